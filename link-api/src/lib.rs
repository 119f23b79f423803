#![warn(missing_docs)]
//! Bounded FIFO links between pipeline actors.
//!
//! A link is a named, bounded queue from a single source endpoint to one or
//! more sink endpoints. All links of a pipeline live in the supervisor
//! process inside a [`LinkBroker`]; actor processes attach to their
//! endpoints over a Unix socket and exchange length-prefixed bincode
//! frames, while the supervisor addresses the very same queues in process.
//!
//! Items are raw byte payloads at the wire level. Typed access is layered
//! on top with the `*_obj` helpers, which serialize with bincode. The
//! payloads that actually travel on data links are small: an object store
//! handle plus a frame index, never the frame itself.

mod broker;
mod endpoint;
mod frame;
mod signal;

pub use broker::{LinkBroker, LinkSpec, OnFull};
pub use endpoint::{attach_consumer, attach_producer, LinkReceiver, LinkSender};
pub use signal::{Command, Signal, UnknownCommand};

use snafu::Snafu;

/// Result wrapper for link operations.
pub type LinkResult<T> = Result<T, LinkError>;

/// Errors returned by link endpoints and the broker.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), context(suffix(false)))]
pub enum LinkError {
    /// A non-blocking put found the link at capacity.
    #[snafu(display("Link '{}' is at capacity", link))]
    Full { link: String },
    /// A non-blocking get found the link empty.
    #[snafu(display("Link '{}' is empty", link))]
    Empty { link: String },
    /// A bounded wait elapsed without an item.
    #[snafu(display("Timed out waiting on link '{}'", link))]
    Timeout { link: String },
    /// The link or its transport is no longer usable.
    #[snafu(display("Link '{}' is closed", link))]
    Closed { link: String },
    /// The broker has no link with this name.
    #[snafu(display("Link '{}' is not registered with the broker", link))]
    Unknown { link: String },
    /// A sink endpoint allows exactly one reader at a time.
    #[snafu(display(
        "Sink '{}' of link '{}' already has a reader attached",
        sink,
        link
    ))]
    SinkBusy { link: String, sink: String },
    /// Link names are unique within a broker.
    #[snafu(display("Link '{}' is already registered", link))]
    Duplicate { link: String },
    /// Could not reach the broker socket.
    #[snafu(display(
        "Failed to connect to the link broker at '{}': {}",
        path.display(),
        source
    ))]
    Connect {
        path: std::path::PathBuf,
        source: std::io::Error,
    },
    /// The byte stream carrying the link broke mid-frame.
    #[snafu(display("Link transport failed on '{}': {}", link, source))]
    Wire {
        link: String,
        source: std::io::Error,
    },
    /// Failed to encode an item or frame.
    #[snafu(display("Failed to serialize an item for link '{}': {}", link, source))]
    Serialize {
        link: String,
        source: bincode::Error,
    },
    /// Failed to decode an item or frame.
    #[snafu(display(
        "Failed to deserialize an item from link '{}': {}",
        link,
        source
    ))]
    Deserialize {
        link: String,
        source: bincode::Error,
    },
    /// The broker rejected the request outright.
    #[snafu(display("Broker refused the request: {}", message))]
    Refused { message: String },
}
