#![warn(missing_docs)]
//! The contract every pipeline actor implements and the machinery that
//! runs one inside its own process.
//!
//! An actor is a sequential unit with four lifecycle operations: `setup`,
//! `run_step`, `stop` and (rarely overridden) `run`. The supervisor drives
//! it over a signal link and listens on a comm link; data moves over the
//! ports declared in the pipeline document. All of that arrives in a child
//! process as a serialized [`SpawnSpec`] on the command line, the explicit
//! replacement for inheriting supervisor state.

mod actor;
mod context;
mod driver;
mod registry;

pub use actor::Actor;
pub use context::{ActorContext, PortRef, Ports, SpawnSpec};
pub use driver::drive;
pub use registry::{run_registered, run_with_spec, ActorFactory, Registry};

use snafu::Snafu;

/// Result wrapper for actor operations.
pub type ActorResult<T> = Result<T, ActorError>;

/// Errors raised by actors and the machinery around them.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub), context(suffix(false)))]
pub enum ActorError {
    /// `setup` could not bring the actor to a runnable state.
    #[snafu(display("Actor setup failed: {}", message))]
    Setup { message: String },
    /// One unit of work failed; the driver logs this and keeps stepping.
    #[snafu(display("Actor step failed: {}", message))]
    Step { message: String },
    /// `stop` could not release resources cleanly.
    #[snafu(display("Actor stop failed: {}", message))]
    Stop { message: String },
    /// The options bag is not what this actor expects.
    #[snafu(display("Actor options are invalid: {}", message))]
    BadOptions { message: String },
    /// No factory registered under this classname.
    #[snafu(display("Unknown actor class '{}'", classname))]
    UnknownClass { classname: String },
    /// A port the actor needs was not wired by the pipeline document.
    #[snafu(display("Port '{}' is not wired", port))]
    Unwired { port: String },
    /// A link operation failed.
    #[snafu(display("Link failure: {}", source))]
    Link {
        #[snafu(source(from(link_api::LinkError, Box::new)))]
        source: Box<link_api::LinkError>,
    },
    /// A store operation failed.
    #[snafu(display("Store failure: {}", source))]
    Store {
        #[snafu(source(from(store_api::StoreError, Box::new)))]
        source: Box<store_api::StoreError>,
    },
    /// The spawn spec on the command line did not parse.
    #[snafu(display("Invalid spawn spec: {}", source))]
    BadSpawnSpec { source: serde_json::Error },
}

impl From<link_api::LinkError> for ActorError {
    fn from(source: link_api::LinkError) -> Self {
        ActorError::Link {
            source: Box::new(source),
        }
    }
}

impl From<store_api::StoreError> for ActorError {
    fn from(source: store_api::StoreError) -> Self {
        ActorError::Store {
            source: Box::new(source),
        }
    }
}
