//! The supervisor proper: socket front ends, per-actor process runtimes,
//! and the event loop that drives the global lifecycle.

mod actors;
mod nexus;
mod sockets;

pub use actors::{resolve_package, ActorRuntime, ActorState};
pub use nexus::{plan_links, Nexus, NexusArgs};
pub use sockets::{ControlSocket, OutputPublisher};

use link_api::{Command, Signal};
use snafu::Snafu;

/// Everything the supervisor loop reacts to, funnelled into one queue so
/// the loop never blocks on a single source.
#[derive(Debug)]
pub enum Event {
    /// An actor reported on its comm link.
    Comm {
        /// Actor name.
        actor: String,
        /// What it reported.
        signal: Signal,
    },
    /// A command arrived on the control socket.
    Command(Command),
    /// An unparseable line arrived on the control socket.
    UnknownCommand(String),
    /// A child process exited.
    ChildExit {
        /// Actor name.
        actor: String,
        /// Process exit code (-1 when killed by a signal).
        code: i32,
    },
    /// A termination signal reached the supervisor.
    OsSignal(&'static str),
}

/// Supervisor-level failures. Anything here before the polling loop is
/// fatal and turns into a non-zero exit.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), context(suffix(false)))]
pub enum NexusError {
    #[snafu(display("Configuration error: {}", source))]
    Config { source: crate::subsys::ConfigError },
    #[snafu(display("Failed to bind the {} socket: {}", which, source))]
    SocketBind {
        which: String,
        source: std::io::Error,
    },
    #[snafu(display("Store backend failed to start: {}", source))]
    StoreStart { source: store_api::StoreError },
    #[snafu(display("Link setup failed: {}", source))]
    LinkSetup { source: link_api::LinkError },
    #[snafu(display("Failed to spawn actor '{}': {}", actor, source))]
    Spawn {
        actor: String,
        source: std::io::Error,
    },
    #[snafu(display("Failed to encode the spawn spec for '{}': {}", actor, source))]
    EncodeSpawnSpec {
        actor: String,
        source: serde_json::Error,
    },
}
