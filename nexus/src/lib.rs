//! The Nexus supervisor.
//!
//! Nexus owns the lifecycle of a whole pipeline: it parses the declarative
//! pipeline document, starts the object store backend, wires every link,
//! spawns each actor as its own OS process, and then drives the global
//! lifecycle (`setup` → `ready` → `run` → `stop`/`quit`) from a single
//! cooperative event loop. A front end talks to it over two TCP sockets:
//! a request/reply control socket and a publish-only output socket.

#[macro_use]
extern crate tracing;

pub mod core;
pub mod logger;
pub mod subsys;
