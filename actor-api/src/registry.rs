//! Classname registry and the child-process entry point.
//!
//! A binary that hosts actors registers each classname with a factory and
//! hands control to [`run_registered`]. The supervisor names the binary in
//! the pipeline document (`package`) and the classname within it; the
//! spawn spec arrives as one JSON argument.

use std::collections::HashMap;

use clap::Parser;
use snafu::ResultExt;
use tracing::{error, info};

use crate::{Actor, ActorResult, BadSpawnSpec, SpawnSpec, UnknownClass};

/// Builds an actor from its options bag.
pub type ActorFactory = fn(&serde_json::Value) -> ActorResult<Box<dyn Actor>>;

/// Classname to factory map for one actor-hosting binary.
#[derive(Default)]
pub struct Registry {
    factories: HashMap<String, ActorFactory>,
}

impl Registry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `factory` under `classname`. Last registration wins.
    pub fn register(mut self, classname: &str, factory: ActorFactory) -> Self {
        self.factories.insert(classname.to_string(), factory);
        self
    }

    /// Instantiate a classname against its options.
    pub fn build(
        &self,
        classname: &str,
        options: &serde_json::Value,
    ) -> ActorResult<Box<dyn Actor>> {
        match self.factories.get(classname) {
            Some(factory) => factory(options),
            None => UnknownClass {
                classname,
            }
            .fail(),
        }
    }
}

#[derive(Debug, Parser)]
struct ActorArgs {
    /// JSON spawn spec handed down by the supervisor.
    #[arg(long)]
    spec: String,
}

/// Parse the spawn spec from the command line, wire up the context, and
/// run the named actor to completion. Returns the process exit code.
pub async fn run_registered(registry: &Registry) -> i32 {
    let args = ActorArgs::parse();
    run_with_spec(registry, &args.spec).await
}

/// Like [`run_registered`], for hosts that parse their own command line
/// and already hold the spawn spec JSON.
pub async fn run_with_spec(registry: &Registry, spec: &str) -> i32 {
    match run_spec(registry, spec).await {
        Ok(()) => 0,
        Err(error) => {
            error!("actor process failed: {}", error);
            1
        }
    }
}

async fn run_spec(registry: &Registry, spec: &str) -> ActorResult<()> {
    let spec: SpawnSpec = serde_json::from_str(spec).context(BadSpawnSpec)?;
    info!("starting actor '{}' ({})", spec.name, spec.classname);
    let mut context = spec.connect().await?;
    let mut actor = registry.build(&spec.classname, &spec.options)?;
    actor.run(&mut context).await
}
