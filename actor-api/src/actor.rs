//! The four-operation lifecycle contract.

use async_trait::async_trait;

use crate::{driver, ActorContext, ActorResult};

/// A processing unit of the pipeline.
///
/// Concrete actors implement the three lifecycle operations; the provided
/// `run` drives them against the signal link. Actors that own their event
/// loop (a GUI, typically) override `run` and take over signal polling
/// themselves.
#[async_trait(?Send)]
pub trait Actor {
    /// One-shot initialisation: open devices, allocate buffers, prime
    /// state. Must leave the actor able to process a step immediately,
    /// and must be idempotent so a stopped actor can be revived.
    async fn setup(&mut self, context: &mut ActorContext) -> ActorResult<()>;

    /// Process one unit of work. Called repeatedly while running; long
    /// waits inside must be bounded so signals are observed promptly.
    async fn run_step(&mut self, context: &mut ActorContext) -> ActorResult<()>;

    /// Drain, flush and close everything `setup` opened.
    async fn stop(&mut self, context: &mut ActorContext) -> ActorResult<()>;

    /// The actor main loop. The default implementation is the standard
    /// driver; overriding it transfers responsibility for polling the
    /// signal link and emitting `ready`/`stop_success`.
    async fn run(&mut self, context: &mut ActorContext) -> ActorResult<()> {
        driver::drive(self, context).await
    }
}
