//! The default actor driver.
//!
//! Waits for lifecycle signals, calls the actor's operations, and answers
//! on the comm link: `ready` after a successful setup, `stop_success`
//! after a clean stop, a `status` diagnostic when setup fails. While
//! running it interleaves one non-blocking signal poll with each step, so
//! `stop` and `quit` are observed within a step's latency.

use link_api::{LinkError, Signal};
use tracing::{debug, info, warn};

use crate::{Actor, ActorContext, ActorResult};

enum StepExit {
    Stopped,
    Quit,
}

/// Drive `actor` through its lifecycle until `quit` or a broken signal
/// link. A clean return means the process may exit 0.
pub async fn drive<A>(actor: &mut A, context: &mut ActorContext) -> ActorResult<()>
where
    A: Actor + ?Sized,
{
    let mut active = false;
    loop {
        let signal: Signal = context.signals.get_obj().await?;
        debug!("{}: received '{}'", context.name, signal);
        match signal {
            Signal::Setup => match actor.setup(context).await {
                Ok(()) => {
                    active = true;
                    info!("{}: setup complete", context.name);
                    context.comm.put_obj(&Signal::Ready).await?;
                }
                Err(error) => {
                    warn!("{}: setup failed: {}", context.name, error);
                    let status = Signal::Status(format!("setup failed: {}", error));
                    context.comm.put_obj(&status).await?;
                }
            },
            Signal::Run if active => match step_loop(actor, context).await? {
                StepExit::Stopped => {
                    active = false;
                }
                StepExit::Quit => return Ok(()),
            },
            Signal::Run => {
                warn!("{}: run before setup", context.name);
                let status = Signal::Status("run refused: not set up".to_string());
                context.comm.put_obj(&status).await?;
            }
            Signal::Stop => {
                if active {
                    stop_actor(actor, context).await?;
                    active = false;
                }
            }
            Signal::Quit => {
                if active {
                    if let Err(error) = actor.stop(context).await {
                        warn!("{}: stop on quit failed: {}", context.name, error);
                    }
                }
                info!("{}: quitting", context.name);
                return Ok(());
            }
            other => debug!("{}: ignoring '{}'", context.name, other),
        }
    }
}

async fn stop_actor<A>(actor: &mut A, context: &mut ActorContext) -> ActorResult<()>
where
    A: Actor + ?Sized,
{
    if let Err(error) = actor.stop(context).await {
        warn!("{}: stop failed: {}", context.name, error);
        let status = Signal::Status(format!("stop failed: {}", error));
        context.comm.put_obj(&status).await?;
    }
    info!("{}: stopped", context.name);
    context.comm.put_obj(&Signal::StopSuccess).await?;
    Ok(())
}

async fn step_loop<A>(
    actor: &mut A,
    context: &mut ActorContext,
) -> ActorResult<StepExit>
where
    A: Actor + ?Sized,
{
    info!("{}: running", context.name);
    loop {
        match context.signals.get_obj_nowait::<Signal>().await {
            Ok(Signal::Stop) => {
                stop_actor(actor, context).await?;
                return Ok(StepExit::Stopped);
            }
            Ok(Signal::Quit) => {
                if let Err(error) = actor.stop(context).await {
                    warn!("{}: stop on quit failed: {}", context.name, error);
                }
                info!("{}: quitting", context.name);
                return Ok(StepExit::Quit);
            }
            Ok(Signal::Run) | Ok(Signal::Setup) => {}
            Ok(other) => debug!("{}: ignoring '{}' mid-run", context.name, other),
            Err(LinkError::Empty {
                ..
            }) => {}
            Err(error) => return Err(error.into()),
        }

        // step errors are actor-local: log and keep going
        if let Err(error) = actor.run_step(context).await {
            warn!("{}: step failed: {}", context.name, error);
        }
    }
}
