//! Reference actors for demos and the end-to-end tests: a generator that
//! pushes store handles downstream, an accumulator that dereferences and
//! sums them, and a deliberately crashing actor for revive drills.

#[macro_use]
extern crate tracing;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use actor_api::{
    Actor, ActorContext, ActorResult, BadOptions, Registry, run_registered,
};
use link_api::LinkError;
use nexus::logger;
use store_api::{Handle, ObjectStoreExt, StoreError};

/// What travels on the data links: a store handle plus its sequence
/// number. The payload itself stays in the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Parcel {
    seq: u64,
    handle: Handle,
}

fn option_u64(options: &serde_json::Value, key: &str, default: u64) -> u64 {
    options.get(key).and_then(|value| value.as_u64()).unwrap_or(default)
}

/// Puts `count` integers into the store and their handles on `q_out`.
struct Generator {
    count: u64,
    delay: Duration,
    next: u64,
}

impl Generator {
    fn from_options(options: &serde_json::Value) -> ActorResult<Self> {
        Ok(Self {
            count: option_u64(options, "count", 100),
            delay: Duration::from_millis(option_u64(options, "delay_ms", 0)),
            next: 1,
        })
    }
}

#[async_trait(?Send)]
impl Actor for Generator {
    async fn setup(&mut self, _context: &mut ActorContext) -> ActorResult<()> {
        self.next = 1;
        Ok(())
    }

    async fn run_step(&mut self, context: &mut ActorContext) -> ActorResult<()> {
        if self.next > self.count {
            // done; idle until stopped
            tokio::time::sleep(Duration::from_millis(5)).await;
            return Ok(());
        }
        let value = self.next;
        let name = format!("frame{}", value);
        let handle = context.store.put_obj(&value, Some(&name)).await?;
        let parcel = Parcel {
            seq: value,
            handle,
        };
        if let Some(watchout) = context.ports.watchout.as_mut() {
            let _ = watchout.put_obj_nowait(&value).await;
        }
        context.ports.q_out()?.put_obj(&parcel).await?;
        self.next += 1;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(())
    }

    async fn stop(&mut self, context: &mut ActorContext) -> ActorResult<()> {
        context.report(format!("emitted: {}", self.next.saturating_sub(1))).await
    }
}

/// Drains `q_in`, dereferences each handle, and accumulates the sum.
/// Reports the total when stopped.
struct Accumulator {
    sum: u64,
    received: u64,
    delay: Duration,
}

impl Accumulator {
    fn from_options(options: &serde_json::Value) -> ActorResult<Self> {
        Ok(Self {
            sum: 0,
            received: 0,
            delay: Duration::from_millis(option_u64(options, "delay_ms", 0)),
        })
    }
}

#[async_trait(?Send)]
impl Actor for Accumulator {
    async fn setup(&mut self, _context: &mut ActorContext) -> ActorResult<()> {
        self.sum = 0;
        self.received = 0;
        Ok(())
    }

    async fn run_step(&mut self, context: &mut ActorContext) -> ActorResult<()> {
        let parcel: Parcel = match context
            .ports
            .q_in()?
            .get_obj_timeout(Duration::from_millis(100))
            .await
        {
            Ok(parcel) => parcel,
            // an empty stretch is not an error, just a quiet pipeline
            Err(LinkError::Timeout {
                ..
            }) => return Ok(()),
            Err(error) => return Err(error.into()),
        };
        match context.store.get_obj::<u64>(&parcel.handle).await {
            Ok(value) => {
                self.sum += value;
                self.received += 1;
            }
            Err(StoreError::NotFound {
                ..
            }) => {
                // expired under us; drop the item
                warn!("payload of {} is gone", parcel.handle);
            }
            Err(error) => return Err(error.into()),
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(())
    }

    async fn stop(&mut self, context: &mut ActorContext) -> ActorResult<()> {
        context.report(format!("sum: {}", self.sum)).await
    }
}

/// Exits the whole process with a non-zero code after a few steps; the
/// revive drill needs a corpse.
struct Flaky {
    fail_after: u64,
    steps: u64,
}

impl Flaky {
    fn from_options(options: &serde_json::Value) -> ActorResult<Self> {
        let fail_after = option_u64(options, "fail_after", 5);
        if fail_after == 0 {
            return BadOptions {
                message: "fail_after must be at least 1",
            }
            .fail();
        }
        Ok(Self {
            fail_after,
            steps: 0,
        })
    }
}

#[async_trait(?Send)]
impl Actor for Flaky {
    async fn setup(&mut self, _context: &mut ActorContext) -> ActorResult<()> {
        self.steps = 0;
        Ok(())
    }

    async fn run_step(&mut self, _context: &mut ActorContext) -> ActorResult<()> {
        self.steps += 1;
        tokio::time::sleep(Duration::from_millis(10)).await;
        if self.steps >= self.fail_after {
            error!("simulated crash after {} steps", self.steps);
            std::process::exit(9);
        }
        Ok(())
    }

    async fn stop(&mut self, _context: &mut ActorContext) -> ActorResult<()> {
        Ok(())
    }
}

fn main() {
    logger::init("INFO");
    let registry = Registry::new()
        .register("Generator", |options| {
            Ok(Box::new(Generator::from_options(options)?))
        })
        .register("Accumulator", |options| {
            Ok(Box::new(Accumulator::from_options(options)?))
        })
        .register("Flaky", |options| Ok(Box::new(Flaky::from_options(options)?)));

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to build the actor runtime");
    let code = rt.block_on(run_registered(&registry));
    std::process::exit(code);
}
