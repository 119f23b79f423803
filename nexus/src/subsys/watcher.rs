//! The optional watcher: a plain actor that shadows selected actors
//! through dedicated `watchout` links and records what flows past.
//!
//! Snapshots are JSON lines, one file per watched actor, under `watch/`
//! in the working directory.

use std::{collections::HashMap, fs, fs::File, io::Write, path::PathBuf};

use async_trait::async_trait;
use serde_json::json;

use actor_api::{Actor, ActorContext, ActorResult, Registry, Setup};
use link_api::LinkError;

const WATCH_DIR: &str = "watch";
const IDLE_WAIT_MS: u64 = 10;

/// The watcher actor. Driven by the standard driver like any other actor.
#[derive(Default)]
pub struct Watcher {
    dir: PathBuf,
    files: HashMap<String, File>,
    seq: u64,
}

/// Registry for the supervisor-spawned watcher process.
pub fn registry() -> Registry {
    Registry::new().register("Watcher", |_options| Ok(Box::new(Watcher::default())))
}

#[async_trait(?Send)]
impl Actor for Watcher {
    async fn setup(&mut self, context: &mut ActorContext) -> ActorResult<()> {
        self.dir = PathBuf::from(WATCH_DIR);
        fs::create_dir_all(&self.dir).map_err(|error| {
            Setup {
                message: format!("cannot create '{}': {}", self.dir.display(), error),
            }
            .build()
        })?;
        for watched in context.ports.extra_in.keys() {
            if !self.files.contains_key(watched) {
                let path = self.dir.join(format!("{}.jsonl", watched));
                let file = File::create(&path).map_err(|error| {
                    Setup {
                        message: format!("cannot create '{}': {}", path.display(), error),
                    }
                    .build()
                })?;
                self.files.insert(watched.clone(), file);
            }
        }
        Ok(())
    }

    async fn run_step(&mut self, context: &mut ActorContext) -> ActorResult<()> {
        let watched: Vec<String> = context.ports.extra_in.keys().cloned().collect();
        let mut drained = false;
        for name in watched {
            loop {
                let receiver = context.ports.input(&name)?;
                match receiver.get_nowait().await {
                    Ok(item) => {
                        drained = true;
                        self.seq += 1;
                        let line = json!({
                            "seq": self.seq,
                            "link": name,
                            "len": item.len(),
                        });
                        if let Some(file) = self.files.get_mut(&name) {
                            let _ = writeln!(file, "{}", line);
                        }
                    }
                    Err(LinkError::Empty {
                        ..
                    }) => break,
                    Err(error) => return Err(error.into()),
                }
            }
        }
        if !drained {
            tokio::time::sleep(std::time::Duration::from_millis(IDLE_WAIT_MS)).await;
        }
        Ok(())
    }

    async fn stop(&mut self, _context: &mut ActorContext) -> ActorResult<()> {
        for file in self.files.values_mut() {
            let _ = file.flush();
        }
        self.files.clear();
        Ok(())
    }
}
