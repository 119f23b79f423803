//! Per-actor process runtimes.
//!
//! Everything the supervisor needs to spawn, kill and respawn one actor:
//! the resolved executable, the serialized spawn spec, and the last state
//! the actor reported. Children are plain OS processes started with
//! spawn/exec; the original fork/spawn/forkserver distinction survives
//! only as an advisory `method` option.

use std::path::PathBuf;

use snafu::ResultExt;
use tokio::{process::Command, sync::mpsc};

use actor_api::SpawnSpec;

use super::{EncodeSpawnSpec, Event, NexusError, Spawn};
use crate::subsys::ActorSpec;

/// The last lifecycle state the supervisor observed for one actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorState {
    /// Process started, nothing reported yet.
    Spawned,
    /// Reported `ready`.
    Ready,
    /// `run` was broadcast while it was ready.
    Running,
    /// `stop` was broadcast; waiting for `stop_success`.
    Stopping,
    /// Reported `stop_success`.
    Stopped,
    /// Process exited with this code.
    Dead(i32),
}

impl ActorState {
    /// Whether the process is presumed alive.
    pub fn alive(&self) -> bool {
        !matches!(self, ActorState::Dead(_))
    }
}

/// Supervisor-side record of one actor.
pub struct ActorRuntime {
    /// Actor name from the pipeline document.
    pub name: String,
    /// The declarative record it was built from.
    pub spec: ActorSpec,
    /// Resolved executable.
    pub program: PathBuf,
    /// Arguments preceding `--spec` (the watcher's internal subcommand).
    pub args_prefix: Vec<String>,
    /// The spawn spec handed to the child.
    pub spawn_spec: SpawnSpec,
    /// Whether this is the GUI actor (spawned first, never revived).
    pub is_gui: bool,
    /// Advisory `daemon` option, logged only; all children are terminated
    /// at quit like in a daemonic setup.
    pub daemon: bool,
    /// Last observed process id.
    pub pid: Option<u32>,
    /// Last observed lifecycle state.
    pub state: ActorState,
}

impl ActorRuntime {
    /// Spawn the child process and watch for its exit. The exit event is
    /// delivered like any other input to the supervisor loop.
    pub fn spawn(&mut self, events: &mpsc::Sender<Event>) -> Result<(), NexusError> {
        let spec_json = serde_json::to_string(&self.spawn_spec).context(EncodeSpawnSpec {
            actor: &self.name,
        })?;
        let mut command = Command::new(&self.program);
        for arg in &self.args_prefix {
            command.arg(arg);
        }
        command.arg("--spec").arg(&spec_json);
        command.kill_on_drop(true);
        let mut child = command.spawn().context(Spawn {
            actor: &self.name,
        })?;
        self.pid = child.id();
        self.state = ActorState::Spawned;
        info!(
            "spawned actor '{}' as pid {:?} ({})",
            self.name,
            self.pid,
            self.program.display()
        );

        let name = self.name.clone();
        let events = events.clone();
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status.code().unwrap_or(-1),
                Err(_) => -1,
            };
            let _ = events
                .send(Event::ChildExit {
                    actor: name,
                    code,
                })
                .await;
        });
        Ok(())
    }

    /// Ask the process to terminate (SIGTERM).
    pub fn terminate(&self) {
        if let Some(pid) = self.pid {
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
        }
    }

    /// Kill the process outright (SIGKILL).
    pub fn kill(&self) {
        if let Some(pid) = self.pid {
            warn!("killing actor '{}' (pid {})", self.name, pid);
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGKILL);
            }
        }
    }
}

/// Resolve a `package` value to an executable: explicit paths as given,
/// bare names first as a sibling of the running supervisor binary (where
/// cargo puts workspace binaries), then left to `PATH`.
pub fn resolve_package(package: &str) -> Result<PathBuf, NexusError> {
    if package.contains('/') {
        return Ok(PathBuf::from(package));
    }
    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            let candidate = dir.join(package);
            if candidate.exists() {
                return Ok(candidate);
            }
        }
    }
    Ok(PathBuf::from(package))
}
