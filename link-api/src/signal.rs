//! The signal vocabulary spoken on supervisor-facing links and on the
//! control socket.

use std::{fmt, path::PathBuf, str::FromStr};

use serde::{Deserialize, Serialize};
use snafu::Snafu;
use strum_macros::Display;

/// Lifecycle signals exchanged between the supervisor and actors.
///
/// The supervisor writes `Setup`, `Run`, `Stop` and `Quit` on every signal
/// link; actors answer with `Ready`, `StopSuccess` or a `Status` diagnostic
/// on their comm link. The string forms below are what shows up in logs and
/// on the output socket.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum Signal {
    /// One-shot initialisation request.
    Setup,
    /// Actor reply: setup completed, a step can run immediately.
    Ready,
    /// Begin (or resume) stepping.
    Run,
    /// Drain and release resources; the actor may be revived afterwards.
    Stop,
    /// Actor reply: stop completed cleanly.
    StopSuccess,
    /// Terminal shutdown.
    Quit,
    /// Advisory; not acted upon by the default driver.
    Pause,
    /// Free-form diagnostic reported over a comm link.
    #[strum(serialize = "status")]
    Status(String),
}

/// Commands accepted on the supervisor control socket, one per line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Broadcast `Signal::Setup`.
    Setup,
    /// Broadcast `Signal::Run` (gated on all actors being ready).
    Run,
    /// Broadcast `Signal::Stop`.
    Stop,
    /// Shut the pipeline down.
    Quit,
    /// Terminate one actor's process.
    Kill(String),
    /// Rebuild every dead actor and re-run it.
    Revive,
    /// Load a new pipeline document.
    Load(PathBuf),
    /// Report whether the pipeline may be run.
    Ready,
    /// Accepted for compatibility; acknowledged only.
    Pause,
}

/// Parse failure for a control socket line.
#[derive(Debug, Snafu)]
#[snafu(display("Unrecognized command '{}'", input))]
pub struct UnknownCommand {
    input: String,
}

impl FromStr for Command {
    type Err = UnknownCommand;

    fn from_str(source: &str) -> Result<Self, Self::Err> {
        let mut words = source.split_whitespace();
        let unknown = || UnknownCommand {
            input: source.to_string(),
        };
        let command = match words.next() {
            Some("setup") => Command::Setup,
            Some("run") => Command::Run,
            Some("stop") => Command::Stop,
            Some("quit") => Command::Quit,
            Some("revive") => Command::Revive,
            Some("ready") => Command::Ready,
            Some("pause") => Command::Pause,
            Some("kill") => match words.next() {
                Some(actor) => Command::Kill(actor.to_string()),
                None => return Err(unknown()),
            },
            Some("load") => match words.next() {
                Some(path) => Command::Load(PathBuf::from(path)),
                None => return Err(unknown()),
            },
            _ => return Err(unknown()),
        };
        match words.next() {
            Some(_) => Err(unknown()),
            None => Ok(command),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Setup => write!(f, "setup"),
            Command::Run => write!(f, "run"),
            Command::Stop => write!(f, "stop"),
            Command::Quit => write!(f, "quit"),
            Command::Kill(actor) => write!(f, "kill {}", actor),
            Command::Revive => write!(f, "revive"),
            Command::Load(path) => write!(f, "load {}", path.display()),
            Command::Ready => write!(f, "ready"),
            Command::Pause => write!(f, "pause"),
        }
    }
}
