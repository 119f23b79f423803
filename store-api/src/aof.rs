//! Append-only log for the store service.
//!
//! One bincode record per committed mutation, length-prefixed like the
//! wire frames. Replay tolerates a torn tail: a crash mid-append loses at
//! most the record being written, consistent with the configured fsync
//! boundary.

use std::{
    fs::{File, OpenOptions},
    io::{Read, Write},
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use tracing::warn;

use crate::{Aof, StoreResult};

const LOG_NAME: &str = "appendonly.log";

/// When the log is pushed to stable storage.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FsyncPolicy {
    /// Sync after every committed write.
    EveryWrite,
    /// Sync on a one-second schedule.
    EverySecond,
    /// Leave syncing to the operating system.
    NoSchedule,
}

impl Default for FsyncPolicy {
    fn default() -> Self {
        FsyncPolicy::NoSchedule
    }
}

#[derive(Serialize, Deserialize, Debug)]
pub(crate) enum AofRecord {
    Put {
        id: u64,
        name: Option<String>,
        bytes: Vec<u8>,
    },
    Free {
        id: u64,
    },
}

pub(crate) struct AofWriter {
    path: PathBuf,
    file: File,
    policy: FsyncPolicy,
}

impl AofWriter {
    /// Open (creating the directory and file as needed) for appending.
    pub(crate) fn open(dir: &Path, policy: FsyncPolicy) -> StoreResult<Self> {
        std::fs::create_dir_all(dir).context(Aof {
            path: dir,
        })?;
        let path = dir.join(LOG_NAME);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .context(Aof {
                path: &path,
            })?;
        Ok(Self {
            path,
            file,
            policy,
        })
    }

    pub(crate) fn append(&mut self, record: &AofRecord) -> StoreResult<()> {
        let body = bincode::serialize(record).context(crate::SerializeValue)?;
        self.file
            .write_all(&(body.len() as u32).to_le_bytes())
            .context(Aof {
                path: &self.path,
            })?;
        self.file.write_all(&body).context(Aof {
            path: &self.path,
        })?;
        if self.policy == FsyncPolicy::EveryWrite {
            self.sync()?;
        }
        Ok(())
    }

    /// Push written records to stable storage.
    pub(crate) fn sync(&mut self) -> StoreResult<()> {
        self.file.sync_data().context(Aof {
            path: &self.path,
        })
    }
}

/// Replay the log in `dir`, if present. Returns the surviving records in
/// append order.
pub(crate) fn replay(dir: &Path) -> StoreResult<Vec<AofRecord>> {
    let path = dir.join(LOG_NAME);
    let mut file = match File::open(&path) {
        Ok(file) => file,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
            return Ok(Vec::new());
        }
        Err(source) => {
            return Err(source).context(Aof {
                path: &path,
            })
        }
    };

    let mut records = Vec::new();
    loop {
        let mut word = [0u8; 4];
        match file.read_exact(&mut word) {
            Ok(_) => {}
            Err(error) if error.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(source) => {
                return Err(source).context(Aof {
                    path: &path,
                })
            }
        }
        let len = u32::from_le_bytes(word) as usize;
        let mut body = vec![0u8; len];
        if let Err(error) = file.read_exact(&mut body) {
            warn!(
                "append-only log at '{}' has a torn tail ({}); replay stops here",
                path.display(),
                error
            );
            break;
        }
        match bincode::deserialize(&body) {
            Ok(record) => records.push(record),
            Err(error) => {
                warn!(
                    "append-only log at '{}' has a corrupt record ({}); replay stops here",
                    path.display(),
                    error
                );
                break;
            }
        }
    }
    Ok(records)
}
