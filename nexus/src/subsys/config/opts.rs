//! The `settings` section of the pipeline document.
//!
//! Partial settings are supported: serde fills defaults for whatever a
//! document leaves out, and the accessors resolve the remaining `None`s
//! against the named constants below. Ports are kept as options so that
//! command-line precedence can tell "the file said 0" apart from "the
//! file said nothing".

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use link_api::OnFull;
use store_api::FsyncPolicy;

use super::{ConfigError, EmptyAofDirname, PersistenceConflict, SavingDisabled};

/// Default byte budget of the object store.
pub const DEFAULT_STORE_SIZE: u64 = 10_000_000;
/// Default queue slots per link.
pub const DEFAULT_LINK_CAPACITY: usize = 16;
/// Persistence directory used when saving is on and no name is given.
pub const DEFAULT_AOF_DIRNAME: &str = "appendonlydir";
/// Prefix of generated per-run persistence directories.
pub const EPHEMERAL_AOF_PREFIX: &str = "nexus_persistence_";

/// Which object store backend a run uses. All actors see the same one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Shared-memory arena mapped into every actor process.
    Inproc,
    /// TCP store service with optional durability.
    External,
}

impl Default for StoreBackend {
    fn default() -> Self {
        StoreBackend::Inproc
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Store backend selection.
    pub store_backend: StoreBackend,
    /// Store byte budget.
    pub store_size: Option<u64>,
    /// Control socket port; 0 or absent means auto-allocate.
    pub control_port: Option<u16>,
    /// Output socket port; 0 or absent means auto-allocate.
    pub output_port: Option<u16>,
    /// Default queue slots per link.
    pub link_capacity: Option<usize>,
    /// Actors to shadow with the watcher.
    pub use_watcher: Option<Vec<String>>,
    /// Store persistence on/off.
    pub redis_saving_enabled: Option<bool>,
    /// Static persistence directory.
    pub redis_aof_dirname: Option<String>,
    /// Generate a unique persistence directory per run.
    pub generate_ephemeral_aof_dirname: bool,
    /// When committed writes reach stable storage.
    pub redis_fsync_frequency: Option<FsyncPolicy>,
    /// Explicit store service port; absent means probe for one.
    pub redis_port: Option<u16>,
}

/// The resolved durability plan for the external store backend.
#[derive(Debug, Clone, PartialEq)]
pub struct Persistence {
    /// Whether writes are logged at all.
    pub saving_enabled: bool,
    /// Sync schedule for the log.
    pub fsync: FsyncPolicy,
    /// Log directory; `None` when saving is disabled.
    pub aof_dir: Option<PathBuf>,
}

impl Settings {
    /// Store byte budget with the default applied.
    pub fn store_size(&self) -> u64 {
        self.store_size.unwrap_or(DEFAULT_STORE_SIZE)
    }

    /// Control port with 0 meaning auto-allocate.
    pub fn control_port(&self) -> u16 {
        self.control_port.unwrap_or(0)
    }

    /// Output port with 0 meaning auto-allocate.
    pub fn output_port(&self) -> u16 {
        self.output_port.unwrap_or(0)
    }

    /// Default link capacity with the default applied.
    pub fn link_capacity(&self) -> usize {
        self.link_capacity.unwrap_or(DEFAULT_LINK_CAPACITY)
    }

    /// Actors watched by the watcher; empty when disabled.
    pub fn watched(&self) -> &[String] {
        self.use_watcher.as_deref().unwrap_or(&[])
    }

    /// Resolve the persistence options, enforcing their exclusivity
    /// rules. Specifying a directory (static or generated) or an fsync
    /// schedule with saving explicitly disabled is an error; with saving
    /// unset it turns saving on.
    pub fn persistence(&self) -> Result<Persistence, ConfigError> {
        let dirname = self.redis_aof_dirname.as_deref();
        if let Some(dirname) = dirname {
            if dirname.is_empty() {
                return EmptyAofDirname.fail();
            }
            if self.generate_ephemeral_aof_dirname {
                return PersistenceConflict.fail();
            }
        }

        let mut saving = self.redis_saving_enabled;
        if dirname.is_some()
            || self.generate_ephemeral_aof_dirname
            || self.redis_fsync_frequency.is_some()
        {
            match saving {
                None => saving = Some(true),
                Some(false) => return SavingDisabled.fail(),
                Some(true) => {}
            }
        }
        let saving_enabled = saving.unwrap_or(false);
        let fsync = self.redis_fsync_frequency.unwrap_or_default();

        let aof_dir = if !saving_enabled {
            None
        } else if let Some(dirname) = dirname {
            Some(PathBuf::from(dirname))
        } else if self.generate_ephemeral_aof_dirname {
            Some(PathBuf::from(format!(
                "{}{}",
                EPHEMERAL_AOF_PREFIX,
                Uuid::new_v4()
            )))
        } else {
            Some(PathBuf::from(DEFAULT_AOF_DIRNAME))
        };

        Ok(Persistence {
            saving_enabled,
            fsync,
            aof_dir,
        })
    }
}

/// Optional per-link tuning from the `links:` document section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LinkTuning {
    /// Queue slots for this link, overriding `settings.link_capacity`.
    pub capacity: Option<usize>,
    /// Fan-out policy when one sink is full.
    pub on_full: Option<OnFull>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(yaml: &str) -> Settings {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn defaults_resolve() {
        let opts = Settings::default();
        assert_eq!(opts.store_size(), DEFAULT_STORE_SIZE);
        assert_eq!(opts.control_port(), 0);
        assert_eq!(opts.link_capacity(), DEFAULT_LINK_CAPACITY);
        assert_eq!(opts.store_backend, StoreBackend::Inproc);
        let persistence = opts.persistence().unwrap();
        assert!(!persistence.saving_enabled);
        assert_eq!(persistence.aof_dir, None);
    }

    #[test]
    fn a_directory_or_schedule_implies_saving() {
        let opts = settings("redis_aof_dirname: custom_aof_dirname");
        let persistence = opts.persistence().unwrap();
        assert!(persistence.saving_enabled);
        assert_eq!(persistence.aof_dir, Some(PathBuf::from("custom_aof_dirname")));

        let opts = settings("redis_fsync_frequency: every_second");
        let persistence = opts.persistence().unwrap();
        assert!(persistence.saving_enabled);
        assert_eq!(persistence.fsync, FsyncPolicy::EverySecond);
        assert_eq!(persistence.aof_dir, Some(PathBuf::from(DEFAULT_AOF_DIRNAME)));
    }

    #[test]
    fn directory_variants_are_mutually_exclusive() {
        let opts = settings(
            "redis_aof_dirname: custom\ngenerate_ephemeral_aof_dirname: true",
        );
        assert!(matches!(
            opts.persistence(),
            Err(ConfigError::PersistenceConflict)
        ));

        let opts = settings(
            "redis_aof_dirname: custom\nredis_saving_enabled: false",
        );
        assert!(matches!(opts.persistence(), Err(ConfigError::SavingDisabled)));

        let opts = settings("redis_aof_dirname: \"\"");
        assert!(matches!(opts.persistence(), Err(ConfigError::EmptyAofDirname)));
    }

    #[test]
    fn ephemeral_directories_are_unique() {
        let opts = settings("generate_ephemeral_aof_dirname: true");
        let first = opts.persistence().unwrap().aof_dir.unwrap();
        let second = opts.persistence().unwrap().aof_dir.unwrap();
        assert!(first
            .to_string_lossy()
            .starts_with(EPHEMERAL_AOF_PREFIX));
        assert_ne!(first, second);
    }

    #[test]
    fn unknown_fsync_values_fail_to_parse() {
        let result: Result<Settings, _> =
            serde_yaml::from_str("redis_fsync_frequency: sometimes");
        assert!(result.is_err());
    }

    #[test]
    fn unknown_settings_keys_are_rejected() {
        let result: Result<Settings, _> = serde_yaml::from_str("not_a_key: 1");
        assert!(result.is_err());
    }
}
