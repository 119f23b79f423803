//! The pipeline document loader.
//!
//! Reads the declarative YAML document, applies command-line precedence,
//! and validates the actor/connection graph before anything is spawned.
//! Every error here is fatal: the supervisor refuses to start on an
//! inconsistent document.

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use snafu::{ensure, ResultExt, Snafu};

pub(crate) mod opts;

pub use opts::{
    LinkTuning, Persistence, Settings, StoreBackend, DEFAULT_AOF_DIRNAME,
    DEFAULT_LINK_CAPACITY, DEFAULT_STORE_SIZE, EPHEMERAL_AOF_PREFIX,
};

/// Errors in loading or validating a pipeline document.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), context(suffix(false)))]
pub enum ConfigError {
    #[snafu(display("Failed to read the pipeline document '{}': {}", path.display(), source))]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("The config file is empty"))]
    EmptyDocument,
    #[snafu(display("Failed to parse the pipeline document: {}", source))]
    Parse { source: serde_yaml::Error },
    #[snafu(display("The pipeline declares no actors"))]
    NoActors,
    #[snafu(display("Endpoint '{}' is not of the form actor.port", endpoint))]
    BadEndpoint { endpoint: String },
    #[snafu(display("Endpoint '{}' references an undeclared actor", endpoint))]
    UnknownEndpoint { endpoint: String },
    #[snafu(display(
        "Cannot both generate a unique persistence directory and use the one provided"
    ))]
    PersistenceConflict,
    #[snafu(display("Cannot persist to disk with saving disabled"))]
    SavingDisabled,
    #[snafu(display("Persistence directory specified but no name given"))]
    EmptyAofDirname,
    #[snafu(display("Watched actor '{}' is not declared", actor))]
    UnknownWatched { actor: String },
    #[snafu(display("Link tuning references unknown connection '{}'", endpoint))]
    UnknownTunedLink { endpoint: String },
    #[snafu(display("The gui section must hold exactly one actor"))]
    BadGui,
}

/// One actor record: which executable hosts it, which registered class to
/// instantiate, and the options bag passed through verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ActorSpec {
    /// Executable hosting the actor (path, or a name resolved next to the
    /// supervisor binary and then on `PATH`).
    pub package: String,
    /// Registered classname within the package.
    pub classname: String,
    /// Actor-specific configuration, not interpreted by the supervisor.
    #[serde(default)]
    pub options: serde_json::Value,
}

/// The raw document shape.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct PipelineDoc {
    #[serde(default)]
    settings: Settings,
    #[serde(default)]
    actors: BTreeMap<String, ActorSpec>,
    #[serde(default)]
    connections: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    links: BTreeMap<String, LinkTuning>,
    #[serde(default)]
    gui: Option<BTreeMap<String, ActorSpec>>,
}

/// A validated pipeline.
#[derive(Debug, Clone)]
pub struct PipelineSpec {
    /// Global settings, after command-line precedence.
    pub settings: Settings,
    /// Declared actors by name.
    pub actors: BTreeMap<String, ActorSpec>,
    /// Source endpoint to sink endpoints, ports defaulted.
    pub connections: BTreeMap<String, Vec<String>>,
    /// Per-link tuning keyed by source endpoint.
    pub links: BTreeMap<String, LinkTuning>,
    /// The GUI actor, spawned first and excluded from revive.
    pub gui: Option<(String, ActorSpec)>,
    /// Where the document was loaded from.
    pub source: Option<PathBuf>,
}

/// Command-line values merged into the document settings. A non-zero
/// port wins over the file; a file port wins over a zero (auto) port.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub control_port: u16,
    pub output_port: u16,
    pub store_size: Option<u64>,
}

/// Split an endpoint into `(actor, port)`, applying the default port.
pub fn parse_endpoint(endpoint: &str, default_port: &str) -> Result<(String, String), ConfigError> {
    match endpoint.split_once('.') {
        Some((actor, port)) if !actor.is_empty() && !port.is_empty() => {
            Ok((actor.to_string(), port.to_string()))
        }
        Some(_) => BadEndpoint {
            endpoint,
        }
        .fail(),
        None => Ok((endpoint.to_string(), default_port.to_string())),
    }
}

impl PipelineSpec {
    /// Load and validate a document from disk.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).context(Read {
            path,
        })?;
        let mut spec = Self::from_str(&text)?;
        spec.source = Some(path.to_path_buf());
        Ok(spec)
    }

    /// Parse and validate a document.
    pub fn from_str(text: &str) -> Result<Self, ConfigError> {
        if text.trim().is_empty() {
            error!("The config file is empty");
            return EmptyDocument.fail();
        }
        let doc: PipelineDoc = serde_yaml::from_str(text).context(Parse)?;
        Self::validate(doc)
    }

    fn validate(doc: PipelineDoc) -> Result<Self, ConfigError> {
        ensure!(!doc.actors.is_empty(), NoActors);

        let gui = match &doc.gui {
            None => None,
            Some(gui) => {
                ensure!(gui.len() == 1, BadGui);
                gui.iter().next().map(|(k, v)| (k.clone(), v.clone()))
            }
        };

        let declared = |name: &str| {
            doc.actors.contains_key(name)
                || gui
                    .as_ref()
                    .map(|(gui_name, _)| gui_name.as_str() == name)
                    .unwrap_or(false)
        };

        // normalize endpoints so downstream code never sees a bare name
        let mut connections = BTreeMap::new();
        for (source, sinks) in &doc.connections {
            let (source_actor, source_port) = parse_endpoint(source, "q_out")?;
            ensure!(declared(&source_actor), UnknownEndpoint {
                endpoint: source.clone(),
            });
            if sinks.is_empty() {
                warn!("connection '{}' has no sinks; nothing will consume it", source);
            }
            let mut resolved = Vec::with_capacity(sinks.len());
            for sink in sinks {
                let (sink_actor, sink_port) = parse_endpoint(sink, "q_in")?;
                ensure!(declared(&sink_actor), UnknownEndpoint {
                    endpoint: sink.clone(),
                });
                resolved.push(format!("{}.{}", sink_actor, sink_port));
            }
            connections.insert(
                format!("{}.{}", source_actor, source_port),
                resolved,
            );
        }

        let mut links = BTreeMap::new();
        for (endpoint, tuning) in doc.links {
            let (actor, port) = parse_endpoint(&endpoint, "q_out")?;
            let key = format!("{}.{}", actor, port);
            ensure!(connections.contains_key(&key), UnknownTunedLink {
                endpoint,
            });
            links.insert(key, tuning);
        }

        for watched in doc.settings.watched() {
            ensure!(doc.actors.contains_key(watched), UnknownWatched {
                actor: watched.clone(),
            });
        }

        // surface persistence conflicts before any process exists; the
        // directory itself is resolved again at store startup
        doc.settings.persistence()?;

        Ok(Self {
            settings: doc.settings,
            actors: doc.actors,
            connections,
            links,
            gui,
            source: None,
        })
    }

    /// Apply command-line precedence to the settings.
    pub fn apply_cli(&mut self, cli: &CliOverrides) {
        if cli.control_port != 0 || self.settings.control_port.is_none() {
            self.settings.control_port = Some(cli.control_port);
        }
        if cli.output_port != 0 || self.settings.output_port.is_none() {
            self.settings.output_port = Some(cli.output_port);
        }
        if self.settings.store_size.is_none() {
            self.settings.store_size = cli.store_size;
        }
    }

    /// Tuned capacity for a source endpoint, or the global default.
    pub fn link_capacity(&self, endpoint: &str) -> usize {
        self.links
            .get(endpoint)
            .and_then(|tuning| tuning.capacity)
            .unwrap_or_else(|| self.settings.link_capacity())
    }

    /// Tuned fan-out policy for a source endpoint.
    pub fn link_on_full(&self, endpoint: &str) -> link_api::OnFull {
        self.links
            .get(endpoint)
            .and_then(|tuning| tuning.on_full)
            .unwrap_or_default()
    }
}
