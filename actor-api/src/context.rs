//! The explicit runtime record an actor receives instead of inherited
//! supervisor state.

use std::{collections::HashMap, path::PathBuf};

use serde::{Deserialize, Serialize};
use snafu::OptionExt;
use tracing::debug;

use link_api::{attach_consumer, attach_producer, LinkReceiver, LinkSender, Signal};
use store_api::{StoreClient, StoreDescriptor};

use crate::{ActorResult, Unwired};

/// One port attachment inside a [`SpawnSpec`]: which broker link backs
/// the named port, and (for inbound ports) which sink queue is ours.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PortRef {
    /// Port name as the actor knows it (`q_in`, `q_out`, `watchout`, or
    /// a custom name from the pipeline document).
    pub port: String,
    /// Broker link name.
    pub link: String,
    /// Sink endpoint within the link; inbound ports only.
    pub sink: Option<String>,
}

/// Everything a child process needs, serialized onto its command line.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SpawnSpec {
    /// Actor name from the pipeline document.
    pub name: String,
    /// Registered classname to instantiate.
    pub classname: String,
    /// The verbatim options bag.
    pub options: serde_json::Value,
    /// The broker socket to attach links through.
    pub broker_socket: PathBuf,
    /// How to reach the store backend of this run.
    pub store: StoreDescriptor,
    /// The supervisor-to-actor signal link (read end is ours).
    pub signal_link: PortRef,
    /// The actor-to-supervisor comm link (write end is ours).
    pub comm_link: String,
    /// Inbound data ports.
    pub inputs: Vec<PortRef>,
    /// Outbound data ports.
    pub outputs: Vec<PortRef>,
}

impl SpawnSpec {
    /// Connect the store and every link, producing the actor's context.
    pub async fn connect(&self) -> ActorResult<ActorContext> {
        let store = self.store.connect().await?;
        let sink = self.signal_link.sink.as_deref().unwrap_or(&self.name);
        let signals =
            attach_consumer(&self.broker_socket, &self.signal_link.link, sink).await?;
        let comm = attach_producer(&self.broker_socket, &self.comm_link).await?;

        let mut ports = Ports::default();
        for input in &self.inputs {
            let sink = input.sink.as_deref().unwrap_or(&self.name);
            let receiver = attach_consumer(&self.broker_socket, &input.link, sink).await?;
            if input.port == "q_in" {
                ports.q_in = Some(receiver);
            } else {
                ports.extra_in.insert(input.port.clone(), receiver);
            }
            debug!("{}: wired inbound port '{}'", self.name, input.port);
        }
        for output in &self.outputs {
            let sender = attach_producer(&self.broker_socket, &output.link).await?;
            match output.port.as_str() {
                "q_out" => ports.q_out = Some(sender),
                "watchout" => ports.watchout = Some(sender),
                _ => {
                    ports.extra_out.insert(output.port.clone(), sender);
                }
            }
            debug!("{}: wired outbound port '{}'", self.name, output.port);
        }

        Ok(ActorContext {
            name: self.name.clone(),
            options: self.options.clone(),
            store,
            ports,
            signals,
            comm,
        })
    }
}

/// The typed endpoints an actor was wired with.
#[derive(Default)]
pub struct Ports {
    /// Inbound data link; absent on source actors.
    pub q_in: Option<LinkReceiver>,
    /// Outbound data link; absent on sink actors.
    pub q_out: Option<LinkSender>,
    /// Diagnostics link to the watcher, when enabled.
    pub watchout: Option<LinkSender>,
    /// Additional named inbound links.
    pub extra_in: HashMap<String, LinkReceiver>,
    /// Additional named outbound links.
    pub extra_out: HashMap<String, LinkSender>,
}

impl Ports {
    /// The inbound data link, or `Unwired`.
    pub fn q_in(&mut self) -> ActorResult<&mut LinkReceiver> {
        self.q_in.as_mut().context(Unwired {
            port: "q_in",
        })
    }

    /// The outbound data link, or `Unwired`.
    pub fn q_out(&mut self) -> ActorResult<&mut LinkSender> {
        self.q_out.as_mut().context(Unwired {
            port: "q_out",
        })
    }

    /// A named inbound link, or `Unwired`.
    pub fn input(&mut self, port: &str) -> ActorResult<&mut LinkReceiver> {
        self.extra_in.get_mut(port).context(Unwired {
            port,
        })
    }

    /// A named outbound link, or `Unwired`.
    pub fn output(&mut self, port: &str) -> ActorResult<&mut LinkSender> {
        self.extra_out.get_mut(port).context(Unwired {
            port,
        })
    }
}

/// Per-actor runtime state: identity, options, store client and link
/// endpoints. Fields are public; an actor owns its context for the life
/// of the process.
pub struct ActorContext {
    /// The actor's name from the pipeline document.
    pub name: String,
    /// The verbatim options bag.
    pub options: serde_json::Value,
    /// Connected store client.
    pub store: StoreClient,
    /// Wired data ports.
    pub ports: Ports,
    /// Signal link read end. Only `run` overrides poll this directly.
    pub signals: LinkReceiver,
    /// Comm link write end.
    pub comm: LinkSender,
}

impl ActorContext {
    /// Send a free-form diagnostic to the supervisor.
    pub async fn report(&mut self, message: impl Into<String>) -> ActorResult<()> {
        self.comm
            .put_obj(&Signal::Status(message.into()))
            .await
            .map_err(Into::into)
    }
}
