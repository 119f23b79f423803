//! The in-host link broker.
//!
//! Owns every queue of the pipeline. The supervisor registers links while
//! wiring the graph, attaches its own endpoints in process, and serves the
//! actor processes over a Unix socket. A multi-link (one source, many
//! sinks) gets one forwarding task which pops the source queue and pushes
//! to each sink queue in order, so delivery is exactly once per sink in
//! source-enqueue order.

use std::{
    collections::HashMap,
    path::Path,
    sync::Arc,
    time::Duration,
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use tokio::{
    io::BufStream,
    net::{UnixListener, UnixStream},
    sync::mpsc,
};
use tracing::{debug, warn};

use crate::{
    endpoint::{LinkReceiver, LinkSender},
    frame::{read_frame, write_frame, Attach, Request, Response},
    Connect, Duplicate, LinkError, LinkResult, Unknown,
};

/// What a multi-link forwarder does when one of its sinks is full:
/// stall the source, or lose the item for that sink only.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OnFull {
    /// Back-pressure: a full sink stalls the source.
    Block,
    /// Best effort: full sinks miss the item, with a warning.
    Drop,
}

impl Default for OnFull {
    fn default() -> Self {
        OnFull::Block
    }
}

/// Declarative description of one link.
#[derive(Debug, Clone)]
pub struct LinkSpec {
    /// Unique name within the broker, e.g. `Acquirer_Analysis`.
    pub name: String,
    /// Source endpoint, e.g. `Acquirer.q_out`.
    pub source: String,
    /// Sink endpoints; more than one makes this a multi-link.
    pub sinks: Vec<String>,
    /// Queue slots per sink.
    pub capacity: usize,
    /// Fan-out policy; only meaningful for multi-links.
    pub on_full: OnFull,
}

impl LinkSpec {
    /// A single source, single sink link.
    pub fn simple(name: &str, source: &str, sink: &str, capacity: usize) -> Self {
        Self {
            name: name.to_string(),
            source: source.to_string(),
            sinks: vec![sink.to_string()],
            capacity,
            on_full: OnFull::default(),
        }
    }

    /// A fan-out link delivering every item to each sink.
    pub fn fan_out(
        name: &str,
        source: &str,
        sinks: &[String],
        capacity: usize,
        on_full: OnFull,
    ) -> Self {
        Self {
            name: name.to_string(),
            source: source.to_string(),
            sinks: sinks.to_vec(),
            capacity,
            on_full,
        }
    }
}

struct SinkQueue {
    tx: mpsc::Sender<Vec<u8>>,
    /// Present while no reader is attached; a consumer connection takes it
    /// and puts it back on detach, buffered items intact.
    rx: Option<mpsc::Receiver<Vec<u8>>>,
}

struct LinkEntry {
    /// Cleared by `close_link`; while present, late producers may attach.
    source_tx: Option<mpsc::Sender<Vec<u8>>>,
    sinks: HashMap<String, SinkQueue>,
}

#[derive(Default)]
struct Registry {
    links: HashMap<String, LinkEntry>,
}

/// The broker itself. Cheap to clone; all clones share the registry.
#[derive(Clone, Default)]
pub struct LinkBroker {
    registry: Arc<Mutex<Registry>>,
}

impl LinkBroker {
    /// A broker with no links yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a link and create its queues. Multi-links get their
    /// forwarding task here, so a runtime must be current.
    pub fn register(&self, spec: LinkSpec) -> LinkResult<()> {
        let mut registry = self.registry.lock();
        if registry.links.contains_key(&spec.name) {
            return Duplicate {
                link: &spec.name,
            }
            .fail();
        }

        // a zero capacity would panic in the channel constructor
        let capacity = spec.capacity.max(1);
        let mut sinks = HashMap::new();
        let source_tx = if spec.sinks.len() == 1 {
            // one queue, no forwarder
            let (tx, rx) = mpsc::channel(capacity);
            sinks.insert(
                spec.sinks[0].clone(),
                SinkQueue {
                    tx: tx.clone(),
                    rx: Some(rx),
                },
            );
            tx
        } else {
            let (source_tx, source_rx) = mpsc::channel(capacity);
            let mut outputs = Vec::new();
            for sink in &spec.sinks {
                let (tx, rx) = mpsc::channel(capacity);
                outputs.push((sink.clone(), tx.clone()));
                sinks.insert(
                    sink.clone(),
                    SinkQueue {
                        tx,
                        rx: Some(rx),
                    },
                );
            }
            tokio::spawn(forward(
                spec.name.clone(),
                source_rx,
                outputs,
                spec.on_full,
            ));
            source_tx
        };

        debug!(
            "registered link '{}': {} -> {:?} (capacity {})",
            spec.name, spec.source, spec.sinks, spec.capacity
        );
        registry.links.insert(spec.name, LinkEntry {
            source_tx: Some(source_tx),
            sinks,
        });
        Ok(())
    }

    /// Names of all registered links.
    pub fn link_names(&self) -> Vec<String> {
        self.registry.lock().links.keys().cloned().collect()
    }

    /// In-process write end; used by the supervisor for signal links.
    pub fn local_sender(&self, link: &str) -> LinkResult<LinkSender> {
        let registry = self.registry.lock();
        let entry = match registry.links.get(link) {
            Some(entry) => entry,
            None => {
                return Unknown {
                    link,
                }
                .fail()
            }
        };
        match &entry.source_tx {
            Some(tx) => Ok(LinkSender::local(link, tx.clone())),
            None => crate::Closed {
                link,
            }
            .fail(),
        }
    }

    /// In-process read end of one sink; used by the supervisor for comm
    /// links. Enforces the single-reader invariant.
    pub fn local_receiver(&self, link: &str, sink: &str) -> LinkResult<LinkReceiver> {
        let mut registry = self.registry.lock();
        let entry = match registry.links.get_mut(link) {
            Some(entry) => entry,
            None => {
                return Unknown {
                    link,
                }
                .fail()
            }
        };
        let queue = match entry.sinks.get_mut(sink) {
            Some(queue) => queue,
            None => {
                return Unknown {
                    link,
                }
                .fail()
            }
        };
        match queue.rx.take() {
            Some(rx) => Ok(LinkReceiver::local(link, rx)),
            None => crate::SinkBusy {
                link,
                sink,
            }
            .fail(),
        }
    }

    /// Drop the broker-held write end so consumers observe closure once the
    /// queue drains and every producer detaches.
    pub fn close_link(&self, link: &str) {
        if let Some(entry) = self.registry.lock().links.get_mut(link) {
            entry.source_tx = None;
        }
    }

    /// Close every link.
    pub fn close_all(&self) {
        for entry in self.registry.lock().links.values_mut() {
            entry.source_tx = None;
        }
    }

    /// Bind the broker socket and serve attachments until dropped.
    pub async fn serve(&self, path: &Path) -> LinkResult<()> {
        if path.exists() {
            let _ = std::fs::remove_file(path);
        }
        let listener = UnixListener::bind(path).context(Connect {
            path,
        })?;
        let broker = self.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        let broker = broker.clone();
                        tokio::spawn(async move {
                            if let Err(error) = broker.serve_connection(stream).await {
                                debug!("link client detached: {}", error);
                            }
                        });
                    }
                    Err(error) => {
                        warn!("link broker accept failed: {}", error);
                        break;
                    }
                }
            }
        });
        Ok(())
    }

    async fn serve_connection(&self, stream: UnixStream) -> LinkResult<()> {
        let mut io = BufStream::new(stream);
        let hello: Attach = read_frame(&mut io, "attach").await?;
        match hello {
            Attach::Producer {
                link,
            } => self.serve_producer(&mut io, &link).await,
            Attach::Consumer {
                link,
                sink,
            } => self.serve_consumer(&mut io, &link, &sink).await,
        }
    }

    async fn serve_producer(
        &self,
        io: &mut BufStream<UnixStream>,
        link: &str,
    ) -> LinkResult<()> {
        let tx = {
            let registry = self.registry.lock();
            match registry.links.get(link) {
                Some(entry) => entry.source_tx.clone(),
                None => None,
            }
        };
        let tx = match tx {
            Some(tx) => {
                write_frame(io, link, &Response::Ok).await?;
                tx
            }
            None => {
                let refused = Response::Refused {
                    message: format!("no writable link '{}'", link),
                };
                write_frame(io, link, &refused).await?;
                return Ok(());
            }
        };

        loop {
            let request: Request = match read_frame(io, link).await {
                Ok(request) => request,
                Err(LinkError::Closed {
                    ..
                }) => break,
                Err(error) => return Err(error),
            };
            let response = match request {
                Request::Put {
                    data,
                    block: true,
                } => match tx.send(data).await {
                    Ok(()) => Response::Ok,
                    Err(_) => Response::Closed,
                },
                Request::Put {
                    data,
                    block: false,
                } => match tx.try_send(data) {
                    Ok(()) => Response::Ok,
                    Err(mpsc::error::TrySendError::Full(_)) => Response::Full,
                    Err(mpsc::error::TrySendError::Closed(_)) => Response::Closed,
                },
                Request::Close => {
                    write_frame(io, link, &Response::Ok).await?;
                    break;
                }
                _ => Response::Refused {
                    message: "producers only put".to_string(),
                },
            };
            write_frame(io, link, &response).await?;
        }
        Ok(())
    }

    async fn serve_consumer(
        &self,
        io: &mut BufStream<UnixStream>,
        link: &str,
        sink: &str,
    ) -> LinkResult<()> {
        let rx = {
            let mut registry = self.registry.lock();
            match registry
                .links
                .get_mut(link)
                .and_then(|entry| entry.sinks.get_mut(sink))
            {
                Some(queue) => match queue.rx.take() {
                    Some(rx) => Ok(rx),
                    None => Err(format!(
                        "sink '{}' of link '{}' already has a reader",
                        sink, link
                    )),
                },
                None => Err(format!("no sink '{}' on link '{}'", sink, link)),
            }
        };
        let mut rx = match rx {
            Ok(rx) => {
                write_frame(io, link, &Response::Ok).await?;
                rx
            }
            Err(message) => {
                write_frame(io, link, &Response::Refused {
                    message,
                })
                .await?;
                return Ok(());
            }
        };

        let result = consumer_loop(io, link, &mut rx).await;

        // hand the queue back so a revived process can reattach
        if let Some(queue) = self
            .registry
            .lock()
            .links
            .get_mut(link)
            .and_then(|entry| entry.sinks.get_mut(sink))
        {
            queue.rx = Some(rx);
        }
        result
    }
}

async fn consumer_loop(
    io: &mut BufStream<UnixStream>,
    link: &str,
    rx: &mut mpsc::Receiver<Vec<u8>>,
) -> LinkResult<()> {
    loop {
        let request: Request = match read_frame(io, link).await {
            Ok(request) => request,
            Err(LinkError::Closed {
                ..
            }) => break,
            Err(error) => return Err(error),
        };
        let response = match request {
            Request::Get {
                block: false,
                ..
            } => match rx.try_recv() {
                Ok(data) => Response::Item {
                    data,
                },
                Err(mpsc::error::TryRecvError::Empty) => Response::NoItem,
                Err(mpsc::error::TryRecvError::Disconnected) => Response::Closed,
            },
            Request::Get {
                block: true,
                timeout_ms,
            } => {
                // bounded even for "wait forever" requests: the client
                // re-issues on TimedOut, and a dead client frees the
                // queue for a revived successor within one slice
                let slice = timeout_ms
                    .map(Duration::from_millis)
                    .unwrap_or(Duration::from_millis(500));
                match tokio::time::timeout(slice, rx.recv()).await {
                    Ok(Some(data)) => Response::Item {
                        data,
                    },
                    Ok(None) => Response::Closed,
                    Err(_) => Response::TimedOut,
                }
            }
            Request::IsEmpty => Response::IsEmpty {
                empty: rx.is_empty(),
            },
            Request::Close => {
                write_frame(io, link, &Response::Ok).await?;
                break;
            }
            _ => Response::Refused {
                message: "consumers only get".to_string(),
            },
        };
        write_frame(io, link, &response).await?;
    }
    Ok(())
}

async fn forward(
    link: String,
    mut source: mpsc::Receiver<Vec<u8>>,
    outputs: Vec<(String, mpsc::Sender<Vec<u8>>)>,
    on_full: OnFull,
) {
    while let Some(item) = source.recv().await {
        for (sink, tx) in &outputs {
            match on_full {
                OnFull::Block => {
                    if tx.send(item.clone()).await.is_err() {
                        debug!("link '{}': sink '{}' went away", link, sink);
                    }
                }
                OnFull::Drop => match tx.try_send(item.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!("link '{}': sink '{}' full, dropping item", link, sink);
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {}
                },
            }
        }
    }
    debug!("link '{}' forwarder finished", link);
}
