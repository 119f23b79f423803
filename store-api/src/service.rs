//! The external store service.
//!
//! A TCP service on localhost owned by the supervisor process. All state
//! lives with a single task; connections turn wire frames into operations
//! and wait on a oneshot for the outcome, so every mutation is serialized
//! and the append-only log needs no locking.

use std::{
    collections::HashMap,
    path::PathBuf,
    time::{Duration, Instant},
};

use tokio::{
    io::BufStream,
    net::{TcpListener, TcpStream},
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    aof::{replay, AofRecord, AofWriter, FsyncPolicy},
    wire::{read_frame, write_frame, WireError, WireRequest, WireResponse},
    Bind, Handle, StoreError, StoreEvent, StoreResult,
};

/// Default service port; probing starts here when none is configured.
pub const DEFAULT_STORE_PORT: u16 = 6379;
const PROBE_ATTEMPTS: u16 = 20;
const SWEEP_INTERVAL: Duration = Duration::from_millis(100);

/// How the service chooses its port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortSpec {
    /// Bind exactly this port or fail.
    Explicit(u16),
    /// Probe upward from this port for a bounded number of attempts.
    Probe {
        /// First port tried.
        from: u16,
    },
    /// Let the kernel pick.
    Any,
}

/// Durability configuration for the service.
#[derive(Debug, Clone)]
pub struct AofOpts {
    /// Directory holding the append-only log.
    pub dir: PathBuf,
    /// When appends reach stable storage.
    pub fsync: FsyncPolicy,
}

/// Startup configuration for the service.
#[derive(Debug, Clone)]
pub struct StoreServiceOpts {
    /// Port selection.
    pub port: PortSpec,
    /// Byte budget across all live payloads.
    pub budget: u64,
    /// Durability; `None` disables saving.
    pub aof: Option<AofOpts>,
}

type Reply<T> = oneshot::Sender<StoreResult<T>>;

enum Op {
    Put {
        bytes: Vec<u8>,
        name: Option<String>,
        reply: Reply<Handle>,
    },
    Get {
        handle: Handle,
        reply: Reply<Vec<u8>>,
    },
    GetList {
        handles: Vec<Handle>,
        reply: Reply<Vec<Vec<u8>>>,
    },
    Expire {
        handle: Handle,
        after: Duration,
        reply: Reply<()>,
    },
    Free {
        handle: Handle,
        reply: Reply<()>,
    },
    Subscribe {
        reply: oneshot::Sender<mpsc::Receiver<StoreEvent>>,
    },
}

/// A running store service.
#[derive(Debug)]
pub struct StoreService {
    port: u16,
    shutdown: Option<oneshot::Sender<()>>,
    accept_task: JoinHandle<()>,
    state_task: JoinHandle<()>,
}

impl StoreService {
    /// Bind, replay any existing log, and start serving.
    pub async fn start(opts: StoreServiceOpts) -> StoreResult<Self> {
        let mut state = State::new(opts.budget);
        let mut flush_every_second = false;
        if let Some(aof) = &opts.aof {
            let records = replay(&aof.dir)?;
            if !records.is_empty() {
                info!(
                    "replayed {} append-only records from '{}'",
                    records.len(),
                    aof.dir.display()
                );
            }
            state.apply_replay(records);
            state.aof = Some(AofWriter::open(&aof.dir, aof.fsync)?);
            flush_every_second = aof.fsync == FsyncPolicy::EverySecond;
        }

        let listener = Self::bind(opts.port).await?;
        let port = listener
            .local_addr()
            .map_err(|source| StoreError::Connect {
                endpoint: "127.0.0.1".to_string(),
                source,
            })?
            .port();
        info!("store service listening on port {}", port);

        let (ops_tx, ops_rx) = mpsc::channel(64);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let state_task = tokio::spawn(state_loop(
            state,
            ops_rx,
            shutdown_rx,
            flush_every_second,
        ));
        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        let ops = ops_tx.clone();
                        tokio::spawn(async move {
                            if let Err(error) = connection(stream, ops).await {
                                debug!("store client detached: {}", error);
                            }
                        });
                    }
                    Err(error) => {
                        warn!("store service accept failed: {}", error);
                        break;
                    }
                }
            }
        });

        Ok(Self {
            port,
            shutdown: Some(shutdown_tx),
            accept_task,
            state_task,
        })
    }

    async fn bind(port: PortSpec) -> StoreResult<TcpListener> {
        match port {
            PortSpec::Explicit(port) => TcpListener::bind(("127.0.0.1", port))
                .await
                .map_err(|error| {
                    Bind {
                        detail: format!("port {} is unavailable: {}", port, error),
                    }
                    .build()
                }),
            PortSpec::Any => {
                TcpListener::bind(("127.0.0.1", 0)).await.map_err(|error| {
                    Bind {
                        detail: error.to_string(),
                    }
                    .build()
                })
            }
            PortSpec::Probe {
                from,
            } => {
                for attempt in 0..PROBE_ATTEMPTS {
                    let port = from + attempt;
                    match TcpListener::bind(("127.0.0.1", port)).await {
                        Ok(listener) => return Ok(listener),
                        Err(error) => {
                            info!("store port {} not usable: {}", port, error);
                        }
                    }
                }
                Bind {
                    detail: format!(
                        "no free port in {}..{}",
                        from,
                        from + PROBE_ATTEMPTS
                    ),
                }
                .fail()
            }
        }
    }

    /// The bound port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Stop serving; flushes the append-only log before returning.
    pub async fn stop(mut self) {
        self.accept_task.abort();
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        let _ = self.state_task.await;
    }
}

struct Entry {
    bytes: Vec<u8>,
    name: Option<String>,
    deadline: Option<Instant>,
}

struct State {
    budget: u64,
    used: u64,
    next_id: u64,
    entries: HashMap<u64, Entry>,
    subscribers: Vec<mpsc::Sender<StoreEvent>>,
    aof: Option<AofWriter>,
}

impl State {
    fn new(budget: u64) -> Self {
        Self {
            budget,
            used: 0,
            next_id: 1,
            entries: HashMap::new(),
            subscribers: Vec::new(),
            aof: None,
        }
    }

    fn apply_replay(&mut self, records: Vec<AofRecord>) {
        for record in records {
            match record {
                AofRecord::Put {
                    id,
                    name,
                    bytes,
                } => {
                    self.used += bytes.len() as u64;
                    self.next_id = self.next_id.max(id + 1);
                    self.entries.insert(id, Entry {
                        bytes,
                        name,
                        deadline: None,
                    });
                }
                AofRecord::Free {
                    id,
                } => {
                    if let Some(entry) = self.entries.remove(&id) {
                        self.used -= entry.bytes.len() as u64;
                    }
                }
            }
        }
        if self.used > self.budget {
            warn!(
                "replayed payloads ({} bytes) exceed the configured budget ({})",
                self.used, self.budget
            );
        }
    }

    fn publish(&mut self, event: StoreEvent) {
        self.subscribers
            .retain(|subscriber| subscriber.try_send(event.clone()).is_ok());
    }

    fn put(&mut self, bytes: Vec<u8>, name: Option<String>) -> StoreResult<Handle> {
        let len = bytes.len() as u64;
        if self.used + len > self.budget {
            return crate::StoreFull {
                needed: len,
                available: self.budget.saturating_sub(self.used),
            }
            .fail();
        }
        let id = self.next_id;
        if let Some(aof) = &mut self.aof {
            aof.append(&AofRecord::Put {
                id,
                name: name.clone(),
                bytes: bytes.clone(),
            })?;
        }
        self.next_id += 1;
        self.used += len;
        self.entries.insert(id, Entry {
            bytes,
            name: name.clone(),
            deadline: None,
        });
        self.publish(StoreEvent::Added {
            id,
            name: name.clone(),
            len,
        });
        Ok(Handle::new(id, 0, len, name))
    }

    fn get(&self, handle: &Handle) -> StoreResult<Vec<u8>> {
        match self.entries.get(&handle.id()) {
            Some(entry) => Ok(entry.bytes.clone()),
            None => crate::NotFound {
                id: handle.id(),
            }
            .fail(),
        }
    }

    fn remove(&mut self, id: u64) -> Option<Entry> {
        let entry = self.entries.remove(&id)?;
        self.used -= entry.bytes.len() as u64;
        if let Some(aof) = &mut self.aof {
            if let Err(error) = aof.append(&AofRecord::Free {
                id,
            }) {
                warn!("failed to log removal of {}: {}", id, error);
            }
        }
        Some(entry)
    }

    fn sweep(&mut self) {
        let now = Instant::now();
        let due: Vec<u64> = self
            .entries
            .iter()
            .filter(|(_, entry)| {
                entry.deadline.map(|deadline| deadline <= now).unwrap_or(false)
            })
            .map(|(id, _)| *id)
            .collect();
        for id in due {
            if let Some(entry) = self.remove(id) {
                debug!("evicted expired payload {} ({:?})", id, entry.name);
                self.publish(StoreEvent::Evicted {
                    id,
                });
            }
        }
    }

    fn handle(&mut self, op: Op) {
        match op {
            Op::Put {
                bytes,
                name,
                reply,
            } => {
                let _ = reply.send(self.put(bytes, name));
            }
            Op::Get {
                handle,
                reply,
            } => {
                let _ = reply.send(self.get(&handle));
            }
            Op::GetList {
                handles,
                reply,
            } => {
                let result = handles
                    .iter()
                    .map(|handle| self.get(handle))
                    .collect::<StoreResult<Vec<_>>>();
                let _ = reply.send(result);
            }
            Op::Expire {
                handle,
                after,
                reply,
            } => {
                let result = match self.entries.get_mut(&handle.id()) {
                    Some(entry) => {
                        entry.deadline = Some(Instant::now() + after);
                        Ok(())
                    }
                    None => crate::NotFound {
                        id: handle.id(),
                    }
                    .fail(),
                };
                let _ = reply.send(result);
            }
            Op::Free {
                handle,
                reply,
            } => {
                let result = match self.remove(handle.id()) {
                    Some(_) => {
                        self.publish(StoreEvent::Freed {
                            id: handle.id(),
                        });
                        Ok(())
                    }
                    None => crate::NotFound {
                        id: handle.id(),
                    }
                    .fail(),
                };
                let _ = reply.send(result);
            }
            Op::Subscribe {
                reply,
            } => {
                let (tx, rx) = mpsc::channel(256);
                self.subscribers.push(tx);
                let _ = reply.send(rx);
            }
        }
    }
}

async fn state_loop(
    mut state: State,
    mut ops: mpsc::Receiver<Op>,
    mut shutdown: oneshot::Receiver<()>,
    flush_every_second: bool,
) {
    let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
    let mut flush = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            op = ops.recv() => match op {
                Some(op) => state.handle(op),
                None => break,
            },
            _ = sweep.tick() => state.sweep(),
            _ = flush.tick(), if flush_every_second => {
                if let Some(aof) = &mut state.aof {
                    if let Err(error) = aof.sync() {
                        warn!("scheduled append-only log sync failed: {}", error);
                    }
                }
            }
            _ = &mut shutdown => break,
        }
    }
    if let Some(aof) = &mut state.aof {
        if let Err(error) = aof.sync() {
            warn!("final append-only log sync failed: {}", error);
        }
    }
    debug!("store service state task finished");
}

async fn connection(stream: TcpStream, ops: mpsc::Sender<Op>) -> StoreResult<()> {
    let mut io = BufStream::new(stream);
    loop {
        let request: WireRequest = match read_frame(&mut io).await {
            Ok(request) => request,
            Err(StoreError::Closed) => break,
            Err(error) => return Err(error),
        };
        match request {
            WireRequest::Put {
                bytes,
                name,
            } => {
                let (reply, rx) = oneshot::channel();
                let op = Op::Put {
                    bytes,
                    name,
                    reply,
                };
                respond(&mut io, &ops, op, rx, WireResponse::Handle).await?;
            }
            WireRequest::Get {
                handle,
            } => {
                let (reply, rx) = oneshot::channel();
                let op = Op::Get {
                    handle,
                    reply,
                };
                respond(&mut io, &ops, op, rx, WireResponse::Value).await?;
            }
            WireRequest::GetList {
                handles,
            } => {
                let (reply, rx) = oneshot::channel();
                let op = Op::GetList {
                    handles,
                    reply,
                };
                respond(&mut io, &ops, op, rx, WireResponse::Values).await?;
            }
            WireRequest::Expire {
                handle,
                after_ms,
            } => {
                let (reply, rx) = oneshot::channel();
                let op = Op::Expire {
                    handle,
                    after: Duration::from_millis(after_ms),
                    reply,
                };
                respond(&mut io, &ops, op, rx, |_| WireResponse::Done).await?;
            }
            WireRequest::Free {
                handle,
            } => {
                let (reply, rx) = oneshot::channel();
                let op = Op::Free {
                    handle,
                    reply,
                };
                respond(&mut io, &ops, op, rx, |_| WireResponse::Done).await?;
            }
            WireRequest::Subscribe => {
                let (reply, rx) = oneshot::channel();
                if ops.send(Op::Subscribe {
                    reply,
                })
                .await
                .is_err()
                {
                    break;
                }
                let mut events = match rx.await {
                    Ok(events) => events,
                    Err(_) => break,
                };
                write_frame(&mut io, &WireResponse::Done).await?;
                while let Some(event) = events.recv().await {
                    write_frame(&mut io, &WireResponse::Event(event)).await?;
                }
                break;
            }
        }
    }
    Ok(())
}

async fn respond<T>(
    io: &mut BufStream<TcpStream>,
    ops: &mpsc::Sender<Op>,
    op: Op,
    rx: oneshot::Receiver<StoreResult<T>>,
    wrap: impl FnOnce(T) -> WireResponse,
) -> StoreResult<()> {
    if ops.send(op).await.is_err() {
        return write_frame(
            io,
            &WireResponse::Error(WireError::Other {
                message: "store service is shutting down".to_string(),
            }),
        )
        .await;
    }
    let response = match rx.await {
        Ok(Ok(value)) => wrap(value),
        Ok(Err(error)) => WireResponse::Error(wire_error(error)),
        Err(_) => WireResponse::Error(WireError::Other {
            message: "store service dropped the request".to_string(),
        }),
    };
    write_frame(io, &response).await
}

fn wire_error(error: StoreError) -> WireError {
    match error {
        StoreError::StoreFull {
            needed,
            available,
        } => WireError::Full {
            needed,
            available,
        },
        StoreError::NotFound {
            id,
        } => WireError::NotFound {
            id,
        },
        other => WireError::Other {
            message: other.to_string(),
        },
    }
}
