#![warn(missing_docs)]
//! The object store: payload-by-handle exchange between pipeline actors.
//!
//! Actors put frame-sized payloads into the store and pass the returned
//! [`Handle`] over a link; the next stage dereferences the handle against
//! its own store client. Two backends exist behind the [`ObjectStore`]
//! trait: a shared-memory arena mapped into every actor process (fastest,
//! no durability) and a TCP store service with an optional append-only log
//! for warm restarts.

mod aof;
mod remote;
mod service;
mod shm;
mod wire;

pub use aof::FsyncPolicy;
pub use remote::RemoteStore;
pub use service::{
    AofOpts, PortSpec, StoreService, StoreServiceOpts, DEFAULT_STORE_PORT,
};
pub use shm::{unlink_region, ShmStore};

use std::{
    fmt,
    hash::{Hash, Hasher},
    time::Duration,
};

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use snafu::{ResultExt, Snafu};
use tokio::sync::mpsc;

/// Result wrapper for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors returned by store clients and backends.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), context(suffix(false)))]
pub enum StoreError {
    /// The payload does not fit the remaining byte budget.
    #[snafu(display(
        "Store is full: {} bytes needed, {} available",
        needed,
        available
    ))]
    StoreFull { needed: u64, available: u64 },
    /// The handle was never minted here, was freed, or expired.
    #[snafu(display("No payload for handle {}", id))]
    NotFound { id: u64 },
    /// Could not reach the store service.
    #[snafu(display("Failed to connect to the store at {}: {}", endpoint, source))]
    Connect {
        endpoint: String,
        source: std::io::Error,
    },
    /// The service connection broke.
    #[snafu(display("Store transport failed: {}", source))]
    Wire { source: std::io::Error },
    /// The service connection is gone.
    #[snafu(display("The store connection is closed"))]
    Closed,
    /// Value encoding failed.
    #[snafu(display("Failed to serialize a value for the store: {}", source))]
    SerializeValue { source: bincode::Error },
    /// Value decoding failed.
    #[snafu(display(
        "Failed to deserialize the payload of handle {}: {}",
        id,
        source
    ))]
    DeserializeValue { id: u64, source: bincode::Error },
    /// Shared-memory region creation or mapping failed.
    #[snafu(display("Store region '{}' could not be opened: {}", name, source))]
    Region {
        name: String,
        source: std::io::Error,
    },
    /// The mapped region does not carry an arena header.
    #[snafu(display("The store region '{}' is not a valid arena", name))]
    BadRegion { name: String },
    /// Could not bind a port for the store service.
    #[snafu(display("Could not bind a store service port: {}", detail))]
    Bind { detail: String },
    /// Append-only log I/O failed.
    #[snafu(display(
        "Failed to access the append-only log at '{}': {}",
        path.display(),
        source
    ))]
    Aof {
        path: std::path::PathBuf,
        source: std::io::Error,
    },
    /// A frame on the service connection failed to decode.
    #[snafu(display("Corrupt frame on the store connection: {}", source))]
    Frame { source: bincode::Error },
    /// The service answered out of protocol.
    #[snafu(display("Unexpected reply from the store service: {}", message))]
    Protocol { message: String },
}

/// Opaque token referring to a payload in the store.
///
/// Minted atomically by the backend on `put`. Equality and hashing go by
/// the mint id alone; `name` is a human-readable tag for debugging and
/// `loc`/`len` are backend location hints (the region offset for the
/// arena backend, zero for the service). Handles are serializable so they
/// can travel over links.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Handle {
    id: u64,
    loc: u64,
    len: u64,
    name: Option<String>,
}

impl Handle {
    pub(crate) fn new(id: u64, loc: u64, len: u64, name: Option<String>) -> Self {
        Self {
            id,
            loc,
            len,
            name,
        }
    }

    /// The mint id; unique per backend instance.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Byte length of the payload.
    pub fn size(&self) -> u64 {
        self.len
    }

    /// The debugging tag given at `put`, if any.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub(crate) fn loc(&self) -> u64 {
        self.loc
    }
}

impl PartialEq for Handle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl Eq for Handle {}

impl Hash for Handle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "handle {} ('{}')", self.id, name),
            None => write!(f, "handle {}", self.id),
        }
    }
}

/// Store lifecycle events observable through `subscribe`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreEvent {
    /// A payload was stored.
    Added {
        /// Mint id of the new payload.
        id: u64,
        /// Debugging tag, if any.
        name: Option<String>,
        /// Byte length.
        len: u64,
    },
    /// A payload reached its expiry deadline and was evicted.
    Evicted {
        /// Mint id of the evicted payload.
        id: u64,
    },
    /// A payload was explicitly freed.
    Freed {
        /// Mint id of the freed payload.
        id: u64,
    },
}

/// Stream of [`StoreEvent`]s delivered to a subscriber.
pub struct StoreEvents {
    rx: mpsc::Receiver<StoreEvent>,
}

impl StoreEvents {
    pub(crate) fn new(rx: mpsc::Receiver<StoreEvent>) -> Self {
        Self {
            rx,
        }
    }

    /// Next event, or `None` once the backend is gone.
    pub async fn next(&mut self) -> Option<StoreEvent> {
        self.rx.recv().await
    }
}

/// The store contract every backend client implements.
///
/// The store records and returns byte sequences; it never interprets
/// them. Typed access is layered on top by [`ObjectStoreExt`].
#[async_trait]
pub trait ObjectStore {
    /// Store a payload, minting a handle. `name` is a debugging tag, not
    /// a key.
    async fn put(&mut self, bytes: &[u8], name: Option<&str>) -> StoreResult<Handle>;

    /// The payload behind `handle`, byte-identical to what was put.
    async fn get(&mut self, handle: &Handle) -> StoreResult<Vec<u8>>;

    /// Batched `get`; one missing handle fails the whole call.
    async fn get_list(&mut self, handles: &[Handle]) -> StoreResult<Vec<Vec<u8>>>;

    /// Schedule eviction of `handle` after a delay. Advisory on backends
    /// without reclamation.
    async fn expire(&mut self, handle: &Handle, after: Duration) -> StoreResult<()>;

    /// Drop the payload now. Advisory on backends without reclamation.
    async fn free(&mut self, handle: &Handle) -> StoreResult<()>;

    /// Register for store events (additions, evictions, frees).
    async fn subscribe(&mut self) -> StoreResult<StoreEvents>;
}

/// Bincode-typed convenience layer over [`ObjectStore`].
#[async_trait]
pub trait ObjectStoreExt: ObjectStore + Send {
    /// Serialize `value` and `put` it.
    async fn put_obj<T>(&mut self, value: &T, name: Option<&str>) -> StoreResult<Handle>
    where
        T: Serialize + Sync,
    {
        let bytes = bincode::serialize(value).context(SerializeValue)?;
        self.put(&bytes, name).await
    }

    /// `get` and deserialize.
    async fn get_obj<T>(&mut self, handle: &Handle) -> StoreResult<T>
    where
        T: DeserializeOwned + Send,
    {
        let bytes = self.get(handle).await?;
        bincode::deserialize(&bytes).context(DeserializeValue {
            id: handle.id(),
        })
    }
}

#[async_trait]
impl<S: ObjectStore + Send + ?Sized> ObjectStoreExt for S {}

/// How an actor process reaches the store chosen for this run. Handed to
/// children inside their spawn spec.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StoreDescriptor {
    /// Shared-memory arena: region name and byte budget.
    Arena {
        /// POSIX shm name, e.g. `/nexus-store-1234`.
        region: String,
        /// Region byte budget.
        size: u64,
    },
    /// TCP store service on localhost.
    Service {
        /// The service port.
        port: u16,
    },
}

impl StoreDescriptor {
    /// Connect a client appropriate for this backend.
    pub async fn connect(&self) -> StoreResult<StoreClient> {
        match self {
            StoreDescriptor::Arena {
                region,
                ..
            } => Ok(StoreClient::Arena(ShmStore::open(region)?)),
            StoreDescriptor::Service {
                port,
            } => Ok(StoreClient::Service(RemoteStore::connect(*port).await?)),
        }
    }
}

/// A connected store client of either backend.
pub enum StoreClient {
    /// Shared-memory arena mapping.
    Arena(ShmStore),
    /// TCP connection to the store service.
    Service(RemoteStore),
}

#[async_trait]
impl ObjectStore for StoreClient {
    async fn put(&mut self, bytes: &[u8], name: Option<&str>) -> StoreResult<Handle> {
        match self {
            StoreClient::Arena(store) => store.put(bytes, name).await,
            StoreClient::Service(store) => store.put(bytes, name).await,
        }
    }

    async fn get(&mut self, handle: &Handle) -> StoreResult<Vec<u8>> {
        match self {
            StoreClient::Arena(store) => store.get(handle).await,
            StoreClient::Service(store) => store.get(handle).await,
        }
    }

    async fn get_list(&mut self, handles: &[Handle]) -> StoreResult<Vec<Vec<u8>>> {
        match self {
            StoreClient::Arena(store) => store.get_list(handles).await,
            StoreClient::Service(store) => store.get_list(handles).await,
        }
    }

    async fn expire(&mut self, handle: &Handle, after: Duration) -> StoreResult<()> {
        match self {
            StoreClient::Arena(store) => store.expire(handle, after).await,
            StoreClient::Service(store) => store.expire(handle, after).await,
        }
    }

    async fn free(&mut self, handle: &Handle) -> StoreResult<()> {
        match self {
            StoreClient::Arena(store) => store.free(handle).await,
            StoreClient::Service(store) => store.free(handle).await,
        }
    }

    async fn subscribe(&mut self) -> StoreResult<StoreEvents> {
        match self {
            StoreClient::Arena(store) => store.subscribe().await,
            StoreClient::Service(store) => store.subscribe().await,
        }
    }
}
