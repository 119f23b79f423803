//! TCP client for the store service.

use std::time::Duration;

use async_trait::async_trait;
use snafu::ResultExt;
use tokio::{io::BufStream, net::TcpStream, sync::mpsc};
use tracing::debug;

use crate::{
    wire::{read_frame, write_frame, WireError, WireRequest, WireResponse},
    Connect, Handle, ObjectStore, Protocol, StoreError, StoreEvents, StoreResult,
};

const CONNECT_RETRIES: u32 = 50;
const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// One connection to the store service. Requests are strict
/// request/reply; `subscribe` opens a second, dedicated connection.
pub struct RemoteStore {
    port: u16,
    io: BufStream<TcpStream>,
}

impl RemoteStore {
    /// Connect to the service on localhost, retrying briefly: actor
    /// processes may come up a moment before the service accepts.
    pub async fn connect(port: u16) -> StoreResult<Self> {
        let io = Self::open(port).await?;
        Ok(Self {
            port,
            io,
        })
    }

    async fn open(port: u16) -> StoreResult<BufStream<TcpStream>> {
        let endpoint = format!("127.0.0.1:{}", port);
        let mut attempt = 0;
        loop {
            match TcpStream::connect(&endpoint).await {
                Ok(stream) => {
                    debug!("connected to the store service at {}", endpoint);
                    return Ok(BufStream::new(stream));
                }
                Err(source) => {
                    attempt += 1;
                    if attempt >= CONNECT_RETRIES {
                        return Err(source).context(Connect {
                            endpoint,
                        });
                    }
                    tokio::time::sleep(CONNECT_RETRY_DELAY).await;
                }
            }
        }
    }

    async fn roundtrip(&mut self, request: &WireRequest) -> StoreResult<WireResponse> {
        write_frame(&mut self.io, request).await?;
        read_frame(&mut self.io).await
    }
}

fn store_error(error: WireError) -> StoreError {
    match error {
        WireError::Full {
            needed,
            available,
        } => StoreError::StoreFull {
            needed,
            available,
        },
        WireError::NotFound {
            id,
        } => StoreError::NotFound {
            id,
        },
        WireError::Other {
            message,
        } => Protocol {
            message,
        }
        .build(),
    }
}

#[async_trait]
impl ObjectStore for RemoteStore {
    async fn put(&mut self, bytes: &[u8], name: Option<&str>) -> StoreResult<Handle> {
        let request = WireRequest::Put {
            bytes: bytes.to_vec(),
            name: name.map(str::to_string),
        };
        match self.roundtrip(&request).await? {
            WireResponse::Handle(handle) => Ok(handle),
            WireResponse::Error(error) => Err(store_error(error)),
            other => Protocol {
                message: format!("unexpected put reply {:?}", other),
            }
            .fail(),
        }
    }

    async fn get(&mut self, handle: &Handle) -> StoreResult<Vec<u8>> {
        let request = WireRequest::Get {
            handle: handle.clone(),
        };
        match self.roundtrip(&request).await? {
            WireResponse::Value(bytes) => Ok(bytes),
            WireResponse::Error(error) => Err(store_error(error)),
            other => Protocol {
                message: format!("unexpected get reply {:?}", other),
            }
            .fail(),
        }
    }

    async fn get_list(&mut self, handles: &[Handle]) -> StoreResult<Vec<Vec<u8>>> {
        let request = WireRequest::GetList {
            handles: handles.to_vec(),
        };
        match self.roundtrip(&request).await? {
            WireResponse::Values(values) => Ok(values),
            WireResponse::Error(error) => Err(store_error(error)),
            other => Protocol {
                message: format!("unexpected get_list reply {:?}", other),
            }
            .fail(),
        }
    }

    async fn expire(&mut self, handle: &Handle, after: Duration) -> StoreResult<()> {
        let request = WireRequest::Expire {
            handle: handle.clone(),
            after_ms: after.as_millis() as u64,
        };
        match self.roundtrip(&request).await? {
            WireResponse::Done => Ok(()),
            WireResponse::Error(error) => Err(store_error(error)),
            other => Protocol {
                message: format!("unexpected expire reply {:?}", other),
            }
            .fail(),
        }
    }

    async fn free(&mut self, handle: &Handle) -> StoreResult<()> {
        let request = WireRequest::Free {
            handle: handle.clone(),
        };
        match self.roundtrip(&request).await? {
            WireResponse::Done => Ok(()),
            WireResponse::Error(error) => Err(store_error(error)),
            other => Protocol {
                message: format!("unexpected free reply {:?}", other),
            }
            .fail(),
        }
    }

    async fn subscribe(&mut self) -> StoreResult<StoreEvents> {
        let mut io = Self::open(self.port).await?;
        write_frame(&mut io, &WireRequest::Subscribe).await?;
        match read_frame::<_, WireResponse>(&mut io).await? {
            WireResponse::Done => {}
            other => {
                return Protocol {
                    message: format!("unexpected subscribe reply {:?}", other),
                }
                .fail()
            }
        }
        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(async move {
            loop {
                match read_frame::<_, WireResponse>(&mut io).await {
                    Ok(WireResponse::Event(event)) => {
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Ok(other) => {
                        debug!("unexpected frame on event stream: {:?}", other);
                        break;
                    }
                    Err(_) => break,
                }
            }
        });
        Ok(StoreEvents::new(rx))
    }
}
