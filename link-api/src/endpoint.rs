//! Link endpoints held by actors and by the supervisor.
//!
//! Remote endpoints talk to the broker socket in strict request/reply;
//! local endpoints (the supervisor's own) address the queues directly.
//! Both expose the same surface: blocking and non-blocking put/get, an
//! emptiness probe, and close.

use std::{
    path::Path,
    time::{Duration, Instant},
};

use serde::{de::DeserializeOwned, Serialize};
use snafu::ResultExt;
use tokio::{io::BufStream, net::UnixStream, sync::mpsc};

use crate::{
    frame::{read_frame, write_frame, Attach, Request, Response},
    Closed, Connect, Deserialize as DeserializeCtx, Empty, Full, LinkResult, Refused,
    Serialize as SerializeCtx, Timeout,
};

/// Remote blocking gets are sliced so the broker never parks on behalf of
/// a client that may be gone.
const POLL_SLICE: Duration = Duration::from_millis(500);

const ATTACH_RETRIES: u32 = 10;
const ATTACH_RETRY_DELAY: Duration = Duration::from_millis(200);

#[derive(Debug)]
struct Connection {
    io: BufStream<UnixStream>,
}

impl Connection {
    async fn attach(path: &Path, link: &str, hello: &Attach) -> LinkResult<Self> {
        // the broker is up before actors spawn; the retry only papers over
        // scheduler jitter right after a revive
        let mut attempt = 0;
        let stream = loop {
            match UnixStream::connect(path).await {
                Ok(stream) => break stream,
                Err(source) => {
                    attempt += 1;
                    if attempt >= ATTACH_RETRIES {
                        return Err(source).context(Connect {
                            path,
                        });
                    }
                    tokio::time::sleep(ATTACH_RETRY_DELAY).await;
                }
            }
        };
        let mut io = BufStream::new(stream);
        write_frame(&mut io, link, hello).await?;
        match read_frame::<_, Response>(&mut io, link).await? {
            Response::Ok => Ok(Connection {
                io,
            }),
            Response::Refused {
                message,
            } => Refused {
                message,
            }
            .fail(),
            other => Refused {
                message: format!("unexpected attach reply {:?}", other),
            }
            .fail(),
        }
    }

    async fn roundtrip(&mut self, link: &str, request: &Request) -> LinkResult<Response> {
        write_frame(&mut self.io, link, request).await?;
        read_frame(&mut self.io, link).await
    }
}

#[derive(Debug)]
enum SenderInner {
    Local(mpsc::Sender<Vec<u8>>),
    Remote(Connection),
}

/// Write end of a link.
#[derive(Debug)]
pub struct LinkSender {
    link: String,
    inner: SenderInner,
}

/// Attach the write end of `link` through the broker socket at `path`.
pub async fn attach_producer(path: &Path, link: &str) -> LinkResult<LinkSender> {
    let hello = Attach::Producer {
        link: link.to_string(),
    };
    let connection = Connection::attach(path, link, &hello).await?;
    Ok(LinkSender {
        link: link.to_string(),
        inner: SenderInner::Remote(connection),
    })
}

/// Attach the read end of one sink of `link` through the broker socket.
pub async fn attach_consumer(
    path: &Path,
    link: &str,
    sink: &str,
) -> LinkResult<LinkReceiver> {
    let hello = Attach::Consumer {
        link: link.to_string(),
        sink: sink.to_string(),
    };
    let connection = Connection::attach(path, link, &hello).await?;
    Ok(LinkReceiver {
        link: link.to_string(),
        inner: ReceiverInner::Remote(connection),
    })
}

impl LinkSender {
    pub(crate) fn local(link: &str, tx: mpsc::Sender<Vec<u8>>) -> Self {
        Self {
            link: link.to_string(),
            inner: SenderInner::Local(tx),
        }
    }

    /// The link this endpoint writes to.
    pub fn link(&self) -> &str {
        &self.link
    }

    /// Enqueue, waiting for room when the link is at capacity.
    pub async fn put(&mut self, data: Vec<u8>) -> LinkResult<()> {
        match &mut self.inner {
            SenderInner::Local(tx) => tx.send(data).await.map_err(|_| {
                Closed {
                    link: &self.link,
                }
                .build()
            }),
            SenderInner::Remote(connection) => {
                let request = Request::Put {
                    data,
                    block: true,
                };
                match connection.roundtrip(&self.link, &request).await? {
                    Response::Ok => Ok(()),
                    Response::Closed => Closed {
                        link: &self.link,
                    }
                    .fail(),
                    other => Refused {
                        message: format!("unexpected put reply {:?}", other),
                    }
                    .fail(),
                }
            }
        }
    }

    /// Enqueue or fail fast with `Full`.
    pub async fn put_nowait(&mut self, data: Vec<u8>) -> LinkResult<()> {
        match &mut self.inner {
            SenderInner::Local(tx) => match tx.try_send(data) {
                Ok(()) => Ok(()),
                Err(mpsc::error::TrySendError::Full(_)) => Full {
                    link: &self.link,
                }
                .fail(),
                Err(mpsc::error::TrySendError::Closed(_)) => Closed {
                    link: &self.link,
                }
                .fail(),
            },
            SenderInner::Remote(connection) => {
                let request = Request::Put {
                    data,
                    block: false,
                };
                match connection.roundtrip(&self.link, &request).await? {
                    Response::Ok => Ok(()),
                    Response::Full => Full {
                        link: &self.link,
                    }
                    .fail(),
                    Response::Closed => Closed {
                        link: &self.link,
                    }
                    .fail(),
                    other => Refused {
                        message: format!("unexpected put reply {:?}", other),
                    }
                    .fail(),
                }
            }
        }
    }

    /// Serialize and `put`.
    pub async fn put_obj<T: Serialize>(&mut self, item: &T) -> LinkResult<()> {
        let data = bincode::serialize(item).context(SerializeCtx {
            link: &self.link,
        })?;
        self.put(data).await
    }

    /// Serialize and `put_nowait`.
    pub async fn put_obj_nowait<T: Serialize>(&mut self, item: &T) -> LinkResult<()> {
        let data = bincode::serialize(item).context(SerializeCtx {
            link: &self.link,
        })?;
        self.put_nowait(data).await
    }

    /// Detach from the link. The link itself stays registered; only the
    /// supervisor tears links down.
    pub async fn close(&mut self) -> LinkResult<()> {
        if let SenderInner::Remote(connection) = &mut self.inner {
            let _ = connection.roundtrip(&self.link, &Request::Close).await;
        }
        Ok(())
    }
}

#[derive(Debug)]
enum ReceiverInner {
    Local(mpsc::Receiver<Vec<u8>>),
    Remote(Connection),
}

/// Read end of one sink of a link.
#[derive(Debug)]
pub struct LinkReceiver {
    link: String,
    inner: ReceiverInner,
}

impl LinkReceiver {
    pub(crate) fn local(link: &str, rx: mpsc::Receiver<Vec<u8>>) -> Self {
        Self {
            link: link.to_string(),
            inner: ReceiverInner::Local(rx),
        }
    }

    /// The link this endpoint reads from.
    pub fn link(&self) -> &str {
        &self.link
    }

    /// Dequeue, waiting for an item. Ends with `Closed` once the link is
    /// closed and drained.
    pub async fn get(&mut self) -> LinkResult<Vec<u8>> {
        self.get_inner(None).await
    }

    /// Dequeue with a bounded wait.
    pub async fn get_timeout(&mut self, timeout: Duration) -> LinkResult<Vec<u8>> {
        self.get_inner(Some(timeout)).await
    }

    async fn get_inner(&mut self, timeout: Option<Duration>) -> LinkResult<Vec<u8>> {
        match &mut self.inner {
            ReceiverInner::Local(rx) => match timeout {
                None => rx.recv().await.ok_or_else(|| {
                    Closed {
                        link: &self.link,
                    }
                    .build()
                }),
                Some(timeout) => match tokio::time::timeout(timeout, rx.recv()).await {
                    Ok(Some(data)) => Ok(data),
                    Ok(None) => Closed {
                        link: &self.link,
                    }
                    .fail(),
                    Err(_) => Timeout {
                        link: &self.link,
                    }
                    .fail(),
                },
            },
            ReceiverInner::Remote(connection) => {
                let deadline = timeout.map(|timeout| Instant::now() + timeout);
                loop {
                    let slice = match deadline {
                        None => POLL_SLICE,
                        Some(deadline) => {
                            let left = deadline.saturating_duration_since(Instant::now());
                            if left.is_zero() {
                                return Timeout {
                                    link: &self.link,
                                }
                                .fail();
                            }
                            left.min(POLL_SLICE)
                        }
                    };
                    let request = Request::Get {
                        block: true,
                        timeout_ms: Some(slice.as_millis() as u64),
                    };
                    match connection.roundtrip(&self.link, &request).await? {
                        Response::Item {
                            data,
                        } => return Ok(data),
                        Response::TimedOut => continue,
                        Response::Closed => {
                            return Closed {
                                link: &self.link,
                            }
                            .fail()
                        }
                        other => {
                            return Refused {
                                message: format!("unexpected get reply {:?}", other),
                            }
                            .fail()
                        }
                    }
                }
            }
        }
    }

    /// Dequeue or fail fast with `Empty`.
    pub async fn get_nowait(&mut self) -> LinkResult<Vec<u8>> {
        match &mut self.inner {
            ReceiverInner::Local(rx) => match rx.try_recv() {
                Ok(data) => Ok(data),
                Err(mpsc::error::TryRecvError::Empty) => Empty {
                    link: &self.link,
                }
                .fail(),
                Err(mpsc::error::TryRecvError::Disconnected) => Closed {
                    link: &self.link,
                }
                .fail(),
            },
            ReceiverInner::Remote(connection) => {
                let request = Request::Get {
                    block: false,
                    timeout_ms: None,
                };
                match connection.roundtrip(&self.link, &request).await? {
                    Response::Item {
                        data,
                    } => Ok(data),
                    Response::NoItem => Empty {
                        link: &self.link,
                    }
                    .fail(),
                    Response::Closed => Closed {
                        link: &self.link,
                    }
                    .fail(),
                    other => Refused {
                        message: format!("unexpected get reply {:?}", other),
                    }
                    .fail(),
                }
            }
        }
    }

    /// Whether the queue behind this endpoint is currently empty.
    pub async fn empty(&mut self) -> LinkResult<bool> {
        match &mut self.inner {
            ReceiverInner::Local(rx) => Ok(rx.is_empty()),
            ReceiverInner::Remote(connection) => {
                match connection.roundtrip(&self.link, &Request::IsEmpty).await? {
                    Response::IsEmpty {
                        empty,
                    } => Ok(empty),
                    other => Refused {
                        message: format!("unexpected empty reply {:?}", other),
                    }
                    .fail(),
                }
            }
        }
    }

    /// `get` and deserialize.
    pub async fn get_obj<T: DeserializeOwned>(&mut self) -> LinkResult<T> {
        let data = self.get().await?;
        self.decode(&data)
    }

    /// `get_timeout` and deserialize.
    pub async fn get_obj_timeout<T: DeserializeOwned>(
        &mut self,
        timeout: Duration,
    ) -> LinkResult<T> {
        let data = self.get_timeout(timeout).await?;
        self.decode(&data)
    }

    /// `get_nowait` and deserialize.
    pub async fn get_obj_nowait<T: DeserializeOwned>(&mut self) -> LinkResult<T> {
        let data = self.get_nowait().await?;
        self.decode(&data)
    }

    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> LinkResult<T> {
        bincode::deserialize(data).context(DeserializeCtx {
            link: &self.link,
        })
    }

    /// Detach from the link, handing the queue back to the broker.
    pub async fn close(&mut self) -> LinkResult<()> {
        match &mut self.inner {
            ReceiverInner::Local(rx) => {
                rx.close();
                Ok(())
            }
            ReceiverInner::Remote(connection) => {
                let _ = connection.roundtrip(&self.link, &Request::Close).await;
                Ok(())
            }
        }
    }
}
