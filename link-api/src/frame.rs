//! Length-prefixed bincode framing for broker connections.
//!
//! Every frame is a little-endian u32 length followed by that many bytes of
//! bincode. The cap below bounds a corrupt length word; link items are
//! handles plus bookkeeping, nowhere near it.

use serde::{de::DeserializeOwned, Serialize};
use snafu::ResultExt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{Closed, Deserialize as DeserializeCtx, LinkResult, Serialize as SerializeCtx, Wire};

const MAX_FRAME: usize = 64 * 1024 * 1024;

/// First frame on every broker connection; declares the endpoint.
#[derive(serde::Serialize, serde::Deserialize, Debug)]
pub(crate) enum Attach {
    /// Write end of a link.
    Producer { link: String },
    /// Read end of one sink queue of a link.
    Consumer { link: String, sink: String },
}

/// Client to broker, after attaching.
#[derive(serde::Serialize, serde::Deserialize, Debug)]
pub(crate) enum Request {
    Put { data: Vec<u8>, block: bool },
    Get { block: bool, timeout_ms: Option<u64> },
    IsEmpty,
    Close,
}

/// Broker to client.
#[derive(serde::Serialize, serde::Deserialize, Debug)]
pub(crate) enum Response {
    Ok,
    Item { data: Vec<u8> },
    NoItem,
    Full,
    TimedOut,
    Closed,
    IsEmpty { empty: bool },
    Refused { message: String },
}

pub(crate) async fn write_frame<W, T>(
    io: &mut W,
    link: &str,
    value: &T,
) -> LinkResult<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = bincode::serialize(value).context(SerializeCtx {
        link,
    })?;
    io.write_all(&(body.len() as u32).to_le_bytes())
        .await
        .context(Wire {
            link,
        })?;
    io.write_all(&body).await.context(Wire {
        link,
    })?;
    io.flush().await.context(Wire {
        link,
    })?;
    Ok(())
}

pub(crate) async fn read_frame<R, T>(io: &mut R, link: &str) -> LinkResult<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut word = [0u8; 4];
    match io.read_exact(&mut word).await {
        Ok(_) => {}
        // a peer hanging up between frames is an orderly closure
        Err(error) if error.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Closed {
                link,
            }
            .fail();
        }
        Err(error) => {
            return Err(error).context(Wire {
                link,
            });
        }
    }
    let len = u32::from_le_bytes(word) as usize;
    if len > MAX_FRAME {
        return Closed {
            link,
        }
        .fail();
    }
    let mut body = vec![0u8; len];
    io.read_exact(&mut body).await.context(Wire {
        link,
    })?;
    bincode::deserialize(&body).context(DeserializeCtx {
        link,
    })
}
