//! Length-prefixed bincode frames between store clients and the service.

use serde::{de::DeserializeOwned, Serialize};
use snafu::ResultExt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{Closed, Handle, StoreEvent, StoreResult, Wire};

const MAX_FRAME: usize = 1024 * 1024 * 1024;

#[derive(serde::Serialize, serde::Deserialize, Debug)]
pub(crate) enum WireRequest {
    Put {
        bytes: Vec<u8>,
        name: Option<String>,
    },
    Get {
        handle: Handle,
    },
    GetList {
        handles: Vec<Handle>,
    },
    Expire {
        handle: Handle,
        after_ms: u64,
    },
    Free {
        handle: Handle,
    },
    Subscribe,
}

#[derive(serde::Serialize, serde::Deserialize, Debug)]
pub(crate) enum WireResponse {
    Handle(Handle),
    Value(Vec<u8>),
    Values(Vec<Vec<u8>>),
    Done,
    Event(StoreEvent),
    Error(WireError),
}

#[derive(serde::Serialize, serde::Deserialize, Debug)]
pub(crate) enum WireError {
    Full { needed: u64, available: u64 },
    NotFound { id: u64 },
    Other { message: String },
}

pub(crate) async fn write_frame<W, T>(io: &mut W, value: &T) -> StoreResult<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = bincode::serialize(value).context(crate::SerializeValue)?;
    io.write_all(&(body.len() as u32).to_le_bytes())
        .await
        .context(Wire)?;
    io.write_all(&body).await.context(Wire)?;
    io.flush().await.context(Wire)?;
    Ok(())
}

pub(crate) async fn read_frame<R, T>(io: &mut R) -> StoreResult<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut word = [0u8; 4];
    match io.read_exact(&mut word).await {
        Ok(_) => {}
        Err(error) if error.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Closed.fail();
        }
        Err(error) => return Err(error).context(Wire),
    }
    let len = u32::from_le_bytes(word) as usize;
    if len > MAX_FRAME {
        return Closed.fail();
    }
    let mut body = vec![0u8; len];
    io.read_exact(&mut body).await.context(Wire)?;
    bincode::deserialize(&body).context(crate::Frame)
}
