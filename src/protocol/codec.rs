// src/protocol/codec.rs

//! Length-delimited frames carrying bincode-encoded messages.

use std::io;

use bytes::{Bytes, BytesMut};
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::errors::{GovernorError, Result};

/// Large enough for inline object data.
pub const MAX_FRAME_LENGTH: usize = 512 * 1024 * 1024;

pub fn frame_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec()
}

pub fn framed<T: AsyncRead + AsyncWrite>(io: T) -> Framed<T, LengthDelimitedCodec> {
    Framed::new(io, frame_codec())
}

pub fn encode<M: Serialize>(message: &M) -> Result<Bytes> {
    Ok(Bytes::from(bincode::serialize(message)?))
}

pub fn decode<M: DeserializeOwned>(frame: &[u8]) -> Result<M> {
    Ok(bincode::deserialize(frame)?)
}

pub async fn send<S, M>(sink: &mut S, message: &M) -> Result<()>
where
    S: Sink<Bytes, Error = io::Error> + Unpin,
    M: Serialize,
{
    sink.send(encode(message)?).await?;
    Ok(())
}

/// Next message, or `None` once the peer closed the connection.
pub async fn recv<S, M>(stream: &mut S) -> Result<Option<M>>
where
    S: Stream<Item = io::Result<BytesMut>> + Unpin,
    M: DeserializeOwned,
{
    match stream.next().await {
        Some(frame) => Ok(Some(decode(&frame?)?)),
        None => Ok(None),
    }
}

/// Like [`recv`] but a closed connection is an error.
pub async fn expect<S, M>(stream: &mut S) -> Result<M>
where
    S: Stream<Item = io::Result<BytesMut>> + Unpin,
    M: DeserializeOwned,
{
    recv(stream).await?.ok_or(GovernorError::ConnectionClosed)
}
