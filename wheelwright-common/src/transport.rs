// Copyright 2026 Wheelwright Maintainers
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Framed message streams over stream sockets (TCP or Unix). Every frame is
//! a 4-byte big-endian length prefix followed by the payload; control-plane
//! endpoints carry self-describing JSON payloads, the file-transfer endpoint
//! carries compact bincode frames.
//!
//! Decode failures (unknown message name, mismatched payload, junk bytes)
//! are recoverable: the connection stays usable and the caller is expected
//! to log and carry on.

use std::marker::PhantomData;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

/// Upper bound for a single frame; comfortably above the largest build
/// output we log and the transfer chunk size.
pub const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("endpoint closed")]
    Closed,
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unable to decode message: {0}")]
    Decode(String),
    #[error("unable to encode message: {0}")]
    Encode(String),
}

impl ProtocolError {
    /// Whether the connection remains usable after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ProtocolError::Decode(_) | ProtocolError::Encode(_))
    }
}

fn framed<S>(stream: S) -> Framed<S, LengthDelimitedCodec>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LENGTH)
        .length_field_length(4)
        .new_framed(stream)
}

/// A typed JSON message stream: receives `In`, sends `Out`. The client side
/// of a protocol is the same stream with the type parameters swapped.
pub struct MessageStream<In, Out, S> {
    inner: Framed<S, LengthDelimitedCodec>,
    _direction: PhantomData<fn(Out) -> In>,
}

impl<In, Out, S> MessageStream<In, Out, S>
where
    In: DeserializeOwned,
    Out: Serialize,
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self {
            inner: framed(stream),
            _direction: PhantomData,
        }
    }

    pub async fn send(&mut self, msg: &Out) -> Result<(), ProtocolError> {
        let payload =
            serde_json::to_vec(msg).map_err(|e| ProtocolError::Encode(e.to_string()))?;
        self.inner.send(Bytes::from(payload)).await?;
        Ok(())
    }

    pub async fn recv(&mut self) -> Result<In, ProtocolError> {
        match self.inner.next().await {
            None => Err(ProtocolError::Closed),
            Some(Err(e)) => Err(ProtocolError::Io(e)),
            Some(Ok(frame)) => {
                serde_json::from_slice(&frame).map_err(|e| ProtocolError::Decode(e.to_string()))
            }
        }
    }
}

/// A typed bincode message stream for the file-transfer endpoint, where
/// chunk payloads are raw bytes and JSON framing would be wasteful.
pub struct BinaryStream<In, Out, S> {
    inner: Framed<S, LengthDelimitedCodec>,
    _direction: PhantomData<fn(Out) -> In>,
}

impl<In, Out, S> BinaryStream<In, Out, S>
where
    In: DeserializeOwned,
    Out: Serialize,
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self {
            inner: framed(stream),
            _direction: PhantomData,
        }
    }

    pub async fn send(&mut self, msg: &Out) -> Result<(), ProtocolError> {
        let payload =
            bincode::serialize(msg).map_err(|e| ProtocolError::Encode(e.to_string()))?;
        self.inner.send(Bytes::from(payload)).await?;
        Ok(())
    }

    pub async fn recv(&mut self) -> Result<In, ProtocolError> {
        match self.inner.next().await {
            None => Err(ProtocolError::Closed),
            Some(Err(e)) => Err(ProtocolError::Io(e)),
            Some(Ok(frame)) => {
                bincode::deserialize(&frame).map_err(|e| ProtocolError::Decode(e.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use crate::protocol::{TransferDown, TransferUp, WorkerReply, WorkerRequest};

    #[test]
    async fn json_stream_roundtrips_messages() {
        let (client, server) = tokio::io::duplex(4096);
        let mut master: MessageStream<WorkerRequest, WorkerReply, _> = MessageStream::new(server);
        let mut worker: MessageStream<WorkerReply, WorkerRequest, _> = MessageStream::new(client);

        worker.send(&WorkerRequest::Idle).await.unwrap();
        assert_eq!(master.recv().await.unwrap(), WorkerRequest::Idle);

        master.send(&WorkerReply::Sleep).await.unwrap();
        assert_eq!(worker.recv().await.unwrap(), WorkerReply::Sleep);
    }

    #[test]
    async fn junk_frame_is_a_recoverable_decode_error() {
        let (client, server) = tokio::io::duplex(4096);
        let mut master: MessageStream<WorkerRequest, WorkerReply, _> = MessageStream::new(server);
        // A valid frame whose payload is not a valid message.
        let mut raw = framed(client);
        raw.send(Bytes::from_static(b"{\"msg\":\"BOGUS\"}"))
            .await
            .unwrap();
        let err = master.recv().await.unwrap_err();
        assert!(err.is_recoverable());
        // The stream is still usable afterwards.
        raw.send(Bytes::from_static(b"{\"msg\":\"Idle\"}")).await.unwrap();
        assert_eq!(master.recv().await.unwrap(), WorkerRequest::Idle);
    }

    #[test]
    async fn closed_stream_reports_closed() {
        let (client, server) = tokio::io::duplex(4096);
        let mut master: MessageStream<WorkerRequest, WorkerReply, _> = MessageStream::new(server);
        drop(client);
        assert!(matches!(
            master.recv().await.unwrap_err(),
            ProtocolError::Closed
        ));
    }

    #[test]
    async fn binary_stream_roundtrips_chunks() {
        let (client, server) = tokio::io::duplex(1 << 20);
        let mut master: BinaryStream<TransferUp, TransferDown, _> = BinaryStream::new(server);
        let mut worker: BinaryStream<TransferDown, TransferUp, _> = BinaryStream::new(client);

        master
            .send(&TransferDown::Fetch {
                offset: 0,
                length: 65536,
            })
            .await
            .unwrap();
        assert_eq!(
            worker.recv().await.unwrap(),
            TransferDown::Fetch {
                offset: 0,
                length: 65536
            }
        );

        let chunk = TransferUp::Chunk {
            offset: 0,
            data: vec![0x5A; 65536],
        };
        worker.send(&chunk).await.unwrap();
        assert_eq!(master.recv().await.unwrap(), chunk);
    }
}
