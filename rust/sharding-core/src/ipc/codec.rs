//! Length-delimited JSON framing.
//!
//! Frames are a 4-byte big-endian length followed by a `serde_json`
//! document. Oversized outgoing frames are refused before anything is
//! written, so the stream stays usable.

use std::marker::PhantomData;

use bytes::{Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::error::{Result, ShardingError};

/// Codec that writes `E` and reads `D`.
pub struct JsonCodec<E, D> {
    inner: LengthDelimitedCodec,
    max_frame_bytes: usize,
    _marker: PhantomData<fn(E) -> D>,
}

impl<E, D> JsonCodec<E, D> {
    pub fn new(max_frame_bytes: usize) -> Self {
        let inner = LengthDelimitedCodec::builder()
            .length_field_length(4)
            .big_endian()
            .max_frame_length(max_frame_bytes)
            .new_codec();
        Self {
            inner,
            max_frame_bytes,
            _marker: PhantomData,
        }
    }
}

impl<E: Serialize, D> Encoder<E> for JsonCodec<E, D> {
    type Error = ShardingError;

    fn encode(&mut self, item: E, dst: &mut BytesMut) -> Result<()> {
        let payload = serde_json::to_vec(&item)
            .map_err(|e| ShardingError::serialization(format!("failed to encode frame: {}", e)))?;
        if payload.len() > self.max_frame_bytes {
            return Err(ShardingError::frame_too_large(payload.len(), self.max_frame_bytes));
        }
        self.inner
            .encode(Bytes::from(payload), dst)
            .map_err(|e| ShardingError::ipc_with_source("failed to write frame", e))
    }
}

impl<E, D: DeserializeOwned> Decoder for JsonCodec<E, D> {
    type Item = D;
    type Error = ShardingError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<D>> {
        let Some(frame) = self
            .inner
            .decode(src)
            .map_err(|e| ShardingError::ipc_with_source("failed to read frame", e))?
        else {
            return Ok(None);
        };

        serde_json::from_slice(&frame)
            .map(Some)
            .map_err(|e| ShardingError::serialization(format!("malformed frame: {}", e)))
    }
}
