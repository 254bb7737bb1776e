//! Length-delimited JSON codec for records on the data port.
//!
//! Wire format: 8-byte big-endian length prefix + serde JSON payload.

use std::marker::PhantomData;

use bytes::{Buf, BufMut, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::codec::{Decoder, Encoder};

use crate::{ProtocolError, MAX_PAYLOAD_BYTES};

/// Length prefix size in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 8;

/// Codec for framing JSON values (a single record or a whole document).
pub struct JsonFrameCodec<T> {
    _item: PhantomData<fn() -> T>,
}

impl<T> JsonFrameCodec<T> {
    pub fn new() -> Self {
        Self { _item: PhantomData }
    }
}

impl<T> Default for JsonFrameCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Validate a declared payload length read off the wire.
pub fn check_payload_len(raw: [u8; LENGTH_PREFIX_SIZE]) -> Result<usize, ProtocolError> {
    let declared = i64::from_be_bytes(raw);
    if declared < 0 || declared as u64 > MAX_PAYLOAD_BYTES {
        return Err(ProtocolError::PayloadTooLarge {
            size: declared as u64,
            max: MAX_PAYLOAD_BYTES,
        });
    }
    Ok(declared as usize)
}

impl<T: DeserializeOwned> Decoder for JsonFrameCodec<T> {
    type Item = T;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }

        let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
        prefix.copy_from_slice(&src[..LENGTH_PREFIX_SIZE]);
        let length = check_payload_len(prefix)?;

        let total = LENGTH_PREFIX_SIZE + length;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX_SIZE);
        let payload = src.split_to(length);
        let item: T = serde_json::from_slice(&payload)?;
        Ok(Some(item))
    }
}

impl<T: Serialize> Encoder<&T> for JsonFrameCodec<T> {
    type Error = ProtocolError;

    fn encode(&mut self, item: &T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = serde_json::to_vec(item)?;

        if payload.len() as u64 > MAX_PAYLOAD_BYTES {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload.len() as u64,
                max: MAX_PAYLOAD_BYTES,
            });
        }

        dst.reserve(LENGTH_PREFIX_SIZE + payload.len());
        dst.put_i64(payload.len() as i64);
        dst.extend_from_slice(&payload);
        Ok(())
    }
}
