// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Value codec of the partition store. Every stored value starts with a one byte
//! [`StorageCodecKind`] followed by the codec specific body.

use bytes::{Buf, BufMut, Bytes};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::errors::GenericError;

const FRAME_LEN: usize = std::mem::size_of::<u32>();

#[derive(Debug, thiserror::Error)]
pub enum StorageEncodeError {
    #[error("cannot encode value: {0}")]
    EncodeValue(GenericError),
}

#[derive(Debug, thiserror::Error)]
pub enum StorageDecodeError {
    #[error("cannot read codec byte: {0}")]
    ReadingCodec(String),
    #[error("cannot decode value: {0}")]
    DecodeValue(GenericError),
    #[error("codec {0} is not supported by this value type")]
    UnsupportedCodecKind(StorageCodecKind),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::FromRepr, derive_more::Display)]
#[repr(u8)]
pub enum StorageCodecKind {
    /// Opaque bytes behind a u32 length.
    LengthPrefixedRawBytes = 1,
    /// Serde value as flexbuffers behind a u32 length.
    FlexbuffersSerde = 2,
}

impl From<StorageCodecKind> for u8 {
    fn from(value: StorageCodecKind) -> Self {
        value as u8
    }
}

impl TryFrom<u8> for StorageCodecKind {
    type Error = StorageDecodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        StorageCodecKind::from_repr(value)
            .ok_or_else(|| StorageDecodeError::ReadingCodec(format!("unknown codec {value}")))
    }
}

/// Writes the codec byte of `T` followed by the encoded value, and reads it back.
pub struct StorageCodec;

impl StorageCodec {
    pub fn encode<T: StorageEncode, B: BufMut>(
        value: &T,
        buf: &mut B,
    ) -> Result<(), StorageEncodeError> {
        buf.put_u8(T::DEFAULT_CODEC.into());
        value.encode(buf)
    }

    pub fn decode<T: StorageDecode, B: Buf>(buf: &mut B) -> Result<T, StorageDecodeError> {
        if !buf.has_remaining() {
            return Err(StorageDecodeError::ReadingCodec("empty value".to_owned()));
        }
        let kind = StorageCodecKind::try_from(buf.get_u8())?;
        T::decode(buf, kind)
    }
}

pub trait StorageEncode {
    /// Codec written in front of newly encoded values.
    const DEFAULT_CODEC: StorageCodecKind;

    fn encode<B: BufMut>(&self, buf: &mut B) -> Result<(), StorageEncodeError>;
}

pub trait StorageDecode {
    fn decode<B: Buf>(buf: &mut B, kind: StorageCodecKind) -> Result<Self, StorageDecodeError>
    where
        Self: Sized;
}

impl<T: StorageEncode> StorageEncode for &T {
    const DEFAULT_CODEC: StorageCodecKind = T::DEFAULT_CODEC;

    fn encode<B: BufMut>(&self, buf: &mut B) -> Result<(), StorageEncodeError> {
        T::encode(self, buf)
    }
}

impl StorageEncode for Bytes {
    const DEFAULT_CODEC: StorageCodecKind = StorageCodecKind::LengthPrefixedRawBytes;

    fn encode<B: BufMut>(&self, buf: &mut B) -> Result<(), StorageEncodeError> {
        put_framed(self, buf).map_err(StorageEncodeError::EncodeValue)
    }
}

impl StorageDecode for Bytes {
    fn decode<B: Buf>(buf: &mut B, kind: StorageCodecKind) -> Result<Self, StorageDecodeError> {
        if kind != StorageCodecKind::LengthPrefixedRawBytes {
            return Err(StorageDecodeError::UnsupportedCodecKind(kind));
        }
        let len = framed_len(buf).map_err(StorageDecodeError::DecodeValue)?;
        Ok(buf.copy_to_bytes(len))
    }
}

/// Implements [`StorageEncode`] and [`StorageDecode`] for a serde type, stored as
/// flexbuffers.
#[macro_export]
macro_rules! flexbuffers_storage_encode_decode {
    ($name:tt) => {
        impl $crate::storage::StorageEncode for $name {
            const DEFAULT_CODEC: $crate::storage::StorageCodecKind =
                $crate::storage::StorageCodecKind::FlexbuffersSerde;

            fn encode<B: ::bytes::BufMut>(
                &self,
                buf: &mut B,
            ) -> Result<(), $crate::storage::StorageEncodeError> {
                $crate::storage::encode_as_flexbuffers(self, buf)
            }
        }

        impl $crate::storage::StorageDecode for $name {
            fn decode<B: ::bytes::Buf>(
                buf: &mut B,
                kind: $crate::storage::StorageCodecKind,
            ) -> Result<Self, $crate::storage::StorageDecodeError> {
                $crate::storage::decode_from_flexbuffers(buf, kind)
            }
        }
    };
}

/// Serializes `value` with flexbuffers behind a u32 length.
pub fn encode_as_flexbuffers<T: Serialize, B: BufMut>(
    value: T,
    buf: &mut B,
) -> Result<(), StorageEncodeError> {
    let vec = flexbuffers::to_vec(value).map_err(|err| StorageEncodeError::EncodeValue(err.into()))?;
    put_framed(&vec, buf).map_err(StorageEncodeError::EncodeValue)
}

/// Reads a flexbuffers value written by [`encode_as_flexbuffers`] and advances `buf`
/// past it.
pub fn decode_from_flexbuffers<T: DeserializeOwned, B: Buf>(
    buf: &mut B,
    kind: StorageCodecKind,
) -> Result<T, StorageDecodeError> {
    if kind != StorageCodecKind::FlexbuffersSerde {
        return Err(StorageDecodeError::UnsupportedCodecKind(kind));
    }
    let len = framed_len(buf).map_err(StorageDecodeError::DecodeValue)?;

    // the flexbuffers root sits at the end of the slice, so it has to be cut exactly
    let result = if buf.chunk().len() >= len {
        let value = flexbuffers::from_slice(&buf.chunk()[..len]);
        buf.advance(len);
        value
    } else {
        flexbuffers::from_slice(&buf.copy_to_bytes(len))
    };
    result.map_err(|err| StorageDecodeError::DecodeValue(err.into()))
}

fn put_framed<B: BufMut>(body: &[u8], buf: &mut B) -> Result<(), GenericError> {
    let len = u32::try_from(body.len())
        .map_err(|_| format!("value of {} bytes exceeds the u32 frame", body.len()))?;
    if buf.remaining_mut() < body.len() + FRAME_LEN {
        return Err(format!(
            "{} bytes of buffer space left, need {}",
            buf.remaining_mut(),
            body.len() + FRAME_LEN
        )
        .into());
    }
    buf.put_u32_le(len);
    buf.put_slice(body);
    Ok(())
}

/// Consumes the length frame and checks that the body behind it is complete.
fn framed_len<B: Buf>(buf: &mut B) -> Result<usize, GenericError> {
    if buf.remaining() < FRAME_LEN {
        return Err(format!("truncated frame, {} bytes left", buf.remaining()).into());
    }
    let len = buf.get_u32_le() as usize;
    if buf.remaining() < len {
        return Err(format!("truncated body, need {len} bytes but {} left", buf.remaining()).into());
    }
    Ok(len)
}
