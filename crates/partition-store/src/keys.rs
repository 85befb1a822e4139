// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::fmt;
use std::mem;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use bytestring::ByteString;
use prost::encoding::encoded_len_varint;

use keel_types::logs::Position;
use keel_types::{Key, PartitionId};

use crate::{Result, StorageError};

/// Every table key needs to have a key kind. This allows to multiplex different column
/// families in the same rocksdb keyspace, a scan of one family never observes another.
///
/// # Important
/// There must exist a bijective mapping between the enum variant and its byte representation.
/// See [`KeyKind::as_bytes`] and [`KeyKind::from_bytes`].
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, strum::EnumIter)]
pub enum KeyKind {
    Fsm,
    DistributionCommand,
    DistributionPending,
    DistributionQueued,
    DistributionRetriable,
    /// Column families declared by command processors and event appliers. Create
    /// with [`KeyKind::custom`].
    Custom([u8; 2]),
}

impl KeyKind {
    pub const SERIALIZED_LENGTH: usize = 2;

    /// Declares the key kind of a processor owned column family. Panics if `bytes` is
    /// reserved by an internal table, which fails compilation when used in a const.
    pub const fn custom(bytes: [u8; Self::SERIALIZED_LENGTH]) -> Self {
        let internal = !matches!(Self::from_bytes(&bytes), KeyKind::Custom(_));
        if internal || (bytes[0] == 0xff && bytes[1] == 0xff) {
            panic!("key kind is reserved");
        }
        KeyKind::Custom(bytes)
    }

    pub const fn exclusive_upper_bound(&self) -> [u8; Self::SERIALIZED_LENGTH] {
        let num = u16::from_be_bytes(self.as_bytes());
        let num = if num == u16::MAX {
            panic!("key kind to not saturate u16");
        } else {
            num + 1
        };
        num.to_be_bytes()
    }

    /// A once assigned byte representation to a key kind variant must never be changed! Instead,
    /// create a new variant representing a new key.
    pub const fn as_bytes(&self) -> [u8; Self::SERIALIZED_LENGTH] {
        // NOTE: do not use [0xff, 0xff] as key byte prefix, ever!
        // We should always be able to +1 the those bytes when interpreted as u16
        match self {
            KeyKind::Fsm => *b"fs",
            KeyKind::DistributionCommand => *b"dc",
            KeyKind::DistributionPending => *b"dp",
            KeyKind::DistributionQueued => *b"dq",
            KeyKind::DistributionRetriable => *b"dr",
            KeyKind::Custom(bytes) => *bytes,
        }
    }

    /// The following invariant must hold:
    /// ```ignore
    /// KeyKind::from_bytes(&key_kind.as_bytes()) == key_kind
    /// ```
    pub const fn from_bytes(bytes: &[u8; Self::SERIALIZED_LENGTH]) -> Self {
        match bytes {
            b"fs" => KeyKind::Fsm,
            b"dc" => KeyKind::DistributionCommand,
            b"dp" => KeyKind::DistributionPending,
            b"dq" => KeyKind::DistributionQueued,
            b"dr" => KeyKind::DistributionRetriable,
            other => KeyKind::Custom(*other),
        }
    }

    pub fn serialize<B: BufMut>(&self, buf: &mut B) {
        buf.put_slice(&self.as_bytes());
    }

    pub fn deserialize<B: Buf>(buf: &mut B) -> Result<Self> {
        if buf.remaining() < KeyKind::SERIALIZED_LENGTH {
            return Err(StorageError::DataIntegrityError);
        }

        let mut bytes = [0; KeyKind::SERIALIZED_LENGTH];
        buf.copy_to_slice(&mut bytes);
        Ok(Self::from_bytes(&bytes))
    }
}

impl fmt::Display for KeyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyKind::Custom(bytes) => write!(f, "Custom({})", bytes.escape_ascii()),
            other => fmt::Debug::fmt(other, f),
        }
    }
}

pub trait TableKey: Sized + fmt::Debug + Send + 'static {
    const KEY_KIND: KeyKind;
    fn is_complete(&self) -> bool;
    fn serialize_key_kind<B: BufMut>(bytes: &mut B);
    fn serialize_to<B: BufMut>(&self, bytes: &mut B);
    fn deserialize_from<B: Buf>(bytes: &mut B) -> Result<Self>;

    fn serialize(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(self.serialized_length());
        self.serialize_to(&mut buf);
        buf
    }

    fn serialized_length(&self) -> usize;
}

/// The following macro defines an ordered, named key tuple, that is used as a rocksdb key.
///
/// Given the following definition
/// ```ignore
/// define_table_key!(KeyKind::custom(*b"fb"), FooBarKey(foo: u32, bar: Bytes));
/// ```
///
/// the macro generates a `FooBarKey` struct holding every component as an `Option`,
/// builder style setters (`FooBarKey::default().foo(1).bar(bytes)`), accessors that fail
/// with [`StorageError::DataIntegrityError`] for missing components and an implementation
/// of [`TableKey`].
///
/// Components are serialized in declaration order after the key kind, missing trailing
/// components are skipped. A key with only its leading components set therefore
/// serializes to a prefix of every complete key sharing those components, which is what
/// prefix scans rely on.
#[macro_export]
macro_rules! define_table_key {

    ($key_kind:expr, $key_name:ident ( $($element: ident: $ty: ty),+ $(,)? ) ) => ($crate::__private::paste! {
        #[derive(Default, Debug, Eq, PartialEq, Clone)]
        pub struct $key_name { $(pub $element: Option<$ty>),+ }

        impl $key_name {
            $(pub fn $element(mut self, $element: $ty) -> Self {
                self.$element = Some($element);
                self
            })+

            $(pub fn [< $element _ok_or >](&self) -> $crate::Result<& $ty> {
                self.$element.as_ref().ok_or($crate::StorageError::DataIntegrityError)
            })+

            pub fn into_inner(self) -> ($(Option<$ty>,)+) {
                ( $(self.$element,)+ )
            }

            pub fn into_inner_ok_or(self) -> $crate::Result<($($ty,)+)> {
                Ok(( $(self.$element.ok_or($crate::StorageError::DataIntegrityError)?,)+ ))
            }
        }

        impl $crate::keys::TableKey for $key_name {
            const KEY_KIND: $crate::keys::KeyKind = $key_kind;

            fn is_complete(&self) -> bool {
                $(self.$element.is_some())&&+
            }

            #[inline]
            fn serialize_key_kind<B: $crate::__private::BufMut>(bytes: &mut B) {
                Self::KEY_KIND.serialize(bytes);
            }

            #[inline]
            fn serialize_to<B: $crate::__private::BufMut>(&self, bytes: &mut B) {
                Self::serialize_key_kind(bytes);
                $(
                $crate::keys::serialize(&self.$element, bytes);
                )+
            }

            #[inline]
            fn deserialize_from<B: $crate::__private::Buf>(bytes: &mut B) -> $crate::Result<Self> {
                let found = $crate::keys::KeyKind::deserialize(bytes)?;
                if found != Self::KEY_KIND {
                    return Err($crate::keys::unexpected_key_kind(Self::KEY_KIND, found));
                }
                Ok(Self {
                    $($element: $crate::keys::deserialize(bytes)?,)+
                })
            }

            #[inline]
            fn serialized_length(&self) -> usize {
                $crate::keys::KeyKind::SERIALIZED_LENGTH
                    $(+ $crate::keys::KeyCodec::serialized_length(&self.$element))+
            }
        }
    })
}

pub use crate::define_table_key;

pub trait KeyCodec: Sized {
    fn encode<B: BufMut>(&self, target: &mut B);
    fn decode<B: Buf>(source: &mut B) -> Result<Self>;

    fn serialized_length(&self) -> usize;
}

impl KeyCodec for Bytes {
    fn encode<B: BufMut>(&self, target: &mut B) {
        write_delimited(self, target);
    }

    fn decode<B: Buf>(source: &mut B) -> Result<Self> {
        read_delimited(source)
    }

    fn serialized_length(&self) -> usize {
        delimited_len(self.len())
    }
}

impl KeyCodec for ByteString {
    fn encode<B: BufMut>(&self, target: &mut B) {
        write_delimited(self, target);
    }

    fn decode<B: Buf>(source: &mut B) -> Result<Self> {
        let bs = read_delimited(source)?;
        ByteString::try_from(bs).map_err(|err| StorageError::KeyDecode(err.into()))
    }

    fn serialized_length(&self) -> usize {
        delimited_len(self.len())
    }
}

macro_rules! unsigned_key_codec {
    ($ty:ty, $put:ident, $get:ident) => {
        impl KeyCodec for $ty {
            fn encode<B: BufMut>(&self, target: &mut B) {
                // big-endian so that byte order equals numeric order
                target.$put(*self);
            }

            fn decode<B: Buf>(source: &mut B) -> Result<Self> {
                ensure_remaining(source, mem::size_of::<$ty>())?;
                Ok(source.$get())
            }

            fn serialized_length(&self) -> usize {
                mem::size_of::<$ty>()
            }
        }
    };
}

unsigned_key_codec!(u8, put_u8, get_u8);
unsigned_key_codec!(u16, put_u16, get_u16);
unsigned_key_codec!(u32, put_u32, get_u32);
unsigned_key_codec!(u64, put_u64, get_u64);

const SIGN_BIT: u64 = 1 << 63;

impl KeyCodec for i64 {
    fn encode<B: BufMut>(&self, target: &mut B) {
        // flip the sign bit so that negative numbers sort before positive ones
        target.put_u64((*self as u64) ^ SIGN_BIT);
    }

    fn decode<B: Buf>(source: &mut B) -> Result<Self> {
        ensure_remaining(source, mem::size_of::<i64>())?;
        Ok((source.get_u64() ^ SIGN_BIT) as i64)
    }

    fn serialized_length(&self) -> usize {
        mem::size_of::<i64>()
    }
}

impl KeyCodec for PartitionId {
    fn encode<B: BufMut>(&self, target: &mut B) {
        target.put_u16(**self);
    }

    fn decode<B: Buf>(source: &mut B) -> Result<Self> {
        let raw = u16::decode(source)?;
        PartitionId::new(raw).ok_or_else(|| {
            StorageError::KeyDecode(format!("partition id {raw} is out of range").into())
        })
    }

    fn serialized_length(&self) -> usize {
        mem::size_of::<u16>()
    }
}

impl KeyCodec for Key {
    fn encode<B: BufMut>(&self, target: &mut B) {
        self.as_i64().encode(target);
    }

    fn decode<B: Buf>(source: &mut B) -> Result<Self> {
        Ok(Key::from_raw(i64::decode(source)?))
    }

    fn serialized_length(&self) -> usize {
        mem::size_of::<i64>()
    }
}

impl KeyCodec for Position {
    fn encode<B: BufMut>(&self, target: &mut B) {
        self.as_i64().encode(target);
    }

    fn decode<B: Buf>(source: &mut B) -> Result<Self> {
        Ok(Position::new(i64::decode(source)?))
    }

    fn serialized_length(&self) -> usize {
        mem::size_of::<i64>()
    }
}

/// Missing components are skipped on encode; an exhausted buffer decodes as `None`.
impl<T: KeyCodec> KeyCodec for Option<T> {
    fn encode<B: BufMut>(&self, target: &mut B) {
        if let Some(t) = self {
            t.encode(target);
        }
    }

    fn decode<B: Buf>(source: &mut B) -> Result<Self> {
        source.has_remaining().then(|| T::decode(source)).transpose()
    }

    fn serialized_length(&self) -> usize {
        self.as_ref().map_or(0, T::serialized_length)
    }
}

#[inline]
fn ensure_remaining<B: Buf>(source: &B, len: usize) -> Result<()> {
    if source.remaining() < len {
        return Err(StorageError::DataIntegrityError);
    }
    Ok(())
}

/// Varint length followed by the raw bytes.
fn write_delimited<B: BufMut>(source: impl AsRef<[u8]>, target: &mut B) {
    let body = source.as_ref();
    prost::encoding::encode_varint(body.len() as u64, target);
    target.put_slice(body);
}

fn read_delimited<B: Buf>(source: &mut B) -> Result<Bytes> {
    let len = prost::encoding::decode_varint(source)
        .map_err(|err| StorageError::KeyDecode(err.into()))
        .and_then(|len| usize::try_from(len).map_err(|err| StorageError::KeyDecode(err.into())))?;
    ensure_remaining(source, len)?;
    // zero-copy for Bytes sources
    Ok(source.copy_to_bytes(len))
}

fn delimited_len(len: usize) -> usize {
    len + encoded_len_varint(len as u64)
}

#[doc(hidden)]
pub fn unexpected_key_kind(expected: KeyKind, found: KeyKind) -> StorageError {
    StorageError::KeyDecode(format!("expected key kind '{expected}' but found '{found}'").into())
}

#[inline]
pub fn serialize<T: KeyCodec, B: BufMut>(what: &T, target: &mut B) {
    what.encode(target);
}

#[inline]
pub fn deserialize<T: KeyCodec, B: Buf>(source: &mut B) -> Result<T> {
    T::decode(source)
}
