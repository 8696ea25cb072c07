/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Self-describing serialized values.
//!
//! Accumulator snapshots cross process boundaries type-erased: the sender
//! knows the reduction type, the wire does not. [`Serialized`] pairs a
//! bincode payload with the typehash of the value it encodes, so that a
//! receiver deserializing under the wrong type fails with a diagnostic
//! instead of decoding garbage. A mismatch indicates that processes
//! registered different reduction types under the same key.

use bytes::Bytes;
use serde::Deserialize;
use serde::Serialize;
use serde::de::DeserializeOwned;

/// A [`Named`] type is a type that has a globally unique name.
///
/// The blanket implementation uses the fully qualified Rust name of the
/// type. Names (and so typehashes) are only stable across binaries built
/// from the same source with the same compiler; the cluster is assumed to
/// run one binary.
pub trait Named: Sized + 'static {
    /// The globally unique type name for the type.
    fn typename() -> &'static str {
        std::any::type_name::<Self>()
    }

    /// A globally unique hash for this type.
    fn typehash() -> u64 {
        cityhasher::hash(Self::typename())
    }
}

impl<T: Sized + 'static> Named for T {}

/// The type of error returned by operations on [`Serialized`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Errors returned from serde bincode.
    #[error(transparent)]
    Bincode(#[from] bincode::Error),

    /// The value on the wire was produced from a different type than the
    /// one requested.
    #[error(
        "typehash mismatch: value has typehash {actual:#x}, \
         requested type {typename} has typehash {expected:#x}"
    )]
    TypeMismatch {
        /// Typehash of the requested type.
        expected: u64,
        /// Typehash carried by the serialized value.
        actual: u64,
        /// Name of the requested type.
        typename: &'static str,
    },
}

/// Represents a serialized value, wrapping the underlying serialization
/// and deserialization details, while ensuring that correctly-typed
/// values are passed throughout the system.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Serialized {
    /// The encoded data.
    data: Bytes,
    /// The typehash of the serialized value.
    typehash: u64,
}

impl Serialized {
    /// Construct a new serialized value by serializing the provided
    /// T-typed value.
    pub fn serialize<T: Serialize + Named>(value: &T) -> Result<Self, Error> {
        Ok(Self {
            data: bincode::serialize(value)?.into(),
            typehash: T::typehash(),
        })
    }

    /// Deserialize a value to the provided type T.
    pub fn deserialized<T: DeserializeOwned + Named>(&self) -> Result<T, Error> {
        if self.typehash != T::typehash() {
            return Err(Error::TypeMismatch {
                expected: T::typehash(),
                actual: self.typehash,
                typename: T::typename(),
            });
        }
        Ok(bincode::deserialize(&self.data)?)
    }

    /// The typehash of the encoded value.
    pub fn typehash(&self) -> u64 {
        self.typehash
    }

    /// The length of the encoded payload in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the encoded payload is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let value: Option<u64> = Some(123);
        let serialized = Serialized::serialize(&value).unwrap();
        assert_eq!(serialized.deserialized::<Option<u64>>().unwrap(), value);
    }

    #[test]
    fn test_type_mismatch() {
        let serialized = Serialized::serialize(&42u64).unwrap();
        assert!(matches!(
            serialized.deserialized::<String>(),
            Err(Error::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_wire_roundtrip() {
        // Serialized is itself serializable, so snapshots can ride inside
        // transport messages.
        let inner = Serialized::serialize(&"hello".to_string()).unwrap();
        let bytes = bincode::serialize(&inner).unwrap();
        let outer: Serialized = bincode::deserialize(&bytes).unwrap();
        assert_eq!(outer.deserialized::<String>().unwrap(), "hello");
    }

    #[test]
    fn test_typehash_distinguishes_types() {
        assert_ne!(<u64 as Named>::typehash(), <i64 as Named>::typehash());
        assert_ne!(
            <Option<u64> as Named>::typehash(),
            <u64 as Named>::typehash()
        );
    }
}
