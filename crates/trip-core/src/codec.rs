//! Deterministic canonical CBOR encoding.
//!
//! Every wire object in the protocol is a CBOR map with unsigned integer
//! keys. The canonical form requires:
//!
//! - integer map keys in strictly ascending order
//! - shortest-length integer encoding
//! - definite-length maps, arrays, strings
//!
//! Encoding builds maps through [`CanonicalMap`], which enforces key order
//! at construction. Decoding parses into [`ciborium::Value`], then
//! re-encodes and compares byte-for-byte against the input; any
//! non-canonical form (indefinite lengths, oversized integers, unordered
//! keys) fails the comparison and is rejected. Signatures and block hashes
//! are therefore always computed over bytes the verifier itself produced.

use std::collections::BTreeMap;
use std::io::Cursor;

use ciborium::value::Value;
use thiserror::Error;

/// Errors from canonical encoding and decoding.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Input is not well-formed CBOR.
    #[error("malformed encoding: {0}")]
    Malformed(String),

    /// Input parsed but is not in the deterministic canonical form.
    #[error("non-canonical encoding")]
    NonCanonical,

    /// Input has bytes after the final CBOR item.
    #[error("trailing bytes after encoded object")]
    TrailingBytes,

    /// A required map field is absent.
    #[error("missing field {key}")]
    MissingField {
        /// The absent integer key.
        key: u64,
    },

    /// The map carries a field the schema does not define.
    #[error("unexpected field {key}")]
    UnexpectedField {
        /// The offending integer key.
        key: u64,
    },

    /// A field holds a value of the wrong CBOR type.
    #[error("wrong type for field {key}")]
    WrongType {
        /// The offending integer key.
        key: u64,
    },

    /// A byte-string field has the wrong length.
    #[error("wrong length for field {key}: expected {expected}, got {got}")]
    WrongLength {
        /// The offending integer key.
        key: u64,
        /// Required byte length.
        expected: usize,
        /// Actual byte length.
        got: usize,
    },
}

/// Builder for a canonical integer-keyed CBOR map.
///
/// Keys must be pushed in strictly ascending order; violating the order is
/// a programming error and panics.
#[derive(Debug, Default)]
pub struct CanonicalMap {
    entries: Vec<(Value, Value)>,
    last_key: Option<u64>,
}

impl CanonicalMap {
    /// Creates an empty map builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `value` under `key`.
    ///
    /// # Panics
    ///
    /// Panics if `key` is not strictly greater than the previous key.
    pub fn push(&mut self, key: u64, value: Value) {
        if let Some(last) = self.last_key {
            assert!(key > last, "canonical map keys must ascend: {key} after {last}");
        }
        self.last_key = Some(key);
        self.entries.push((Value::Integer(key.into()), value));
    }

    /// Finalizes the builder into a CBOR value.
    #[must_use]
    pub fn into_value(self) -> Value {
        Value::Map(self.entries)
    }

    /// Finalizes and encodes the map.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Malformed`] if serialization fails.
    pub fn encode(self) -> Result<Vec<u8>, CodecError> {
        encode_value(&self.into_value())
    }
}

/// Encodes a CBOR value to bytes.
///
/// # Errors
///
/// Returns [`CodecError::Malformed`] if serialization fails.
pub fn encode_value(value: &Value) -> Result<Vec<u8>, CodecError> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| CodecError::Malformed(e.to_string()))?;
    Ok(buf)
}

/// Decodes exactly one CBOR value, rejecting trailing bytes.
///
/// # Errors
///
/// Returns [`CodecError::Malformed`] or [`CodecError::TrailingBytes`].
pub fn decode_value(bytes: &[u8]) -> Result<Value, CodecError> {
    let mut cursor = Cursor::new(bytes);
    let value: Value = ciborium::from_reader(&mut cursor)
        .map_err(|e| CodecError::Malformed(e.to_string()))?;
    if cursor.position() as usize != bytes.len() {
        return Err(CodecError::TrailingBytes);
    }
    Ok(value)
}

/// Decodes one CBOR value and requires the input to be in canonical form.
///
/// Canonicality is enforced by re-encoding the parsed value and comparing
/// byte-for-byte with the input.
///
/// # Errors
///
/// Returns [`CodecError::NonCanonical`] for any non-canonical input.
pub fn decode_canonical(bytes: &[u8]) -> Result<Value, CodecError> {
    let value = decode_value(bytes)?;
    let reencoded = encode_value(&value)?;
    if reencoded != bytes {
        return Err(CodecError::NonCanonical);
    }
    Ok(value)
}

/// Typed reader over a decoded integer-keyed map.
///
/// Construction validates that every key is an unsigned integer and that
/// keys ascend strictly. [`MapReader::finish`] rejects fields the schema
/// did not consume, so unknown keys are always an error.
#[derive(Debug)]
pub struct MapReader {
    fields: BTreeMap<u64, Value>,
}

impl MapReader {
    /// Builds a reader from a decoded value, which must be a map with
    /// strictly ascending unsigned integer keys.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::WrongType`] for non-map values or non-integer
    /// keys and [`CodecError::NonCanonical`] for unordered keys.
    pub fn new(value: Value) -> Result<Self, CodecError> {
        let Value::Map(entries) = value else {
            return Err(CodecError::WrongType { key: 0 });
        };

        let mut fields = BTreeMap::new();
        let mut last_key: Option<u64> = None;
        for (key, value) in entries {
            let key = match key {
                Value::Integer(i) => {
                    u64::try_from(i128::from(i)).map_err(|_| CodecError::NonCanonical)?
                },
                _ => return Err(CodecError::WrongType { key: 0 }),
            };
            if last_key.is_some_and(|last| key <= last) {
                return Err(CodecError::NonCanonical);
            }
            last_key = Some(key);
            fields.insert(key, value);
        }

        Ok(Self { fields })
    }

    /// Removes and returns the raw value for `key`, if present.
    pub fn take(&mut self, key: u64) -> Option<Value> {
        self.fields.remove(&key)
    }

    /// Reads an unsigned integer field.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::MissingField`] or [`CodecError::WrongType`].
    pub fn uint(&mut self, key: u64) -> Result<u64, CodecError> {
        match self.take(key) {
            Some(Value::Integer(i)) => {
                u64::try_from(i128::from(i)).map_err(|_| CodecError::WrongType { key })
            },
            Some(_) => Err(CodecError::WrongType { key }),
            None => Err(CodecError::MissingField { key }),
        }
    }

    /// Reads a float field (also accepting integer-encoded values).
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::MissingField`] or [`CodecError::WrongType`].
    #[allow(clippy::cast_precision_loss)]
    pub fn float(&mut self, key: u64) -> Result<f64, CodecError> {
        match self.take(key) {
            Some(Value::Float(f)) => Ok(f),
            Some(Value::Integer(i)) => Ok(i128::from(i) as f64),
            Some(_) => Err(CodecError::WrongType { key }),
            None => Err(CodecError::MissingField { key }),
        }
    }

    /// Reads a fixed-length byte-string field into an array.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::MissingField`], [`CodecError::WrongType`], or
    /// [`CodecError::WrongLength`].
    pub fn bytes_exact<const N: usize>(&mut self, key: u64) -> Result<[u8; N], CodecError> {
        match self.take(key) {
            Some(Value::Bytes(b)) => {
                let got = b.len();
                b.try_into().map_err(|_| CodecError::WrongLength {
                    key,
                    expected: N,
                    got,
                })
            },
            Some(_) => Err(CodecError::WrongType { key }),
            None => Err(CodecError::MissingField { key }),
        }
    }

    /// Reads a fixed-length byte string that may instead be an explicit
    /// CBOR `null`.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::MissingField`], [`CodecError::WrongType`], or
    /// [`CodecError::WrongLength`].
    pub fn bytes_or_null<const N: usize>(
        &mut self,
        key: u64,
    ) -> Result<Option<[u8; N]>, CodecError> {
        match self.take(key) {
            Some(Value::Null) => Ok(None),
            Some(Value::Bytes(b)) => {
                let got = b.len();
                Ok(Some(b.try_into().map_err(|_| CodecError::WrongLength {
                    key,
                    expected: N,
                    got,
                })?))
            },
            Some(_) => Err(CodecError::WrongType { key }),
            None => Err(CodecError::MissingField { key }),
        }
    }

    /// Reads a nested map field, returning its raw entries.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::MissingField`] or [`CodecError::WrongType`].
    pub fn map(&mut self, key: u64) -> Result<Vec<(Value, Value)>, CodecError> {
        match self.take(key) {
            Some(Value::Map(entries)) => Ok(entries),
            Some(_) => Err(CodecError::WrongType { key }),
            None => Err(CodecError::MissingField { key }),
        }
    }

    /// Requires that every field has been consumed.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::UnexpectedField`] naming the lowest leftover
    /// key.
    pub fn finish(self) -> Result<(), CodecError> {
        if let Some((&key, _)) = self.fields.iter().next() {
            return Err(CodecError::UnexpectedField { key });
        }
        Ok(())
    }
}
