//! Content fingerprints used as dedup keys for catalog and pipeline snapshots.
//!
//! Content is canonicalized with RFC 8785 (JCS) before hashing, so mapping key
//! order and numeric spelling (`1` vs `1.0`) never change the digest. The
//! SHA-256 digest is truncated to [`FINGERPRINT_BYTES`] bytes.

use std::fmt::{Display, Formatter};

use serde::ser::{self, Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::error::WaldoError;
use crate::ids::ContentHash;

pub const FINGERPRINT_BYTES: usize = 8;
pub const FINGERPRINT_HEX_LEN: usize = FINGERPRINT_BYTES * 2;

/// Canonical JSON text of a serializable value.
///
/// # Errors
/// Returns [`WaldoError::Serialization`] when the value has no canonical JSON
/// form, e.g. non-finite floats or maps keyed by non-strings.
pub fn canonical_json<T: Serialize + ?Sized>(content: &T) -> Result<String, WaldoError> {
    let bytes = canonical_json_bytes(content)?;
    String::from_utf8(bytes).map_err(|err| WaldoError::Serialization(err.to_string()))
}

/// # Errors
/// See [`canonical_json`].
pub fn canonical_json_bytes<T: Serialize + ?Sized>(content: &T) -> Result<Vec<u8>, WaldoError> {
    // serde_jcs writes NaN and infinities as `null`; reject them up front.
    content
        .serialize(FiniteFloats)
        .map_err(|err| WaldoError::Serialization(err.0))?;
    serde_jcs::to_vec(content).map_err(|err| WaldoError::Serialization(err.to_string()))
}

/// Deterministic dedup key for structured content.
///
/// # Errors
/// See [`canonical_json`].
pub fn fingerprint<T: Serialize + ?Sized>(content: &T) -> Result<ContentHash, WaldoError> {
    let bytes = canonical_json_bytes(content)?;
    Ok(fingerprint_bytes(&bytes))
}

#[must_use]
pub fn fingerprint_bytes(bytes: &[u8]) -> ContentHash {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    ContentHash::from_hex_unchecked(hex::encode(&digest[..FINGERPRINT_BYTES]))
}

/// Walks a value without producing output and fails on the first float that
/// JSON cannot represent.
struct FiniteFloats;

#[derive(Debug)]
struct NonCanonical(String);

impl Display for NonCanonical {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for NonCanonical {}

impl ser::Error for NonCanonical {
    fn custom<T: Display>(msg: T) -> Self {
        Self(msg.to_string())
    }
}

fn check_finite(value: f64) -> Result<(), NonCanonical> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(NonCanonical(format!(
            "non-finite float {value} has no canonical JSON form"
        )))
    }
}

impl Serializer for FiniteFloats {
    type Ok = ();
    type Error = NonCanonical;
    type SerializeSeq = Self;
    type SerializeTuple = Self;
    type SerializeTupleStruct = Self;
    type SerializeTupleVariant = Self;
    type SerializeMap = Self;
    type SerializeStruct = Self;
    type SerializeStructVariant = Self;

    fn serialize_bool(self, _v: bool) -> Result<(), NonCanonical> {
        Ok(())
    }

    fn serialize_i8(self, _v: i8) -> Result<(), NonCanonical> {
        Ok(())
    }

    fn serialize_i16(self, _v: i16) -> Result<(), NonCanonical> {
        Ok(())
    }

    fn serialize_i32(self, _v: i32) -> Result<(), NonCanonical> {
        Ok(())
    }

    fn serialize_i64(self, _v: i64) -> Result<(), NonCanonical> {
        Ok(())
    }

    fn serialize_i128(self, _v: i128) -> Result<(), NonCanonical> {
        Ok(())
    }

    fn serialize_u8(self, _v: u8) -> Result<(), NonCanonical> {
        Ok(())
    }

    fn serialize_u16(self, _v: u16) -> Result<(), NonCanonical> {
        Ok(())
    }

    fn serialize_u32(self, _v: u32) -> Result<(), NonCanonical> {
        Ok(())
    }

    fn serialize_u64(self, _v: u64) -> Result<(), NonCanonical> {
        Ok(())
    }

    fn serialize_u128(self, _v: u128) -> Result<(), NonCanonical> {
        Ok(())
    }

    fn serialize_f32(self, v: f32) -> Result<(), NonCanonical> {
        check_finite(f64::from(v))
    }

    fn serialize_f64(self, v: f64) -> Result<(), NonCanonical> {
        check_finite(v)
    }

    fn serialize_char(self, _v: char) -> Result<(), NonCanonical> {
        Ok(())
    }

    fn serialize_str(self, _v: &str) -> Result<(), NonCanonical> {
        Ok(())
    }

    fn serialize_bytes(self, _v: &[u8]) -> Result<(), NonCanonical> {
        Ok(())
    }

    fn serialize_none(self) -> Result<(), NonCanonical> {
        Ok(())
    }

    fn serialize_some<T: ?Sized + Serialize>(self, value: &T) -> Result<(), NonCanonical> {
        value.serialize(self)
    }

    fn serialize_unit(self) -> Result<(), NonCanonical> {
        Ok(())
    }

    fn serialize_unit_struct(self, _name: &'static str) -> Result<(), NonCanonical> {
        Ok(())
    }

    fn serialize_unit_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        _variant: &'static str,
    ) -> Result<(), NonCanonical> {
        Ok(())
    }

    fn serialize_newtype_struct<T: ?Sized + Serialize>(
        self,
        _name: &'static str,
        value: &T,
    ) -> Result<(), NonCanonical> {
        value.serialize(self)
    }

    fn serialize_newtype_variant<T: ?Sized + Serialize>(
        self,
        _name: &'static str,
        _variant_index: u32,
        _variant: &'static str,
        value: &T,
    ) -> Result<(), NonCanonical> {
        value.serialize(self)
    }

    fn serialize_seq(self, _len: Option<usize>) -> Result<Self, NonCanonical> {
        Ok(self)
    }

    fn serialize_tuple(self, _len: usize) -> Result<Self, NonCanonical> {
        Ok(self)
    }

    fn serialize_tuple_struct(
        self,
        _name: &'static str,
        _len: usize,
    ) -> Result<Self, NonCanonical> {
        Ok(self)
    }

    fn serialize_tuple_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> Result<Self, NonCanonical> {
        Ok(self)
    }

    fn serialize_map(self, _len: Option<usize>) -> Result<Self, NonCanonical> {
        Ok(self)
    }

    fn serialize_struct(self, _name: &'static str, _len: usize) -> Result<Self, NonCanonical> {
        Ok(self)
    }

    fn serialize_struct_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> Result<Self, NonCanonical> {
        Ok(self)
    }
}

impl ser::SerializeSeq for FiniteFloats {
    type Ok = ();
    type Error = NonCanonical;

    fn serialize_element<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), NonCanonical> {
        value.serialize(FiniteFloats)
    }

    fn end(self) -> Result<(), NonCanonical> {
        Ok(())
    }
}

impl ser::SerializeTuple for FiniteFloats {
    type Ok = ();
    type Error = NonCanonical;

    fn serialize_element<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), NonCanonical> {
        value.serialize(FiniteFloats)
    }

    fn end(self) -> Result<(), NonCanonical> {
        Ok(())
    }
}

impl ser::SerializeTupleStruct for FiniteFloats {
    type Ok = ();
    type Error = NonCanonical;

    fn serialize_field<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), NonCanonical> {
        value.serialize(FiniteFloats)
    }

    fn end(self) -> Result<(), NonCanonical> {
        Ok(())
    }
}

impl ser::SerializeTupleVariant for FiniteFloats {
    type Ok = ();
    type Error = NonCanonical;

    fn serialize_field<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), NonCanonical> {
        value.serialize(FiniteFloats)
    }

    fn end(self) -> Result<(), NonCanonical> {
        Ok(())
    }
}

impl ser::SerializeMap for FiniteFloats {
    type Ok = ();
    type Error = NonCanonical;

    fn serialize_key<T: ?Sized + Serialize>(&mut self, key: &T) -> Result<(), NonCanonical> {
        key.serialize(FiniteFloats)
    }

    fn serialize_value<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), NonCanonical> {
        value.serialize(FiniteFloats)
    }

    fn end(self) -> Result<(), NonCanonical> {
        Ok(())
    }
}

impl ser::SerializeStruct for FiniteFloats {
    type Ok = ();
    type Error = NonCanonical;

    fn serialize_field<T: ?Sized + Serialize>(
        &mut self,
        _key: &'static str,
        value: &T,
    ) -> Result<(), NonCanonical> {
        value.serialize(FiniteFloats)
    }

    fn end(self) -> Result<(), NonCanonical> {
        Ok(())
    }
}

impl ser::SerializeStructVariant for FiniteFloats {
    type Ok = ();
    type Error = NonCanonical;

    fn serialize_field<T: ?Sized + Serialize>(
        &mut self,
        _key: &'static str,
        value: &T,
    ) -> Result<(), NonCanonical> {
        value.serialize(FiniteFloats)
    }

    fn end(self) -> Result<(), NonCanonical> {
        Ok(())
    }
}
