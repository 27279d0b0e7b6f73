// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Decoded argument values shared by the client and the daemon.

use cryptoki_sys::{CK_ATTRIBUTE_TYPE, CK_FLAGS, CK_SLOT_ID, CK_STATE, CK_ULONG};

/// A variable-length result which is either fully present or described only by its
/// length.
///
/// `Length` answers a size query, or tells the client that the buffer it offered was
/// too small for the result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload<T> {
    Length(CK_ULONG),
    Value(T),
}

impl<T> Payload<Vec<T>> {
    /// Produce the payload for a result given the capacity the caller offered.
    pub fn for_capacity(data: Vec<T>, capacity: Option<CK_ULONG>) -> Self {
        match capacity {
            Some(capacity) if data.len() as CK_ULONG <= capacity => Payload::Value(data),
            _ => Payload::Length(data.len() as CK_ULONG),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
}

/// General information about the token library behind the daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Info {
    pub cryptoki_version: Version,
    pub manufacturer_id: [u8; 32],
    pub flags: CK_FLAGS,
    pub library_description: [u8; 32],
    pub library_version: Version,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotInfo {
    pub slot_description: [u8; 64],
    pub manufacturer_id: [u8; 32],
    pub flags: CK_FLAGS,
    pub hardware_version: Version,
    pub firmware_version: Version,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenInfo {
    pub label: [u8; 32],
    pub manufacturer_id: [u8; 32],
    pub model: [u8; 16],
    pub serial_number: [u8; 16],
    pub flags: CK_FLAGS,
    pub max_session_count: CK_ULONG,
    pub session_count: CK_ULONG,
    pub max_rw_session_count: CK_ULONG,
    pub rw_session_count: CK_ULONG,
    pub max_pin_len: CK_ULONG,
    pub min_pin_len: CK_ULONG,
    pub total_public_memory: CK_ULONG,
    pub free_public_memory: CK_ULONG,
    pub total_private_memory: CK_ULONG,
    pub free_private_memory: CK_ULONG,
    pub hardware_version: Version,
    pub firmware_version: Version,
    pub utc_time: [u8; 16],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MechanismInfo {
    pub min_key_size: CK_ULONG,
    pub max_key_size: CK_ULONG,
    pub flags: CK_FLAGS,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionInfo {
    pub slot_id: CK_SLOT_ID,
    pub state: CK_STATE,
    pub flags: CK_FLAGS,
    pub device_error: CK_ULONG,
}

/// The value half of an attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeValue {
    /// The attribute doesn't apply to the object or can't be revealed.
    ///
    /// This is the `ulValueLen = CK_UNAVAILABLE_INFORMATION` case and is distinct from
    /// a valid, empty value.
    Invalid,
    /// Only the length of the value is known.
    Length(CK_ULONG),
    Bytes(Vec<u8>),
}

/// An attribute as carried in templates and `GetAttributeValue` answers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub attribute_type: CK_ATTRIBUTE_TYPE,
    pub value: AttributeValue,
}

impl Attribute {
    pub fn new(attribute_type: CK_ATTRIBUTE_TYPE, value: impl Into<Vec<u8>>) -> Self {
        Self {
            attribute_type,
            value: AttributeValue::Bytes(value.into()),
        }
    }
}

/// One entry of a `GetAttributeValue` request: the attribute wanted and the size of the
/// buffer the caller has for it, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttributeRequest {
    pub attribute_type: CK_ATTRIBUTE_TYPE,
    pub capacity: Option<CK_ULONG>,
}

/// Blank pad `text` into a fixed width field, truncating if it doesn't fit.
pub fn padded<const N: usize>(text: &str) -> [u8; N] {
    let mut field = [b' '; N];
    let len = text.len().min(N);
    field[..len].copy_from_slice(&text.as_bytes()[..len]);
    field
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_respects_capacity() {
        let data = vec![1_u8, 2, 3];
        assert_eq!(
            Payload::for_capacity(data.clone(), None),
            Payload::Length(3)
        );
        assert_eq!(
            Payload::for_capacity(data.clone(), Some(2)),
            Payload::Length(3)
        );
        assert_eq!(
            Payload::for_capacity(data.clone(), Some(3)),
            Payload::Value(data)
        );
    }

    #[test]
    fn padded_fields() {
        let field: [u8; 8] = padded("abc");
        assert_eq!(&field, b"abc     ");
        let field: [u8; 2] = padded("abc");
        assert_eq!(&field, b"ab");
    }
}
