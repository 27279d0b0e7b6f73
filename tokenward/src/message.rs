// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Building and parsing RPC messages.
//!
//! A message body is a big-endian `u32` call id followed by the arguments the call
//! catalog declares for that call and direction. Responses may instead carry
//! [`ERROR_CALL_ID`] and a single result code.

use cryptoki_sys::{CK_MECHANISM_TYPE, CK_RV, CK_ULONG, CK_UNAVAILABLE_INFORMATION};

use crate::{
    buffer::WireBuffer,
    calls::{ArgKind, CallId, ERROR_CALL_ID},
    error::{Error, ProtocolError},
    mechanism::{self, Mechanism},
    types::{
        Attribute, AttributeRequest, AttributeValue, Info, MechanismInfo, Payload, SessionInfo,
        SlotInfo, TokenInfo, Version,
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Request,
    Response,
}

/// One decoded argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Byte(u8),
    Ulong(CK_ULONG),
    ZeroString(Vec<u8>),
    ByteArray(Payload<Vec<u8>>),
    ByteBuffer(Option<CK_ULONG>),
    UlongArray(Payload<Vec<CK_ULONG>>),
    UlongBuffer(Option<CK_ULONG>),
    AttributeArray(Vec<Attribute>),
    AttributeBuffer(Vec<AttributeRequest>),
    Mechanism(Mechanism),
    MechanismType(CK_MECHANISM_TYPE),
    Info(Info),
    SlotInfo(SlotInfo),
    TokenInfo(TokenInfo),
    SessionInfo(SessionInfo),
    MechanismInfo(MechanismInfo),
}

impl Value {
    pub fn kind(&self) -> ArgKind {
        match self {
            Value::Byte(_) => ArgKind::Byte,
            Value::Ulong(_) => ArgKind::Ulong,
            Value::ZeroString(_) => ArgKind::ZeroString,
            Value::ByteArray(_) => ArgKind::ByteArray,
            Value::ByteBuffer(_) => ArgKind::ByteBuffer,
            Value::UlongArray(_) => ArgKind::UlongArray,
            Value::UlongBuffer(_) => ArgKind::UlongBuffer,
            Value::AttributeArray(_) => ArgKind::AttributeArray,
            Value::AttributeBuffer(_) => ArgKind::AttributeBuffer,
            Value::Mechanism(_) => ArgKind::Mechanism,
            Value::MechanismType(_) => ArgKind::MechanismType,
            Value::Info(_) => ArgKind::Info,
            Value::SlotInfo(_) => ArgKind::SlotInfo,
            Value::TokenInfo(_) => ArgKind::TokenInfo,
            Value::SessionInfo(_) => ArgKind::SessionInfo,
            Value::MechanismInfo(_) => ArgKind::MechanismInfo,
        }
    }
}

/// The header of a parsed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Header {
    Call(CallId),
    /// An error response and its result code.
    Error(CK_RV),
}

/// A reusable RPC message.
#[derive(Debug)]
pub struct Message {
    call_id: u32,
    direction: Direction,
    signature: &'static [ArgKind],
    position: usize,
    verify: bool,
    buffer: WireBuffer,
}

impl Default for Message {
    fn default() -> Self {
        Self::new()
    }
}

impl Message {
    /// Create an empty message.
    ///
    /// Signature verification is on in debug builds; see [`Message::set_verify`].
    pub fn new() -> Self {
        Self {
            call_id: ERROR_CALL_ID,
            direction: Direction::Request,
            signature: &[],
            position: 0,
            verify: cfg!(debug_assertions),
            buffer: WireBuffer::new(),
        }
    }

    /// Check every argument written against the call's declared argument list.
    pub fn set_verify(&mut self, verify: bool) {
        self.verify = verify;
    }

    pub fn call_id(&self) -> u32 {
        self.call_id
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.buffer.as_bytes()
    }

    /// Reset the message and write the header for `call`.
    pub fn prepare(&mut self, call: CallId, direction: Direction) -> Result<(), Error> {
        self.buffer.reset();
        self.call_id = call as u32;
        self.direction = direction;
        self.signature = signature(call, direction);
        self.position = 0;
        if self.buffer.put_u32(self.call_id) {
            Ok(())
        } else {
            Err(Error::HostMemory)
        }
    }

    /// Reset the message into an error response carrying `rv`.
    pub fn prepare_error(&mut self, rv: CK_RV) -> Result<(), Error> {
        self.buffer.reset();
        self.call_id = ERROR_CALL_ID;
        self.direction = Direction::Response;
        self.signature = &[];
        self.position = 0;
        if !self.buffer.put_u32(ERROR_CALL_ID) {
            return Err(Error::HostMemory);
        }
        self.put_ulong(rv)
    }

    /// Reset the message and expose `len` bytes for the caller to receive the body into.
    pub fn receive_buffer(&mut self, len: usize) -> Option<&mut [u8]> {
        self.call_id = ERROR_CALL_ID;
        self.signature = &[];
        self.position = 0;
        self.buffer.prepare_receive(len)
    }

    /// Replace the contents with a received body.
    pub fn load(&mut self, body: &[u8]) -> Result<(), Error> {
        let space = self.receive_buffer(body.len()).ok_or(Error::HostMemory)?;
        space.copy_from_slice(body);
        Ok(())
    }

    /// Read the header of a received message.
    ///
    /// After this returns [`Header::Call`] the arguments can be read with
    /// [`Message::read_all`]. Error responses are fully consumed by this call.
    pub fn parse(&mut self, direction: Direction) -> Result<Header, Error> {
        self.direction = direction;
        let call_id = self
            .buffer
            .get_u32()
            .ok_or_else(|| malformed("message has no call id"))?;
        self.call_id = call_id;
        if call_id == ERROR_CALL_ID && direction == Direction::Response {
            let rv = self.get_ulong()?;
            self.finish()?;
            if rv == cryptoki_sys::CKR_OK {
                return Err(ProtocolError::BadErrorCode.into());
            }
            return Ok(Header::Error(rv));
        }
        let call = CallId::from_wire(call_id).ok_or(ProtocolError::UnknownCall(call_id))?;
        self.signature = signature(call, direction);
        Ok(Header::Call(call))
    }

    /// Write every argument of the call in order.
    pub fn write_all(&mut self, values: &[Value]) -> Result<(), Error> {
        for value in values {
            self.write(value)?;
        }
        if self.verify && self.position != self.signature.len() {
            return Err(ProtocolError::Signature {
                call_id: self.call_id,
                expected: self.signature.get(self.position).copied(),
                actual: None,
            }
            .into());
        }
        Ok(())
    }

    /// Read every argument the call declares, then check nothing is left over.
    pub fn read_all(&mut self) -> Result<Values, Error> {
        let mut values = Vec::with_capacity(self.signature.len());
        for kind in self.signature {
            values.push(self.read_value(*kind)?);
        }
        self.position = self.signature.len();
        self.finish()?;
        Ok(Values(values.into_iter()))
    }

    /// Write one argument.
    pub fn write(&mut self, value: &Value) -> Result<(), Error> {
        self.check_signature(value.kind())?;
        match value {
            Value::Byte(byte) => self.put_u8(*byte),
            Value::Ulong(value) => self.put_ulong(*value),
            Value::ZeroString(string) => self.put_zero_string(string),
            Value::ByteArray(payload) => self.put_byte_array(payload),
            Value::ByteBuffer(capacity) | Value::UlongBuffer(capacity) => {
                self.put_buffer(*capacity)
            }
            Value::UlongArray(payload) => self.put_ulong_array(payload),
            Value::AttributeArray(attributes) => self.put_attribute_array(attributes),
            Value::AttributeBuffer(requests) => self.put_attribute_buffer(requests),
            Value::Mechanism(mechanism) => self.put_mechanism(mechanism),
            Value::MechanismType(mechanism_type) => {
                if !mechanism::is_supported(*mechanism_type) {
                    return Err(Error::MechanismInvalid(*mechanism_type));
                }
                self.put_ulong(*mechanism_type)
            }
            Value::Info(info) => self.put_info(info),
            Value::SlotInfo(info) => self.put_slot_info(info),
            Value::TokenInfo(info) => self.put_token_info(info),
            Value::SessionInfo(info) => {
                self.put_ulong(info.slot_id)?;
                self.put_ulong(info.state)?;
                self.put_ulong(info.flags)?;
                self.put_ulong(info.device_error)
            }
            Value::MechanismInfo(info) => {
                self.put_ulong(info.min_key_size)?;
                self.put_ulong(info.max_key_size)?;
                self.put_ulong(info.flags)
            }
        }
    }

    fn check_signature(&mut self, actual: ArgKind) -> Result<(), Error> {
        if self.verify {
            let expected = self.signature.get(self.position).copied();
            if expected != Some(actual) {
                return Err(ProtocolError::Signature {
                    call_id: self.call_id,
                    expected,
                    actual: Some(actual),
                }
                .into());
            }
        }
        self.position += 1;
        Ok(())
    }

    fn finish(&self) -> Result<(), Error> {
        if self.buffer.has_error() {
            return Err(malformed("message is truncated"));
        }
        match self.buffer.remaining() {
            0 => Ok(()),
            trailing => Err(ProtocolError::TrailingData(trailing).into()),
        }
    }

    fn put_u8(&mut self, value: u8) -> Result<(), Error> {
        if self.buffer.put_u8(value) {
            Ok(())
        } else {
            Err(Error::HostMemory)
        }
    }

    fn put_u32(&mut self, value: u32) -> Result<(), Error> {
        if self.buffer.put_u32(value) {
            Ok(())
        } else {
            Err(Error::HostMemory)
        }
    }

    fn put_bytes(&mut self, value: &[u8]) -> Result<(), Error> {
        if self.buffer.put_bytes(value) {
            Ok(())
        } else {
            Err(Error::HostMemory)
        }
    }

    /// Ulongs are 32 bits on the wire; `CK_UNAVAILABLE_INFORMATION` maps to `u32::MAX`.
    ///
    /// A native `0xFFFF_FFFF` would decode as `CK_UNAVAILABLE_INFORMATION`, so it is refused.
    fn put_ulong(&mut self, value: CK_ULONG) -> Result<(), Error> {
        let value = if value == CK_UNAVAILABLE_INFORMATION {
            u32::MAX
        } else if value == CK_ULONG::from(u32::MAX) {
            return Err(Error::ArgumentsBad("value is ambiguous on the wire"));
        } else {
            u32::try_from(value).map_err(|_| Error::ArgumentsBad("value does not fit in 32 bits"))?
        };
        self.put_u32(value)
    }

    fn put_len(&mut self, len: usize) -> Result<(), Error> {
        let len = u32::try_from(len).map_err(|_| Error::ArgumentsBad("argument is too large"))?;
        self.put_u32(len)
    }

    fn put_zero_string(&mut self, string: &[u8]) -> Result<(), Error> {
        if string.contains(&0) {
            return Err(Error::ArgumentsBad("string contains a NUL byte"));
        }
        self.put_bytes(string)?;
        self.put_u8(0)
    }

    fn put_byte_array(&mut self, payload: &Payload<Vec<u8>>) -> Result<(), Error> {
        match payload {
            Payload::Length(len) => {
                self.put_u8(0)?;
                self.put_u32(clamp_length(*len))
            }
            Payload::Value(bytes) => {
                self.put_u8(1)?;
                self.put_len(bytes.len())?;
                self.put_bytes(bytes)
            }
        }
    }

    fn put_buffer(&mut self, capacity: Option<CK_ULONG>) -> Result<(), Error> {
        self.put_u8(capacity.is_some().into())?;
        self.put_u32(capacity.map_or(0, clamp_length))
    }

    fn put_ulong_array(&mut self, payload: &Payload<Vec<CK_ULONG>>) -> Result<(), Error> {
        match payload {
            Payload::Length(count) => {
                self.put_u8(0)?;
                self.put_u32(clamp_length(*count))
            }
            Payload::Value(values) => {
                self.put_u8(1)?;
                self.put_len(values.len())?;
                values.iter().try_for_each(|value| self.put_ulong(*value))
            }
        }
    }

    fn put_attribute_array(&mut self, attributes: &[Attribute]) -> Result<(), Error> {
        self.put_len(attributes.len())?;
        for attribute in attributes {
            self.put_ulong(attribute.attribute_type)?;
            match &attribute.value {
                AttributeValue::Invalid => self.put_u8(0)?,
                AttributeValue::Length(len) => {
                    self.put_u8(1)?;
                    self.put_byte_array(&Payload::Length(*len))?;
                }
                AttributeValue::Bytes(bytes) => {
                    self.put_u8(1)?;
                    self.put_u8(1)?;
                    self.put_len(bytes.len())?;
                    self.put_bytes(bytes)?;
                }
            }
        }
        Ok(())
    }

    fn put_attribute_buffer(&mut self, requests: &[AttributeRequest]) -> Result<(), Error> {
        self.put_len(requests.len())?;
        for request in requests {
            self.put_ulong(request.attribute_type)?;
            self.put_buffer(request.capacity)?;
        }
        Ok(())
    }

    fn put_mechanism(&mut self, mechanism: &Mechanism) -> Result<(), Error> {
        if !mechanism::is_supported(mechanism.mechanism_type()) {
            return Err(Error::MechanismInvalid(mechanism.mechanism_type()));
        }
        self.put_ulong(mechanism.mechanism_type())?;
        match mechanism.parameter() {
            None => {
                self.put_u8(0)?;
                self.put_u32(0)
            }
            Some(parameter) => {
                self.put_u8(1)?;
                self.put_len(parameter.len())?;
                self.put_bytes(parameter)
            }
        }
    }

    fn put_version(&mut self, version: Version) -> Result<(), Error> {
        self.put_u8(version.major)?;
        self.put_u8(version.minor)
    }

    fn put_info(&mut self, info: &Info) -> Result<(), Error> {
        self.put_version(info.cryptoki_version)?;
        self.put_bytes(&info.manufacturer_id)?;
        self.put_ulong(info.flags)?;
        self.put_bytes(&info.library_description)?;
        self.put_version(info.library_version)
    }

    fn put_slot_info(&mut self, info: &SlotInfo) -> Result<(), Error> {
        self.put_bytes(&info.slot_description)?;
        self.put_bytes(&info.manufacturer_id)?;
        self.put_ulong(info.flags)?;
        self.put_version(info.hardware_version)?;
        self.put_version(info.firmware_version)
    }

    fn put_token_info(&mut self, info: &TokenInfo) -> Result<(), Error> {
        self.put_bytes(&info.label)?;
        self.put_bytes(&info.manufacturer_id)?;
        self.put_bytes(&info.model)?;
        self.put_bytes(&info.serial_number)?;
        for value in [
            info.flags,
            info.max_session_count,
            info.session_count,
            info.max_rw_session_count,
            info.rw_session_count,
            info.max_pin_len,
            info.min_pin_len,
            info.total_public_memory,
            info.free_public_memory,
            info.total_private_memory,
            info.free_private_memory,
        ] {
            self.put_ulong(value)?;
        }
        self.put_version(info.hardware_version)?;
        self.put_version(info.firmware_version)?;
        self.put_bytes(&info.utc_time)
    }

    /// Read one argument of the given kind.
    fn read_value(&mut self, kind: ArgKind) -> Result<Value, Error> {
        let value = match kind {
            ArgKind::Byte => Value::Byte(self.get_u8()?),
            ArgKind::Ulong => Value::Ulong(self.get_ulong()?),
            ArgKind::ZeroString => Value::ZeroString(self.get_zero_string()?),
            ArgKind::ByteArray => Value::ByteArray(self.get_byte_array()?),
            ArgKind::ByteBuffer => Value::ByteBuffer(self.get_buffer()?),
            ArgKind::UlongArray => Value::UlongArray(self.get_ulong_array()?),
            ArgKind::UlongBuffer => Value::UlongBuffer(self.get_buffer()?),
            ArgKind::AttributeArray => Value::AttributeArray(self.get_attribute_array()?),
            ArgKind::AttributeBuffer => Value::AttributeBuffer(self.get_attribute_buffer()?),
            ArgKind::Mechanism => Value::Mechanism(self.get_mechanism()?),
            ArgKind::MechanismType => {
                let mechanism_type = self.get_ulong()?;
                if !mechanism::is_supported(mechanism_type) {
                    return Err(Error::MechanismInvalid(mechanism_type));
                }
                Value::MechanismType(mechanism_type)
            }
            ArgKind::Info => Value::Info(Info {
                cryptoki_version: self.get_version()?,
                manufacturer_id: self.get_fixed()?,
                flags: self.get_ulong()?,
                library_description: self.get_fixed()?,
                library_version: self.get_version()?,
            }),
            ArgKind::SlotInfo => Value::SlotInfo(SlotInfo {
                slot_description: self.get_fixed()?,
                manufacturer_id: self.get_fixed()?,
                flags: self.get_ulong()?,
                hardware_version: self.get_version()?,
                firmware_version: self.get_version()?,
            }),
            ArgKind::TokenInfo => Value::TokenInfo(TokenInfo {
                label: self.get_fixed()?,
                manufacturer_id: self.get_fixed()?,
                model: self.get_fixed()?,
                serial_number: self.get_fixed()?,
                flags: self.get_ulong()?,
                max_session_count: self.get_ulong()?,
                session_count: self.get_ulong()?,
                max_rw_session_count: self.get_ulong()?,
                rw_session_count: self.get_ulong()?,
                max_pin_len: self.get_ulong()?,
                min_pin_len: self.get_ulong()?,
                total_public_memory: self.get_ulong()?,
                free_public_memory: self.get_ulong()?,
                total_private_memory: self.get_ulong()?,
                free_private_memory: self.get_ulong()?,
                hardware_version: self.get_version()?,
                firmware_version: self.get_version()?,
                utc_time: self.get_fixed()?,
            }),
            ArgKind::SessionInfo => Value::SessionInfo(SessionInfo {
                slot_id: self.get_ulong()?,
                state: self.get_ulong()?,
                flags: self.get_ulong()?,
                device_error: self.get_ulong()?,
            }),
            ArgKind::MechanismInfo => Value::MechanismInfo(MechanismInfo {
                min_key_size: self.get_ulong()?,
                max_key_size: self.get_ulong()?,
                flags: self.get_ulong()?,
            }),
        };
        Ok(value)
    }

    fn get_u8(&mut self) -> Result<u8, Error> {
        self.buffer
            .get_u8()
            .ok_or_else(|| malformed("message is truncated"))
    }

    fn get_u32(&mut self) -> Result<u32, Error> {
        self.buffer
            .get_u32()
            .ok_or_else(|| malformed("message is truncated"))
    }

    fn get_bytes(&mut self, len: u32) -> Result<Vec<u8>, Error> {
        let len = usize::try_from(len).map_err(|_| malformed("length does not fit in memory"))?;
        self.buffer
            .get_bytes(len)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| malformed("byte array is longer than the message"))
    }

    fn get_validity(&mut self) -> Result<bool, Error> {
        match self.get_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(malformed(&format!("invalid validity flag {other}"))),
        }
    }

    fn get_ulong(&mut self) -> Result<CK_ULONG, Error> {
        Ok(match self.get_u32()? {
            u32::MAX => CK_UNAVAILABLE_INFORMATION,
            value => CK_ULONG::from(value),
        })
    }

    fn get_zero_string(&mut self) -> Result<Vec<u8>, Error> {
        let mut string = Vec::new();
        loop {
            match self.get_u8()? {
                0 => return Ok(string),
                byte => string.push(byte),
            }
        }
    }

    fn get_byte_array(&mut self) -> Result<Payload<Vec<u8>>, Error> {
        let valid = self.get_validity()?;
        let len = self.get_u32()?;
        if valid {
            Ok(Payload::Value(self.get_bytes(len)?))
        } else {
            Ok(Payload::Length(CK_ULONG::from(len)))
        }
    }

    fn get_buffer(&mut self) -> Result<Option<CK_ULONG>, Error> {
        let has_buffer = self.get_validity()?;
        let capacity = self.get_u32()?;
        Ok(has_buffer.then_some(CK_ULONG::from(capacity)))
    }

    fn get_count(&mut self, element_size: usize) -> Result<usize, Error> {
        let count = usize::try_from(self.get_u32()?)
            .map_err(|_| malformed("count does not fit in memory"))?;
        // Refuse to allocate for elements the message can't hold.
        if count.saturating_mul(element_size) > self.buffer.remaining() {
            return Err(malformed("array is longer than the message"));
        }
        Ok(count)
    }

    fn get_ulong_array(&mut self) -> Result<Payload<Vec<CK_ULONG>>, Error> {
        if !self.get_validity()? {
            return Ok(Payload::Length(CK_ULONG::from(self.get_u32()?)));
        }
        let count = self.get_count(4)?;
        let mut values = Vec::with_capacity(count);
        for _ in 0..count {
            values.push(self.get_ulong()?);
        }
        Ok(Payload::Value(values))
    }

    fn get_attribute_array(&mut self) -> Result<Vec<Attribute>, Error> {
        // Every entry is at least a type and a validity flag.
        let count = self.get_count(5)?;
        let mut attributes = Vec::with_capacity(count);
        for _ in 0..count {
            let attribute_type = self.get_ulong()?;
            let value = if self.get_validity()? {
                match self.get_byte_array()? {
                    Payload::Length(len) => AttributeValue::Length(len),
                    Payload::Value(bytes) => AttributeValue::Bytes(bytes),
                }
            } else {
                AttributeValue::Invalid
            };
            attributes.push(Attribute {
                attribute_type,
                value,
            });
        }
        Ok(attributes)
    }

    fn get_attribute_buffer(&mut self) -> Result<Vec<AttributeRequest>, Error> {
        let count = self.get_count(9)?;
        let mut requests = Vec::with_capacity(count);
        for _ in 0..count {
            requests.push(AttributeRequest {
                attribute_type: self.get_ulong()?,
                capacity: self.get_buffer()?,
            });
        }
        Ok(requests)
    }

    fn get_mechanism(&mut self) -> Result<Mechanism, Error> {
        let mechanism_type = self.get_ulong()?;
        let parameter = match self.get_byte_array()? {
            Payload::Value(parameter) => Some(parameter),
            Payload::Length(_) => None,
        };
        Mechanism::new(mechanism_type, parameter.as_deref())
    }

    fn get_version(&mut self) -> Result<Version, Error> {
        Ok(Version {
            major: self.get_u8()?,
            minor: self.get_u8()?,
        })
    }

    fn get_fixed<const N: usize>(&mut self) -> Result<[u8; N], Error> {
        let bytes = self
            .buffer
            .get_bytes(N)
            .ok_or_else(|| malformed("message is truncated"))?;
        let mut field = [0_u8; N];
        field.copy_from_slice(bytes);
        Ok(field)
    }
}

fn signature(call: CallId, direction: Direction) -> &'static [ArgKind] {
    match direction {
        Direction::Request => call.spec().request,
        Direction::Response => call.spec().response,
    }
}

/// Lengths and capacities are 32 bits on the wire; larger ones saturate.
fn clamp_length(len: CK_ULONG) -> u32 {
    u32::try_from(len).unwrap_or(u32::MAX)
}

fn malformed(reason: &str) -> Error {
    ProtocolError::Malformed(reason.to_string()).into()
}

/// The arguments read from a message, consumed in declaration order.
#[derive(Debug)]
pub struct Values(std::vec::IntoIter<Value>);

macro_rules! take {
    ($(#[$doc:meta])* $name:ident, $variant:ident, $type:ty) => {
        $(#[$doc])*
        pub fn $name(&mut self) -> Result<$type, Error> {
            match self.0.next() {
                Some(Value::$variant(value)) => Ok(value),
                other => Err(ProtocolError::Malformed(format!(
                    "expected {} but found {:?}",
                    stringify!($variant),
                    other.map(|value| value.kind())
                ))
                .into()),
            }
        }
    };
}

impl Values {
    pub fn new(values: Vec<Value>) -> Self {
        Self(values.into_iter())
    }

    take!(byte, Byte, u8);
    take!(ulong, Ulong, CK_ULONG);
    take!(zero_string, ZeroString, Vec<u8>);
    take!(byte_array, ByteArray, Payload<Vec<u8>>);
    take!(
        /// The caller's capacity, or `None` for a size query.
        byte_buffer,
        ByteBuffer,
        Option<CK_ULONG>
    );
    take!(ulong_array, UlongArray, Payload<Vec<CK_ULONG>>);
    take!(ulong_buffer, UlongBuffer, Option<CK_ULONG>);
    take!(attribute_array, AttributeArray, Vec<Attribute>);
    take!(attribute_buffer, AttributeBuffer, Vec<AttributeRequest>);
    take!(mechanism, Mechanism, Mechanism);
    take!(mechanism_type, MechanismType, CK_MECHANISM_TYPE);
    take!(info, Info, Info);
    take!(slot_info, SlotInfo, SlotInfo);
    take!(token_info, TokenInfo, TokenInfo);
    take!(session_info, SessionInfo, SessionInfo);
    take!(mechanism_info, MechanismInfo, MechanismInfo);

    /// A byte array that must be present, as opposed to a length.
    pub fn bytes(&mut self) -> Result<Vec<u8>, Error> {
        match self.byte_array()? {
            Payload::Value(bytes) => Ok(bytes),
            Payload::Length(_) => Err(malformed("expected a byte array with data")),
        }
    }

    /// A byte array which may be NULL in the C API, such as a PIN.
    pub fn optional_bytes(&mut self) -> Result<Option<Vec<u8>>, Error> {
        match self.byte_array()? {
            Payload::Value(bytes) => Ok(Some(bytes)),
            Payload::Length(_) => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use cryptoki_sys::{
        CKA_LABEL, CKA_VALUE, CKM_AES_CBC_PAD, CKM_AES_GCM, CKM_RSA_PKCS_OAEP,
        CKM_SHA256_RSA_PKCS, CKR_PIN_INCORRECT,
    };
    use proptest::prelude::*;

    use super::*;
    use crate::calls::CALLS;

    fn reparse(message: &Message, direction: Direction) -> (Message, Result<Header, Error>) {
        let mut parsed = Message::new();
        parsed.load(message.as_bytes()).unwrap();
        let header = parsed.parse(direction);
        (parsed, header)
    }

    #[test]
    fn request_layout() -> Result<(), Error> {
        let mut message = Message::new();
        message.prepare(CallId::GetSlotList, Direction::Request)?;
        message.write_all(&[Value::Byte(1), Value::UlongBuffer(Some(2))])?;
        assert_eq!(
            message.as_bytes(),
            &[0, 0, 0, 4, 1, 1, 0, 0, 0, 2],
            "call id, token present, has buffer, capacity"
        );
        Ok(())
    }

    #[test]
    fn byte_array_layouts() -> Result<(), Error> {
        let mut message = Message::new();
        message.prepare(CallId::GenerateRandom, Direction::Response)?;
        message.write_all(&[Value::ByteArray(Payload::Length(300))])?;
        assert_eq!(&message.as_bytes()[4..], &[0, 0, 0, 1, 44]);

        message.prepare(CallId::GenerateRandom, Direction::Response)?;
        message.write_all(&[Value::ByteArray(Payload::Value(vec![9, 8]))])?;
        assert_eq!(&message.as_bytes()[4..], &[1, 0, 0, 0, 2, 9, 8]);
        Ok(())
    }

    #[test]
    fn error_response() -> Result<(), Error> {
        let mut message = Message::new();
        message.prepare_error(CKR_PIN_INCORRECT)?;
        let (_, header) = reparse(&message, Direction::Response);
        assert_eq!(header?, Header::Error(CKR_PIN_INCORRECT));
        Ok(())
    }

    #[test]
    fn error_response_with_ok_code() -> Result<(), Error> {
        let mut message = Message::new();
        message.prepare_error(cryptoki_sys::CKR_OK)?;
        let (_, header) = reparse(&message, Direction::Response);
        assert!(matches!(
            header,
            Err(Error::Protocol(ProtocolError::BadErrorCode))
        ));
        Ok(())
    }

    #[test]
    fn unknown_call_id() {
        let mut message = Message::new();
        message.load(&[0, 0, 1, 0]).unwrap();
        assert!(matches!(
            message.parse(Direction::Request),
            Err(Error::Protocol(ProtocolError::UnknownCall(256)))
        ));
    }

    #[test]
    fn validity_sentinel_survives() -> Result<(), Error> {
        let attributes = vec![
            Attribute {
                attribute_type: CKA_VALUE,
                value: AttributeValue::Invalid,
            },
            Attribute::new(CKA_LABEL, Vec::new()),
            Attribute {
                attribute_type: CKA_LABEL,
                value: AttributeValue::Length(0),
            },
        ];
        let mut message = Message::new();
        message.prepare(CallId::GetAttributeValue, Direction::Response)?;
        message.write_all(&[
            Value::AttributeArray(attributes.clone()),
            Value::Ulong(cryptoki_sys::CKR_OK),
        ])?;

        let (mut parsed, header) = reparse(&message, Direction::Response);
        assert_eq!(header?, Header::Call(CallId::GetAttributeValue));
        let mut values = parsed.read_all()?;
        assert_eq!(values.attribute_array()?, attributes);
        Ok(())
    }

    #[test]
    fn unavailable_information_round_trips() -> Result<(), Error> {
        let mut message = Message::new();
        message.prepare(CallId::GetObjectSize, Direction::Response)?;
        message.write_all(&[Value::Ulong(CK_UNAVAILABLE_INFORMATION)])?;
        assert_eq!(&message.as_bytes()[4..], &[0xff; 4]);
        let (mut parsed, _) = reparse(&message, Direction::Response);
        assert_eq!(parsed.read_all()?.ulong()?, CK_UNAVAILABLE_INFORMATION);
        Ok(())
    }

    #[test]
    fn oversized_ulong_is_rejected() -> Result<(), Error> {
        let mut message = Message::new();
        message.prepare(CallId::CloseSession, Direction::Request)?;
        assert!(matches!(
            message.write(&Value::Ulong(1 << 40)),
            Err(Error::ArgumentsBad(_))
        ));
        Ok(())
    }

    #[test]
    fn ambiguous_ulong_is_rejected() -> Result<(), Error> {
        let mut message = Message::new();
        message.prepare(CallId::OpenSession, Direction::Response)?;
        assert!(matches!(
            message.write(&Value::Ulong(0xFFFF_FFFF)),
            Err(Error::ArgumentsBad("value is ambiguous on the wire"))
        ));

        message.prepare(CallId::OpenSession, Direction::Response)?;
        message.write(&Value::Ulong(0xFFFF_FFFE))?;
        let (mut parsed, _) = reparse(&message, Direction::Response);
        assert_eq!(parsed.read_all()?.ulong()?, 0xFFFF_FFFE);
        Ok(())
    }

    #[test]
    fn signature_verification() -> Result<(), Error> {
        let mut message = Message::new();
        message.set_verify(true);
        message.prepare(CallId::OpenSession, Direction::Request)?;
        let result = message.write(&Value::Byte(1));
        assert!(matches!(
            result,
            Err(Error::Protocol(ProtocolError::Signature {
                expected: Some(ArgKind::Ulong),
                actual: Some(ArgKind::Byte),
                ..
            }))
        ));

        message.prepare(CallId::OpenSession, Direction::Request)?;
        let result = message.write_all(&[Value::Ulong(1)]);
        assert!(matches!(
            result,
            Err(Error::Protocol(ProtocolError::Signature { actual: None, .. }))
        ));
        Ok(())
    }

    #[test]
    fn disallowed_mechanism_type() -> Result<(), Error> {
        let mut message = Message::new();
        message.prepare(CallId::GetMechanismInfo, Direction::Request)?;
        message.write(&Value::Ulong(0))?;
        assert!(matches!(
            message.write(&Value::MechanismType(CKM_RSA_PKCS_OAEP)),
            Err(Error::MechanismInvalid(CKM_RSA_PKCS_OAEP))
        ));
        Ok(())
    }

    #[test]
    fn disallowed_mechanism_writes_nothing() -> Result<(), Error> {
        let mut message = Message::new();
        message.prepare(CallId::EncryptInit, Direction::Request)?;
        message.write(&Value::Ulong(1))?;
        let before = message.as_bytes().to_vec();
        let gcm = Mechanism::unchecked(CKM_AES_GCM, Some(&[0_u8; 8][..]));
        assert!(matches!(
            message.write(&Value::Mechanism(gcm)),
            Err(Error::MechanismInvalid(CKM_AES_GCM))
        ));
        assert_eq!(message.as_bytes(), &before[..]);
        Ok(())
    }

    #[test]
    fn truncated_and_trailing() -> Result<(), Error> {
        let mut message = Message::new();
        message.prepare(CallId::OpenSession, Direction::Response)?;
        message.write_all(&[Value::Ulong(7)])?;
        let full = message.as_bytes().to_vec();

        let mut parsed = Message::new();
        parsed.load(&full[..full.len() - 1])?;
        parsed.parse(Direction::Response)?;
        assert!(matches!(
            parsed.read_all(),
            Err(Error::Protocol(ProtocolError::Malformed(_)))
        ));

        let mut long = full.clone();
        long.push(0);
        parsed.load(&long)?;
        parsed.parse(Direction::Response)?;
        assert!(matches!(
            parsed.read_all(),
            Err(Error::Protocol(ProtocolError::TrailingData(1)))
        ));
        Ok(())
    }

    #[test]
    fn oversized_array_count_is_rejected() -> Result<(), Error> {
        let mut parsed = Message::new();
        // FindObjects response claiming a billion handles in four bytes.
        parsed.load(&[0, 0, 0, 30, 1, 0x40, 0, 0, 0, 0, 0, 0, 1])?;
        parsed.parse(Direction::Response)?;
        assert!(matches!(
            parsed.read_all(),
            Err(Error::Protocol(ProtocolError::Malformed(_)))
        ));
        Ok(())
    }

    /// Every wire value; `u32::MAX` stands for `CK_UNAVAILABLE_INFORMATION`.
    fn arb_ulong() -> impl Strategy<Value = CK_ULONG> {
        (0..=u32::MAX).prop_map(|value| match value {
            u32::MAX => CK_UNAVAILABLE_INFORMATION,
            value => CK_ULONG::from(value),
        })
    }

    fn arb_bytes() -> impl Strategy<Value = Vec<u8>> {
        proptest::collection::vec(any::<u8>(), 0..64)
    }

    fn arb_byte_payload() -> impl Strategy<Value = Payload<Vec<u8>>> {
        prop_oneof![
            (0..u32::MAX).prop_map(|len| Payload::Length(len.into())),
            arb_bytes().prop_map(Payload::Value),
        ]
    }

    fn arb_capacity() -> impl Strategy<Value = Option<CK_ULONG>> {
        proptest::option::of((0..u32::MAX).prop_map(CK_ULONG::from))
    }

    fn arb_attribute() -> impl Strategy<Value = Attribute> {
        let value = prop_oneof![
            Just(AttributeValue::Invalid),
            (0..u32::MAX).prop_map(|len| AttributeValue::Length(len.into())),
            arb_bytes().prop_map(AttributeValue::Bytes),
        ];
        (arb_ulong(), value).prop_map(|(attribute_type, value)| Attribute {
            attribute_type,
            value,
        })
    }

    fn arb_value(kind: ArgKind) -> BoxedStrategy<Value> {
        match kind {
            ArgKind::Byte => any::<u8>().prop_map(Value::Byte).boxed(),
            ArgKind::Ulong => arb_ulong().prop_map(Value::Ulong).boxed(),
            ArgKind::ZeroString => proptest::collection::vec(1_u8..=255, 0..32)
                .prop_map(Value::ZeroString)
                .boxed(),
            ArgKind::ByteArray => arb_byte_payload().prop_map(Value::ByteArray).boxed(),
            ArgKind::ByteBuffer => arb_capacity().prop_map(Value::ByteBuffer).boxed(),
            ArgKind::UlongArray => prop_oneof![
                (0..u32::MAX).prop_map(|len| Payload::Length(len.into())),
                proptest::collection::vec(arb_ulong(), 0..16).prop_map(Payload::Value),
            ]
            .prop_map(Value::UlongArray)
            .boxed(),
            ArgKind::UlongBuffer => arb_capacity().prop_map(Value::UlongBuffer).boxed(),
            ArgKind::AttributeArray => proptest::collection::vec(arb_attribute(), 0..8)
                .prop_map(Value::AttributeArray)
                .boxed(),
            ArgKind::AttributeBuffer => {
                proptest::collection::vec((arb_ulong(), arb_capacity()), 0..8)
                    .prop_map(|entries| {
                        Value::AttributeBuffer(
                            entries
                                .into_iter()
                                .map(|(attribute_type, capacity)| AttributeRequest {
                                    attribute_type,
                                    capacity,
                                })
                                .collect(),
                        )
                    })
                    .boxed()
            }
            ArgKind::Mechanism => prop_oneof![
                Just(Mechanism::new(CKM_SHA256_RSA_PKCS, None).unwrap()),
                arb_bytes()
                    .prop_map(|iv| Mechanism::new(CKM_AES_CBC_PAD, Some(&iv[..])).unwrap()),
            ]
            .prop_map(Value::Mechanism)
            .boxed(),
            ArgKind::MechanismType => Just(Value::MechanismType(CKM_SHA256_RSA_PKCS)).boxed(),
            ArgKind::Info => Just(Value::Info(Info {
                cryptoki_version: Version { major: 2, minor: 40 },
                manufacturer_id: crate::types::padded("manufacturer"),
                flags: 0,
                library_description: crate::types::padded("description"),
                library_version: Version { major: 1, minor: 2 },
            }))
            .boxed(),
            ArgKind::SlotInfo => Just(Value::SlotInfo(SlotInfo {
                slot_description: crate::types::padded("slot"),
                manufacturer_id: crate::types::padded("manufacturer"),
                flags: 7,
                hardware_version: Version { major: 0, minor: 1 },
                firmware_version: Version { major: 3, minor: 4 },
            }))
            .boxed(),
            ArgKind::TokenInfo => arb_ulong()
                .prop_map(|count| {
                    Value::TokenInfo(TokenInfo {
                        label: crate::types::padded("label"),
                        manufacturer_id: crate::types::padded("manufacturer"),
                        model: crate::types::padded("model"),
                        serial_number: crate::types::padded("0001"),
                        flags: 1,
                        max_session_count: count,
                        session_count: 1,
                        max_rw_session_count: count,
                        rw_session_count: 0,
                        max_pin_len: 64,
                        min_pin_len: 4,
                        total_public_memory: CK_UNAVAILABLE_INFORMATION,
                        free_public_memory: CK_UNAVAILABLE_INFORMATION,
                        total_private_memory: CK_UNAVAILABLE_INFORMATION,
                        free_private_memory: CK_UNAVAILABLE_INFORMATION,
                        hardware_version: Version::default(),
                        firmware_version: Version::default(),
                        utc_time: *b"2026101612000000",
                    })
                })
                .boxed(),
            ArgKind::SessionInfo => (arb_ulong(), arb_ulong())
                .prop_map(|(slot_id, flags)| {
                    Value::SessionInfo(SessionInfo {
                        slot_id,
                        state: 3,
                        flags,
                        device_error: 0,
                    })
                })
                .boxed(),
            ArgKind::MechanismInfo => (arb_ulong(), arb_ulong(), arb_ulong())
                .prop_map(|(min_key_size, max_key_size, flags)| {
                    Value::MechanismInfo(MechanismInfo {
                        min_key_size,
                        max_key_size,
                        flags,
                    })
                })
                .boxed(),
        }
    }

    fn arb_message() -> impl Strategy<Value = (CallId, Direction, Vec<Value>)> {
        (0..CALLS.len(), any::<bool>()).prop_flat_map(|(index, request)| {
            let spec = &CALLS[index];
            let direction = if request {
                Direction::Request
            } else {
                Direction::Response
            };
            let kinds = match direction {
                Direction::Request => spec.request,
                Direction::Response => spec.response,
            };
            let values: Vec<_> = kinds.iter().map(|kind| arb_value(*kind)).collect();
            (Just(spec.id), Just(direction), values)
        })
    }

    proptest! {
        #[test]
        fn framing_round_trip((call, direction, values) in arb_message()) {
            let mut message = Message::new();
            message.set_verify(true);
            message.prepare(call, direction).unwrap();
            message.write_all(&values).unwrap();

            let mut parsed = Message::new();
            parsed.load(message.as_bytes()).unwrap();
            prop_assert_eq!(parsed.parse(direction).unwrap(), Header::Call(call));
            let mut decoded = Vec::new();
            let mut read = parsed.read_all().unwrap();
            for _ in 0..values.len() {
                decoded.push(read.0.next().unwrap());
            }
            prop_assert_eq!(&decoded, &values);

            let mut encoded = Message::new();
            encoded.prepare(call, direction).unwrap();
            encoded.write_all(&decoded).unwrap();
            prop_assert_eq!(encoded.as_bytes(), message.as_bytes());
        }
    }
}
