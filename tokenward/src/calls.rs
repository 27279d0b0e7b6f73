// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! The call catalog: every RPC the daemon answers and the ordered argument types each
//! one carries.
//!
//! Both the client and the daemon drive a single generic encoder/decoder from this table,
//! so the table is the one place a call's wire shape is defined.

use std::fmt::Display;

/// The call id used by responses that carry only a result code.
pub const ERROR_CALL_ID: u32 = 0;

/// The type of one argument on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    Byte,
    Ulong,
    /// Bytes followed by a single NUL.
    ZeroString,
    ByteArray,
    /// The output buffer the caller has for a byte result (request only).
    ByteBuffer,
    UlongArray,
    /// The output buffer the caller has for a list result (request only).
    UlongBuffer,
    AttributeArray,
    /// The output buffers the caller has for attribute values (request only).
    AttributeBuffer,
    Mechanism,
    MechanismType,
    Info,
    SlotInfo,
    TokenInfo,
    SessionInfo,
    MechanismInfo,
}

/// Calls in PKCS#11 function list order.
///
/// `C_GetFunctionList` has no entry since it's answered without contacting the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum CallId {
    Initialize = 1,
    Finalize,
    GetInfo,
    GetSlotList,
    GetSlotInfo,
    GetTokenInfo,
    GetMechanismList,
    GetMechanismInfo,
    InitToken,
    WaitForSlotEvent,
    OpenSession,
    CloseSession,
    CloseAllSessions,
    GetFunctionStatus,
    CancelFunction,
    GetSessionInfo,
    InitPin,
    SetPin,
    GetOperationState,
    SetOperationState,
    Login,
    Logout,
    CreateObject,
    CopyObject,
    DestroyObject,
    GetObjectSize,
    GetAttributeValue,
    SetAttributeValue,
    FindObjectsInit,
    FindObjects,
    FindObjectsFinal,
    EncryptInit,
    Encrypt,
    EncryptUpdate,
    EncryptFinal,
    DecryptInit,
    Decrypt,
    DecryptUpdate,
    DecryptFinal,
    DigestInit,
    Digest,
    DigestUpdate,
    DigestKey,
    DigestFinal,
    SignInit,
    Sign,
    SignUpdate,
    SignFinal,
    SignRecoverInit,
    SignRecover,
    VerifyInit,
    Verify,
    VerifyUpdate,
    VerifyFinal,
    VerifyRecoverInit,
    VerifyRecover,
    DigestEncryptUpdate,
    DecryptDigestUpdate,
    SignEncryptUpdate,
    DecryptVerifyUpdate,
    GenerateKey,
    GenerateKeyPair,
    WrapKey,
    UnwrapKey,
    DeriveKey,
    SeedRandom,
    GenerateRandom,
}

impl CallId {
    /// Look up a call id received on the wire.
    pub fn from_wire(id: u32) -> Option<Self> {
        let index = usize::try_from(id).ok()?.checked_sub(1)?;
        CALLS.get(index).map(|spec| spec.id)
    }

    pub fn spec(self) -> &'static CallSpec {
        &CALLS[self as usize - 1]
    }

    pub fn name(self) -> &'static str {
        self.spec().name
    }
}

impl Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// The wire shape of one call.
#[derive(Debug)]
pub struct CallSpec {
    pub id: CallId,
    pub name: &'static str,
    pub request: &'static [ArgKind],
    pub response: &'static [ArgKind],
}

use ArgKind::{
    AttributeArray, AttributeBuffer, Byte, ByteArray, ByteBuffer, Info, Mechanism,
    MechanismInfo, MechanismType, SessionInfo, SlotInfo, TokenInfo, Ulong, UlongArray,
    UlongBuffer, ZeroString,
};

/// Data in, two-phase data out.
const CRYPT: &[ArgKind] = &[Ulong, ByteArray, ByteBuffer];
/// Two-phase data out.
const FINAL: &[ArgKind] = &[Ulong, ByteBuffer];
/// Session, mechanism, key.
const OPERATION_INIT: &[ArgKind] = &[Ulong, Mechanism, Ulong];
const SESSION: &[ArgKind] = &[Ulong];
const SESSION_DATA: &[ArgKind] = &[Ulong, ByteArray];
const DATA: &[ArgKind] = &[ByteArray];
const HANDLE: &[ArgKind] = &[Ulong];
const NOTHING: &[ArgKind] = &[];

const fn call(
    id: CallId,
    name: &'static str,
    request: &'static [ArgKind],
    response: &'static [ArgKind],
) -> CallSpec {
    CallSpec {
        id,
        name,
        request,
        response,
    }
}

/// Every call, indexed by `call id - 1`.
#[rustfmt::skip]
pub static CALLS: [CallSpec; 67] = [
    call(CallId::Initialize, "C_Initialize", DATA, NOTHING),
    call(CallId::Finalize, "C_Finalize", NOTHING, NOTHING),
    call(CallId::GetInfo, "C_GetInfo", NOTHING, &[Info]),
    call(CallId::GetSlotList, "C_GetSlotList", &[Byte, UlongBuffer], &[UlongArray]),
    call(CallId::GetSlotInfo, "C_GetSlotInfo", &[Ulong], &[SlotInfo]),
    call(CallId::GetTokenInfo, "C_GetTokenInfo", &[Ulong], &[TokenInfo]),
    call(CallId::GetMechanismList, "C_GetMechanismList", &[Ulong, UlongBuffer], &[UlongArray]),
    call(CallId::GetMechanismInfo, "C_GetMechanismInfo", &[Ulong, MechanismType], &[MechanismInfo]),
    call(CallId::InitToken, "C_InitToken", &[Ulong, ByteArray, ZeroString], NOTHING),
    call(CallId::WaitForSlotEvent, "C_WaitForSlotEvent", &[Ulong], &[Ulong]),
    call(CallId::OpenSession, "C_OpenSession", &[Ulong, Ulong], HANDLE),
    call(CallId::CloseSession, "C_CloseSession", SESSION, NOTHING),
    call(CallId::CloseAllSessions, "C_CloseAllSessions", &[Ulong], NOTHING),
    call(CallId::GetFunctionStatus, "C_GetFunctionStatus", SESSION, NOTHING),
    call(CallId::CancelFunction, "C_CancelFunction", SESSION, NOTHING),
    call(CallId::GetSessionInfo, "C_GetSessionInfo", SESSION, &[SessionInfo]),
    call(CallId::InitPin, "C_InitPIN", SESSION_DATA, NOTHING),
    call(CallId::SetPin, "C_SetPIN", &[Ulong, ByteArray, ByteArray], NOTHING),
    call(CallId::GetOperationState, "C_GetOperationState", FINAL, DATA),
    call(CallId::SetOperationState, "C_SetOperationState", &[Ulong, ByteArray, Ulong, Ulong], NOTHING),
    call(CallId::Login, "C_Login", &[Ulong, Ulong, ByteArray], NOTHING),
    call(CallId::Logout, "C_Logout", SESSION, NOTHING),
    call(CallId::CreateObject, "C_CreateObject", &[Ulong, AttributeArray], HANDLE),
    call(CallId::CopyObject, "C_CopyObject", &[Ulong, Ulong, AttributeArray], HANDLE),
    call(CallId::DestroyObject, "C_DestroyObject", &[Ulong, Ulong], NOTHING),
    call(CallId::GetObjectSize, "C_GetObjectSize", &[Ulong, Ulong], &[Ulong]),
    call(CallId::GetAttributeValue, "C_GetAttributeValue", &[Ulong, Ulong, AttributeBuffer], &[AttributeArray, Ulong]),
    call(CallId::SetAttributeValue, "C_SetAttributeValue", &[Ulong, Ulong, AttributeArray], NOTHING),
    call(CallId::FindObjectsInit, "C_FindObjectsInit", &[Ulong, AttributeArray], NOTHING),
    call(CallId::FindObjects, "C_FindObjects", &[Ulong, UlongBuffer], &[UlongArray]),
    call(CallId::FindObjectsFinal, "C_FindObjectsFinal", SESSION, NOTHING),
    call(CallId::EncryptInit, "C_EncryptInit", OPERATION_INIT, NOTHING),
    call(CallId::Encrypt, "C_Encrypt", CRYPT, DATA),
    call(CallId::EncryptUpdate, "C_EncryptUpdate", CRYPT, DATA),
    call(CallId::EncryptFinal, "C_EncryptFinal", FINAL, DATA),
    call(CallId::DecryptInit, "C_DecryptInit", OPERATION_INIT, NOTHING),
    call(CallId::Decrypt, "C_Decrypt", CRYPT, DATA),
    call(CallId::DecryptUpdate, "C_DecryptUpdate", CRYPT, DATA),
    call(CallId::DecryptFinal, "C_DecryptFinal", FINAL, DATA),
    call(CallId::DigestInit, "C_DigestInit", &[Ulong, Mechanism], NOTHING),
    call(CallId::Digest, "C_Digest", CRYPT, DATA),
    call(CallId::DigestUpdate, "C_DigestUpdate", SESSION_DATA, NOTHING),
    call(CallId::DigestKey, "C_DigestKey", &[Ulong, Ulong], NOTHING),
    call(CallId::DigestFinal, "C_DigestFinal", FINAL, DATA),
    call(CallId::SignInit, "C_SignInit", OPERATION_INIT, NOTHING),
    call(CallId::Sign, "C_Sign", CRYPT, DATA),
    call(CallId::SignUpdate, "C_SignUpdate", SESSION_DATA, NOTHING),
    call(CallId::SignFinal, "C_SignFinal", FINAL, DATA),
    call(CallId::SignRecoverInit, "C_SignRecoverInit", OPERATION_INIT, NOTHING),
    call(CallId::SignRecover, "C_SignRecover", CRYPT, DATA),
    call(CallId::VerifyInit, "C_VerifyInit", OPERATION_INIT, NOTHING),
    call(CallId::Verify, "C_Verify", &[Ulong, ByteArray, ByteArray], NOTHING),
    call(CallId::VerifyUpdate, "C_VerifyUpdate", SESSION_DATA, NOTHING),
    call(CallId::VerifyFinal, "C_VerifyFinal", SESSION_DATA, NOTHING),
    call(CallId::VerifyRecoverInit, "C_VerifyRecoverInit", OPERATION_INIT, NOTHING),
    call(CallId::VerifyRecover, "C_VerifyRecover", CRYPT, DATA),
    call(CallId::DigestEncryptUpdate, "C_DigestEncryptUpdate", CRYPT, DATA),
    call(CallId::DecryptDigestUpdate, "C_DecryptDigestUpdate", CRYPT, DATA),
    call(CallId::SignEncryptUpdate, "C_SignEncryptUpdate", CRYPT, DATA),
    call(CallId::DecryptVerifyUpdate, "C_DecryptVerifyUpdate", CRYPT, DATA),
    call(CallId::GenerateKey, "C_GenerateKey", &[Ulong, Mechanism, AttributeArray], HANDLE),
    call(CallId::GenerateKeyPair, "C_GenerateKeyPair", &[Ulong, Mechanism, AttributeArray, AttributeArray], &[Ulong, Ulong]),
    call(CallId::WrapKey, "C_WrapKey", &[Ulong, Mechanism, Ulong, Ulong, ByteBuffer], DATA),
    call(CallId::UnwrapKey, "C_UnwrapKey", &[Ulong, Mechanism, Ulong, ByteArray, AttributeArray], HANDLE),
    call(CallId::DeriveKey, "C_DeriveKey", &[Ulong, Mechanism, Ulong, AttributeArray], HANDLE),
    call(CallId::SeedRandom, "C_SeedRandom", SESSION_DATA, NOTHING),
    call(CallId::GenerateRandom, "C_GenerateRandom", FINAL, DATA),
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_is_indexed_by_call_id() {
        for (index, spec) in CALLS.iter().enumerate() {
            assert_eq!(spec.id as usize, index + 1, "{} is out of order", spec.name);
            assert_eq!(CallId::from_wire(spec.id as u32), Some(spec.id));
            assert!(spec.name.starts_with("C_"));
        }
    }

    #[test]
    fn unknown_ids() {
        assert_eq!(CallId::from_wire(ERROR_CALL_ID), None);
        assert_eq!(CallId::from_wire(CALLS.len() as u32 + 1), None);
        assert_eq!(CallId::from_wire(u32::MAX), None);
    }

    #[test]
    fn buffers_only_in_requests() {
        for spec in CALLS.iter() {
            for kind in spec.response {
                assert!(
                    !matches!(kind, ByteBuffer | UlongBuffer | AttributeBuffer),
                    "{} declares a buffer in its response",
                    spec.name
                );
            }
            // Every two-phase request is answered with a matching array.
            for (request, response) in [
                (ByteBuffer, ByteArray),
                (UlongBuffer, UlongArray),
                (AttributeBuffer, AttributeArray),
            ] {
                if spec.request.contains(&request) {
                    assert!(spec.response.contains(&response), "{}", spec.name);
                }
            }
        }
    }

    #[test]
    fn display() {
        assert_eq!(CallId::GenerateRandom.to_string(), "C_GenerateRandom");
        assert_eq!(CallId::InitPin.name(), "C_InitPIN");
    }
}
