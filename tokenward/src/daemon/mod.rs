// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! The daemon half of the protocol.
//!
//! The daemon owns the real token. It accepts connections on a Unix socket, checks the
//! peer's credentials, decodes each request with the same call catalog the client uses,
//! and hands the decoded arguments to a [`Token`] implementation.

use cryptoki_sys::{
    CK_FLAGS, CK_MECHANISM_TYPE, CK_OBJECT_HANDLE, CK_RV, CK_SESSION_HANDLE,
    CK_SLOT_ID, CK_ULONG, CK_USER_TYPE, CKR_FUNCTION_NOT_SUPPORTED,
};

use crate::{
    mechanism::Mechanism,
    types::{
        Attribute, AttributeRequest, Info, MechanismInfo, Payload, SessionInfo, SlotInfo,
        TokenInfo,
    },
};

mod dispatch;
mod service;

pub use dispatch::dispatch;
pub use service::{Daemon, Listener};

/// The result of a token operation; errors are PKCS#11 return values.
pub type TokenResult<T> = Result<T, CK_RV>;

/// Variable-length byte output sized against the client's buffer.
///
/// Use [`Payload::for_capacity`] to build one from a complete result.
pub type Output = TokenResult<Payload<Vec<u8>>>;

/// The values of a `GetAttributeValue` answer along with the token's return value.
///
/// PKCS#11 lets a token report per-attribute problems (sensitive or unknown attributes,
/// short buffers) through the return value while still answering for every attribute,
/// so both are sent back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeAnswer {
    pub attributes: Vec<Attribute>,
    pub rv: CK_RV,
}

/// A token served by the daemon.
///
/// There is one method per call in the catalog apart from `Initialize`, which the daemon
/// answers itself after checking the client's handshake. Every method defaults to
/// `CKR_FUNCTION_NOT_SUPPORTED` except [`Token::finalize`], which succeeds.
///
/// Methods are invoked from a blocking thread pool and may be called concurrently for
/// different clients.
#[allow(unused_variables)]
pub trait Token: Send + Sync {
    /// A client process is done with the token.
    fn finalize(&self) -> TokenResult<()> {
        Ok(())
    }

    fn get_info(&self) -> TokenResult<Info> {
        Err(CKR_FUNCTION_NOT_SUPPORTED)
    }

    fn get_slot_list(
        &self,
        token_present: bool,
        capacity: Option<CK_ULONG>,
    ) -> TokenResult<Payload<Vec<CK_SLOT_ID>>> {
        Err(CKR_FUNCTION_NOT_SUPPORTED)
    }

    fn get_slot_info(&self, slot: CK_SLOT_ID) -> TokenResult<SlotInfo> {
        Err(CKR_FUNCTION_NOT_SUPPORTED)
    }

    fn get_token_info(&self, slot: CK_SLOT_ID) -> TokenResult<TokenInfo> {
        Err(CKR_FUNCTION_NOT_SUPPORTED)
    }

    fn get_mechanism_list(
        &self,
        slot: CK_SLOT_ID,
        capacity: Option<CK_ULONG>,
    ) -> TokenResult<Payload<Vec<CK_MECHANISM_TYPE>>> {
        Err(CKR_FUNCTION_NOT_SUPPORTED)
    }

    fn get_mechanism_info(
        &self,
        slot: CK_SLOT_ID,
        mechanism_type: CK_MECHANISM_TYPE,
    ) -> TokenResult<MechanismInfo> {
        Err(CKR_FUNCTION_NOT_SUPPORTED)
    }

    fn init_token(&self, slot: CK_SLOT_ID, pin: Option<&[u8]>, label: &[u8]) -> TokenResult<()> {
        Err(CKR_FUNCTION_NOT_SUPPORTED)
    }

    fn wait_for_slot_event(&self, flags: CK_FLAGS) -> TokenResult<CK_SLOT_ID> {
        Err(CKR_FUNCTION_NOT_SUPPORTED)
    }

    fn open_session(&self, slot: CK_SLOT_ID, flags: CK_FLAGS) -> TokenResult<CK_SESSION_HANDLE> {
        Err(CKR_FUNCTION_NOT_SUPPORTED)
    }

    fn close_session(&self, session: CK_SESSION_HANDLE) -> TokenResult<()> {
        Err(CKR_FUNCTION_NOT_SUPPORTED)
    }

    fn close_all_sessions(&self, slot: CK_SLOT_ID) -> TokenResult<()> {
        Err(CKR_FUNCTION_NOT_SUPPORTED)
    }

    fn get_function_status(&self, session: CK_SESSION_HANDLE) -> TokenResult<()> {
        Err(CKR_FUNCTION_NOT_SUPPORTED)
    }

    fn cancel_function(&self, session: CK_SESSION_HANDLE) -> TokenResult<()> {
        Err(CKR_FUNCTION_NOT_SUPPORTED)
    }

    fn get_session_info(&self, session: CK_SESSION_HANDLE) -> TokenResult<SessionInfo> {
        Err(CKR_FUNCTION_NOT_SUPPORTED)
    }

    fn init_pin(&self, session: CK_SESSION_HANDLE, pin: Option<&[u8]>) -> TokenResult<()> {
        Err(CKR_FUNCTION_NOT_SUPPORTED)
    }

    fn set_pin(
        &self,
        session: CK_SESSION_HANDLE,
        old_pin: Option<&[u8]>,
        new_pin: Option<&[u8]>,
    ) -> TokenResult<()> {
        Err(CKR_FUNCTION_NOT_SUPPORTED)
    }

    fn get_operation_state(
        &self,
        session: CK_SESSION_HANDLE,
        capacity: Option<CK_ULONG>,
    ) -> Output {
        Err(CKR_FUNCTION_NOT_SUPPORTED)
    }

    fn set_operation_state(
        &self,
        session: CK_SESSION_HANDLE,
        state: &[u8],
        encryption_key: CK_OBJECT_HANDLE,
        authentication_key: CK_OBJECT_HANDLE,
    ) -> TokenResult<()> {
        Err(CKR_FUNCTION_NOT_SUPPORTED)
    }

    fn login(
        &self,
        session: CK_SESSION_HANDLE,
        user_type: CK_USER_TYPE,
        pin: Option<&[u8]>,
    ) -> TokenResult<()> {
        Err(CKR_FUNCTION_NOT_SUPPORTED)
    }

    fn logout(&self, session: CK_SESSION_HANDLE) -> TokenResult<()> {
        Err(CKR_FUNCTION_NOT_SUPPORTED)
    }

    fn create_object(
        &self,
        session: CK_SESSION_HANDLE,
        template: &[Attribute],
    ) -> TokenResult<CK_OBJECT_HANDLE> {
        Err(CKR_FUNCTION_NOT_SUPPORTED)
    }

    fn copy_object(
        &self,
        session: CK_SESSION_HANDLE,
        object: CK_OBJECT_HANDLE,
        template: &[Attribute],
    ) -> TokenResult<CK_OBJECT_HANDLE> {
        Err(CKR_FUNCTION_NOT_SUPPORTED)
    }

    fn destroy_object(
        &self,
        session: CK_SESSION_HANDLE,
        object: CK_OBJECT_HANDLE,
    ) -> TokenResult<()> {
        Err(CKR_FUNCTION_NOT_SUPPORTED)
    }

    fn get_object_size(
        &self,
        session: CK_SESSION_HANDLE,
        object: CK_OBJECT_HANDLE,
    ) -> TokenResult<CK_ULONG> {
        Err(CKR_FUNCTION_NOT_SUPPORTED)
    }

    /// Answer for exactly the attributes requested, in order.
    fn get_attribute_value(
        &self,
        session: CK_SESSION_HANDLE,
        object: CK_OBJECT_HANDLE,
        requests: &[AttributeRequest],
    ) -> TokenResult<AttributeAnswer> {
        Err(CKR_FUNCTION_NOT_SUPPORTED)
    }

    fn set_attribute_value(
        &self,
        session: CK_SESSION_HANDLE,
        object: CK_OBJECT_HANDLE,
        template: &[Attribute],
    ) -> TokenResult<()> {
        Err(CKR_FUNCTION_NOT_SUPPORTED)
    }

    fn find_objects_init(
        &self,
        session: CK_SESSION_HANDLE,
        template: &[Attribute],
    ) -> TokenResult<()> {
        Err(CKR_FUNCTION_NOT_SUPPORTED)
    }

    /// Return at most `max_count` handles.
    fn find_objects(
        &self,
        session: CK_SESSION_HANDLE,
        max_count: CK_ULONG,
    ) -> TokenResult<Vec<CK_OBJECT_HANDLE>> {
        Err(CKR_FUNCTION_NOT_SUPPORTED)
    }

    fn find_objects_final(&self, session: CK_SESSION_HANDLE) -> TokenResult<()> {
        Err(CKR_FUNCTION_NOT_SUPPORTED)
    }

    fn encrypt_init(
        &self,
        session: CK_SESSION_HANDLE,
        mechanism: &Mechanism,
        key: CK_OBJECT_HANDLE,
    ) -> TokenResult<()> {
        Err(CKR_FUNCTION_NOT_SUPPORTED)
    }

    fn encrypt(
        &self,
        session: CK_SESSION_HANDLE,
        data: &[u8],
        capacity: Option<CK_ULONG>,
    ) -> Output {
        Err(CKR_FUNCTION_NOT_SUPPORTED)
    }

    fn encrypt_update(
        &self,
        session: CK_SESSION_HANDLE,
        data: &[u8],
        capacity: Option<CK_ULONG>,
    ) -> Output {
        Err(CKR_FUNCTION_NOT_SUPPORTED)
    }

    fn encrypt_final(&self, session: CK_SESSION_HANDLE, capacity: Option<CK_ULONG>) -> Output {
        Err(CKR_FUNCTION_NOT_SUPPORTED)
    }

    fn decrypt_init(
        &self,
        session: CK_SESSION_HANDLE,
        mechanism: &Mechanism,
        key: CK_OBJECT_HANDLE,
    ) -> TokenResult<()> {
        Err(CKR_FUNCTION_NOT_SUPPORTED)
    }

    fn decrypt(
        &self,
        session: CK_SESSION_HANDLE,
        data: &[u8],
        capacity: Option<CK_ULONG>,
    ) -> Output {
        Err(CKR_FUNCTION_NOT_SUPPORTED)
    }

    fn decrypt_update(
        &self,
        session: CK_SESSION_HANDLE,
        data: &[u8],
        capacity: Option<CK_ULONG>,
    ) -> Output {
        Err(CKR_FUNCTION_NOT_SUPPORTED)
    }

    fn decrypt_final(&self, session: CK_SESSION_HANDLE, capacity: Option<CK_ULONG>) -> Output {
        Err(CKR_FUNCTION_NOT_SUPPORTED)
    }

    fn digest_init(&self, session: CK_SESSION_HANDLE, mechanism: &Mechanism) -> TokenResult<()> {
        Err(CKR_FUNCTION_NOT_SUPPORTED)
    }

    fn digest(
        &self,
        session: CK_SESSION_HANDLE,
        data: &[u8],
        capacity: Option<CK_ULONG>,
    ) -> Output {
        Err(CKR_FUNCTION_NOT_SUPPORTED)
    }

    fn digest_update(&self, session: CK_SESSION_HANDLE, data: &[u8]) -> TokenResult<()> {
        Err(CKR_FUNCTION_NOT_SUPPORTED)
    }

    fn digest_key(&self, session: CK_SESSION_HANDLE, key: CK_OBJECT_HANDLE) -> TokenResult<()> {
        Err(CKR_FUNCTION_NOT_SUPPORTED)
    }

    fn digest_final(&self, session: CK_SESSION_HANDLE, capacity: Option<CK_ULONG>) -> Output {
        Err(CKR_FUNCTION_NOT_SUPPORTED)
    }

    fn sign_init(
        &self,
        session: CK_SESSION_HANDLE,
        mechanism: &Mechanism,
        key: CK_OBJECT_HANDLE,
    ) -> TokenResult<()> {
        Err(CKR_FUNCTION_NOT_SUPPORTED)
    }

    fn sign(&self, session: CK_SESSION_HANDLE, data: &[u8], capacity: Option<CK_ULONG>) -> Output {
        Err(CKR_FUNCTION_NOT_SUPPORTED)
    }

    fn sign_update(&self, session: CK_SESSION_HANDLE, data: &[u8]) -> TokenResult<()> {
        Err(CKR_FUNCTION_NOT_SUPPORTED)
    }

    fn sign_final(&self, session: CK_SESSION_HANDLE, capacity: Option<CK_ULONG>) -> Output {
        Err(CKR_FUNCTION_NOT_SUPPORTED)
    }

    fn sign_recover_init(
        &self,
        session: CK_SESSION_HANDLE,
        mechanism: &Mechanism,
        key: CK_OBJECT_HANDLE,
    ) -> TokenResult<()> {
        Err(CKR_FUNCTION_NOT_SUPPORTED)
    }

    fn sign_recover(
        &self,
        session: CK_SESSION_HANDLE,
        data: &[u8],
        capacity: Option<CK_ULONG>,
    ) -> Output {
        Err(CKR_FUNCTION_NOT_SUPPORTED)
    }

    fn verify_init(
        &self,
        session: CK_SESSION_HANDLE,
        mechanism: &Mechanism,
        key: CK_OBJECT_HANDLE,
    ) -> TokenResult<()> {
        Err(CKR_FUNCTION_NOT_SUPPORTED)
    }

    fn verify(&self, session: CK_SESSION_HANDLE, data: &[u8], signature: &[u8]) -> TokenResult<()> {
        Err(CKR_FUNCTION_NOT_SUPPORTED)
    }

    fn verify_update(&self, session: CK_SESSION_HANDLE, data: &[u8]) -> TokenResult<()> {
        Err(CKR_FUNCTION_NOT_SUPPORTED)
    }

    fn verify_final(&self, session: CK_SESSION_HANDLE, signature: &[u8]) -> TokenResult<()> {
        Err(CKR_FUNCTION_NOT_SUPPORTED)
    }

    fn verify_recover_init(
        &self,
        session: CK_SESSION_HANDLE,
        mechanism: &Mechanism,
        key: CK_OBJECT_HANDLE,
    ) -> TokenResult<()> {
        Err(CKR_FUNCTION_NOT_SUPPORTED)
    }

    fn verify_recover(
        &self,
        session: CK_SESSION_HANDLE,
        signature: &[u8],
        capacity: Option<CK_ULONG>,
    ) -> Output {
        Err(CKR_FUNCTION_NOT_SUPPORTED)
    }

    fn digest_encrypt_update(
        &self,
        session: CK_SESSION_HANDLE,
        data: &[u8],
        capacity: Option<CK_ULONG>,
    ) -> Output {
        Err(CKR_FUNCTION_NOT_SUPPORTED)
    }

    fn decrypt_digest_update(
        &self,
        session: CK_SESSION_HANDLE,
        data: &[u8],
        capacity: Option<CK_ULONG>,
    ) -> Output {
        Err(CKR_FUNCTION_NOT_SUPPORTED)
    }

    fn sign_encrypt_update(
        &self,
        session: CK_SESSION_HANDLE,
        data: &[u8],
        capacity: Option<CK_ULONG>,
    ) -> Output {
        Err(CKR_FUNCTION_NOT_SUPPORTED)
    }

    fn decrypt_verify_update(
        &self,
        session: CK_SESSION_HANDLE,
        data: &[u8],
        capacity: Option<CK_ULONG>,
    ) -> Output {
        Err(CKR_FUNCTION_NOT_SUPPORTED)
    }

    fn generate_key(
        &self,
        session: CK_SESSION_HANDLE,
        mechanism: &Mechanism,
        template: &[Attribute],
    ) -> TokenResult<CK_OBJECT_HANDLE> {
        Err(CKR_FUNCTION_NOT_SUPPORTED)
    }

    /// Returns the public and private key handles.
    fn generate_key_pair(
        &self,
        session: CK_SESSION_HANDLE,
        mechanism: &Mechanism,
        public_template: &[Attribute],
        private_template: &[Attribute],
    ) -> TokenResult<(CK_OBJECT_HANDLE, CK_OBJECT_HANDLE)> {
        Err(CKR_FUNCTION_NOT_SUPPORTED)
    }

    fn wrap_key(
        &self,
        session: CK_SESSION_HANDLE,
        mechanism: &Mechanism,
        wrapping_key: CK_OBJECT_HANDLE,
        key: CK_OBJECT_HANDLE,
        capacity: Option<CK_ULONG>,
    ) -> Output {
        Err(CKR_FUNCTION_NOT_SUPPORTED)
    }

    fn unwrap_key(
        &self,
        session: CK_SESSION_HANDLE,
        mechanism: &Mechanism,
        unwrapping_key: CK_OBJECT_HANDLE,
        wrapped: &[u8],
        template: &[Attribute],
    ) -> TokenResult<CK_OBJECT_HANDLE> {
        Err(CKR_FUNCTION_NOT_SUPPORTED)
    }

    fn derive_key(
        &self,
        session: CK_SESSION_HANDLE,
        mechanism: &Mechanism,
        base_key: CK_OBJECT_HANDLE,
        template: &[Attribute],
    ) -> TokenResult<CK_OBJECT_HANDLE> {
        Err(CKR_FUNCTION_NOT_SUPPORTED)
    }

    fn seed_random(&self, session: CK_SESSION_HANDLE, seed: &[u8]) -> TokenResult<()> {
        Err(CKR_FUNCTION_NOT_SUPPORTED)
    }

    /// Produce exactly `len` random bytes.
    fn generate_random(&self, session: CK_SESSION_HANDLE, len: CK_ULONG) -> TokenResult<Vec<u8>> {
        Err(CKR_FUNCTION_NOT_SUPPORTED)
    }
}

