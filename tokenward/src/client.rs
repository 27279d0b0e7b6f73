// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! The client half of the protocol.
//!
//! [`Client`] offers one method per PKCS#11 operation. Each method encodes its arguments
//! in the order the call catalog declares, makes the round trip on the calling thread's
//! [`CallState`](crate::session::CallState), and decodes the answer into the caller's
//! buffers following the two-phase convention: with no output buffer, only the required
//! length is reported; with a buffer that is too small, [`Error::BufferTooSmall`] carries
//! the required length.

use std::sync::Mutex;

use cryptoki_sys::{
    CK_ATTRIBUTE_TYPE, CK_FLAGS, CK_MECHANISM_TYPE, CK_OBJECT_HANDLE, CK_SESSION_HANDLE,
    CK_SLOT_ID, CK_ULONG, CK_UNAVAILABLE_INFORMATION, CK_USER_TYPE,
    CKR_CRYPTOKI_ALREADY_INITIALIZED,
};

use crate::{
    HANDSHAKE,
    calls::CallId,
    config::ClientConfig,
    error::{Error, ProtocolError},
    mechanism::{self, Mechanism},
    message::{Value, Values},
    session::{CallStates, CallStatus, Endpoint, PerThread, current_pid},
    types::{
        Attribute, AttributeRequest, AttributeValue, Info, MechanismInfo, Payload, SessionInfo,
        SlotInfo, TokenInfo,
    },
};

/// One entry of a `GetAttributeValue` template.
#[derive(Debug)]
pub struct AttributeQuery<'a> {
    pub attribute_type: CK_ATTRIBUTE_TYPE,
    /// Where to copy the value, or `None` to only learn its length.
    pub buffer: Option<&'a mut [u8]>,
    /// Set to the value's length, or to `CK_UNAVAILABLE_INFORMATION` if the attribute is
    /// invalid for the object or the buffer was too small.
    pub length: CK_ULONG,
}

impl<'a> AttributeQuery<'a> {
    pub fn new(attribute_type: CK_ATTRIBUTE_TYPE, buffer: Option<&'a mut [u8]>) -> Self {
        Self {
            attribute_type,
            buffer,
            length: 0,
        }
    }

    /// The bytes copied into the buffer, if any.
    pub fn value(&self) -> Option<&[u8]> {
        let len = usize::try_from(self.length).ok()?;
        self.buffer.as_deref().and_then(|buffer| buffer.get(..len))
    }
}

/// A connection to the token daemon shared by every thread of the process.
///
/// The client must be initialized before use. Initialization is bound to the process
/// that performed it; a forked child sees [`Error::NotInitialized`] until it initializes
/// again.
#[derive(Debug)]
pub struct Client<S = PerThread> {
    process: Mutex<Option<Endpoint>>,
    states: S,
}

impl Default for Client<PerThread> {
    fn default() -> Self {
        Self::new()
    }
}

impl Client<PerThread> {
    pub fn new() -> Self {
        Self::with_states(PerThread::new())
    }
}

impl<S: CallStates> Client<S> {
    pub fn with_states(states: S) -> Self {
        Self {
            process: Mutex::new(None),
            states,
        }
    }

    /// Connect to the daemon and introduce this process.
    ///
    /// The process lock is held for the whole round trip so concurrent initializers
    /// can't both succeed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyInitialized`] if this process already initialized the client,
    /// or any error the handshake produced, in which case the client stays uninitialized.
    #[tracing::instrument(skip_all, fields(socket = %config.socket_path.display()), err)]
    pub fn initialize(&self, config: &ClientConfig) -> Result<(), Error> {
        let mut process = self.process.lock().expect("process lock poisoned");
        let pid = current_pid();
        if process.as_ref().is_some_and(|endpoint| endpoint.pid == pid) {
            return Err(Error::AlreadyInitialized);
        }
        if process.is_some() {
            tracing::info!(pid, "Initializing again in a forked process");
        }

        let endpoint = Endpoint {
            pid,
            socket_path: config.socket_path.clone(),
            max_response_size: config.max_response_size,
        };
        let handshake = [Value::ByteArray(Payload::Value(HANDSHAKE.to_vec()))];
        match self
            .states
            .with_state(|state| state.call(&endpoint, CallId::Initialize, &handshake))
        {
            Ok(_) | Err(Error::Token(CKR_CRYPTOKI_ALREADY_INITIALIZED)) => {
                tracing::debug!("Client initialized");
                *process = Some(endpoint);
                Ok(())
            }
            Err(error) => {
                *process = None;
                Err(error)
            }
        }
    }

    /// Tell the daemon this process is done and forget the connection settings.
    ///
    /// The daemon's answer is only logged; once initialized, finalizing always succeeds.
    #[tracing::instrument(skip_all, err)]
    pub fn finalize(&self) -> Result<(), Error> {
        let mut process = self.process.lock().expect("process lock poisoned");
        let endpoint = match process.as_ref() {
            Some(endpoint) if endpoint.pid == current_pid() => endpoint.clone(),
            _ => return Err(Error::NotInitialized),
        };
        self.states.with_state(|state| {
            if let Err(error) = state.call(&endpoint, CallId::Finalize, &[]) {
                tracing::warn!(%error, "Daemon failed to finalize; ignoring");
            }
            state.disconnect();
        });
        *process = None;
        Ok(())
    }

    /// Whether this process has initialized the client.
    pub fn is_initialized(&self) -> bool {
        self.endpoint().is_ok()
    }

    /// The status of the calling thread's session.
    pub fn call_status(&self) -> CallStatus {
        self.states.with_state(|state| state.status())
    }

    fn endpoint(&self) -> Result<Endpoint, Error> {
        let process = self.process.lock().expect("process lock poisoned");
        match process.as_ref() {
            Some(endpoint) if endpoint.pid == current_pid() => Ok(endpoint.clone()),
            _ => Err(Error::NotInitialized),
        }
    }

    /// Make any call in the catalog with pre-encoded arguments.
    pub fn call(&self, call: CallId, arguments: &[Value]) -> Result<Values, Error> {
        let endpoint = self.endpoint()?;
        self.states
            .with_state(|state| state.call(&endpoint, call, arguments))
    }

    pub fn get_info(&self) -> Result<Info, Error> {
        self.call(CallId::GetInfo, &[])?.info()
    }

    /// List slots into `slots`, returning how many there are.
    pub fn get_slot_list(
        &self,
        token_present: bool,
        slots: Option<&mut [CK_SLOT_ID]>,
    ) -> Result<usize, Error> {
        let mut values = self.call(
            CallId::GetSlotList,
            &[
                Value::Byte(token_present.into()),
                Value::UlongBuffer(capacity(&slots)),
            ],
        )?;
        fill(values.ulong_array()?, slots)
    }

    pub fn get_slot_info(&self, slot: CK_SLOT_ID) -> Result<SlotInfo, Error> {
        self.call(CallId::GetSlotInfo, &[Value::Ulong(slot)])?
            .slot_info()
    }

    pub fn get_token_info(&self, slot: CK_SLOT_ID) -> Result<TokenInfo, Error> {
        self.call(CallId::GetTokenInfo, &[Value::Ulong(slot)])?
            .token_info()
    }

    /// List the mechanisms of a slot that can be used through this client.
    ///
    /// Mechanisms the daemon reports but which can't be sent over RPC are left out, and
    /// the count reflects that.
    pub fn get_mechanism_list(
        &self,
        slot: CK_SLOT_ID,
        mechanisms: Option<&mut [CK_MECHANISM_TYPE]>,
    ) -> Result<usize, Error> {
        let mut supported = self.fetch_mechanisms(slot)?;
        mechanism::purge_unsupported(&mut supported);
        fill(Payload::Value(supported), mechanisms)
    }

    fn fetch_mechanisms(&self, slot: CK_SLOT_ID) -> Result<Vec<CK_MECHANISM_TYPE>, Error> {
        let mut capacity = None;
        // The list can change between the size query and the fetch, so try once more
        // if it grew.
        for _ in 0..3 {
            let mut values = self.call(
                CallId::GetMechanismList,
                &[Value::Ulong(slot), Value::UlongBuffer(capacity)],
            )?;
            match values.ulong_array()? {
                Payload::Value(mechanisms) if capacity.is_some() => return Ok(mechanisms),
                Payload::Value(mechanisms) => capacity = Some(mechanisms.len() as CK_ULONG),
                Payload::Length(required) => capacity = Some(required),
            }
        }
        Err(ProtocolError::Malformed("mechanism list keeps changing size".to_string()).into())
    }

    /// Mechanism details; mechanisms that can't be sent over RPC are reported invalid
    /// without asking the daemon.
    pub fn get_mechanism_info(
        &self,
        slot: CK_SLOT_ID,
        mechanism_type: CK_MECHANISM_TYPE,
    ) -> Result<MechanismInfo, Error> {
        if !mechanism::is_supported(mechanism_type) {
            return Err(Error::MechanismInvalid(mechanism_type));
        }
        self.call(
            CallId::GetMechanismInfo,
            &[Value::Ulong(slot), Value::MechanismType(mechanism_type)],
        )?
        .mechanism_info()
    }

    /// Initialize a token; the label is sent without any trailing NUL padding.
    pub fn init_token(
        &self,
        slot: CK_SLOT_ID,
        pin: Option<&[u8]>,
        label: &[u8],
    ) -> Result<(), Error> {
        let end = label
            .iter()
            .rposition(|byte| *byte != 0)
            .map_or(0, |index| index + 1);
        self.call(
            CallId::InitToken,
            &[
                Value::Ulong(slot),
                optional(pin),
                Value::ZeroString(label[..end].to_vec()),
            ],
        )?;
        Ok(())
    }

    /// Wait for a slot event, returning the slot it happened in.
    pub fn wait_for_slot_event(&self, flags: CK_FLAGS) -> Result<CK_SLOT_ID, Error> {
        self.call(CallId::WaitForSlotEvent, &[Value::Ulong(flags)])?
            .ulong()
    }

    pub fn open_session(
        &self,
        slot: CK_SLOT_ID,
        flags: CK_FLAGS,
    ) -> Result<CK_SESSION_HANDLE, Error> {
        self.call(CallId::OpenSession, &[Value::Ulong(slot), Value::Ulong(flags)])?
            .ulong()
    }

    pub fn close_session(&self, session: CK_SESSION_HANDLE) -> Result<(), Error> {
        self.session_call(CallId::CloseSession, session)
    }

    pub fn close_all_sessions(&self, slot: CK_SLOT_ID) -> Result<(), Error> {
        self.call(CallId::CloseAllSessions, &[Value::Ulong(slot)])?;
        Ok(())
    }

    pub fn get_function_status(&self, session: CK_SESSION_HANDLE) -> Result<(), Error> {
        self.session_call(CallId::GetFunctionStatus, session)
    }

    pub fn cancel_function(&self, session: CK_SESSION_HANDLE) -> Result<(), Error> {
        self.session_call(CallId::CancelFunction, session)
    }

    pub fn get_session_info(&self, session: CK_SESSION_HANDLE) -> Result<SessionInfo, Error> {
        self.call(CallId::GetSessionInfo, &[Value::Ulong(session)])?
            .session_info()
    }

    pub fn init_pin(&self, session: CK_SESSION_HANDLE, pin: Option<&[u8]>) -> Result<(), Error> {
        self.call(CallId::InitPin, &[Value::Ulong(session), optional(pin)])?;
        Ok(())
    }

    pub fn set_pin(
        &self,
        session: CK_SESSION_HANDLE,
        old_pin: Option<&[u8]>,
        new_pin: Option<&[u8]>,
    ) -> Result<(), Error> {
        self.call(
            CallId::SetPin,
            &[Value::Ulong(session), optional(old_pin), optional(new_pin)],
        )?;
        Ok(())
    }

    pub fn get_operation_state(
        &self,
        session: CK_SESSION_HANDLE,
        state: Option<&mut [u8]>,
    ) -> Result<usize, Error> {
        self.output_call(CallId::GetOperationState, session, &[], state)
    }

    pub fn set_operation_state(
        &self,
        session: CK_SESSION_HANDLE,
        state: &[u8],
        encryption_key: CK_OBJECT_HANDLE,
        authentication_key: CK_OBJECT_HANDLE,
    ) -> Result<(), Error> {
        self.call(
            CallId::SetOperationState,
            &[
                Value::Ulong(session),
                bytes(state),
                Value::Ulong(encryption_key),
                Value::Ulong(authentication_key),
            ],
        )?;
        Ok(())
    }

    pub fn login(
        &self,
        session: CK_SESSION_HANDLE,
        user_type: CK_USER_TYPE,
        pin: Option<&[u8]>,
    ) -> Result<(), Error> {
        self.call(
            CallId::Login,
            &[Value::Ulong(session), Value::Ulong(user_type), optional(pin)],
        )?;
        Ok(())
    }

    pub fn logout(&self, session: CK_SESSION_HANDLE) -> Result<(), Error> {
        self.session_call(CallId::Logout, session)
    }

    pub fn create_object(
        &self,
        session: CK_SESSION_HANDLE,
        template: &[Attribute],
    ) -> Result<CK_OBJECT_HANDLE, Error> {
        self.call(
            CallId::CreateObject,
            &[Value::Ulong(session), Value::AttributeArray(template.to_vec())],
        )?
        .ulong()
    }

    pub fn copy_object(
        &self,
        session: CK_SESSION_HANDLE,
        object: CK_OBJECT_HANDLE,
        template: &[Attribute],
    ) -> Result<CK_OBJECT_HANDLE, Error> {
        self.call(
            CallId::CopyObject,
            &[
                Value::Ulong(session),
                Value::Ulong(object),
                Value::AttributeArray(template.to_vec()),
            ],
        )?
        .ulong()
    }

    pub fn destroy_object(
        &self,
        session: CK_SESSION_HANDLE,
        object: CK_OBJECT_HANDLE,
    ) -> Result<(), Error> {
        self.call(
            CallId::DestroyObject,
            &[Value::Ulong(session), Value::Ulong(object)],
        )?;
        Ok(())
    }

    pub fn get_object_size(
        &self,
        session: CK_SESSION_HANDLE,
        object: CK_OBJECT_HANDLE,
    ) -> Result<CK_ULONG, Error> {
        self.call(
            CallId::GetObjectSize,
            &[Value::Ulong(session), Value::Ulong(object)],
        )?
        .ulong()
    }

    /// Read attribute values into the template.
    ///
    /// Every entry's `length` is updated even when an error is returned. If any buffer
    /// was too small this returns [`Error::BufferTooSmall`] (carrying the largest length
    /// that didn't fit) in preference to whatever the token reported.
    pub fn get_attribute_value(
        &self,
        session: CK_SESSION_HANDLE,
        object: CK_OBJECT_HANDLE,
        template: &mut [AttributeQuery<'_>],
    ) -> Result<(), Error> {
        let requests = template
            .iter()
            .map(|query| AttributeRequest {
                attribute_type: query.attribute_type,
                capacity: capacity(&query.buffer),
            })
            .collect();
        let mut values = self.call(
            CallId::GetAttributeValue,
            &[
                Value::Ulong(session),
                Value::Ulong(object),
                Value::AttributeBuffer(requests),
            ],
        )?;
        let attributes = values.attribute_array()?;
        let rv = values.ulong()?;
        fill_attributes(attributes, template)?;
        Error::check(rv)
    }

    pub fn set_attribute_value(
        &self,
        session: CK_SESSION_HANDLE,
        object: CK_OBJECT_HANDLE,
        template: &[Attribute],
    ) -> Result<(), Error> {
        self.call(
            CallId::SetAttributeValue,
            &[
                Value::Ulong(session),
                Value::Ulong(object),
                Value::AttributeArray(template.to_vec()),
            ],
        )?;
        Ok(())
    }

    pub fn find_objects_init(
        &self,
        session: CK_SESSION_HANDLE,
        template: &[Attribute],
    ) -> Result<(), Error> {
        self.call(
            CallId::FindObjectsInit,
            &[Value::Ulong(session), Value::AttributeArray(template.to_vec())],
        )?;
        Ok(())
    }

    /// Fetch up to `objects.len()` matches, returning how many were written.
    pub fn find_objects(
        &self,
        session: CK_SESSION_HANDLE,
        objects: &mut [CK_OBJECT_HANDLE],
    ) -> Result<usize, Error> {
        let mut values = self.call(
            CallId::FindObjects,
            &[
                Value::Ulong(session),
                Value::UlongBuffer(Some(objects.len() as CK_ULONG)),
            ],
        )?;
        fill(values.ulong_array()?, Some(objects))
    }

    pub fn find_objects_final(&self, session: CK_SESSION_HANDLE) -> Result<(), Error> {
        self.session_call(CallId::FindObjectsFinal, session)
    }

    pub fn encrypt_init(
        &self,
        session: CK_SESSION_HANDLE,
        mechanism: &Mechanism,
        key: CK_OBJECT_HANDLE,
    ) -> Result<(), Error> {
        self.operation_init(CallId::EncryptInit, session, mechanism, key)
    }

    pub fn encrypt(
        &self,
        session: CK_SESSION_HANDLE,
        data: &[u8],
        output: Option<&mut [u8]>,
    ) -> Result<usize, Error> {
        self.output_call(CallId::Encrypt, session, &[bytes(data)], output)
    }

    pub fn encrypt_update(
        &self,
        session: CK_SESSION_HANDLE,
        data: &[u8],
        output: Option<&mut [u8]>,
    ) -> Result<usize, Error> {
        self.output_call(CallId::EncryptUpdate, session, &[bytes(data)], output)
    }

    pub fn encrypt_final(
        &self,
        session: CK_SESSION_HANDLE,
        output: Option<&mut [u8]>,
    ) -> Result<usize, Error> {
        self.output_call(CallId::EncryptFinal, session, &[], output)
    }

    pub fn decrypt_init(
        &self,
        session: CK_SESSION_HANDLE,
        mechanism: &Mechanism,
        key: CK_OBJECT_HANDLE,
    ) -> Result<(), Error> {
        self.operation_init(CallId::DecryptInit, session, mechanism, key)
    }

    pub fn decrypt(
        &self,
        session: CK_SESSION_HANDLE,
        data: &[u8],
        output: Option<&mut [u8]>,
    ) -> Result<usize, Error> {
        self.output_call(CallId::Decrypt, session, &[bytes(data)], output)
    }

    pub fn decrypt_update(
        &self,
        session: CK_SESSION_HANDLE,
        data: &[u8],
        output: Option<&mut [u8]>,
    ) -> Result<usize, Error> {
        self.output_call(CallId::DecryptUpdate, session, &[bytes(data)], output)
    }

    pub fn decrypt_final(
        &self,
        session: CK_SESSION_HANDLE,
        output: Option<&mut [u8]>,
    ) -> Result<usize, Error> {
        self.output_call(CallId::DecryptFinal, session, &[], output)
    }

    pub fn digest_init(
        &self,
        session: CK_SESSION_HANDLE,
        mechanism: &Mechanism,
    ) -> Result<(), Error> {
        self.call(
            CallId::DigestInit,
            &[Value::Ulong(session), Value::Mechanism(mechanism.clone())],
        )?;
        Ok(())
    }

    pub fn digest(
        &self,
        session: CK_SESSION_HANDLE,
        data: &[u8],
        output: Option<&mut [u8]>,
    ) -> Result<usize, Error> {
        self.output_call(CallId::Digest, session, &[bytes(data)], output)
    }

    pub fn digest_update(&self, session: CK_SESSION_HANDLE, data: &[u8]) -> Result<(), Error> {
        self.data_call(CallId::DigestUpdate, session, data)
    }

    pub fn digest_key(
        &self,
        session: CK_SESSION_HANDLE,
        key: CK_OBJECT_HANDLE,
    ) -> Result<(), Error> {
        self.call(CallId::DigestKey, &[Value::Ulong(session), Value::Ulong(key)])?;
        Ok(())
    }

    pub fn digest_final(
        &self,
        session: CK_SESSION_HANDLE,
        output: Option<&mut [u8]>,
    ) -> Result<usize, Error> {
        self.output_call(CallId::DigestFinal, session, &[], output)
    }

    pub fn sign_init(
        &self,
        session: CK_SESSION_HANDLE,
        mechanism: &Mechanism,
        key: CK_OBJECT_HANDLE,
    ) -> Result<(), Error> {
        self.operation_init(CallId::SignInit, session, mechanism, key)
    }

    pub fn sign(
        &self,
        session: CK_SESSION_HANDLE,
        data: &[u8],
        signature: Option<&mut [u8]>,
    ) -> Result<usize, Error> {
        self.output_call(CallId::Sign, session, &[bytes(data)], signature)
    }

    pub fn sign_update(&self, session: CK_SESSION_HANDLE, data: &[u8]) -> Result<(), Error> {
        self.data_call(CallId::SignUpdate, session, data)
    }

    pub fn sign_final(
        &self,
        session: CK_SESSION_HANDLE,
        signature: Option<&mut [u8]>,
    ) -> Result<usize, Error> {
        self.output_call(CallId::SignFinal, session, &[], signature)
    }

    pub fn sign_recover_init(
        &self,
        session: CK_SESSION_HANDLE,
        mechanism: &Mechanism,
        key: CK_OBJECT_HANDLE,
    ) -> Result<(), Error> {
        self.operation_init(CallId::SignRecoverInit, session, mechanism, key)
    }

    pub fn sign_recover(
        &self,
        session: CK_SESSION_HANDLE,
        data: &[u8],
        signature: Option<&mut [u8]>,
    ) -> Result<usize, Error> {
        self.output_call(CallId::SignRecover, session, &[bytes(data)], signature)
    }

    pub fn verify_init(
        &self,
        session: CK_SESSION_HANDLE,
        mechanism: &Mechanism,
        key: CK_OBJECT_HANDLE,
    ) -> Result<(), Error> {
        self.operation_init(CallId::VerifyInit, session, mechanism, key)
    }

    pub fn verify(
        &self,
        session: CK_SESSION_HANDLE,
        data: &[u8],
        signature: &[u8],
    ) -> Result<(), Error> {
        self.call(
            CallId::Verify,
            &[Value::Ulong(session), bytes(data), bytes(signature)],
        )?;
        Ok(())
    }

    pub fn verify_update(&self, session: CK_SESSION_HANDLE, data: &[u8]) -> Result<(), Error> {
        self.data_call(CallId::VerifyUpdate, session, data)
    }

    pub fn verify_final(
        &self,
        session: CK_SESSION_HANDLE,
        signature: &[u8],
    ) -> Result<(), Error> {
        self.data_call(CallId::VerifyFinal, session, signature)
    }

    pub fn verify_recover_init(
        &self,
        session: CK_SESSION_HANDLE,
        mechanism: &Mechanism,
        key: CK_OBJECT_HANDLE,
    ) -> Result<(), Error> {
        self.operation_init(CallId::VerifyRecoverInit, session, mechanism, key)
    }

    pub fn verify_recover(
        &self,
        session: CK_SESSION_HANDLE,
        signature: &[u8],
        data: Option<&mut [u8]>,
    ) -> Result<usize, Error> {
        self.output_call(CallId::VerifyRecover, session, &[bytes(signature)], data)
    }

    pub fn digest_encrypt_update(
        &self,
        session: CK_SESSION_HANDLE,
        data: &[u8],
        output: Option<&mut [u8]>,
    ) -> Result<usize, Error> {
        self.output_call(CallId::DigestEncryptUpdate, session, &[bytes(data)], output)
    }

    pub fn decrypt_digest_update(
        &self,
        session: CK_SESSION_HANDLE,
        data: &[u8],
        output: Option<&mut [u8]>,
    ) -> Result<usize, Error> {
        self.output_call(CallId::DecryptDigestUpdate, session, &[bytes(data)], output)
    }

    pub fn sign_encrypt_update(
        &self,
        session: CK_SESSION_HANDLE,
        data: &[u8],
        output: Option<&mut [u8]>,
    ) -> Result<usize, Error> {
        self.output_call(CallId::SignEncryptUpdate, session, &[bytes(data)], output)
    }

    pub fn decrypt_verify_update(
        &self,
        session: CK_SESSION_HANDLE,
        data: &[u8],
        output: Option<&mut [u8]>,
    ) -> Result<usize, Error> {
        self.output_call(CallId::DecryptVerifyUpdate, session, &[bytes(data)], output)
    }

    pub fn generate_key(
        &self,
        session: CK_SESSION_HANDLE,
        mechanism: &Mechanism,
        template: &[Attribute],
    ) -> Result<CK_OBJECT_HANDLE, Error> {
        self.call(
            CallId::GenerateKey,
            &[
                Value::Ulong(session),
                Value::Mechanism(mechanism.clone()),
                Value::AttributeArray(template.to_vec()),
            ],
        )?
        .ulong()
    }

    /// Generate a key pair, returning the public and private key handles.
    pub fn generate_key_pair(
        &self,
        session: CK_SESSION_HANDLE,
        mechanism: &Mechanism,
        public_template: &[Attribute],
        private_template: &[Attribute],
    ) -> Result<(CK_OBJECT_HANDLE, CK_OBJECT_HANDLE), Error> {
        let mut values = self.call(
            CallId::GenerateKeyPair,
            &[
                Value::Ulong(session),
                Value::Mechanism(mechanism.clone()),
                Value::AttributeArray(public_template.to_vec()),
                Value::AttributeArray(private_template.to_vec()),
            ],
        )?;
        Ok((values.ulong()?, values.ulong()?))
    }

    pub fn wrap_key(
        &self,
        session: CK_SESSION_HANDLE,
        mechanism: &Mechanism,
        wrapping_key: CK_OBJECT_HANDLE,
        key: CK_OBJECT_HANDLE,
        wrapped: Option<&mut [u8]>,
    ) -> Result<usize, Error> {
        let mut values = self.call(
            CallId::WrapKey,
            &[
                Value::Ulong(session),
                Value::Mechanism(mechanism.clone()),
                Value::Ulong(wrapping_key),
                Value::Ulong(key),
                Value::ByteBuffer(capacity(&wrapped)),
            ],
        )?;
        fill(values.byte_array()?, wrapped)
    }

    pub fn unwrap_key(
        &self,
        session: CK_SESSION_HANDLE,
        mechanism: &Mechanism,
        unwrapping_key: CK_OBJECT_HANDLE,
        wrapped: &[u8],
        template: &[Attribute],
    ) -> Result<CK_OBJECT_HANDLE, Error> {
        self.call(
            CallId::UnwrapKey,
            &[
                Value::Ulong(session),
                Value::Mechanism(mechanism.clone()),
                Value::Ulong(unwrapping_key),
                bytes(wrapped),
                Value::AttributeArray(template.to_vec()),
            ],
        )?
        .ulong()
    }

    pub fn derive_key(
        &self,
        session: CK_SESSION_HANDLE,
        mechanism: &Mechanism,
        base_key: CK_OBJECT_HANDLE,
        template: &[Attribute],
    ) -> Result<CK_OBJECT_HANDLE, Error> {
        self.call(
            CallId::DeriveKey,
            &[
                Value::Ulong(session),
                Value::Mechanism(mechanism.clone()),
                Value::Ulong(base_key),
                Value::AttributeArray(template.to_vec()),
            ],
        )?
        .ulong()
    }

    pub fn seed_random(&self, session: CK_SESSION_HANDLE, seed: &[u8]) -> Result<(), Error> {
        self.data_call(CallId::SeedRandom, session, seed)
    }

    /// Fill `output` with random bytes from the token.
    pub fn generate_random(
        &self,
        session: CK_SESSION_HANDLE,
        output: &mut [u8],
    ) -> Result<(), Error> {
        let expected = output.len();
        let written = self.output_call(CallId::GenerateRandom, session, &[], Some(output))?;
        if written != expected {
            return Err(ProtocolError::Malformed(format!(
                "asked for {expected} random bytes but received {written}"
            ))
            .into());
        }
        Ok(())
    }

    fn session_call(&self, call: CallId, session: CK_SESSION_HANDLE) -> Result<(), Error> {
        self.call(call, &[Value::Ulong(session)])?;
        Ok(())
    }

    fn data_call(
        &self,
        call: CallId,
        session: CK_SESSION_HANDLE,
        data: &[u8],
    ) -> Result<(), Error> {
        self.call(call, &[Value::Ulong(session), bytes(data)])?;
        Ok(())
    }

    fn operation_init(
        &self,
        call: CallId,
        session: CK_SESSION_HANDLE,
        mechanism: &Mechanism,
        key: CK_OBJECT_HANDLE,
    ) -> Result<(), Error> {
        self.call(
            call,
            &[
                Value::Ulong(session),
                Value::Mechanism(mechanism.clone()),
                Value::Ulong(key),
            ],
        )?;
        Ok(())
    }

    /// A call of the shape `(session, inputs..., buffer) -> byte array`.
    fn output_call(
        &self,
        call: CallId,
        session: CK_SESSION_HANDLE,
        inputs: &[Value],
        output: Option<&mut [u8]>,
    ) -> Result<usize, Error> {
        let mut arguments = Vec::with_capacity(inputs.len() + 2);
        arguments.push(Value::Ulong(session));
        arguments.extend_from_slice(inputs);
        arguments.push(Value::ByteBuffer(capacity(&output)));
        let mut values = self.call(call, &arguments)?;
        fill(values.byte_array()?, output)
    }
}

fn capacity<T>(buffer: &Option<&mut [T]>) -> Option<CK_ULONG> {
    buffer.as_ref().map(|buffer| buffer.len() as CK_ULONG)
}

fn bytes(data: &[u8]) -> Value {
    Value::ByteArray(Payload::Value(data.to_vec()))
}

/// A byte array which may be NULL in the C API.
fn optional(data: Option<&[u8]>) -> Value {
    match data {
        Some(data) => bytes(data),
        None => Value::ByteArray(Payload::Length(0)),
    }
}

/// Copy a two-phase result into the caller's buffer, returning the result's length.
pub(crate) fn fill<T: Copy>(
    payload: Payload<Vec<T>>,
    output: Option<&mut [T]>,
) -> Result<usize, Error> {
    let required = match &payload {
        Payload::Length(len) => *len,
        Payload::Value(data) => data.len() as CK_ULONG,
    };
    let Some(output) = output else {
        tracing::debug!(required, "Reporting required length");
        return usize::try_from(required).map_err(|_| Error::HostMemory);
    };
    if required > output.len() as CK_ULONG {
        tracing::debug!(required, available = output.len(), "Caller's buffer is too small");
        return Err(Error::BufferTooSmall { required });
    }
    match payload {
        Payload::Value(data) => {
            output[..data.len()].copy_from_slice(&data);
            Ok(data.len())
        }
        Payload::Length(_) => Err(ProtocolError::Malformed(
            "daemon sent a length for data that fits the buffer".to_string(),
        )
        .into()),
    }
}

fn fill_attributes(
    attributes: Vec<Attribute>,
    template: &mut [AttributeQuery<'_>],
) -> Result<(), Error> {
    if attributes.len() != template.len() {
        return Err(ProtocolError::AttributeCount {
            expected: template.len(),
            received: attributes.len(),
        }
        .into());
    }
    let mut too_small = None;
    for (query, attribute) in template.iter_mut().zip(attributes) {
        if attribute.attribute_type != query.attribute_type {
            return Err(ProtocolError::Malformed(format!(
                "asked for attribute {:#x} but received {:#x}",
                query.attribute_type, attribute.attribute_type
            ))
            .into());
        }
        let payload = match attribute.value {
            AttributeValue::Invalid => {
                query.length = CK_UNAVAILABLE_INFORMATION;
                continue;
            }
            AttributeValue::Length(len) => Payload::Length(len),
            AttributeValue::Bytes(bytes) => Payload::Value(bytes),
        };
        match fill(payload, query.buffer.as_deref_mut()) {
            Ok(len) => query.length = len as CK_ULONG,
            Err(Error::BufferTooSmall { required }) => {
                query.length = CK_UNAVAILABLE_INFORMATION;
                too_small = too_small.max(Some(required));
            }
            Err(error) => return Err(error),
        }
    }
    match too_small {
        Some(required) => Err(Error::BufferTooSmall { required }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use cryptoki_sys::{CKA_ID, CKA_LABEL, CKA_VALUE};

    use super::*;

    #[test]
    fn fill_without_buffer_reports_length() {
        assert_eq!(fill::<u8>(Payload::Length(7), None).unwrap(), 7);
        assert_eq!(fill(Payload::Value(vec![1_u8, 2]), None).unwrap(), 2);
    }

    #[test]
    fn fill_too_small() {
        let mut buffer = [0_u8; 2];
        assert!(matches!(
            fill(Payload::Value(vec![1, 2, 3]), Some(&mut buffer)),
            Err(Error::BufferTooSmall { required: 3 })
        ));
        assert!(matches!(
            fill::<u8>(Payload::Length(3), Some(&mut buffer)),
            Err(Error::BufferTooSmall { required: 3 })
        ));
        assert_eq!(buffer, [0, 0]);
    }

    #[test]
    fn fill_copies() {
        let mut buffer = [0_u64; 4];
        assert_eq!(fill(Payload::Value(vec![5, 6]), Some(&mut buffer)).unwrap(), 2);
        assert_eq!(buffer, [5, 6, 0, 0]);
    }

    #[test]
    fn fill_length_that_fits_is_a_protocol_error() {
        let mut buffer = [0_u8; 4];
        assert!(matches!(
            fill::<u8>(Payload::Length(3), Some(&mut buffer)),
            Err(Error::Protocol(ProtocolError::Malformed(_)))
        ));
    }

    #[test]
    fn attribute_fill() {
        let mut label = [0_u8; 8];
        let mut id = [0_u8; 1];
        let mut template = [
            AttributeQuery::new(CKA_LABEL, Some(&mut label)),
            AttributeQuery::new(CKA_ID, Some(&mut id)),
            AttributeQuery::new(CKA_VALUE, None),
        ];
        let answer = vec![
            Attribute::new(CKA_LABEL, b"key".as_slice()),
            Attribute {
                attribute_type: CKA_ID,
                value: AttributeValue::Length(4),
            },
            Attribute {
                attribute_type: CKA_VALUE,
                value: AttributeValue::Invalid,
            },
        ];
        assert!(matches!(
            fill_attributes(answer, &mut template),
            Err(Error::BufferTooSmall { required: 4 })
        ));
        assert_eq!(template[0].length, 3);
        assert_eq!(template[0].value(), Some(b"key".as_slice()));
        assert_eq!(template[1].length, CK_UNAVAILABLE_INFORMATION);
        assert_eq!(template[2].length, CK_UNAVAILABLE_INFORMATION);
    }

    #[test]
    fn attribute_count_mismatch() {
        let mut template = [AttributeQuery::new(CKA_LABEL, None)];
        assert!(matches!(
            fill_attributes(vec![], &mut template),
            Err(Error::Protocol(ProtocolError::AttributeCount {
                expected: 1,
                received: 0
            }))
        ));
        let answer = vec![
            Attribute::new(CKA_LABEL, b"a".as_slice()),
            Attribute::new(CKA_ID, b"b".as_slice()),
        ];
        assert!(matches!(
            fill_attributes(answer, &mut template),
            Err(Error::Protocol(ProtocolError::AttributeCount {
                expected: 1,
                received: 2
            }))
        ));
    }

    #[test]
    fn uninitialized_client() {
        let client = Client::new();
        assert!(!client.is_initialized());
        assert!(matches!(client.get_info(), Err(Error::NotInitialized)));
        assert!(matches!(client.finalize(), Err(Error::NotInitialized)));
    }
}
