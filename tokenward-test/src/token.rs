// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! An in-memory token for exercising the client and daemon.
//!
//! The "cryptography" is deliberately trivial: encryption XORs with a byte derived from
//! the key handle and digests are a keyed FNV hash. It only needs to be deterministic
//! and reversible so tests can check round trips.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        Mutex, MutexGuard,
        atomic::{AtomicUsize, Ordering},
    },
};

use cryptoki_sys::{
    CK_FLAGS, CK_MECHANISM_TYPE, CK_OBJECT_HANDLE, CK_SESSION_HANDLE, CK_SLOT_ID, CK_ULONG,
    CK_USER_TYPE, CKF_DECRYPT, CKF_DIGEST, CKF_ENCRYPT, CKF_HW_SLOT, CKF_LOGIN_REQUIRED,
    CKF_RNG, CKF_RW_SESSION, CKF_SERIAL_SESSION, CKF_SIGN, CKF_TOKEN_INITIALIZED,
    CKF_TOKEN_PRESENT, CKF_USER_PIN_INITIALIZED, CKF_VERIFY, CKM_AES_CBC_PAD, CKM_AES_GCM,
    CKM_RSA_PKCS, CKM_RSA_PKCS_OAEP, CKM_SHA256, CKM_SHA256_RSA_PKCS, CKR_ATTRIBUTE_TYPE_INVALID,
    CKR_FUNCTION_NOT_PARALLEL, CKR_MECHANISM_INVALID, CKR_OBJECT_HANDLE_INVALID, CKR_OK,
    CKR_OPERATION_ACTIVE, CKR_OPERATION_NOT_INITIALIZED, CKR_PIN_INCORRECT,
    CKR_SESSION_HANDLE_INVALID, CKR_SESSION_PARALLEL_NOT_SUPPORTED, CKR_SIGNATURE_INVALID,
    CKR_SLOT_ID_INVALID, CKR_USER_NOT_LOGGED_IN, CKS_RO_PUBLIC_SESSION, CKS_RO_USER_FUNCTIONS,
    CKS_RW_PUBLIC_SESSION, CKS_RW_USER_FUNCTIONS,
};
use tokenward::{
    daemon::{AttributeAnswer, Output, Token, TokenResult},
    mechanism::Mechanism,
    types::{
        Attribute, AttributeRequest, AttributeValue, Info, MechanismInfo, Payload, SessionInfo,
        SlotInfo, TokenInfo, Version, padded,
    },
};

/// The slots the mock token exposes.
pub const SLOTS: [CK_SLOT_ID; 2] = [1, 2];

/// The user PIN the token starts with.
pub const USER_PIN: &[u8] = b"1234";

/// Mechanisms the token reports, including some that can't be used over RPC.
pub const MECHANISMS: [CK_MECHANISM_TYPE; 6] = [
    CKM_RSA_PKCS,
    CKM_RSA_PKCS_OAEP,
    CKM_SHA256,
    CKM_SHA256_RSA_PKCS,
    CKM_AES_CBC_PAD,
    CKM_AES_GCM,
];

const DIGEST_LEN: usize = 32;

#[derive(Debug)]
enum Operation {
    Encrypt(u8),
    Decrypt(u8),
    Digest(Vec<u8>),
    Sign(CK_OBJECT_HANDLE, Vec<u8>),
    Verify(CK_OBJECT_HANDLE, Vec<u8>),
}

#[derive(Debug)]
struct Session {
    slot: CK_SLOT_ID,
    flags: CK_FLAGS,
    operation: Option<Operation>,
    search: Option<Vec<CK_OBJECT_HANDLE>>,
}

#[derive(Debug)]
struct State {
    next_handle: CK_ULONG,
    sessions: HashMap<CK_SESSION_HANDLE, Session>,
    objects: BTreeMap<CK_OBJECT_HANDLE, Vec<Attribute>>,
    logged_in: bool,
    user_pin: Vec<u8>,
    random: u8,
}

/// A token that lives entirely in memory.
#[derive(Debug)]
pub struct MockToken {
    state: Mutex<State>,
    requests: AtomicUsize,
}

impl Default for MockToken {
    fn default() -> Self {
        Self::new()
    }
}

impl MockToken {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                next_handle: 1,
                sessions: HashMap::new(),
                objects: BTreeMap::new(),
                logged_in: false,
                user_pin: USER_PIN.to_vec(),
                random: 0,
            }),
            requests: AtomicUsize::new(0),
        }
    }

    /// How many requests reached the token.
    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    /// Store an object directly, returning its handle.
    pub fn insert_object(&self, attributes: Vec<Attribute>) -> CK_OBJECT_HANDLE {
        let mut state = self.lock();
        let handle = state.allocate();
        state.objects.insert(handle, attributes);
        handle
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        self.state.lock().expect("mock token lock poisoned")
    }
}

impl State {
    fn allocate(&mut self) -> CK_ULONG {
        let handle = self.next_handle;
        self.next_handle += 1;
        handle
    }

    fn session(&mut self, session: CK_SESSION_HANDLE) -> TokenResult<&mut Session> {
        self.sessions
            .get_mut(&session)
            .ok_or(CKR_SESSION_HANDLE_INVALID)
    }

    fn object(&self, object: CK_OBJECT_HANDLE) -> TokenResult<&Vec<Attribute>> {
        self.objects.get(&object).ok_or(CKR_OBJECT_HANDLE_INVALID)
    }

    fn begin(&mut self, session: CK_SESSION_HANDLE, operation: Operation) -> TokenResult<()> {
        let session = self.session(session)?;
        if session.operation.is_some() {
            return Err(CKR_OPERATION_ACTIVE);
        }
        session.operation = Some(operation);
        Ok(())
    }

    fn take_operation(&mut self, session: CK_SESSION_HANDLE) -> TokenResult<Operation> {
        self.session(session)?
            .operation
            .take()
            .ok_or(CKR_OPERATION_NOT_INITIALIZED)
    }

    fn key_byte(&self, key: CK_OBJECT_HANDLE) -> TokenResult<u8> {
        self.object(key)?;
        Ok((key as u8) ^ 0x5a)
    }
}

fn check_slot(slot: CK_SLOT_ID) -> TokenResult<()> {
    if SLOTS.contains(&slot) {
        Ok(())
    } else {
        Err(CKR_SLOT_ID_INVALID)
    }
}

fn xor(data: &[u8], key: u8) -> Vec<u8> {
    data.iter().map(|byte| byte ^ key).collect()
}

/// A 32 byte keyed FNV-1a hash; not cryptographic.
fn digest(key: u64, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(DIGEST_LEN);
    for lane in 0..(DIGEST_LEN / 8) as u64 {
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325 ^ key.wrapping_mul(lane + 1);
        for byte in data {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        }
        out.extend_from_slice(&hash.to_be_bytes());
    }
    out
}

/// Complete a multi-part or single-part operation into the caller's buffer.
///
/// The operation stays active when the caller only asked for the length or the buffer
/// was too small, as PKCS#11 requires.
fn conclude(
    state: &mut State,
    session: CK_SESSION_HANDLE,
    operation: Operation,
    result: Vec<u8>,
    capacity: Option<CK_ULONG>,
) -> Output {
    let payload = Payload::for_capacity(result, capacity);
    if matches!(payload, Payload::Length(_)) {
        state.session(session)?.operation = Some(operation);
    }
    Ok(payload)
}

impl Token for MockToken {
    fn get_info(&self) -> TokenResult<Info> {
        let _state = self.lock();
        Ok(Info {
            cryptoki_version: Version { major: 2, minor: 40 },
            manufacturer_id: padded("Tokenward"),
            flags: 0,
            library_description: padded("Mock token"),
            library_version: Version { major: 0, minor: 1 },
        })
    }

    fn get_slot_list(
        &self,
        _token_present: bool,
        capacity: Option<CK_ULONG>,
    ) -> TokenResult<Payload<Vec<CK_SLOT_ID>>> {
        let _state = self.lock();
        Ok(Payload::for_capacity(SLOTS.to_vec(), capacity))
    }

    fn get_slot_info(&self, slot: CK_SLOT_ID) -> TokenResult<SlotInfo> {
        let _state = self.lock();
        check_slot(slot)?;
        Ok(SlotInfo {
            slot_description: padded(&format!("Mock slot {slot}")),
            manufacturer_id: padded("Tokenward"),
            flags: CKF_TOKEN_PRESENT | CKF_HW_SLOT,
            hardware_version: Version { major: 1, minor: 0 },
            firmware_version: Version { major: 1, minor: 1 },
        })
    }

    fn get_token_info(&self, slot: CK_SLOT_ID) -> TokenResult<TokenInfo> {
        let state = self.lock();
        check_slot(slot)?;
        let sessions = state
            .sessions
            .values()
            .filter(|session| session.slot == slot)
            .collect::<Vec<_>>();
        Ok(TokenInfo {
            label: padded(&format!("mock-token-{slot}")),
            manufacturer_id: padded("Tokenward"),
            model: padded("Mock"),
            serial_number: padded(&format!("{slot:016}")),
            flags: CKF_RNG
                | CKF_LOGIN_REQUIRED
                | CKF_USER_PIN_INITIALIZED
                | CKF_TOKEN_INITIALIZED,
            max_session_count: 64,
            session_count: sessions.len() as CK_ULONG,
            max_rw_session_count: 64,
            rw_session_count: sessions
                .iter()
                .filter(|session| session.flags & CKF_RW_SESSION != 0)
                .count() as CK_ULONG,
            max_pin_len: 32,
            min_pin_len: 4,
            total_public_memory: 1 << 20,
            free_public_memory: 1 << 19,
            total_private_memory: 1 << 20,
            free_private_memory: 1 << 19,
            hardware_version: Version { major: 1, minor: 0 },
            firmware_version: Version { major: 1, minor: 1 },
            utc_time: padded("2024010100000000"),
        })
    }

    fn get_mechanism_list(
        &self,
        slot: CK_SLOT_ID,
        capacity: Option<CK_ULONG>,
    ) -> TokenResult<Payload<Vec<CK_MECHANISM_TYPE>>> {
        let _state = self.lock();
        check_slot(slot)?;
        Ok(Payload::for_capacity(MECHANISMS.to_vec(), capacity))
    }

    fn get_mechanism_info(
        &self,
        slot: CK_SLOT_ID,
        mechanism_type: CK_MECHANISM_TYPE,
    ) -> TokenResult<MechanismInfo> {
        let _state = self.lock();
        check_slot(slot)?;
        let flags = match mechanism_type {
            CKM_RSA_PKCS => CKF_ENCRYPT | CKF_DECRYPT | CKF_SIGN | CKF_VERIFY,
            CKM_SHA256 => CKF_DIGEST,
            CKM_SHA256_RSA_PKCS => CKF_SIGN | CKF_VERIFY,
            CKM_AES_CBC_PAD => CKF_ENCRYPT | CKF_DECRYPT,
            _ => return Err(CKR_MECHANISM_INVALID),
        };
        Ok(MechanismInfo {
            min_key_size: 128,
            max_key_size: 4096,
            flags,
        })
    }

    fn init_token(&self, slot: CK_SLOT_ID, _pin: Option<&[u8]>, _label: &[u8]) -> TokenResult<()> {
        let mut state = self.lock();
        check_slot(slot)?;
        state.objects.clear();
        Ok(())
    }

    fn wait_for_slot_event(&self, _flags: CK_FLAGS) -> TokenResult<CK_SLOT_ID> {
        let _state = self.lock();
        Err(cryptoki_sys::CKR_NO_EVENT)
    }

    fn open_session(&self, slot: CK_SLOT_ID, flags: CK_FLAGS) -> TokenResult<CK_SESSION_HANDLE> {
        let mut state = self.lock();
        check_slot(slot)?;
        if flags & CKF_SERIAL_SESSION == 0 {
            return Err(CKR_SESSION_PARALLEL_NOT_SUPPORTED);
        }
        let handle = state.allocate();
        state.sessions.insert(
            handle,
            Session {
                slot,
                flags,
                operation: None,
                search: None,
            },
        );
        Ok(handle)
    }

    fn close_session(&self, session: CK_SESSION_HANDLE) -> TokenResult<()> {
        let mut state = self.lock();
        state
            .sessions
            .remove(&session)
            .ok_or(CKR_SESSION_HANDLE_INVALID)?;
        if state.sessions.is_empty() {
            state.logged_in = false;
        }
        Ok(())
    }

    fn close_all_sessions(&self, slot: CK_SLOT_ID) -> TokenResult<()> {
        let mut state = self.lock();
        check_slot(slot)?;
        state.sessions.retain(|_, session| session.slot != slot);
        state.logged_in = false;
        Ok(())
    }

    fn get_function_status(&self, session: CK_SESSION_HANDLE) -> TokenResult<()> {
        self.lock().session(session)?;
        Err(CKR_FUNCTION_NOT_PARALLEL)
    }

    fn cancel_function(&self, session: CK_SESSION_HANDLE) -> TokenResult<()> {
        self.lock().session(session)?;
        Err(CKR_FUNCTION_NOT_PARALLEL)
    }

    fn get_session_info(&self, session: CK_SESSION_HANDLE) -> TokenResult<SessionInfo> {
        let mut state = self.lock();
        let logged_in = state.logged_in;
        let session = state.session(session)?;
        let read_write = session.flags & CKF_RW_SESSION != 0;
        let session_state = match (read_write, logged_in) {
            (false, false) => CKS_RO_PUBLIC_SESSION,
            (false, true) => CKS_RO_USER_FUNCTIONS,
            (true, false) => CKS_RW_PUBLIC_SESSION,
            (true, true) => CKS_RW_USER_FUNCTIONS,
        };
        Ok(SessionInfo {
            slot_id: session.slot,
            state: session_state,
            flags: session.flags,
            device_error: 0,
        })
    }

    fn init_pin(&self, session: CK_SESSION_HANDLE, pin: Option<&[u8]>) -> TokenResult<()> {
        let mut state = self.lock();
        state.session(session)?;
        state.user_pin = pin.unwrap_or_default().to_vec();
        Ok(())
    }

    fn set_pin(
        &self,
        session: CK_SESSION_HANDLE,
        old_pin: Option<&[u8]>,
        new_pin: Option<&[u8]>,
    ) -> TokenResult<()> {
        let mut state = self.lock();
        state.session(session)?;
        if old_pin.unwrap_or_default() != state.user_pin {
            return Err(CKR_PIN_INCORRECT);
        }
        state.user_pin = new_pin.unwrap_or_default().to_vec();
        Ok(())
    }

    fn login(
        &self,
        session: CK_SESSION_HANDLE,
        _user_type: CK_USER_TYPE,
        pin: Option<&[u8]>,
    ) -> TokenResult<()> {
        let mut state = self.lock();
        state.session(session)?;
        if pin.unwrap_or_default() != state.user_pin {
            return Err(CKR_PIN_INCORRECT);
        }
        state.logged_in = true;
        Ok(())
    }

    fn logout(&self, session: CK_SESSION_HANDLE) -> TokenResult<()> {
        let mut state = self.lock();
        state.session(session)?;
        if !state.logged_in {
            return Err(CKR_USER_NOT_LOGGED_IN);
        }
        state.logged_in = false;
        Ok(())
    }

    fn create_object(
        &self,
        session: CK_SESSION_HANDLE,
        template: &[Attribute],
    ) -> TokenResult<CK_OBJECT_HANDLE> {
        let mut state = self.lock();
        state.session(session)?;
        let handle = state.allocate();
        state.objects.insert(handle, template.to_vec());
        Ok(handle)
    }

    fn copy_object(
        &self,
        session: CK_SESSION_HANDLE,
        object: CK_OBJECT_HANDLE,
        template: &[Attribute],
    ) -> TokenResult<CK_OBJECT_HANDLE> {
        let mut state = self.lock();
        state.session(session)?;
        let mut attributes = state.object(object)?.clone();
        merge(&mut attributes, template);
        let handle = state.allocate();
        state.objects.insert(handle, attributes);
        Ok(handle)
    }

    fn destroy_object(
        &self,
        session: CK_SESSION_HANDLE,
        object: CK_OBJECT_HANDLE,
    ) -> TokenResult<()> {
        let mut state = self.lock();
        state.session(session)?;
        state
            .objects
            .remove(&object)
            .map(|_| ())
            .ok_or(CKR_OBJECT_HANDLE_INVALID)
    }

    fn get_object_size(
        &self,
        session: CK_SESSION_HANDLE,
        object: CK_OBJECT_HANDLE,
    ) -> TokenResult<CK_ULONG> {
        let mut state = self.lock();
        state.session(session)?;
        let size = state
            .object(object)?
            .iter()
            .map(|attribute| match &attribute.value {
                AttributeValue::Bytes(bytes) => bytes.len(),
                _ => 0,
            })
            .sum::<usize>();
        Ok(size as CK_ULONG)
    }

    fn get_attribute_value(
        &self,
        session: CK_SESSION_HANDLE,
        object: CK_OBJECT_HANDLE,
        requests: &[AttributeRequest],
    ) -> TokenResult<AttributeAnswer> {
        let mut state = self.lock();
        state.session(session)?;
        let stored = state.object(object)?;
        let mut rv = CKR_OK;
        let attributes = requests
            .iter()
            .map(|request| {
                let value = stored
                    .iter()
                    .find(|attribute| attribute.attribute_type == request.attribute_type)
                    .map(|attribute| attribute.value.clone())
                    .unwrap_or_else(|| {
                        rv = CKR_ATTRIBUTE_TYPE_INVALID;
                        AttributeValue::Invalid
                    });
                Attribute {
                    attribute_type: request.attribute_type,
                    value,
                }
            })
            .collect();
        Ok(AttributeAnswer { attributes, rv })
    }

    fn set_attribute_value(
        &self,
        session: CK_SESSION_HANDLE,
        object: CK_OBJECT_HANDLE,
        template: &[Attribute],
    ) -> TokenResult<()> {
        let mut state = self.lock();
        state.session(session)?;
        let attributes = state
            .objects
            .get_mut(&object)
            .ok_or(CKR_OBJECT_HANDLE_INVALID)?;
        merge(attributes, template);
        Ok(())
    }

    fn find_objects_init(
        &self,
        session: CK_SESSION_HANDLE,
        template: &[Attribute],
    ) -> TokenResult<()> {
        let mut state = self.lock();
        let matches = state
            .objects
            .iter()
            .filter(|(_, attributes)| template.iter().all(|wanted| attributes.contains(wanted)))
            .map(|(handle, _)| *handle)
            .collect::<Vec<_>>();
        let session = state.session(session)?;
        if session.search.is_some() {
            return Err(CKR_OPERATION_ACTIVE);
        }
        session.search = Some(matches);
        Ok(())
    }

    fn find_objects(
        &self,
        session: CK_SESSION_HANDLE,
        max_count: CK_ULONG,
    ) -> TokenResult<Vec<CK_OBJECT_HANDLE>> {
        let mut state = self.lock();
        let search = state
            .session(session)?
            .search
            .as_mut()
            .ok_or(CKR_OPERATION_NOT_INITIALIZED)?;
        let count = search.len().min(max_count as usize);
        Ok(search.drain(..count).collect())
    }

    fn find_objects_final(&self, session: CK_SESSION_HANDLE) -> TokenResult<()> {
        let mut state = self.lock();
        state
            .session(session)?
            .search
            .take()
            .map(|_| ())
            .ok_or(CKR_OPERATION_NOT_INITIALIZED)
    }

    fn encrypt_init(
        &self,
        session: CK_SESSION_HANDLE,
        _mechanism: &Mechanism,
        key: CK_OBJECT_HANDLE,
    ) -> TokenResult<()> {
        let mut state = self.lock();
        let key = state.key_byte(key)?;
        state.begin(session, Operation::Encrypt(key))
    }

    fn encrypt(
        &self,
        session: CK_SESSION_HANDLE,
        data: &[u8],
        capacity: Option<CK_ULONG>,
    ) -> Output {
        let mut state = self.lock();
        match state.take_operation(session)? {
            Operation::Encrypt(key) => {
                conclude(&mut state, session, Operation::Encrypt(key), xor(data, key), capacity)
            }
            other => {
                state.session(session)?.operation = Some(other);
                Err(CKR_OPERATION_NOT_INITIALIZED)
            }
        }
    }

    fn encrypt_update(
        &self,
        session: CK_SESSION_HANDLE,
        data: &[u8],
        capacity: Option<CK_ULONG>,
    ) -> Output {
        let mut state = self.lock();
        let Some(Operation::Encrypt(key)) = state.session(session)?.operation else {
            return Err(CKR_OPERATION_NOT_INITIALIZED);
        };
        Ok(Payload::for_capacity(xor(data, key), capacity))
    }

    fn encrypt_final(&self, session: CK_SESSION_HANDLE, capacity: Option<CK_ULONG>) -> Output {
        let mut state = self.lock();
        match state.take_operation(session)? {
            operation @ Operation::Encrypt(_) => {
                conclude(&mut state, session, operation, vec![], capacity)
            }
            other => {
                state.session(session)?.operation = Some(other);
                Err(CKR_OPERATION_NOT_INITIALIZED)
            }
        }
    }

    fn decrypt_init(
        &self,
        session: CK_SESSION_HANDLE,
        _mechanism: &Mechanism,
        key: CK_OBJECT_HANDLE,
    ) -> TokenResult<()> {
        let mut state = self.lock();
        let key = state.key_byte(key)?;
        state.begin(session, Operation::Decrypt(key))
    }

    fn decrypt(
        &self,
        session: CK_SESSION_HANDLE,
        data: &[u8],
        capacity: Option<CK_ULONG>,
    ) -> Output {
        let mut state = self.lock();
        match state.take_operation(session)? {
            Operation::Decrypt(key) => {
                conclude(&mut state, session, Operation::Decrypt(key), xor(data, key), capacity)
            }
            other => {
                state.session(session)?.operation = Some(other);
                Err(CKR_OPERATION_NOT_INITIALIZED)
            }
        }
    }

    fn digest_init(&self, session: CK_SESSION_HANDLE, _mechanism: &Mechanism) -> TokenResult<()> {
        self.lock().begin(session, Operation::Digest(vec![]))
    }

    fn digest(
        &self,
        session: CK_SESSION_HANDLE,
        data: &[u8],
        capacity: Option<CK_ULONG>,
    ) -> Output {
        let mut state = self.lock();
        match state.take_operation(session)? {
            Operation::Digest(buffered) if buffered.is_empty() => {
                let result = digest(0, data);
                conclude(&mut state, session, Operation::Digest(buffered), result, capacity)
            }
            other => {
                state.session(session)?.operation = Some(other);
                Err(CKR_OPERATION_NOT_INITIALIZED)
            }
        }
    }

    fn digest_update(&self, session: CK_SESSION_HANDLE, data: &[u8]) -> TokenResult<()> {
        let mut state = self.lock();
        match &mut state.session(session)?.operation {
            Some(Operation::Digest(buffered)) => {
                buffered.extend_from_slice(data);
                Ok(())
            }
            _ => Err(CKR_OPERATION_NOT_INITIALIZED),
        }
    }

    fn digest_final(&self, session: CK_SESSION_HANDLE, capacity: Option<CK_ULONG>) -> Output {
        let mut state = self.lock();
        match state.take_operation(session)? {
            Operation::Digest(buffered) => {
                let result = digest(0, &buffered);
                conclude(&mut state, session, Operation::Digest(buffered), result, capacity)
            }
            other => {
                state.session(session)?.operation = Some(other);
                Err(CKR_OPERATION_NOT_INITIALIZED)
            }
        }
    }

    fn sign_init(
        &self,
        session: CK_SESSION_HANDLE,
        _mechanism: &Mechanism,
        key: CK_OBJECT_HANDLE,
    ) -> TokenResult<()> {
        let mut state = self.lock();
        state.object(key)?;
        state.begin(session, Operation::Sign(key, vec![]))
    }

    fn sign(&self, session: CK_SESSION_HANDLE, data: &[u8], capacity: Option<CK_ULONG>) -> Output {
        let mut state = self.lock();
        match state.take_operation(session)? {
            Operation::Sign(key, buffered) if buffered.is_empty() => {
                let signature = digest(key, data);
                conclude(&mut state, session, Operation::Sign(key, buffered), signature, capacity)
            }
            other => {
                state.session(session)?.operation = Some(other);
                Err(CKR_OPERATION_NOT_INITIALIZED)
            }
        }
    }

    fn sign_update(&self, session: CK_SESSION_HANDLE, data: &[u8]) -> TokenResult<()> {
        let mut state = self.lock();
        match &mut state.session(session)?.operation {
            Some(Operation::Sign(_, buffered)) => {
                buffered.extend_from_slice(data);
                Ok(())
            }
            _ => Err(CKR_OPERATION_NOT_INITIALIZED),
        }
    }

    fn sign_final(&self, session: CK_SESSION_HANDLE, capacity: Option<CK_ULONG>) -> Output {
        let mut state = self.lock();
        match state.take_operation(session)? {
            Operation::Sign(key, buffered) => {
                let signature = digest(key, &buffered);
                conclude(&mut state, session, Operation::Sign(key, buffered), signature, capacity)
            }
            other => {
                state.session(session)?.operation = Some(other);
                Err(CKR_OPERATION_NOT_INITIALIZED)
            }
        }
    }

    fn verify_init(
        &self,
        session: CK_SESSION_HANDLE,
        _mechanism: &Mechanism,
        key: CK_OBJECT_HANDLE,
    ) -> TokenResult<()> {
        let mut state = self.lock();
        state.object(key)?;
        state.begin(session, Operation::Verify(key, vec![]))
    }

    fn verify(&self, session: CK_SESSION_HANDLE, data: &[u8], signature: &[u8]) -> TokenResult<()> {
        let mut state = self.lock();
        match state.take_operation(session)? {
            Operation::Verify(key, _) => check_signature(key, data, signature),
            other => {
                state.session(session)?.operation = Some(other);
                Err(CKR_OPERATION_NOT_INITIALIZED)
            }
        }
    }

    fn verify_update(&self, session: CK_SESSION_HANDLE, data: &[u8]) -> TokenResult<()> {
        let mut state = self.lock();
        match &mut state.session(session)?.operation {
            Some(Operation::Verify(_, buffered)) => {
                buffered.extend_from_slice(data);
                Ok(())
            }
            _ => Err(CKR_OPERATION_NOT_INITIALIZED),
        }
    }

    fn verify_final(&self, session: CK_SESSION_HANDLE, signature: &[u8]) -> TokenResult<()> {
        let mut state = self.lock();
        match state.take_operation(session)? {
            Operation::Verify(key, buffered) => check_signature(key, &buffered, signature),
            other => {
                state.session(session)?.operation = Some(other);
                Err(CKR_OPERATION_NOT_INITIALIZED)
            }
        }
    }

    fn generate_key(
        &self,
        session: CK_SESSION_HANDLE,
        _mechanism: &Mechanism,
        template: &[Attribute],
    ) -> TokenResult<CK_OBJECT_HANDLE> {
        let mut state = self.lock();
        state.session(session)?;
        let handle = state.allocate();
        state.objects.insert(handle, template.to_vec());
        Ok(handle)
    }

    fn generate_key_pair(
        &self,
        session: CK_SESSION_HANDLE,
        _mechanism: &Mechanism,
        public_template: &[Attribute],
        private_template: &[Attribute],
    ) -> TokenResult<(CK_OBJECT_HANDLE, CK_OBJECT_HANDLE)> {
        let mut state = self.lock();
        state.session(session)?;
        let public_key = state.allocate();
        state.objects.insert(public_key, public_template.to_vec());
        let private_key = state.allocate();
        state.objects.insert(private_key, private_template.to_vec());
        Ok((public_key, private_key))
    }

    fn wrap_key(
        &self,
        session: CK_SESSION_HANDLE,
        _mechanism: &Mechanism,
        wrapping_key: CK_OBJECT_HANDLE,
        key: CK_OBJECT_HANDLE,
        capacity: Option<CK_ULONG>,
    ) -> Output {
        let mut state = self.lock();
        state.session(session)?;
        let wrapping_key = state.key_byte(wrapping_key)?;
        let value = state
            .object(key)?
            .iter()
            .find_map(|attribute| match &attribute.value {
                AttributeValue::Bytes(bytes)
                    if attribute.attribute_type == cryptoki_sys::CKA_VALUE =>
                {
                    Some(bytes.clone())
                }
                _ => None,
            })
            .unwrap_or_default();
        Ok(Payload::for_capacity(xor(&value, wrapping_key), capacity))
    }

    fn unwrap_key(
        &self,
        session: CK_SESSION_HANDLE,
        _mechanism: &Mechanism,
        unwrapping_key: CK_OBJECT_HANDLE,
        wrapped: &[u8],
        template: &[Attribute],
    ) -> TokenResult<CK_OBJECT_HANDLE> {
        let mut state = self.lock();
        state.session(session)?;
        let unwrapping_key = state.key_byte(unwrapping_key)?;
        let mut attributes = template.to_vec();
        merge(
            &mut attributes,
            &[Attribute::new(cryptoki_sys::CKA_VALUE, xor(wrapped, unwrapping_key))],
        );
        let handle = state.allocate();
        state.objects.insert(handle, attributes);
        Ok(handle)
    }

    fn seed_random(&self, session: CK_SESSION_HANDLE, seed: &[u8]) -> TokenResult<()> {
        let mut state = self.lock();
        state.session(session)?;
        state.random = seed.iter().fold(state.random, |acc, byte| acc.wrapping_add(*byte));
        Ok(())
    }

    fn generate_random(&self, session: CK_SESSION_HANDLE, len: CK_ULONG) -> TokenResult<Vec<u8>> {
        let mut state = self.lock();
        state.session(session)?;
        let start = state.random;
        state.random = state.random.wrapping_add(1);
        Ok((0..len).map(|index| start.wrapping_add(index as u8)).collect())
    }
}

fn check_signature(key: CK_OBJECT_HANDLE, data: &[u8], signature: &[u8]) -> TokenResult<()> {
    if digest(key, data) == signature {
        Ok(())
    } else {
        Err(CKR_SIGNATURE_INVALID)
    }
}

/// Overwrite or add each attribute of `updates`.
fn merge(attributes: &mut Vec<Attribute>, updates: &[Attribute]) {
    for update in updates {
        match attributes
            .iter_mut()
            .find(|attribute| attribute.attribute_type == update.attribute_type)
        {
            Some(existing) => existing.value = update.value.clone(),
            None => attributes.push(update.clone()),
        }
    }
}
