// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Tests that drive the module through its function list against an in-memory daemon.
//!
//! The module keeps process-wide state, so the tests here take turns.

use std::{
    os::raw::c_void,
    ptr,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use cryptoki_sys::{
    CK_ATTRIBUTE, CK_C_INITIALIZE_ARGS, CK_FALSE, CK_FUNCTION_LIST, CK_FUNCTION_LIST_PTR,
    CK_MECHANISM, CK_MECHANISM_TYPE, CK_OBJECT_HANDLE, CK_RV, CK_SESSION_HANDLE, CK_SLOT_ID,
    CK_ULONG, CK_UNAVAILABLE_INFORMATION, CKA_ID, CKA_LABEL, CKA_VALUE, CKF_OS_LOCKING_OK,
    CKF_SERIAL_SESSION, CKM_AES_CBC_PAD, CKM_RSA_PKCS_OAEP, CKM_SHA256, CKR_ARGUMENTS_BAD,
    CKR_ATTRIBUTE_TYPE_INVALID, CKR_BUFFER_TOO_SMALL, CKR_CANT_LOCK,
    CKR_CRYPTOKI_ALREADY_INITIALIZED, CKR_CRYPTOKI_NOT_INITIALIZED, CKR_MECHANISM_INVALID, CKR_OK,
    CKU_USER,
};
use tokenward::{
    config::{CLIENT_CONFIG_ENV, SOCKET_ENV},
    types::Attribute,
};
use tokenward_pkcs11::C_GetFunctionList;
use tokenward_test::{DaemonBuilder, DaemonHandle, MockToken, SLOTS, USER_PIN};

static SERIAL: Mutex<()> = Mutex::new(());

fn functions() -> &'static CK_FUNCTION_LIST {
    let mut list: CK_FUNCTION_LIST_PTR = ptr::null_mut();
    // Safety: `list` is a valid location for the function list pointer.
    let rv = unsafe { C_GetFunctionList(&mut list) };
    assert_eq!(rv, CKR_OK);
    // Safety: the module hands out a pointer to a static.
    unsafe { &*list }
}

/// An initialized module talking to a fresh daemon; finalized on drop.
struct Module {
    functions: &'static CK_FUNCTION_LIST,
    _daemon: DaemonHandle,
    _serial: MutexGuard<'static, ()>,
}

impl Module {
    fn start(token: Arc<MockToken>) -> anyhow::Result<Self> {
        let serial = SERIAL.lock().unwrap_or_else(PoisonError::into_inner);
        let daemon = DaemonBuilder::new(token).start()?;
        std::env::set_var(SOCKET_ENV, daemon.socket_path());
        std::env::remove_var(CLIENT_CONFIG_ENV);

        let functions = functions();
        // Safety: NULL initialization arguments are permitted.
        let rv = unsafe { functions.C_Initialize.unwrap()(ptr::null_mut()) };
        anyhow::ensure!(rv == CKR_OK, "C_Initialize returned {rv:#x}");
        Ok(Self {
            functions,
            _daemon: daemon,
            _serial: serial,
        })
    }

    fn open_session(&self, slot: CK_SLOT_ID) -> CK_SESSION_HANDLE {
        let mut session = 0;
        // Safety: the output pointer is a valid local.
        let rv = unsafe {
            self.functions.C_OpenSession.unwrap()(
                slot,
                CKF_SERIAL_SESSION,
                ptr::null_mut(),
                None,
                &mut session,
            )
        };
        assert_eq!(rv, CKR_OK);
        session
    }

    fn login(&self, session: CK_SESSION_HANDLE) {
        let mut pin = USER_PIN.to_vec();
        // Safety: the PIN buffer is valid for its length.
        let rv = unsafe {
            self.functions.C_Login.unwrap()(
                session,
                CKU_USER,
                pin.as_mut_ptr(),
                pin.len() as CK_ULONG,
            )
        };
        assert_eq!(rv, CKR_OK);
    }
}

impl Drop for Module {
    fn drop(&mut self) {
        // Safety: NULL is the only permitted argument.
        let rv = unsafe { self.functions.C_Finalize.unwrap()(ptr::null_mut()) };
        if rv != CKR_OK && rv != CKR_CRYPTOKI_NOT_INITIALIZED {
            tracing::error!(rv, "C_Finalize failed");
        }
    }
}

unsafe extern "C" fn create_mutex(_mutex: *mut *mut c_void) -> CK_RV {
    CKR_OK
}

unsafe extern "C" fn mutex_op(_mutex: *mut c_void) -> CK_RV {
    CKR_OK
}

fn initialize_args(flags: cryptoki_sys::CK_FLAGS, mutexes: bool) -> CK_C_INITIALIZE_ARGS {
    CK_C_INITIALIZE_ARGS {
        CreateMutex: mutexes.then_some(create_mutex as _),
        DestroyMutex: mutexes.then_some(mutex_op as _),
        LockMutex: mutexes.then_some(mutex_op as _),
        UnlockMutex: mutexes.then_some(mutex_op as _),
        flags,
        pReserved: ptr::null_mut(),
    }
}

#[test]
#[tracing_test::traced_test]
fn get_slot_list_two_phase() -> anyhow::Result<()> {
    let module = Module::start(Arc::new(MockToken::new()))?;
    let get_slot_list = module.functions.C_GetSlotList.unwrap();

    let mut count: CK_ULONG = 0;
    // Safety: a NULL list asks for the count only.
    let rv = unsafe { get_slot_list(CK_FALSE, ptr::null_mut(), &mut count) };
    assert_eq!(rv, CKR_OK);
    assert_eq!(count, 2);

    let mut slots = [0 as CK_SLOT_ID; 2];
    let mut count = slots.len() as CK_ULONG;
    // Safety: the list has room for `count` slots.
    let rv = unsafe { get_slot_list(CK_FALSE, slots.as_mut_ptr(), &mut count) };
    assert_eq!(rv, CKR_OK);
    assert_eq!(count, 2);
    assert_eq!(slots, SLOTS);

    let mut slots = [0 as CK_SLOT_ID; 1];
    let mut count = slots.len() as CK_ULONG;
    // Safety: the list has room for `count` slots.
    let rv = unsafe { get_slot_list(CK_FALSE, slots.as_mut_ptr(), &mut count) };
    assert_eq!(rv, CKR_BUFFER_TOO_SMALL);
    assert_eq!(count, 2);

    // Safety: a NULL count is rejected before it's used.
    let rv = unsafe { get_slot_list(CK_FALSE, ptr::null_mut(), ptr::null_mut()) };
    assert_eq!(rv, CKR_ARGUMENTS_BAD);

    Ok(())
}

#[test]
#[tracing_test::traced_test]
fn encrypt_init_rejects_disallowed_mechanism_without_traffic() -> anyhow::Result<()> {
    let token = Arc::new(MockToken::new());
    let module = Module::start(token.clone())?;
    let session = module.open_session(SLOTS[0]);
    let key = token.insert_object(vec![Attribute::new(CKA_VALUE, vec![0x11; 16])]);

    // OAEP parameters hold pointers into this process.
    let mut oaep = CK_MECHANISM {
        mechanism: CKM_RSA_PKCS_OAEP,
        pParameter: ptr::null_mut(),
        ulParameterLen: 0,
    };
    let requests = token.requests();
    // Safety: the mechanism is a valid local.
    let rv = unsafe { module.functions.C_EncryptInit.unwrap()(session, &mut oaep, key) };
    assert_eq!(rv, CKR_MECHANISM_INVALID);
    assert_eq!(token.requests(), requests);

    Ok(())
}

#[test]
#[tracing_test::traced_test]
fn mechanism_list_hides_unsupported_mechanisms() -> anyhow::Result<()> {
    let module = Module::start(Arc::new(MockToken::new()))?;
    let get_mechanism_list = module.functions.C_GetMechanismList.unwrap();

    let mut count: CK_ULONG = 0;
    // Safety: a NULL list asks for the count only.
    let rv = unsafe { get_mechanism_list(SLOTS[0], ptr::null_mut(), &mut count) };
    assert_eq!(rv, CKR_OK);

    let mut mechanisms = vec![0 as CK_MECHANISM_TYPE; count as usize];
    // Safety: the list has room for `count` mechanisms.
    let rv = unsafe { get_mechanism_list(SLOTS[0], mechanisms.as_mut_ptr(), &mut count) };
    assert_eq!(rv, CKR_OK);
    mechanisms.truncate(count as usize);
    assert!(mechanisms.contains(&CKM_SHA256));
    assert!(mechanisms.contains(&CKM_AES_CBC_PAD));
    assert!(!mechanisms.contains(&CKM_RSA_PKCS_OAEP));

    Ok(())
}

#[test]
#[tracing_test::traced_test]
fn get_attribute_value_reports_lengths() -> anyhow::Result<()> {
    let token = Arc::new(MockToken::new());
    let module = Module::start(token.clone())?;
    let session = module.open_session(SLOTS[0]);
    let object = token.insert_object(vec![Attribute::new(CKA_LABEL, b"signing-key".to_vec())]);
    let get_attribute_value = module.functions.C_GetAttributeValue.unwrap();

    let mut template = [CK_ATTRIBUTE {
        type_: CKA_LABEL,
        pValue: ptr::null_mut(),
        ulValueLen: 0,
    }];
    // Safety: the template is a valid local.
    let rv = unsafe { get_attribute_value(session, object, template.as_mut_ptr(), 1) };
    assert_eq!(rv, CKR_OK);
    assert_eq!(template[0].ulValueLen, 11);

    let mut small = [0u8; 4];
    template[0].pValue = small.as_mut_ptr() as *mut c_void;
    template[0].ulValueLen = small.len() as CK_ULONG;
    // Safety: the template and its buffer are valid locals.
    let rv = unsafe { get_attribute_value(session, object, template.as_mut_ptr(), 1) };
    assert_eq!(rv, CKR_BUFFER_TOO_SMALL);
    assert_eq!(template[0].ulValueLen, CK_UNAVAILABLE_INFORMATION);

    let mut label = [0u8; 32];
    let mut template = [
        CK_ATTRIBUTE {
            type_: CKA_LABEL,
            pValue: label.as_mut_ptr() as *mut c_void,
            ulValueLen: label.len() as CK_ULONG,
        },
        CK_ATTRIBUTE {
            type_: CKA_ID,
            pValue: ptr::null_mut(),
            ulValueLen: 0,
        },
    ];
    // Safety: the template and its buffer are valid locals.
    let rv = unsafe { get_attribute_value(session, object, template.as_mut_ptr(), 2) };
    assert_eq!(rv, CKR_ATTRIBUTE_TYPE_INVALID);
    assert_eq!(template[0].ulValueLen, 11);
    assert_eq!(&label[..11], b"signing-key");
    assert_eq!(template[1].ulValueLen, CK_UNAVAILABLE_INFORMATION);

    Ok(())
}

#[test]
#[tracing_test::traced_test]
fn encrypt_decrypt_round_trip() -> anyhow::Result<()> {
    let token = Arc::new(MockToken::new());
    let module = Module::start(token.clone())?;
    let session = module.open_session(SLOTS[1]);
    module.login(session);
    let key: CK_OBJECT_HANDLE = token.insert_object(vec![Attribute::new(CKA_VALUE, vec![7; 16])]);
    let functions = module.functions;

    let mut iv = [0u8; 16];
    let mut mechanism = CK_MECHANISM {
        mechanism: CKM_AES_CBC_PAD,
        pParameter: iv.as_mut_ptr() as *mut c_void,
        ulParameterLen: iv.len() as CK_ULONG,
    };
    let mut plaintext = b"attack at dawn".to_vec();

    // Safety: all pointers refer to valid locals sized as declared.
    unsafe {
        assert_eq!(functions.C_EncryptInit.unwrap()(session, &mut mechanism, key), CKR_OK);
        let mut len: CK_ULONG = 0;
        let rv = functions.C_Encrypt.unwrap()(
            session,
            plaintext.as_mut_ptr(),
            plaintext.len() as CK_ULONG,
            ptr::null_mut(),
            &mut len,
        );
        assert_eq!(rv, CKR_OK);
        assert_eq!(len as usize, plaintext.len());

        let mut ciphertext = vec![0u8; len as usize];
        let rv = functions.C_Encrypt.unwrap()(
            session,
            plaintext.as_mut_ptr(),
            plaintext.len() as CK_ULONG,
            ciphertext.as_mut_ptr(),
            &mut len,
        );
        assert_eq!(rv, CKR_OK);
        assert_ne!(ciphertext, plaintext);

        assert_eq!(functions.C_DecryptInit.unwrap()(session, &mut mechanism, key), CKR_OK);
        let mut decrypted = vec![0u8; 64];
        let mut decrypted_len = decrypted.len() as CK_ULONG;
        let rv = functions.C_Decrypt.unwrap()(
            session,
            ciphertext.as_mut_ptr(),
            ciphertext.len() as CK_ULONG,
            decrypted.as_mut_ptr(),
            &mut decrypted_len,
        );
        assert_eq!(rv, CKR_OK);
        decrypted.truncate(decrypted_len as usize);
        assert_eq!(decrypted, plaintext);
    }

    Ok(())
}

#[test]
#[tracing_test::traced_test]
fn generate_random_fills_buffer() -> anyhow::Result<()> {
    let module = Module::start(Arc::new(MockToken::new()))?;
    let session = module.open_session(SLOTS[0]);

    let mut random = [0u8; 24];
    // Safety: the buffer is a valid local of the given length.
    let rv = unsafe {
        module.functions.C_GenerateRandom.unwrap()(
            session,
            random.as_mut_ptr(),
            random.len() as CK_ULONG,
        )
    };
    assert_eq!(rv, CKR_OK);
    assert!(random.windows(2).any(|pair| pair[0] != pair[1]));

    Ok(())
}

#[test]
#[tracing_test::traced_test]
fn initialize_twice_and_finalize() -> anyhow::Result<()> {
    let module = Module::start(Arc::new(MockToken::new()))?;
    let functions = module.functions;

    // Safety: NULL arguments are permitted for both calls.
    unsafe {
        assert_eq!(
            functions.C_Initialize.unwrap()(ptr::null_mut()),
            CKR_CRYPTOKI_ALREADY_INITIALIZED
        );
        assert_eq!(functions.C_Finalize.unwrap()(ptr::null_mut()), CKR_OK);
        assert_eq!(
            functions.C_Finalize.unwrap()(ptr::null_mut()),
            CKR_CRYPTOKI_NOT_INITIALIZED
        );
    }

    let mut count: CK_ULONG = 0;
    // Safety: a NULL list asks for the count only.
    let rv = unsafe { functions.C_GetSlotList.unwrap()(CK_FALSE, ptr::null_mut(), &mut count) };
    assert_eq!(rv, CKR_CRYPTOKI_NOT_INITIALIZED);

    // Safety: NULL arguments are permitted.
    let rv = unsafe { functions.C_Initialize.unwrap()(ptr::null_mut()) };
    assert_eq!(rv, CKR_OK);

    Ok(())
}

#[test]
#[tracing_test::traced_test]
fn initialize_validates_arguments() -> anyhow::Result<()> {
    let _serial = SERIAL.lock().unwrap_or_else(PoisonError::into_inner);
    let initialize = functions().C_Initialize.unwrap();

    let mut reserved = 0u8;
    let mut args = initialize_args(CKF_OS_LOCKING_OK, false);
    args.pReserved = &mut reserved as *mut u8 as *mut c_void;
    // Safety: the arguments are a valid local.
    let rv = unsafe { initialize(&mut args as *mut CK_C_INITIALIZE_ARGS as *mut c_void) };
    assert_eq!(rv, CKR_ARGUMENTS_BAD);

    let mut args = initialize_args(CKF_OS_LOCKING_OK, true);
    args.UnlockMutex = None;
    // Safety: the arguments are a valid local.
    let rv = unsafe { initialize(&mut args as *mut CK_C_INITIALIZE_ARGS as *mut c_void) };
    assert_eq!(rv, CKR_ARGUMENTS_BAD);

    let mut args = initialize_args(0, true);
    // Safety: the arguments are a valid local.
    let rv = unsafe { initialize(&mut args as *mut CK_C_INITIALIZE_ARGS as *mut c_void) };
    assert_eq!(rv, CKR_CANT_LOCK);

    Ok(())
}

#[test]
#[tracing_test::traced_test]
fn initialize_with_locking_callbacks_and_os_locking() -> anyhow::Result<()> {
    let _serial = SERIAL.lock().unwrap_or_else(PoisonError::into_inner);
    let daemon = DaemonBuilder::new(Arc::new(MockToken::new())).start()?;
    std::env::set_var(SOCKET_ENV, daemon.socket_path());
    let functions = functions();

    let mut args = initialize_args(CKF_OS_LOCKING_OK, true);
    let args = &mut args as *mut CK_C_INITIALIZE_ARGS as *mut c_void;
    // Safety: the arguments are a valid local.
    let rv = unsafe { functions.C_Initialize.unwrap()(args) };
    assert_eq!(rv, CKR_OK);
    // Safety: NULL is the only permitted argument.
    let rv = unsafe { functions.C_Finalize.unwrap()(ptr::null_mut()) };
    assert_eq!(rv, CKR_OK);

    daemon.halt()
}

#[test]
#[tracing_test::traced_test]
fn initialize_without_daemon_fails() -> anyhow::Result<()> {
    let _serial = SERIAL.lock().unwrap_or_else(PoisonError::into_inner);
    let directory = tempfile::tempdir()?;
    std::env::set_var(SOCKET_ENV, tokenward_test::socket_in(directory.path()));
    let functions = functions();

    // Safety: NULL arguments are permitted.
    let rv = unsafe { functions.C_Initialize.unwrap()(ptr::null_mut()) };
    assert_eq!(rv, cryptoki_sys::CKR_DEVICE_ERROR);
    // Safety: NULL is the only permitted argument.
    let rv = unsafe { functions.C_Finalize.unwrap()(ptr::null_mut()) };
    assert_eq!(rv, CKR_CRYPTOKI_NOT_INITIALIZED);

    Ok(())
}
