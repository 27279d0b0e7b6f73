// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Session management functions.
//!
//! Sessions live in the daemon; the module only passes handles through.

use tracing::instrument;

use crate::{CLIENT, finish, input, optional_input, output, rv};
use cryptoki_sys::{
    CK_BYTE_PTR, CK_FLAGS, CK_NOTIFY, CK_OBJECT_HANDLE, CK_RV, CK_SESSION_HANDLE,
    CK_SESSION_HANDLE_PTR, CK_SESSION_INFO, CK_SESSION_INFO_PTR, CK_SLOT_ID, CK_ULONG,
    CK_ULONG_PTR, CK_USER_TYPE, CK_UTF8CHAR_PTR, CK_VOID_PTR, CKR_ARGUMENTS_BAD, CKR_OK,
};

// Implemented as described in Section 5.6.1 of the PKCS #11 specification, version 2.40.
//
// Callbacks can't be delivered across the socket, so pApplication and Notify are ignored.
#[instrument(ret)]
pub(crate) extern "C" fn C_OpenSession(
    slotID: CK_SLOT_ID,
    flags: CK_FLAGS,
    _pApplication: CK_VOID_PTR,
    _Notify: CK_NOTIFY,
    phSession: CK_SESSION_HANDLE_PTR,
) -> CK_RV {
    if phSession.is_null() {
        return CKR_ARGUMENTS_BAD;
    }
    match CLIENT.open_session(slotID, flags) {
        Ok(session) => {
            // Safety:
            // The pointer is non-NULL and receives the session handle per the specification.
            unsafe { *phSession = session };
            CKR_OK
        }
        Err(error) => rv(Err(error)),
    }
}

// Implemented as described in Section 5.6.2 of the PKCS #11 specification, version 2.40.
#[instrument(ret)]
pub(crate) extern "C" fn C_CloseSession(hSession: CK_SESSION_HANDLE) -> CK_RV {
    rv(CLIENT.close_session(hSession))
}

// Implemented as described in Section 5.6.3 of the PKCS #11 specification, version 2.40.
#[instrument(ret)]
pub(crate) extern "C" fn C_CloseAllSessions(slotID: CK_SLOT_ID) -> CK_RV {
    rv(CLIENT.close_all_sessions(slotID))
}

// Implemented as described in Section 5.6.4 of the PKCS #11 specification, version 2.40.
#[instrument(ret)]
pub(crate) extern "C" fn C_GetSessionInfo(
    hSession: CK_SESSION_HANDLE,
    pInfo: CK_SESSION_INFO_PTR,
) -> CK_RV {
    if pInfo.is_null() {
        return CKR_ARGUMENTS_BAD;
    }
    match CLIENT.get_session_info(hSession) {
        Ok(info) => {
            // Safety:
            // The pointer is non-NULL and must point to a CK_SESSION_INFO structure.
            unsafe {
                *pInfo = CK_SESSION_INFO {
                    slotID: info.slot_id,
                    state: info.state,
                    flags: info.flags,
                    ulDeviceError: info.device_error,
                }
            };
            CKR_OK
        }
        Err(error) => rv(Err(error)),
    }
}

#[instrument(ret)]
pub(crate) extern "C" fn C_GetFunctionStatus(hSession: CK_SESSION_HANDLE) -> CK_RV {
    rv(CLIENT.get_function_status(hSession))
}

#[instrument(ret)]
pub(crate) extern "C" fn C_CancelFunction(hSession: CK_SESSION_HANDLE) -> CK_RV {
    rv(CLIENT.cancel_function(hSession))
}

#[instrument(ret, skip(pPin, ulPinLen))]
pub(crate) extern "C" fn C_InitPIN(
    hSession: CK_SESSION_HANDLE,
    pPin: CK_UTF8CHAR_PTR,
    ulPinLen: CK_ULONG,
) -> CK_RV {
    // Safety:
    // If non-NULL, pPin points to ulPinLen bytes.
    let pin = unsafe { optional_input(pPin, ulPinLen) };
    rv(CLIENT.init_pin(hSession, pin))
}

#[instrument(ret, skip(pOldPin, ulOldLen, pNewPin, ulNewLen))]
pub(crate) extern "C" fn C_SetPIN(
    hSession: CK_SESSION_HANDLE,
    pOldPin: CK_UTF8CHAR_PTR,
    ulOldLen: CK_ULONG,
    pNewPin: CK_UTF8CHAR_PTR,
    ulNewLen: CK_ULONG,
) -> CK_RV {
    // Safety:
    // If non-NULL, each PIN points to the number of bytes given with it.
    let (old_pin, new_pin) = unsafe {
        (
            optional_input(pOldPin, ulOldLen),
            optional_input(pNewPin, ulNewLen),
        )
    };
    rv(CLIENT.set_pin(hSession, old_pin, new_pin))
}

#[instrument(ret)]
pub(crate) extern "C" fn C_GetOperationState(
    hSession: CK_SESSION_HANDLE,
    pOperationState: CK_BYTE_PTR,
    pulOperationStateLen: CK_ULONG_PTR,
) -> CK_RV {
    // Safety:
    // Per the specification, pulOperationStateLen holds the size of pOperationState.
    let result = unsafe { output(pOperationState, pulOperationStateLen) }
        .and_then(|state| CLIENT.get_operation_state(hSession, state));
    // Safety:
    // pulOperationStateLen is writable per the specification.
    unsafe { finish(result, pulOperationStateLen) }
}

#[instrument(ret)]
pub(crate) extern "C" fn C_SetOperationState(
    hSession: CK_SESSION_HANDLE,
    pOperationState: CK_BYTE_PTR,
    ulOperationStateLen: CK_ULONG,
    hEncryptionKey: CK_OBJECT_HANDLE,
    hAuthenticationKey: CK_OBJECT_HANDLE,
) -> CK_RV {
    // Safety:
    // pOperationState holds ulOperationStateLen bytes per the specification.
    let result = unsafe { input(pOperationState, ulOperationStateLen) }.and_then(|state| {
        CLIENT.set_operation_state(hSession, state, hEncryptionKey, hAuthenticationKey)
    });
    rv(result)
}

// Implemented as described in Section 5.6.9 of the PKCS #11 specification, version 2.40.
#[instrument(ret, skip(pPin, ulPinLen))]
pub(crate) extern "C" fn C_Login(
    hSession: CK_SESSION_HANDLE,
    userType: CK_USER_TYPE,
    pPin: CK_UTF8CHAR_PTR,
    ulPinLen: CK_ULONG,
) -> CK_RV {
    // Safety:
    // If non-NULL, pPin points to ulPinLen bytes.
    let pin = unsafe { optional_input(pPin, ulPinLen) };
    rv(CLIENT.login(hSession, userType, pin))
}

#[instrument(ret)]
pub(crate) extern "C" fn C_Logout(hSession: CK_SESSION_HANDLE) -> CK_RV {
    rv(CLIENT.logout(hSession))
}
