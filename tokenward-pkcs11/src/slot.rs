// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Slot and token management functions.

use tracing::instrument;

use crate::{CLIENT, finish, optional_input, output, rv, version};
use cryptoki_sys::{
    CK_BBOOL, CK_FALSE, CK_FLAGS, CK_MECHANISM_INFO, CK_MECHANISM_INFO_PTR, CK_MECHANISM_TYPE,
    CK_MECHANISM_TYPE_PTR, CK_RV, CK_SLOT_ID, CK_SLOT_ID_PTR, CK_SLOT_INFO, CK_SLOT_INFO_PTR,
    CK_TOKEN_INFO, CK_TOKEN_INFO_PTR, CK_ULONG, CK_ULONG_PTR, CK_UTF8CHAR_PTR, CK_VOID_PTR,
    CKR_ARGUMENTS_BAD, CKR_OK,
};

/// The width of the label passed to `C_InitToken`.
const LABEL_LEN: usize = 32;

// Implemented as described in Section 5.5.1 of the PKCS #11 specification, version 2.40.
#[instrument(ret)]
pub(crate) extern "C" fn C_GetSlotList(
    tokenPresent: CK_BBOOL,
    pSlotList: CK_SLOT_ID_PTR,
    pulCount: CK_ULONG_PTR,
) -> CK_RV {
    // Safety:
    // Per the specification, pulCount points to the number of slots pSlotList has room for.
    let result = unsafe { output(pSlotList, pulCount) }
        .and_then(|slots| CLIENT.get_slot_list(tokenPresent != CK_FALSE, slots));
    // Safety:
    // pulCount is writable per the specification.
    unsafe { finish(result, pulCount) }
}

// Implemented as described in Section 5.5.2 of the PKCS #11 specification, version 2.40.
#[instrument(ret)]
pub(crate) extern "C" fn C_GetSlotInfo(slotID: CK_SLOT_ID, pInfo: CK_SLOT_INFO_PTR) -> CK_RV {
    if pInfo.is_null() {
        return CKR_ARGUMENTS_BAD;
    }
    match CLIENT.get_slot_info(slotID) {
        Ok(info) => {
            // Safety:
            // The pointer is non-NULL and must point to a CK_SLOT_INFO structure.
            unsafe {
                *pInfo = CK_SLOT_INFO {
                    slotDescription: info.slot_description,
                    manufacturerID: info.manufacturer_id,
                    flags: info.flags,
                    hardwareVersion: version(info.hardware_version),
                    firmwareVersion: version(info.firmware_version),
                }
            };
            CKR_OK
        }
        Err(error) => rv(Err(error)),
    }
}

// Implemented as described in Section 5.5.3 of the PKCS #11 specification, version 2.40.
#[instrument(ret)]
pub(crate) extern "C" fn C_GetTokenInfo(slotID: CK_SLOT_ID, pInfo: CK_TOKEN_INFO_PTR) -> CK_RV {
    if pInfo.is_null() {
        return CKR_ARGUMENTS_BAD;
    }
    match CLIENT.get_token_info(slotID) {
        Ok(info) => {
            // Safety:
            // The pointer is non-NULL and must point to a CK_TOKEN_INFO structure.
            unsafe {
                *pInfo = CK_TOKEN_INFO {
                    label: info.label,
                    manufacturerID: info.manufacturer_id,
                    model: info.model,
                    serialNumber: info.serial_number,
                    flags: info.flags,
                    ulMaxSessionCount: info.max_session_count,
                    ulSessionCount: info.session_count,
                    ulMaxRwSessionCount: info.max_rw_session_count,
                    ulRwSessionCount: info.rw_session_count,
                    ulMaxPinLen: info.max_pin_len,
                    ulMinPinLen: info.min_pin_len,
                    ulTotalPublicMemory: info.total_public_memory,
                    ulFreePublicMemory: info.free_public_memory,
                    ulTotalPrivateMemory: info.total_private_memory,
                    ulFreePrivateMemory: info.free_private_memory,
                    hardwareVersion: version(info.hardware_version),
                    firmwareVersion: version(info.firmware_version),
                    utcTime: info.utc_time,
                }
            };
            CKR_OK
        }
        Err(error) => rv(Err(error)),
    }
}

// Implemented as described in Section 5.5.5 of the PKCS #11 specification, version 2.40.
#[instrument(ret)]
pub(crate) extern "C" fn C_GetMechanismList(
    slotID: CK_SLOT_ID,
    pMechanismList: CK_MECHANISM_TYPE_PTR,
    pulCount: CK_ULONG_PTR,
) -> CK_RV {
    // Safety:
    // Per the specification, pulCount points to the number of mechanisms pMechanismList has
    // room for.
    let result = unsafe { output(pMechanismList, pulCount) }
        .and_then(|mechanisms| CLIENT.get_mechanism_list(slotID, mechanisms));
    // Safety:
    // pulCount is writable per the specification.
    unsafe { finish(result, pulCount) }
}

// Implemented as described in Section 5.5.6 of the PKCS #11 specification, version 2.40.
#[instrument(ret)]
pub(crate) extern "C" fn C_GetMechanismInfo(
    slotID: CK_SLOT_ID,
    mechType: CK_MECHANISM_TYPE,
    pInfo: CK_MECHANISM_INFO_PTR,
) -> CK_RV {
    if pInfo.is_null() {
        return CKR_ARGUMENTS_BAD;
    }
    match CLIENT.get_mechanism_info(slotID, mechType) {
        Ok(info) => {
            // Safety:
            // The pointer is non-NULL and must point to a CK_MECHANISM_INFO structure.
            unsafe {
                *pInfo = CK_MECHANISM_INFO {
                    ulMinKeySize: info.min_key_size,
                    ulMaxKeySize: info.max_key_size,
                    flags: info.flags,
                }
            };
            CKR_OK
        }
        Err(error) => rv(Err(error)),
    }
}

// Implemented as described in Section 5.5.7 of the PKCS #11 specification, version 2.40.
#[instrument(ret, skip(pPin, ulPinLen))]
pub(crate) extern "C" fn C_InitToken(
    slotID: CK_SLOT_ID,
    pPin: CK_UTF8CHAR_PTR,
    ulPinLen: CK_ULONG,
    pLabel: CK_UTF8CHAR_PTR,
) -> CK_RV {
    if pLabel.is_null() {
        return CKR_ARGUMENTS_BAD;
    }
    // Safety:
    // The label is a 32 byte, blank padded field per the specification.
    let label = unsafe { std::slice::from_raw_parts(pLabel, LABEL_LEN) };
    // Safety:
    // If non-NULL, pPin points to ulPinLen bytes.
    let pin = unsafe { optional_input(pPin, ulPinLen) };
    rv(CLIENT.init_token(slotID, pin, label))
}

// Implemented as described in Section 5.5.4 of the PKCS #11 specification, version 2.40.
#[instrument(ret)]
pub(crate) extern "C" fn C_WaitForSlotEvent(
    flags: CK_FLAGS,
    pSlot: CK_SLOT_ID_PTR,
    pReserved: CK_VOID_PTR,
) -> CK_RV {
    if pSlot.is_null() || !pReserved.is_null() {
        return CKR_ARGUMENTS_BAD;
    }
    match CLIENT.wait_for_slot_event(flags) {
        Ok(slot) => {
            // Safety:
            // The pointer is non-NULL and receives the slot id per the specification.
            unsafe { *pSlot = slot };
            CKR_OK
        }
        Err(error) => rv(Err(error)),
    }
}
