// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Object management functions.

use tokenward::AttributeQuery;
use tracing::instrument;

use crate::{CLIENT, rv, template};
use cryptoki_sys::{
    CK_ATTRIBUTE_PTR, CK_OBJECT_HANDLE, CK_OBJECT_HANDLE_PTR, CK_RV, CK_SESSION_HANDLE, CK_ULONG,
    CK_ULONG_PTR, CKR_ARGUMENTS_BAD, CKR_OK,
};

// Implemented as described in Section 5.7.1 of the PKCS #11 specification, version 2.40.
#[instrument(ret)]
pub(crate) extern "C" fn C_CreateObject(
    hSession: CK_SESSION_HANDLE,
    pTemplate: CK_ATTRIBUTE_PTR,
    ulCount: CK_ULONG,
    phObject: CK_OBJECT_HANDLE_PTR,
) -> CK_RV {
    if phObject.is_null() {
        return CKR_ARGUMENTS_BAD;
    }
    // Safety:
    // pTemplate holds ulCount attributes per the specification.
    let result = unsafe { template(pTemplate, ulCount) }
        .and_then(|template| CLIENT.create_object(hSession, &template));
    match result {
        Ok(object) => {
            // Safety:
            // The pointer is non-NULL and receives the new handle.
            unsafe { *phObject = object };
            CKR_OK
        }
        Err(error) => rv(Err(error)),
    }
}

// Implemented as described in Section 5.7.2 of the PKCS #11 specification, version 2.40.
#[instrument(ret)]
pub(crate) extern "C" fn C_CopyObject(
    hSession: CK_SESSION_HANDLE,
    hObject: CK_OBJECT_HANDLE,
    pTemplate: CK_ATTRIBUTE_PTR,
    ulCount: CK_ULONG,
    phNewObject: CK_OBJECT_HANDLE_PTR,
) -> CK_RV {
    if phNewObject.is_null() {
        return CKR_ARGUMENTS_BAD;
    }
    // Safety:
    // pTemplate holds ulCount attributes per the specification.
    let result = unsafe { template(pTemplate, ulCount) }
        .and_then(|template| CLIENT.copy_object(hSession, hObject, &template));
    match result {
        Ok(object) => {
            // Safety:
            // The pointer is non-NULL and receives the new handle.
            unsafe { *phNewObject = object };
            CKR_OK
        }
        Err(error) => rv(Err(error)),
    }
}

#[instrument(ret)]
pub(crate) extern "C" fn C_DestroyObject(
    hSession: CK_SESSION_HANDLE,
    hObject: CK_OBJECT_HANDLE,
) -> CK_RV {
    rv(CLIENT.destroy_object(hSession, hObject))
}

#[instrument(ret)]
pub(crate) extern "C" fn C_GetObjectSize(
    hSession: CK_SESSION_HANDLE,
    hObject: CK_OBJECT_HANDLE,
    pulSize: CK_ULONG_PTR,
) -> CK_RV {
    if pulSize.is_null() {
        return CKR_ARGUMENTS_BAD;
    }
    match CLIENT.get_object_size(hSession, hObject) {
        Ok(size) => {
            // Safety:
            // The pointer is non-NULL and receives the size.
            unsafe { *pulSize = size };
            CKR_OK
        }
        Err(error) => rv(Err(error)),
    }
}

// Implemented as described in Section 5.7.5 of the PKCS #11 specification, version 2.40.
//
// Every attribute's ulValueLen is updated, including when the call as a whole fails with
// CKR_BUFFER_TOO_SMALL, CKR_ATTRIBUTE_SENSITIVE or CKR_ATTRIBUTE_TYPE_INVALID.
#[instrument(ret)]
pub(crate) extern "C" fn C_GetAttributeValue(
    hSession: CK_SESSION_HANDLE,
    hObject: CK_OBJECT_HANDLE,
    pTemplate: CK_ATTRIBUTE_PTR,
    ulCount: CK_ULONG,
) -> CK_RV {
    if pTemplate.is_null() {
        return CKR_ARGUMENTS_BAD;
    }
    // Safety:
    // The pointer is non-NULL and holds ulCount attributes per the specification.
    let attributes = unsafe { std::slice::from_raw_parts_mut(pTemplate, ulCount as usize) };
    let mut queries = attributes
        .iter()
        .map(|attribute| AttributeQuery {
            attribute_type: attribute.type_,
            buffer: if attribute.pValue.is_null() {
                None
            } else {
                // Safety:
                // A non-NULL pValue has room for ulValueLen bytes.
                Some(unsafe {
                    std::slice::from_raw_parts_mut(
                        attribute.pValue as *mut u8,
                        attribute.ulValueLen as usize,
                    )
                })
            },
            length: attribute.ulValueLen,
        })
        .collect::<Vec<_>>();

    let result = CLIENT.get_attribute_value(hSession, hObject, &mut queries);
    for (attribute, query) in attributes.iter_mut().zip(&queries) {
        attribute.ulValueLen = query.length;
    }
    rv(result)
}

#[instrument(ret)]
pub(crate) extern "C" fn C_SetAttributeValue(
    hSession: CK_SESSION_HANDLE,
    hObject: CK_OBJECT_HANDLE,
    pTemplate: CK_ATTRIBUTE_PTR,
    ulCount: CK_ULONG,
) -> CK_RV {
    // Safety:
    // pTemplate holds ulCount attributes per the specification.
    let result = unsafe { template(pTemplate, ulCount) }
        .and_then(|template| CLIENT.set_attribute_value(hSession, hObject, &template));
    rv(result)
}

// Implemented as described in Section 5.7.7 of the PKCS #11 specification, version 2.40.
#[instrument(ret)]
pub(crate) extern "C" fn C_FindObjectsInit(
    hSession: CK_SESSION_HANDLE,
    pTemplate: CK_ATTRIBUTE_PTR,
    ulCount: CK_ULONG,
) -> CK_RV {
    // Safety:
    // pTemplate holds ulCount attributes per the specification.
    let result = unsafe { template(pTemplate, ulCount) }
        .and_then(|template| CLIENT.find_objects_init(hSession, &template));
    rv(result)
}

// Implemented as described in Section 5.7.8 of the PKCS #11 specification, version 2.40.
#[instrument(ret)]
pub(crate) extern "C" fn C_FindObjects(
    hSession: CK_SESSION_HANDLE,
    phObject: CK_OBJECT_HANDLE_PTR,
    ulMaxObjectCount: CK_ULONG,
    pulObjectCount: CK_ULONG_PTR,
) -> CK_RV {
    if phObject.is_null() || pulObjectCount.is_null() {
        return CKR_ARGUMENTS_BAD;
    }
    // Safety:
    // The pointer is non-NULL and has room for ulMaxObjectCount handles.
    let objects = unsafe { std::slice::from_raw_parts_mut(phObject, ulMaxObjectCount as usize) };
    match CLIENT.find_objects(hSession, objects) {
        Ok(found) => {
            // Safety:
            // The pointer is non-NULL and receives the number of handles written.
            unsafe { *pulObjectCount = found as CK_ULONG };
            CKR_OK
        }
        Err(error) => rv(Err(error)),
    }
}

#[instrument(ret)]
pub(crate) extern "C" fn C_FindObjectsFinal(hSession: CK_SESSION_HANDLE) -> CK_RV {
    rv(CLIENT.find_objects_final(hSession))
}
