// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Key management functions.

use tracing::instrument;

use crate::{CLIENT, finish, input, mechanism, output, rv, template};
use cryptoki_sys::{
    CK_ATTRIBUTE_PTR, CK_BYTE_PTR, CK_MECHANISM_PTR, CK_OBJECT_HANDLE, CK_OBJECT_HANDLE_PTR, CK_RV,
    CK_SESSION_HANDLE, CK_ULONG, CK_ULONG_PTR, CKR_ARGUMENTS_BAD, CKR_OK,
};

// Implemented as described in Section 5.14.1 of the PKCS #11 specification, version 2.40.
#[instrument(ret)]
pub(crate) extern "C" fn C_GenerateKey(
    hSession: CK_SESSION_HANDLE,
    pMechanism: CK_MECHANISM_PTR,
    pTemplate: CK_ATTRIBUTE_PTR,
    ulCount: CK_ULONG,
    phKey: CK_OBJECT_HANDLE_PTR,
) -> CK_RV {
    if phKey.is_null() {
        return CKR_ARGUMENTS_BAD;
    }
    // Safety:
    // The mechanism and template are valid per the specification.
    let arguments = unsafe {
        mechanism(pMechanism).and_then(|mechanism| Ok((mechanism, template(pTemplate, ulCount)?)))
    };
    let result = arguments
        .and_then(|(mechanism, template)| CLIENT.generate_key(hSession, &mechanism, &template));
    match result {
        Ok(key) => {
            // Safety:
            // The pointer is non-NULL and receives the new key handle.
            unsafe { *phKey = key };
            CKR_OK
        }
        Err(error) => rv(Err(error)),
    }
}

// Implemented as described in Section 5.14.2 of the PKCS #11 specification, version 2.40.
#[instrument(ret)]
pub(crate) extern "C" fn C_GenerateKeyPair(
    hSession: CK_SESSION_HANDLE,
    pMechanism: CK_MECHANISM_PTR,
    pPublicKeyTemplate: CK_ATTRIBUTE_PTR,
    ulPublicKeyAttributeCount: CK_ULONG,
    pPrivateKeyTemplate: CK_ATTRIBUTE_PTR,
    ulPrivateKeyAttributeCount: CK_ULONG,
    phPublicKey: CK_OBJECT_HANDLE_PTR,
    phPrivateKey: CK_OBJECT_HANDLE_PTR,
) -> CK_RV {
    if phPublicKey.is_null() || phPrivateKey.is_null() {
        return CKR_ARGUMENTS_BAD;
    }
    // Safety:
    // The mechanism and both templates are valid per the specification.
    let arguments = unsafe {
        mechanism(pMechanism).and_then(|mechanism| {
            Ok((
                mechanism,
                template(pPublicKeyTemplate, ulPublicKeyAttributeCount)?,
                template(pPrivateKeyTemplate, ulPrivateKeyAttributeCount)?,
            ))
        })
    };
    let result = arguments.and_then(|(mechanism, public_template, private_template)| {
        CLIENT.generate_key_pair(hSession, &mechanism, &public_template, &private_template)
    });
    match result {
        Ok((public_key, private_key)) => {
            // Safety:
            // Both pointers are non-NULL and receive the new key handles.
            unsafe {
                *phPublicKey = public_key;
                *phPrivateKey = private_key;
            }
            CKR_OK
        }
        Err(error) => rv(Err(error)),
    }
}

// Implemented as described in Section 5.14.3 of the PKCS #11 specification, version 2.40.
#[instrument(ret)]
pub(crate) extern "C" fn C_WrapKey(
    hSession: CK_SESSION_HANDLE,
    pMechanism: CK_MECHANISM_PTR,
    hWrappingKey: CK_OBJECT_HANDLE,
    hKey: CK_OBJECT_HANDLE,
    pWrappedKey: CK_BYTE_PTR,
    pulWrappedKeyLen: CK_ULONG_PTR,
) -> CK_RV {
    // Safety:
    // The mechanism is valid and pulWrappedKeyLen holds the size of pWrappedKey per the
    // specification.
    let result = unsafe { mechanism(pMechanism) }.and_then(|mechanism| {
        // Safety:
        // As above.
        let wrapped = unsafe { output(pWrappedKey, pulWrappedKeyLen) }?;
        CLIENT.wrap_key(hSession, &mechanism, hWrappingKey, hKey, wrapped)
    });
    // Safety:
    // pulWrappedKeyLen is writable per the specification.
    unsafe { finish(result, pulWrappedKeyLen) }
}

// Implemented as described in Section 5.14.4 of the PKCS #11 specification, version 2.40.
#[instrument(ret)]
pub(crate) extern "C" fn C_UnwrapKey(
    hSession: CK_SESSION_HANDLE,
    pMechanism: CK_MECHANISM_PTR,
    hUnwrappingKey: CK_OBJECT_HANDLE,
    pWrappedKey: CK_BYTE_PTR,
    ulWrappedKeyLen: CK_ULONG,
    pTemplate: CK_ATTRIBUTE_PTR,
    ulAttributeCount: CK_ULONG,
    phKey: CK_OBJECT_HANDLE_PTR,
) -> CK_RV {
    if phKey.is_null() {
        return CKR_ARGUMENTS_BAD;
    }
    // Safety:
    // The mechanism, wrapped key and template are valid per the specification.
    let arguments = unsafe {
        mechanism(pMechanism).and_then(|mechanism| {
            Ok((
                mechanism,
                input(pWrappedKey, ulWrappedKeyLen)?,
                template(pTemplate, ulAttributeCount)?,
            ))
        })
    };
    let result = arguments.and_then(|(mechanism, wrapped, template)| {
        CLIENT.unwrap_key(hSession, &mechanism, hUnwrappingKey, wrapped, &template)
    });
    match result {
        Ok(key) => {
            // Safety:
            // The pointer is non-NULL and receives the new key handle.
            unsafe { *phKey = key };
            CKR_OK
        }
        Err(error) => rv(Err(error)),
    }
}

// Implemented as described in Section 5.14.5 of the PKCS #11 specification, version 2.40.
#[instrument(ret)]
pub(crate) extern "C" fn C_DeriveKey(
    hSession: CK_SESSION_HANDLE,
    pMechanism: CK_MECHANISM_PTR,
    hBaseKey: CK_OBJECT_HANDLE,
    pTemplate: CK_ATTRIBUTE_PTR,
    ulAttributeCount: CK_ULONG,
    phKey: CK_OBJECT_HANDLE_PTR,
) -> CK_RV {
    if phKey.is_null() {
        return CKR_ARGUMENTS_BAD;
    }
    // Safety:
    // The mechanism and template are valid per the specification.
    let arguments = unsafe {
        mechanism(pMechanism)
            .and_then(|mechanism| Ok((mechanism, template(pTemplate, ulAttributeCount)?)))
    };
    let result = arguments.and_then(|(mechanism, template)| {
        CLIENT.derive_key(hSession, &mechanism, hBaseKey, &template)
    });
    match result {
        Ok(key) => {
            // Safety:
            // The pointer is non-NULL and receives the new key handle.
            unsafe { *phKey = key };
            CKR_OK
        }
        Err(error) => rv(Err(error)),
    }
}
