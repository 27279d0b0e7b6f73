// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Encryption, decryption, digest, signing, verification and random number functions.
//!
//! These all follow a handful of shapes, so each C function hands its pointers to one of
//! the helpers below along with the client method to call.

use tokenward::{Error, mechanism::Mechanism};
use tracing::instrument;

use crate::{CLIENT, finish, input, mechanism, output, rv};
use cryptoki_sys::{
    CK_BYTE_PTR, CK_MECHANISM_PTR, CK_OBJECT_HANDLE, CK_RV, CK_SESSION_HANDLE, CK_ULONG,
    CK_ULONG_PTR, CKR_ARGUMENTS_BAD,
};

/// Classify the mechanism, then start an operation with it.
///
/// A mechanism that can't be sent is refused before anything reaches the daemon.
///
/// # Safety
///
/// `pMechanism` must be NULL or point to a valid `CK_MECHANISM`.
unsafe fn begin(
    pMechanism: CK_MECHANISM_PTR,
    start: impl FnOnce(&Mechanism) -> Result<(), Error>,
) -> CK_RV {
    // Safety:
    // Upheld by the caller.
    rv(unsafe { mechanism(pMechanism) }.and_then(|mechanism| start(&mechanism)))
}

/// Feed input to an operation that produces no output.
///
/// # Safety
///
/// `data` must be NULL or point to `len` readable bytes.
unsafe fn consume(
    data: CK_BYTE_PTR,
    len: CK_ULONG,
    call: impl FnOnce(&[u8]) -> Result<(), Error>,
) -> CK_RV {
    // Safety:
    // Upheld by the caller.
    rv(unsafe { input(data, len) }.and_then(call))
}

/// Feed input to an operation and collect its output with the two-phase convention.
///
/// # Safety
///
/// `data` must be NULL or point to `len` readable bytes; `out_len` must be NULL or
/// valid for reads and writes, and `out` must be NULL or have room for `*out_len` bytes.
unsafe fn transform(
    data: CK_BYTE_PTR,
    len: CK_ULONG,
    out: CK_BYTE_PTR,
    out_len: CK_ULONG_PTR,
    call: impl FnOnce(&[u8], Option<&mut [u8]>) -> Result<usize, Error>,
) -> CK_RV {
    // Safety:
    // Upheld by the caller.
    let result = unsafe { input(data, len) }.and_then(|data| {
        // Safety:
        // Upheld by the caller.
        let buffer = unsafe { output(out, out_len) }?;
        call(data, buffer)
    });
    // Safety:
    // Upheld by the caller.
    unsafe { finish(result, out_len) }
}

/// Collect the final output of an operation with the two-phase convention.
///
/// # Safety
///
/// `out_len` must be NULL or valid for reads and writes, and `out` must be NULL or have
/// room for `*out_len` bytes.
unsafe fn produce(
    out: CK_BYTE_PTR,
    out_len: CK_ULONG_PTR,
    call: impl FnOnce(Option<&mut [u8]>) -> Result<usize, Error>,
) -> CK_RV {
    // Safety:
    // Upheld by the caller.
    let result = unsafe { output(out, out_len) }.and_then(call);
    // Safety:
    // Upheld by the caller.
    unsafe { finish(result, out_len) }
}

// Implemented as described in Section 5.8 of the PKCS #11 specification, version 2.40.
#[instrument(ret)]
pub(crate) extern "C" fn C_EncryptInit(
    hSession: CK_SESSION_HANDLE,
    pMechanism: CK_MECHANISM_PTR,
    hKey: CK_OBJECT_HANDLE,
) -> CK_RV {
    // Safety:
    // pMechanism points to a CK_MECHANISM per the specification.
    unsafe { begin(pMechanism, |mechanism| CLIENT.encrypt_init(hSession, mechanism, hKey)) }
}

#[instrument(ret, skip(pData, ulDataLen))]
pub(crate) extern "C" fn C_Encrypt(
    hSession: CK_SESSION_HANDLE,
    pData: CK_BYTE_PTR,
    ulDataLen: CK_ULONG,
    pEncryptedData: CK_BYTE_PTR,
    pulEncryptedDataLen: CK_ULONG_PTR,
) -> CK_RV {
    // Safety:
    // The buffers and lengths are paired per the specification.
    unsafe {
        transform(
            pData,
            ulDataLen,
            pEncryptedData,
            pulEncryptedDataLen,
            |data, out| CLIENT.encrypt(hSession, data, out),
        )
    }
}

#[instrument(ret, skip(pPart, ulPartLen))]
pub(crate) extern "C" fn C_EncryptUpdate(
    hSession: CK_SESSION_HANDLE,
    pPart: CK_BYTE_PTR,
    ulPartLen: CK_ULONG,
    pEncryptedPart: CK_BYTE_PTR,
    pulEncryptedPartLen: CK_ULONG_PTR,
) -> CK_RV {
    // Safety:
    // The buffers and lengths are paired per the specification.
    unsafe {
        transform(
            pPart,
            ulPartLen,
            pEncryptedPart,
            pulEncryptedPartLen,
            |data, out| CLIENT.encrypt_update(hSession, data, out),
        )
    }
}

#[instrument(ret)]
pub(crate) extern "C" fn C_EncryptFinal(
    hSession: CK_SESSION_HANDLE,
    pLastEncryptedPart: CK_BYTE_PTR,
    pulLastEncryptedPartLen: CK_ULONG_PTR,
) -> CK_RV {
    // Safety:
    // The buffer and length are paired per the specification.
    unsafe {
        produce(pLastEncryptedPart, pulLastEncryptedPartLen, |out| {
            CLIENT.encrypt_final(hSession, out)
        })
    }
}

// Implemented as described in Section 5.9 of the PKCS #11 specification, version 2.40.
#[instrument(ret)]
pub(crate) extern "C" fn C_DecryptInit(
    hSession: CK_SESSION_HANDLE,
    pMechanism: CK_MECHANISM_PTR,
    hKey: CK_OBJECT_HANDLE,
) -> CK_RV {
    // Safety:
    // pMechanism points to a CK_MECHANISM per the specification.
    unsafe { begin(pMechanism, |mechanism| CLIENT.decrypt_init(hSession, mechanism, hKey)) }
}

#[instrument(ret, skip(pData, pulDataLen))]
pub(crate) extern "C" fn C_Decrypt(
    hSession: CK_SESSION_HANDLE,
    pEncryptedData: CK_BYTE_PTR,
    ulEncryptedDataLen: CK_ULONG,
    pData: CK_BYTE_PTR,
    pulDataLen: CK_ULONG_PTR,
) -> CK_RV {
    // Safety:
    // The buffers and lengths are paired per the specification.
    unsafe {
        transform(
            pEncryptedData,
            ulEncryptedDataLen,
            pData,
            pulDataLen,
            |data, out| CLIENT.decrypt(hSession, data, out),
        )
    }
}

#[instrument(ret, skip(pPart, pulPartLen))]
pub(crate) extern "C" fn C_DecryptUpdate(
    hSession: CK_SESSION_HANDLE,
    pEncryptedPart: CK_BYTE_PTR,
    ulEncryptedPartLen: CK_ULONG,
    pPart: CK_BYTE_PTR,
    pulPartLen: CK_ULONG_PTR,
) -> CK_RV {
    // Safety:
    // The buffers and lengths are paired per the specification.
    unsafe {
        transform(
            pEncryptedPart,
            ulEncryptedPartLen,
            pPart,
            pulPartLen,
            |data, out| CLIENT.decrypt_update(hSession, data, out),
        )
    }
}

#[instrument(ret, skip(pLastPart, pulLastPartLen))]
pub(crate) extern "C" fn C_DecryptFinal(
    hSession: CK_SESSION_HANDLE,
    pLastPart: CK_BYTE_PTR,
    pulLastPartLen: CK_ULONG_PTR,
) -> CK_RV {
    // Safety:
    // The buffer and length are paired per the specification.
    unsafe { produce(pLastPart, pulLastPartLen, |out| CLIENT.decrypt_final(hSession, out)) }
}

// Implemented as described in Section 5.10 of the PKCS #11 specification, version 2.40.
#[instrument(ret)]
pub(crate) extern "C" fn C_DigestInit(
    hSession: CK_SESSION_HANDLE,
    pMechanism: CK_MECHANISM_PTR,
) -> CK_RV {
    // Safety:
    // pMechanism points to a CK_MECHANISM per the specification.
    unsafe { begin(pMechanism, |mechanism| CLIENT.digest_init(hSession, mechanism)) }
}

#[instrument(ret, skip(pData, ulDataLen))]
pub(crate) extern "C" fn C_Digest(
    hSession: CK_SESSION_HANDLE,
    pData: CK_BYTE_PTR,
    ulDataLen: CK_ULONG,
    pDigest: CK_BYTE_PTR,
    pulDigestLen: CK_ULONG_PTR,
) -> CK_RV {
    // Safety:
    // The buffers and lengths are paired per the specification.
    unsafe {
        transform(pData, ulDataLen, pDigest, pulDigestLen, |data, out| {
            CLIENT.digest(hSession, data, out)
        })
    }
}

#[instrument(ret, skip(pPart, ulPartLen))]
pub(crate) extern "C" fn C_DigestUpdate(
    hSession: CK_SESSION_HANDLE,
    pPart: CK_BYTE_PTR,
    ulPartLen: CK_ULONG,
) -> CK_RV {
    // Safety:
    // pPart holds ulPartLen bytes per the specification.
    unsafe { consume(pPart, ulPartLen, |data| CLIENT.digest_update(hSession, data)) }
}

#[instrument(ret)]
pub(crate) extern "C" fn C_DigestKey(hSession: CK_SESSION_HANDLE, hKey: CK_OBJECT_HANDLE) -> CK_RV {
    rv(CLIENT.digest_key(hSession, hKey))
}

#[instrument(ret)]
pub(crate) extern "C" fn C_DigestFinal(
    hSession: CK_SESSION_HANDLE,
    pDigest: CK_BYTE_PTR,
    pulDigestLen: CK_ULONG_PTR,
) -> CK_RV {
    // Safety:
    // The buffer and length are paired per the specification.
    unsafe { produce(pDigest, pulDigestLen, |out| CLIENT.digest_final(hSession, out)) }
}

// Implemented as described in Section 5.11 of the PKCS #11 specification, version 2.40.
#[instrument(ret)]
pub(crate) extern "C" fn C_SignInit(
    hSession: CK_SESSION_HANDLE,
    pMechanism: CK_MECHANISM_PTR,
    hKey: CK_OBJECT_HANDLE,
) -> CK_RV {
    // Safety:
    // pMechanism points to a CK_MECHANISM per the specification.
    unsafe { begin(pMechanism, |mechanism| CLIENT.sign_init(hSession, mechanism, hKey)) }
}

#[instrument(ret, skip(pData, ulDataLen))]
pub(crate) extern "C" fn C_Sign(
    hSession: CK_SESSION_HANDLE,
    pData: CK_BYTE_PTR,
    ulDataLen: CK_ULONG,
    pSignature: CK_BYTE_PTR,
    pulSignatureLen: CK_ULONG_PTR,
) -> CK_RV {
    // Safety:
    // The buffers and lengths are paired per the specification.
    unsafe {
        transform(pData, ulDataLen, pSignature, pulSignatureLen, |data, out| {
            CLIENT.sign(hSession, data, out)
        })
    }
}

#[instrument(ret, skip(pPart, ulPartLen))]
pub(crate) extern "C" fn C_SignUpdate(
    hSession: CK_SESSION_HANDLE,
    pPart: CK_BYTE_PTR,
    ulPartLen: CK_ULONG,
) -> CK_RV {
    // Safety:
    // pPart holds ulPartLen bytes per the specification.
    unsafe { consume(pPart, ulPartLen, |data| CLIENT.sign_update(hSession, data)) }
}

#[instrument(ret)]
pub(crate) extern "C" fn C_SignFinal(
    hSession: CK_SESSION_HANDLE,
    pSignature: CK_BYTE_PTR,
    pulSignatureLen: CK_ULONG_PTR,
) -> CK_RV {
    // Safety:
    // The buffer and length are paired per the specification.
    unsafe { produce(pSignature, pulSignatureLen, |out| CLIENT.sign_final(hSession, out)) }
}

#[instrument(ret)]
pub(crate) extern "C" fn C_SignRecoverInit(
    hSession: CK_SESSION_HANDLE,
    pMechanism: CK_MECHANISM_PTR,
    hKey: CK_OBJECT_HANDLE,
) -> CK_RV {
    // Safety:
    // pMechanism points to a CK_MECHANISM per the specification.
    unsafe {
        begin(pMechanism, |mechanism| {
            CLIENT.sign_recover_init(hSession, mechanism, hKey)
        })
    }
}

#[instrument(ret, skip(pData, ulDataLen))]
pub(crate) extern "C" fn C_SignRecover(
    hSession: CK_SESSION_HANDLE,
    pData: CK_BYTE_PTR,
    ulDataLen: CK_ULONG,
    pSignature: CK_BYTE_PTR,
    pulSignatureLen: CK_ULONG_PTR,
) -> CK_RV {
    // Safety:
    // The buffers and lengths are paired per the specification.
    unsafe {
        transform(pData, ulDataLen, pSignature, pulSignatureLen, |data, out| {
            CLIENT.sign_recover(hSession, data, out)
        })
    }
}

// Implemented as described in Section 5.12 of the PKCS #11 specification, version 2.40.
#[instrument(ret)]
pub(crate) extern "C" fn C_VerifyInit(
    hSession: CK_SESSION_HANDLE,
    pMechanism: CK_MECHANISM_PTR,
    hKey: CK_OBJECT_HANDLE,
) -> CK_RV {
    // Safety:
    // pMechanism points to a CK_MECHANISM per the specification.
    unsafe { begin(pMechanism, |mechanism| CLIENT.verify_init(hSession, mechanism, hKey)) }
}

#[instrument(ret, skip(pData, ulDataLen))]
pub(crate) extern "C" fn C_Verify(
    hSession: CK_SESSION_HANDLE,
    pData: CK_BYTE_PTR,
    ulDataLen: CK_ULONG,
    pSignature: CK_BYTE_PTR,
    ulSignatureLen: CK_ULONG,
) -> CK_RV {
    // Safety:
    // Each buffer holds the number of bytes given with it.
    let result = unsafe { input(pData, ulDataLen) }.and_then(|data| {
        // Safety:
        // Each buffer holds the number of bytes given with it.
        let signature = unsafe { input(pSignature, ulSignatureLen) }?;
        CLIENT.verify(hSession, data, signature)
    });
    rv(result)
}

#[instrument(ret, skip(pPart, ulPartLen))]
pub(crate) extern "C" fn C_VerifyUpdate(
    hSession: CK_SESSION_HANDLE,
    pPart: CK_BYTE_PTR,
    ulPartLen: CK_ULONG,
) -> CK_RV {
    // Safety:
    // pPart holds ulPartLen bytes per the specification.
    unsafe { consume(pPart, ulPartLen, |data| CLIENT.verify_update(hSession, data)) }
}

#[instrument(ret)]
pub(crate) extern "C" fn C_VerifyFinal(
    hSession: CK_SESSION_HANDLE,
    pSignature: CK_BYTE_PTR,
    ulSignatureLen: CK_ULONG,
) -> CK_RV {
    // Safety:
    // pSignature holds ulSignatureLen bytes per the specification.
    unsafe {
        consume(pSignature, ulSignatureLen, |signature| {
            CLIENT.verify_final(hSession, signature)
        })
    }
}

#[instrument(ret)]
pub(crate) extern "C" fn C_VerifyRecoverInit(
    hSession: CK_SESSION_HANDLE,
    pMechanism: CK_MECHANISM_PTR,
    hKey: CK_OBJECT_HANDLE,
) -> CK_RV {
    // Safety:
    // pMechanism points to a CK_MECHANISM per the specification.
    unsafe {
        begin(pMechanism, |mechanism| {
            CLIENT.verify_recover_init(hSession, mechanism, hKey)
        })
    }
}

#[instrument(ret, skip(pData, pulDataLen))]
pub(crate) extern "C" fn C_VerifyRecover(
    hSession: CK_SESSION_HANDLE,
    pSignature: CK_BYTE_PTR,
    ulSignatureLen: CK_ULONG,
    pData: CK_BYTE_PTR,
    pulDataLen: CK_ULONG_PTR,
) -> CK_RV {
    // Safety:
    // The buffers and lengths are paired per the specification.
    unsafe {
        transform(pSignature, ulSignatureLen, pData, pulDataLen, |signature, out| {
            CLIENT.verify_recover(hSession, signature, out)
        })
    }
}

// Implemented as described in Section 5.13 of the PKCS #11 specification, version 2.40.
#[instrument(ret, skip(pPart, ulPartLen))]
pub(crate) extern "C" fn C_DigestEncryptUpdate(
    hSession: CK_SESSION_HANDLE,
    pPart: CK_BYTE_PTR,
    ulPartLen: CK_ULONG,
    pEncryptedPart: CK_BYTE_PTR,
    pulEncryptedPartLen: CK_ULONG_PTR,
) -> CK_RV {
    // Safety:
    // The buffers and lengths are paired per the specification.
    unsafe {
        transform(
            pPart,
            ulPartLen,
            pEncryptedPart,
            pulEncryptedPartLen,
            |data, out| CLIENT.digest_encrypt_update(hSession, data, out),
        )
    }
}

#[instrument(ret, skip(pPart, pulPartLen))]
pub(crate) extern "C" fn C_DecryptDigestUpdate(
    hSession: CK_SESSION_HANDLE,
    pEncryptedPart: CK_BYTE_PTR,
    ulEncryptedPartLen: CK_ULONG,
    pPart: CK_BYTE_PTR,
    pulPartLen: CK_ULONG_PTR,
) -> CK_RV {
    // Safety:
    // The buffers and lengths are paired per the specification.
    unsafe {
        transform(
            pEncryptedPart,
            ulEncryptedPartLen,
            pPart,
            pulPartLen,
            |data, out| CLIENT.decrypt_digest_update(hSession, data, out),
        )
    }
}

#[instrument(ret, skip(pPart, ulPartLen))]
pub(crate) extern "C" fn C_SignEncryptUpdate(
    hSession: CK_SESSION_HANDLE,
    pPart: CK_BYTE_PTR,
    ulPartLen: CK_ULONG,
    pEncryptedPart: CK_BYTE_PTR,
    pulEncryptedPartLen: CK_ULONG_PTR,
) -> CK_RV {
    // Safety:
    // The buffers and lengths are paired per the specification.
    unsafe {
        transform(
            pPart,
            ulPartLen,
            pEncryptedPart,
            pulEncryptedPartLen,
            |data, out| CLIENT.sign_encrypt_update(hSession, data, out),
        )
    }
}

#[instrument(ret, skip(pPart, pulPartLen))]
pub(crate) extern "C" fn C_DecryptVerifyUpdate(
    hSession: CK_SESSION_HANDLE,
    pEncryptedPart: CK_BYTE_PTR,
    ulEncryptedPartLen: CK_ULONG,
    pPart: CK_BYTE_PTR,
    pulPartLen: CK_ULONG_PTR,
) -> CK_RV {
    // Safety:
    // The buffers and lengths are paired per the specification.
    unsafe {
        transform(
            pEncryptedPart,
            ulEncryptedPartLen,
            pPart,
            pulPartLen,
            |data, out| CLIENT.decrypt_verify_update(hSession, data, out),
        )
    }
}

// Implemented as described in Section 5.15 of the PKCS #11 specification, version 2.40.
#[instrument(ret, skip(pSeed, ulSeedLen))]
pub(crate) extern "C" fn C_SeedRandom(
    hSession: CK_SESSION_HANDLE,
    pSeed: CK_BYTE_PTR,
    ulSeedLen: CK_ULONG,
) -> CK_RV {
    // Safety:
    // pSeed holds ulSeedLen bytes per the specification.
    unsafe { consume(pSeed, ulSeedLen, |seed| CLIENT.seed_random(hSession, seed)) }
}

#[instrument(ret, skip(RandomData))]
pub(crate) extern "C" fn C_GenerateRandom(
    hSession: CK_SESSION_HANDLE,
    RandomData: CK_BYTE_PTR,
    ulRandomLen: CK_ULONG,
) -> CK_RV {
    if RandomData.is_null() {
        return if ulRandomLen == 0 {
            rv(CLIENT.generate_random(hSession, &mut []))
        } else {
            CKR_ARGUMENTS_BAD
        };
    }
    // Safety:
    // The pointer is non-NULL and has room for ulRandomLen bytes.
    let buffer = unsafe { std::slice::from_raw_parts_mut(RandomData, ulRandomLen as usize) };
    rv(CLIENT.generate_random(hSession, buffer))
}
