// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! A PKCS#11 module that forwards every call to a tokenward daemon.
//!
//! The daemon's socket is found through the client configuration: the file named by
//! `TOKENWARD_CLIENT_CONFIG`, with `TOKENWARD_SOCKET` overriding the socket path. Logging
//! is controlled by `TOKENWARD_PKCS11_LOG` using the usual `tracing` filter syntax.
//!
//! Each thread of the host application talks to the daemon over its own connection, so
//! concurrent calls never wait on each other inside the module.

#![allow(non_snake_case)]
use std::{os::raw::c_void, sync::LazyLock};

use tokenward::{Client, Error, config::ClientConfig, mechanism::Mechanism, types::Attribute};
use tracing::{instrument, level_filters::LevelFilter};

use cryptoki_sys::{
    CK_ATTRIBUTE_PTR, CK_BYTE_PTR, CK_C_INITIALIZE_ARGS_PTR, CK_FUNCTION_LIST,
    CK_FUNCTION_LIST_PTR, CK_INFO, CK_INFO_PTR, CK_MECHANISM_PTR, CK_RV, CK_ULONG, CK_ULONG_PTR,
    CK_VERSION, CKF_OS_LOCKING_OK, CKR_ARGUMENTS_BAD, CKR_CANT_LOCK, CKR_GENERAL_ERROR, CKR_OK,
};

mod crypto;
mod interfaces;
mod keys;
mod objects;
mod session;
mod slot;

use interfaces::FUNCTIONS;
use tracing_subscriber::{EnvFilter, fmt::format::FmtSpan, layer::SubscriberExt};

static LOGGING: LazyLock<()> = LazyLock::new(|| {
    let log_filter = EnvFilter::builder()
        .with_env_var("TOKENWARD_PKCS11_LOG")
        .with_default_directive(LevelFilter::INFO.into())
        .from_env()
        .expect("Set a valid log filter");
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_writer(std::io::stderr);
    let registry = tracing_subscriber::registry()
        .with(stderr_layer)
        .with(log_filter);
    if tracing::subscriber::set_global_default(registry).is_err() {
        // The host application installed its own subscriber; use that one.
        tracing::debug!("A global tracing subscriber is already set");
    }
});

/// The connection to the daemon shared by every thread in the process.
static CLIENT: LazyLock<Client> = LazyLock::new(Client::new);

// Implemented as described in Section 5.4.1 of the PKCS #11 specification, version 2.40.
#[instrument(ret)]
extern "C" fn C_Initialize(pInitArgs: *mut c_void) -> CK_RV {
    if !pInitArgs.is_null() {
        let pInitArgs = pInitArgs as CK_C_INITIALIZE_ARGS_PTR;

        // Safety:
        // If non-null, the specification states it MUST point to a CK_C_INITIALIZE_ARGS structure.
        let args = unsafe { &*pInitArgs };
        if !args.pReserved.is_null() {
            return CKR_ARGUMENTS_BAD;
        }

        let mutex_functions = [
            args.CreateMutex.is_some(),
            args.DestroyMutex.is_some(),
            args.LockMutex.is_some(),
            args.UnlockMutex.is_some(),
        ];
        let mutex_functions_provided = mutex_functions.iter().all(|provided| *provided);
        if !mutex_functions_provided && mutex_functions.iter().any(|provided| *provided) {
            tracing::error!("Either all mutex functions must be provided or none of them");
            return CKR_ARGUMENTS_BAD;
        }
        if mutex_functions_provided && args.flags & CKF_OS_LOCKING_OK == 0 {
            // We don't implement using the provided mutex functions, so we inform
            // the caller that we can't lock.
            return CKR_CANT_LOCK;
        }
    }

    let config = match ClientConfig::from_env() {
        Ok(config) => config,
        Err(error) => {
            tracing::error!(?error, "Failed to load the client configuration");
            return CKR_GENERAL_ERROR;
        }
    };
    tracing::debug!(socket_path = ?config.socket_path, "Connecting to the tokenward daemon");
    let rv = rv(CLIENT.initialize(&config));
    if rv == CKR_OK {
        tracing::info!("Initialized tokenward-pkcs11 successfully");
    }
    rv
}

// Implemented as described in Section 5.4.2 of the PKCS #11 specification, version 2.40.
#[instrument(ret)]
extern "C" fn C_Finalize(pReserved: *mut c_void) -> CK_RV {
    if !pReserved.is_null() {
        return CKR_ARGUMENTS_BAD;
    }
    rv(CLIENT.finalize())
}

// Implemented as described in Section 5.4.3 of the PKCS #11 specification, version 2.40.
#[instrument(ret)]
extern "C" fn C_GetInfo(pInfo: CK_INFO_PTR) -> CK_RV {
    if pInfo.is_null() {
        return CKR_ARGUMENTS_BAD;
    }
    match CLIENT.get_info() {
        Ok(info) => {
            // Safety:
            // The pointer is a valid non-null pointer to a CK_INFO structure.
            unsafe {
                *pInfo = CK_INFO {
                    cryptokiVersion: version(info.cryptoki_version),
                    manufacturerID: info.manufacturer_id,
                    flags: info.flags,
                    libraryDescription: info.library_description,
                    libraryVersion: version(info.library_version),
                }
            };
            CKR_OK
        }
        Err(error) => rv(Err(error)),
    }
}

/// Implemented as described in Section 5.4.4 of the PKCS #11 specification, version 2.40.
///
/// # Safety
///
/// The caller must ensure the following:
/// - ppFunctionList must be a non-NULL pointer that points to a value which will receive a pointer
///   to a CK_FUNCTION_LIST object.
#[instrument(ret)]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn C_GetFunctionList(ppFunctionList: *mut CK_FUNCTION_LIST_PTR) -> CK_RV {
    // Set up logging as early as possible.
    *LOGGING;
    if ppFunctionList.is_null() {
        CKR_ARGUMENTS_BAD
    } else {
        // Safety:
        // The pointer is a valid non-null pointer to a CK_FUNCTION_LIST structure,
        // per the specification.
        unsafe {
            *ppFunctionList = &FUNCTIONS as *const CK_FUNCTION_LIST as CK_FUNCTION_LIST_PTR;
        }
        CKR_OK
    }
}

fn version(version: tokenward::types::Version) -> CK_VERSION {
    CK_VERSION {
        major: version.major,
        minor: version.minor,
    }
}

/// Convert the outcome of a client call into its PKCS#11 return value.
fn rv(result: Result<(), Error>) -> CK_RV {
    match result {
        Ok(()) => CKR_OK,
        Err(error) => {
            match &error {
                Error::Token(_) => tracing::debug!(%error, "The token refused the request"),
                Error::BufferTooSmall { .. } => tracing::debug!(%error),
                _ => tracing::warn!(%error, "Call failed"),
            }
            error.rv()
        }
    }
}

/// Borrow an input byte string from the caller.
///
/// A NULL pointer is an empty string as long as the length is zero.
///
/// # Safety
///
/// `data` must be NULL or point to `len` readable bytes which outlive `'a`.
unsafe fn input<'a>(data: CK_BYTE_PTR, len: CK_ULONG) -> Result<&'a [u8], Error> {
    if data.is_null() {
        if len == 0 {
            Ok(&[])
        } else {
            Err(Error::ArgumentsBad("NULL input with a non-zero length"))
        }
    } else {
        // Safety:
        // The caller guarantees `data` points to `len` bytes.
        Ok(unsafe { std::slice::from_raw_parts(data, len as usize) })
    }
}

/// Borrow an optional input, such as a PIN which may be entered on a protected path.
///
/// # Safety
///
/// `data` must be NULL or point to `len` readable bytes which outlive `'a`.
unsafe fn optional_input<'a>(data: CK_BYTE_PTR, len: CK_ULONG) -> Option<&'a [u8]> {
    if data.is_null() {
        None
    } else {
        // Safety:
        // The caller guarantees `data` points to `len` bytes.
        Some(unsafe { std::slice::from_raw_parts(data, len as usize) })
    }
}

/// Borrow the caller's output buffer for a two-phase call.
///
/// A NULL buffer asks for the length only.
///
/// # Safety
///
/// `len` must be NULL or valid for reads, and `data` must be NULL or point to `*len`
/// writable elements which outlive `'a`.
unsafe fn output<'a, T>(data: *mut T, len: CK_ULONG_PTR) -> Result<Option<&'a mut [T]>, Error> {
    if len.is_null() {
        return Err(Error::ArgumentsBad("NULL output length"));
    }
    if data.is_null() {
        Ok(None)
    } else {
        // Safety:
        // The caller guarantees `len` is readable and that `data` has room for `*len` elements.
        Ok(Some(unsafe {
            std::slice::from_raw_parts_mut(data, *len as usize)
        }))
    }
}

/// Report the outcome of a two-phase call, writing the length the caller needs to know.
///
/// # Safety
///
/// `len` must be NULL or valid for writes.
unsafe fn finish(result: Result<usize, Error>, len: CK_ULONG_PTR) -> CK_RV {
    let reported = match &result {
        Ok(written) => Some(*written as CK_ULONG),
        Err(Error::BufferTooSmall { required }) => Some(*required),
        Err(_) => None,
    };
    if let Some(reported) = reported {
        if len.is_null() {
            return CKR_ARGUMENTS_BAD;
        }
        // Safety:
        // The pointer is non-NULL and the caller guarantees it's writable.
        unsafe { *len = reported };
    }
    rv(result.map(|_| ()))
}

/// Read and classify the caller's mechanism.
///
/// # Safety
///
/// `mechanism` must be NULL or point to a valid `CK_MECHANISM` whose parameter, if any,
/// is `ulParameterLen` bytes long.
unsafe fn mechanism(mechanism: CK_MECHANISM_PTR) -> Result<Mechanism, Error> {
    if mechanism.is_null() {
        return Err(Error::ArgumentsBad("NULL mechanism"));
    }
    // Safety:
    // The pointer is non-NULL and the caller guarantees it's a CK_MECHANISM.
    let mechanism = unsafe { &*mechanism };
    // Safety:
    // Per the specification, pParameter holds ulParameterLen bytes when non-NULL.
    let parameter = unsafe {
        optional_input(
            mechanism.pParameter as CK_BYTE_PTR,
            mechanism.ulParameterLen,
        )
    };
    Mechanism::new(mechanism.mechanism, parameter)
}

/// Copy the caller's attribute template.
///
/// # Safety
///
/// `template` must be NULL or point to `count` valid `CK_ATTRIBUTE`s, each of whose
/// values is NULL or `ulValueLen` bytes long.
unsafe fn template(template: CK_ATTRIBUTE_PTR, count: CK_ULONG) -> Result<Vec<Attribute>, Error> {
    if template.is_null() {
        return if count == 0 {
            Ok(vec![])
        } else {
            Err(Error::ArgumentsBad("NULL template with a non-zero count"))
        };
    }
    // Safety:
    // The pointer is non-NULL and the caller guarantees it holds `count` attributes.
    let template = unsafe { std::slice::from_raw_parts(template, count as usize) };
    template
        .iter()
        .map(|attribute| {
            // Safety:
            // Per the specification, pValue holds ulValueLen bytes when non-NULL.
            let value = unsafe { input(attribute.pValue as CK_BYTE_PTR, attribute.ulValueLen)? };
            Ok(Attribute::new(attribute.type_, value))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use cryptoki_sys::{
        CK_ATTRIBUTE, CK_MECHANISM, CKA_LABEL, CKM_AES_GCM, CKM_SHA256, CKR_BUFFER_TOO_SMALL,
    };

    use super::*;

    #[test]
    fn null_input_needs_zero_length() {
        // Safety: the pointer is NULL.
        unsafe {
            assert_eq!(input(std::ptr::null_mut(), 0).unwrap(), &[] as &[u8]);
            assert!(matches!(
                input(std::ptr::null_mut(), 4),
                Err(Error::ArgumentsBad(_))
            ));
        }
    }

    #[test]
    fn finish_reports_required_length() {
        let mut len: CK_ULONG = 1;
        // Safety: `len` is a valid local.
        let rv = unsafe { finish(Err(Error::BufferTooSmall { required: 2 }), &mut len) };
        assert_eq!(rv, CKR_BUFFER_TOO_SMALL);
        assert_eq!(len, 2);

        // Safety: `len` is a valid local.
        let rv = unsafe { finish(Ok(7), &mut len) };
        assert_eq!(rv, CKR_OK);
        assert_eq!(len, 7);
    }

    #[test]
    fn finish_leaves_length_alone_on_other_errors() {
        let mut len: CK_ULONG = 9;
        let result = Err(Error::Token(cryptoki_sys::CKR_KEY_HANDLE_INVALID));
        // Safety: `len` is a valid local.
        let rv = unsafe { finish(result, &mut len) };
        assert_eq!(rv, cryptoki_sys::CKR_KEY_HANDLE_INVALID);
        assert_eq!(len, 9);
    }

    #[test]
    fn output_requires_length_pointer() {
        let mut buffer = [0u8; 4];
        // Safety: the buffer is valid and the length pointer is NULL.
        let result = unsafe { output(buffer.as_mut_ptr(), std::ptr::null_mut()) };
        assert!(matches!(result, Err(Error::ArgumentsBad(_))));
    }

    #[test]
    fn mechanism_is_classified() {
        let mut digest = CK_MECHANISM {
            mechanism: CKM_SHA256,
            pParameter: std::ptr::null_mut(),
            ulParameterLen: 0,
        };
        let mut gcm = CK_MECHANISM {
            mechanism: CKM_AES_GCM,
            pParameter: std::ptr::null_mut(),
            ulParameterLen: 0,
        };
        // Safety: both mechanisms are valid locals.
        unsafe {
            let classified = mechanism(&mut digest).unwrap();
            assert_eq!(classified.mechanism_type(), CKM_SHA256);
            assert_eq!(classified.parameter(), None);
            assert!(matches!(
                mechanism(&mut gcm),
                Err(Error::MechanismInvalid(CKM_AES_GCM))
            ));
        }
    }

    #[test]
    fn template_copies_values() {
        let mut label = *b"signing";
        let mut attributes = [CK_ATTRIBUTE {
            type_: CKA_LABEL,
            pValue: label.as_mut_ptr() as *mut c_void,
            ulValueLen: label.len() as CK_ULONG,
        }];
        // Safety: the template and its value are valid locals.
        let copied = unsafe { template(attributes.as_mut_ptr(), 1) }.unwrap();
        assert_eq!(copied, vec![Attribute::new(CKA_LABEL, b"signing".to_vec())]);
    }
}
