// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Mechanisms which can be sent to the daemon.
//!
//! Native mechanism parameters are C structures which may contain pointers into the
//! calling process, so they can't be transmitted in general. Only two shapes travel over
//! the wire: mechanisms that take no parameter, and mechanisms whose parameter is a plain
//! byte string or a pointer-free structure that can be copied verbatim.

use cryptoki_sys::{
    CK_MECHANISM_TYPE, CKM_AES_CBC, CKM_AES_CBC_PAD, CKM_AES_CMAC, CKM_AES_CTR, CKM_AES_ECB,
    CKM_AES_KEY_GEN, CKM_AES_MAC, CKM_DES_CBC, CKM_DES_CBC_PAD, CKM_DES_ECB, CKM_DES_KEY_GEN,
    CKM_DES_MAC, CKM_DES2_KEY_GEN, CKM_DES3_CBC, CKM_DES3_CBC_PAD, CKM_DES3_ECB, CKM_DES3_KEY_GEN,
    CKM_DES3_MAC, CKM_DH_PKCS_KEY_PAIR_GEN, CKM_DH_PKCS_PARAMETER_GEN, CKM_DSA,
    CKM_DSA_KEY_PAIR_GEN, CKM_DSA_PARAMETER_GEN, CKM_DSA_SHA1, CKM_EC_KEY_PAIR_GEN, CKM_ECDSA,
    CKM_ECDSA_SHA1, CKM_ECDSA_SHA224, CKM_ECDSA_SHA256, CKM_ECDSA_SHA384, CKM_ECDSA_SHA512,
    CKM_GENERIC_SECRET_KEY_GEN, CKM_MD5, CKM_MD5_HMAC, CKM_MD5_RSA_PKCS, CKM_RSA_PKCS,
    CKM_RSA_PKCS_KEY_PAIR_GEN, CKM_RSA_PKCS_PSS, CKM_RSA_X_509, CKM_RSA_X9_31,
    CKM_RSA_X9_31_KEY_PAIR_GEN, CKM_SHA_1, CKM_SHA_1_HMAC, CKM_SHA1_RSA_PKCS,
    CKM_SHA1_RSA_PKCS_PSS, CKM_SHA1_RSA_X9_31, CKM_SHA224, CKM_SHA224_HMAC, CKM_SHA224_RSA_PKCS,
    CKM_SHA224_RSA_PKCS_PSS, CKM_SHA256, CKM_SHA256_HMAC, CKM_SHA256_RSA_PKCS,
    CKM_SHA256_RSA_PKCS_PSS, CKM_SHA384, CKM_SHA384_HMAC, CKM_SHA384_RSA_PKCS,
    CKM_SHA384_RSA_PKCS_PSS, CKM_SHA512, CKM_SHA512_HMAC, CKM_SHA512_RSA_PKCS,
    CKM_SHA512_RSA_PKCS_PSS, CKM_X9_42_DH_KEY_PAIR_GEN, CKM_X9_42_DH_PARAMETER_GEN,
};

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shape {
    NoParameters,
    Blob,
}

fn shape(mechanism_type: CK_MECHANISM_TYPE) -> Option<Shape> {
    match mechanism_type {
        CKM_RSA_PKCS_KEY_PAIR_GEN
        | CKM_RSA_X9_31_KEY_PAIR_GEN
        | CKM_RSA_PKCS
        | CKM_RSA_X_509
        | CKM_RSA_X9_31
        | CKM_MD5_RSA_PKCS
        | CKM_SHA1_RSA_PKCS
        | CKM_SHA224_RSA_PKCS
        | CKM_SHA256_RSA_PKCS
        | CKM_SHA384_RSA_PKCS
        | CKM_SHA512_RSA_PKCS
        | CKM_SHA1_RSA_X9_31
        | CKM_DSA_KEY_PAIR_GEN
        | CKM_DSA_PARAMETER_GEN
        | CKM_DSA
        | CKM_DSA_SHA1
        | CKM_EC_KEY_PAIR_GEN
        | CKM_ECDSA
        | CKM_ECDSA_SHA1
        | CKM_ECDSA_SHA224
        | CKM_ECDSA_SHA256
        | CKM_ECDSA_SHA384
        | CKM_ECDSA_SHA512
        | CKM_DH_PKCS_KEY_PAIR_GEN
        | CKM_DH_PKCS_PARAMETER_GEN
        | CKM_X9_42_DH_KEY_PAIR_GEN
        | CKM_X9_42_DH_PARAMETER_GEN
        | CKM_GENERIC_SECRET_KEY_GEN
        | CKM_AES_KEY_GEN
        | CKM_AES_ECB
        | CKM_AES_MAC
        | CKM_AES_CMAC
        | CKM_DES_KEY_GEN
        | CKM_DES2_KEY_GEN
        | CKM_DES3_KEY_GEN
        | CKM_DES_ECB
        | CKM_DES3_ECB
        | CKM_DES_MAC
        | CKM_DES3_MAC
        | CKM_MD5
        | CKM_MD5_HMAC
        | CKM_SHA_1
        | CKM_SHA_1_HMAC
        | CKM_SHA224
        | CKM_SHA224_HMAC
        | CKM_SHA256
        | CKM_SHA256_HMAC
        | CKM_SHA384
        | CKM_SHA384_HMAC
        | CKM_SHA512
        | CKM_SHA512_HMAC => Some(Shape::NoParameters),
        // The IV, the CTR counter block, or the pointer-free CK_RSA_PKCS_PSS_PARAMS.
        CKM_AES_CBC
        | CKM_AES_CBC_PAD
        | CKM_AES_CTR
        | CKM_DES_CBC
        | CKM_DES_CBC_PAD
        | CKM_DES3_CBC
        | CKM_DES3_CBC_PAD
        | CKM_RSA_PKCS_PSS
        | CKM_SHA1_RSA_PKCS_PSS
        | CKM_SHA224_RSA_PKCS_PSS
        | CKM_SHA256_RSA_PKCS_PSS
        | CKM_SHA384_RSA_PKCS_PSS
        | CKM_SHA512_RSA_PKCS_PSS => Some(Shape::Blob),
        _ => None,
    }
}

/// A mechanism that is safe to transmit.
///
/// The fields are private and the only way to build one is [`Mechanism::new`], which
/// rejects everything off the allow-list, so holding a `Mechanism` means it can be encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mechanism {
    mechanism_type: CK_MECHANISM_TYPE,
    parameter: Option<Vec<u8>>,
}

impl Mechanism {
    /// Classify a mechanism and its parameter.
    ///
    /// Parameterless mechanisms ignore whatever parameter the caller supplied.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MechanismInvalid`] if the mechanism isn't on the allow-list or if
    /// it needs a parameter and none was given.
    pub fn new(mechanism_type: CK_MECHANISM_TYPE, parameter: Option<&[u8]>) -> Result<Self, Error> {
        let parameter = match (shape(mechanism_type), parameter) {
            (Some(Shape::NoParameters), _) => None,
            (Some(Shape::Blob), Some(parameter)) => Some(parameter.to_vec()),
            (Some(Shape::Blob), None) | (None, _) => {
                return Err(Error::MechanismInvalid(mechanism_type))
            }
        };
        Ok(Self {
            mechanism_type,
            parameter,
        })
    }

    /// Build a mechanism without consulting the allow-list, so the encoder's own check can be
    /// exercised.
    #[cfg(test)]
    pub(crate) fn unchecked(mechanism_type: CK_MECHANISM_TYPE, parameter: Option<&[u8]>) -> Self {
        Self {
            mechanism_type,
            parameter: parameter.map(<[u8]>::to_vec),
        }
    }

    pub fn mechanism_type(&self) -> CK_MECHANISM_TYPE {
        self.mechanism_type
    }

    pub fn parameter(&self) -> Option<&[u8]> {
        self.parameter.as_deref()
    }
}

/// Whether a mechanism type can be used over RPC at all.
pub fn is_supported(mechanism_type: CK_MECHANISM_TYPE) -> bool {
    shape(mechanism_type).is_some()
}

/// Remove mechanism types that can't be used over RPC from a list reported by the token.
pub fn purge_unsupported(mechanisms: &mut Vec<CK_MECHANISM_TYPE>) {
    mechanisms.retain(|mechanism_type| {
        let supported = is_supported(*mechanism_type);
        if !supported {
            tracing::debug!(mechanism_type, "Hiding mechanism that can't be used over RPC");
        }
        supported
    });
}

#[cfg(test)]
mod tests {
    use cryptoki_sys::{CKM_AES_GCM, CKM_ECDH1_DERIVE, CKM_RSA_PKCS_OAEP, CKM_VENDOR_DEFINED};

    use super::*;

    #[test]
    fn parameterless_mechanisms_drop_parameters() {
        let mechanism = Mechanism::new(CKM_SHA256_RSA_PKCS, Some(&b"ignored"[..])).unwrap();
        assert_eq!(mechanism, Mechanism::new(CKM_SHA256_RSA_PKCS, None).unwrap());
        assert_eq!(mechanism.mechanism_type(), CKM_SHA256_RSA_PKCS);
        assert_eq!(mechanism.parameter(), None);
    }

    #[test]
    fn blob_mechanisms_keep_parameters() {
        let iv = [7_u8; 16];
        let mechanism = Mechanism::new(CKM_AES_CBC_PAD, Some(&iv[..])).unwrap();
        assert_eq!(mechanism.mechanism_type(), CKM_AES_CBC_PAD);
        assert_eq!(mechanism.parameter(), Some(&iv[..]));
    }

    #[test]
    fn blob_mechanism_without_parameter() {
        assert!(matches!(
            Mechanism::new(CKM_AES_CBC, None),
            Err(Error::MechanismInvalid(CKM_AES_CBC))
        ));
    }

    #[test]
    fn pointer_bearing_mechanisms_are_rejected() {
        for mechanism_type in [
            CKM_RSA_PKCS_OAEP,
            CKM_AES_GCM,
            CKM_ECDH1_DERIVE,
            CKM_VENDOR_DEFINED,
        ] {
            assert!(matches!(
                Mechanism::new(mechanism_type, Some(&[0_u8; 40][..])),
                Err(Error::MechanismInvalid(m)) if m == mechanism_type
            ));
            assert!(!is_supported(mechanism_type));
        }
    }

    #[test]
    fn purge() {
        let mut mechanisms = vec![CKM_RSA_PKCS, CKM_RSA_PKCS_OAEP, CKM_SHA256, CKM_AES_GCM];
        purge_unsupported(&mut mechanisms);
        assert_eq!(mechanisms, vec![CKM_RSA_PKCS, CKM_SHA256]);
    }
}
