// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! The function list handed to applications by `C_GetFunctionList`.

use cryptoki_sys::{CK_FUNCTION_LIST, CK_VERSION};

use crate::{
    C_Finalize, C_GetFunctionList, C_GetInfo, C_Initialize,
    crypto::{
        C_Decrypt, C_DecryptDigestUpdate, C_DecryptFinal, C_DecryptInit, C_DecryptUpdate,
        C_DecryptVerifyUpdate, C_Digest, C_DigestEncryptUpdate, C_DigestFinal, C_DigestInit,
        C_DigestKey, C_DigestUpdate, C_Encrypt, C_EncryptFinal, C_EncryptInit, C_EncryptUpdate,
        C_GenerateRandom, C_SeedRandom, C_Sign, C_SignEncryptUpdate, C_SignFinal, C_SignInit,
        C_SignRecover, C_SignRecoverInit, C_SignUpdate, C_Verify, C_VerifyFinal, C_VerifyInit,
        C_VerifyRecover, C_VerifyRecoverInit, C_VerifyUpdate,
    },
    keys::{C_DeriveKey, C_GenerateKey, C_GenerateKeyPair, C_UnwrapKey, C_WrapKey},
    objects::{
        C_CopyObject, C_CreateObject, C_DestroyObject, C_FindObjects, C_FindObjectsFinal,
        C_FindObjectsInit, C_GetAttributeValue, C_GetObjectSize, C_SetAttributeValue,
    },
    session::{
        C_CancelFunction, C_CloseAllSessions, C_CloseSession, C_GetFunctionStatus,
        C_GetOperationState, C_GetSessionInfo, C_InitPIN, C_Login, C_Logout, C_OpenSession,
        C_SetOperationState, C_SetPIN,
    },
    slot::{
        C_GetMechanismInfo, C_GetMechanismList, C_GetSlotInfo, C_GetSlotList, C_GetTokenInfo,
        C_InitToken, C_WaitForSlotEvent,
    },
};

pub(crate) static FUNCTIONS: CK_FUNCTION_LIST = CK_FUNCTION_LIST {
    version: CK_VERSION {
        major: 2,
        minor: 40,
    },
    C_Initialize: Some(C_Initialize),
    C_Finalize: Some(C_Finalize),
    C_GetInfo: Some(C_GetInfo),
    C_GetFunctionList: Some(C_GetFunctionList),
    C_GetSlotList: Some(C_GetSlotList),
    C_GetSlotInfo: Some(C_GetSlotInfo),
    C_GetTokenInfo: Some(C_GetTokenInfo),
    C_GetMechanismList: Some(C_GetMechanismList),
    C_GetMechanismInfo: Some(C_GetMechanismInfo),
    C_InitToken: Some(C_InitToken),
    C_InitPIN: Some(C_InitPIN),
    C_SetPIN: Some(C_SetPIN),
    C_OpenSession: Some(C_OpenSession),
    C_CloseSession: Some(C_CloseSession),
    C_CloseAllSessions: Some(C_CloseAllSessions),
    C_GetSessionInfo: Some(C_GetSessionInfo),
    C_GetOperationState: Some(C_GetOperationState),
    C_SetOperationState: Some(C_SetOperationState),
    C_Login: Some(C_Login),
    C_Logout: Some(C_Logout),
    C_CreateObject: Some(C_CreateObject),
    C_CopyObject: Some(C_CopyObject),
    C_DestroyObject: Some(C_DestroyObject),
    C_GetObjectSize: Some(C_GetObjectSize),
    C_GetAttributeValue: Some(C_GetAttributeValue),
    C_SetAttributeValue: Some(C_SetAttributeValue),
    C_FindObjectsInit: Some(C_FindObjectsInit),
    C_FindObjects: Some(C_FindObjects),
    C_FindObjectsFinal: Some(C_FindObjectsFinal),
    C_EncryptInit: Some(C_EncryptInit),
    C_Encrypt: Some(C_Encrypt),
    C_EncryptUpdate: Some(C_EncryptUpdate),
    C_EncryptFinal: Some(C_EncryptFinal),
    C_DecryptInit: Some(C_DecryptInit),
    C_Decrypt: Some(C_Decrypt),
    C_DecryptUpdate: Some(C_DecryptUpdate),
    C_DecryptFinal: Some(C_DecryptFinal),
    C_DigestInit: Some(C_DigestInit),
    C_Digest: Some(C_Digest),
    C_DigestUpdate: Some(C_DigestUpdate),
    C_DigestKey: Some(C_DigestKey),
    C_DigestFinal: Some(C_DigestFinal),
    C_SignInit: Some(C_SignInit),
    C_Sign: Some(C_Sign),
    C_SignUpdate: Some(C_SignUpdate),
    C_SignFinal: Some(C_SignFinal),
    C_SignRecoverInit: Some(C_SignRecoverInit),
    C_SignRecover: Some(C_SignRecover),
    C_VerifyInit: Some(C_VerifyInit),
    C_Verify: Some(C_Verify),
    C_VerifyUpdate: Some(C_VerifyUpdate),
    C_VerifyFinal: Some(C_VerifyFinal),
    C_VerifyRecoverInit: Some(C_VerifyRecoverInit),
    C_VerifyRecover: Some(C_VerifyRecover),
    C_DigestEncryptUpdate: Some(C_DigestEncryptUpdate),
    C_DecryptDigestUpdate: Some(C_DecryptDigestUpdate),
    C_SignEncryptUpdate: Some(C_SignEncryptUpdate),
    C_DecryptVerifyUpdate: Some(C_DecryptVerifyUpdate),
    C_GenerateKey: Some(C_GenerateKey),
    C_GenerateKeyPair: Some(C_GenerateKeyPair),
    C_WrapKey: Some(C_WrapKey),
    C_UnwrapKey: Some(C_UnwrapKey),
    C_DeriveKey: Some(C_DeriveKey),
    C_SeedRandom: Some(C_SeedRandom),
    C_GenerateRandom: Some(C_GenerateRandom),
    C_GetFunctionStatus: Some(C_GetFunctionStatus),
    C_CancelFunction: Some(C_CancelFunction),
    C_WaitForSlotEvent: Some(C_WaitForSlotEvent),
};
