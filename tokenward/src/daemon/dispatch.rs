// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Decoding requests, invoking the token, and encoding its answers.

use cryptoki_sys::{
    CK_RV, CK_ULONG, CKR_ARGUMENTS_BAD, CKR_DEVICE_ERROR, CKR_GENERAL_ERROR,
    CKR_MECHANISM_INVALID, CKR_OK,
};
use tracing::{Level, instrument};

use crate::{
    HANDSHAKE,
    calls::{CallId, ERROR_CALL_ID},
    daemon::Token,
    error::Error,
    message::{Direction, Header, Message, Value, Values},
    types::{AttributeValue, Payload},
};

/// Why a request wasn't answered with the call's outputs.
#[derive(Debug)]
struct Rejected(CK_RV);

impl From<CK_RV> for Rejected {
    fn from(rv: CK_RV) -> Self {
        if rv == CKR_OK {
            tracing::error!("Token reported CKR_OK as an error");
            Self(CKR_GENERAL_ERROR)
        } else {
            Self(rv)
        }
    }
}

impl From<Error> for Rejected {
    fn from(error: Error) -> Self {
        tracing::warn!(%error, "Rejecting request");
        match error {
            Error::MechanismInvalid(_) => Self(CKR_MECHANISM_INVALID),
            _ => Self(CKR_DEVICE_ERROR),
        }
    }
}

/// Answer one request body, returning the response body.
///
/// Every request gets an answer. Requests that can't be decoded are answered with
/// `CKR_DEVICE_ERROR`, except for mechanisms that can't be used over RPC which are
/// answered with `CKR_MECHANISM_INVALID`.
#[instrument(level = Level::DEBUG, skip_all, fields(call = tracing::field::Empty))]
pub fn dispatch(token: &dyn Token, body: &[u8]) -> Vec<u8> {
    let mut request = Message::new();
    request.set_verify(true);
    let outcome = decode(&mut request, body).and_then(|(call, arguments)| {
        tracing::Span::current().record("call", call.name());
        handle(token, call, arguments).map(|outputs| (call, outputs))
    });

    let mut response = Message::new();
    let encoded = match outcome {
        Ok((call, outputs)) => response
            .prepare(call, Direction::Response)
            .and_then(|()| response.write_all(&outputs)),
        Err(Rejected(rv)) => {
            tracing::debug!(rv, "Answering with an error");
            response.prepare_error(rv)
        }
    };
    match encoded {
        Ok(()) => response.as_bytes().to_vec(),
        Err(error) => {
            tracing::error!(%error, "Failed to encode the response");
            error_body(CKR_DEVICE_ERROR)
        }
    }
}

fn error_body(rv: CK_RV) -> Vec<u8> {
    let rv = u32::try_from(rv).unwrap_or(u32::MAX);
    let mut body = ERROR_CALL_ID.to_be_bytes().to_vec();
    body.extend_from_slice(&rv.to_be_bytes());
    body
}

fn decode(request: &mut Message, body: &[u8]) -> Result<(CallId, Values), Rejected> {
    request.load(body)?;
    let call = match request.parse(Direction::Request)? {
        Header::Call(call) => call,
        Header::Error(_) => return Err(Rejected(CKR_DEVICE_ERROR)),
    };
    Ok((call, request.read_all()?))
}

/// Re-size a two-phase result against the client's buffer.
fn fit<T>(payload: Payload<Vec<T>>, capacity: Option<CK_ULONG>) -> Payload<Vec<T>> {
    match payload {
        Payload::Value(data) => Payload::for_capacity(data, capacity),
        length => length,
    }
}

fn bytes(payload: Payload<Vec<u8>>, capacity: Option<CK_ULONG>) -> Value {
    Value::ByteArray(fit(payload, capacity))
}

fn handle(token: &dyn Token, call: CallId, mut args: Values) -> Result<Vec<Value>, Rejected> {
    let args = &mut args;
    let outputs = match call {
        CallId::Initialize => {
            if args.bytes()? != HANDSHAKE {
                tracing::warn!("Client sent an unknown protocol handshake");
                return Err(Rejected(CKR_GENERAL_ERROR));
            }
            vec![]
        }
        CallId::Finalize => {
            token.finalize()?;
            vec![]
        }
        CallId::GetInfo => vec![Value::Info(token.get_info()?)],
        CallId::GetSlotList => {
            let token_present = args.byte()? != 0;
            let capacity = args.ulong_buffer()?;
            let slots = token.get_slot_list(token_present, capacity)?;
            vec![Value::UlongArray(fit(slots, capacity))]
        }
        CallId::GetSlotInfo => vec![Value::SlotInfo(token.get_slot_info(args.ulong()?)?)],
        CallId::GetTokenInfo => vec![Value::TokenInfo(token.get_token_info(args.ulong()?)?)],
        CallId::GetMechanismList => {
            let slot = args.ulong()?;
            let capacity = args.ulong_buffer()?;
            let mechanisms = token.get_mechanism_list(slot, capacity)?;
            vec![Value::UlongArray(fit(mechanisms, capacity))]
        }
        CallId::GetMechanismInfo => {
            let slot = args.ulong()?;
            let mechanism_type = args.mechanism_type()?;
            vec![Value::MechanismInfo(
                token.get_mechanism_info(slot, mechanism_type)?,
            )]
        }
        CallId::InitToken => {
            let slot = args.ulong()?;
            let pin = args.optional_bytes()?;
            let label = args.zero_string()?;
            token.init_token(slot, pin.as_deref(), &label)?;
            vec![]
        }
        CallId::WaitForSlotEvent => vec![Value::Ulong(token.wait_for_slot_event(args.ulong()?)?)],
        CallId::OpenSession => {
            let slot = args.ulong()?;
            let flags = args.ulong()?;
            vec![Value::Ulong(token.open_session(slot, flags)?)]
        }
        CallId::CloseSession => {
            token.close_session(args.ulong()?)?;
            vec![]
        }
        CallId::CloseAllSessions => {
            token.close_all_sessions(args.ulong()?)?;
            vec![]
        }
        CallId::GetFunctionStatus => {
            token.get_function_status(args.ulong()?)?;
            vec![]
        }
        CallId::CancelFunction => {
            token.cancel_function(args.ulong()?)?;
            vec![]
        }
        CallId::GetSessionInfo => vec![Value::SessionInfo(token.get_session_info(args.ulong()?)?)],
        CallId::InitPin => {
            let session = args.ulong()?;
            let pin = args.optional_bytes()?;
            token.init_pin(session, pin.as_deref())?;
            vec![]
        }
        CallId::SetPin => {
            let session = args.ulong()?;
            let old_pin = args.optional_bytes()?;
            let new_pin = args.optional_bytes()?;
            token.set_pin(session, old_pin.as_deref(), new_pin.as_deref())?;
            vec![]
        }
        CallId::GetOperationState => {
            let session = args.ulong()?;
            let capacity = args.byte_buffer()?;
            vec![bytes(token.get_operation_state(session, capacity)?, capacity)]
        }
        CallId::SetOperationState => {
            let session = args.ulong()?;
            let state = args.bytes()?;
            let encryption_key = args.ulong()?;
            let authentication_key = args.ulong()?;
            token.set_operation_state(session, &state, encryption_key, authentication_key)?;
            vec![]
        }
        CallId::Login => {
            let session = args.ulong()?;
            let user_type = args.ulong()?;
            let pin = args.optional_bytes()?;
            token.login(session, user_type, pin.as_deref())?;
            vec![]
        }
        CallId::Logout => {
            token.logout(args.ulong()?)?;
            vec![]
        }
        CallId::CreateObject => {
            let session = args.ulong()?;
            let template = args.attribute_array()?;
            vec![Value::Ulong(token.create_object(session, &template)?)]
        }
        CallId::CopyObject => {
            let session = args.ulong()?;
            let object = args.ulong()?;
            let template = args.attribute_array()?;
            vec![Value::Ulong(token.copy_object(session, object, &template)?)]
        }
        CallId::DestroyObject => {
            let session = args.ulong()?;
            token.destroy_object(session, args.ulong()?)?;
            vec![]
        }
        CallId::GetObjectSize => {
            let session = args.ulong()?;
            vec![Value::Ulong(token.get_object_size(session, args.ulong()?)?)]
        }
        CallId::GetAttributeValue => {
            let session = args.ulong()?;
            let object = args.ulong()?;
            let requests = args.attribute_buffer()?;
            let mut answer = token.get_attribute_value(session, object, &requests)?;
            if answer.attributes.len() != requests.len() {
                tracing::error!(
                    requested = requests.len(),
                    answered = answer.attributes.len(),
                    "Token answered for the wrong number of attributes"
                );
                return Err(Rejected(CKR_DEVICE_ERROR));
            }
            for (attribute, request) in answer.attributes.iter_mut().zip(&requests) {
                if let AttributeValue::Bytes(value) = &attribute.value {
                    let len = value.len() as CK_ULONG;
                    if request.capacity.is_none_or(|capacity| len > capacity) {
                        attribute.value = AttributeValue::Length(len);
                    }
                }
            }
            vec![Value::AttributeArray(answer.attributes), Value::Ulong(answer.rv)]
        }
        CallId::SetAttributeValue => {
            let session = args.ulong()?;
            let object = args.ulong()?;
            let template = args.attribute_array()?;
            token.set_attribute_value(session, object, &template)?;
            vec![]
        }
        CallId::FindObjectsInit => {
            let session = args.ulong()?;
            token.find_objects_init(session, &args.attribute_array()?)?;
            vec![]
        }
        CallId::FindObjects => {
            let session = args.ulong()?;
            let max_count = args.ulong_buffer()?.unwrap_or(0);
            let mut objects = token.find_objects(session, max_count)?;
            let max = usize::try_from(max_count).unwrap_or(usize::MAX);
            if objects.len() > max {
                tracing::warn!(found = objects.len(), max, "Token returned too many objects");
                objects.truncate(max);
            }
            vec![Value::UlongArray(Payload::Value(objects))]
        }
        CallId::FindObjectsFinal => {
            token.find_objects_final(args.ulong()?)?;
            vec![]
        }
        CallId::EncryptInit => {
            let (session, mechanism, key) = (args.ulong()?, args.mechanism()?, args.ulong()?);
            token.encrypt_init(session, &mechanism, key)?;
            vec![]
        }
        CallId::Encrypt => crypt(args, |session, data, capacity| {
            token.encrypt(session, data, capacity)
        })?,
        CallId::EncryptUpdate => crypt(args, |session, data, capacity| {
            token.encrypt_update(session, data, capacity)
        })?,
        CallId::EncryptFinal => {
            finish(args, |session, capacity| token.encrypt_final(session, capacity))?
        }
        CallId::DecryptInit => {
            let (session, mechanism, key) = (args.ulong()?, args.mechanism()?, args.ulong()?);
            token.decrypt_init(session, &mechanism, key)?;
            vec![]
        }
        CallId::Decrypt => crypt(args, |session, data, capacity| {
            token.decrypt(session, data, capacity)
        })?,
        CallId::DecryptUpdate => crypt(args, |session, data, capacity| {
            token.decrypt_update(session, data, capacity)
        })?,
        CallId::DecryptFinal => {
            finish(args, |session, capacity| token.decrypt_final(session, capacity))?
        }
        CallId::DigestInit => {
            let session = args.ulong()?;
            token.digest_init(session, &args.mechanism()?)?;
            vec![]
        }
        CallId::Digest => crypt(args, |session, data, capacity| {
            token.digest(session, data, capacity)
        })?,
        CallId::DigestUpdate => {
            let session = args.ulong()?;
            token.digest_update(session, &args.bytes()?)?;
            vec![]
        }
        CallId::DigestKey => {
            let session = args.ulong()?;
            token.digest_key(session, args.ulong()?)?;
            vec![]
        }
        CallId::DigestFinal => {
            finish(args, |session, capacity| token.digest_final(session, capacity))?
        }
        CallId::SignInit => {
            let (session, mechanism, key) = (args.ulong()?, args.mechanism()?, args.ulong()?);
            token.sign_init(session, &mechanism, key)?;
            vec![]
        }
        CallId::Sign => crypt(args, |session, data, capacity| token.sign(session, data, capacity))?,
        CallId::SignUpdate => {
            let session = args.ulong()?;
            token.sign_update(session, &args.bytes()?)?;
            vec![]
        }
        CallId::SignFinal => finish(args, |session, capacity| token.sign_final(session, capacity))?,
        CallId::SignRecoverInit => {
            let (session, mechanism, key) = (args.ulong()?, args.mechanism()?, args.ulong()?);
            token.sign_recover_init(session, &mechanism, key)?;
            vec![]
        }
        CallId::SignRecover => crypt(args, |session, data, capacity| {
            token.sign_recover(session, data, capacity)
        })?,
        CallId::VerifyInit => {
            let (session, mechanism, key) = (args.ulong()?, args.mechanism()?, args.ulong()?);
            token.verify_init(session, &mechanism, key)?;
            vec![]
        }
        CallId::Verify => {
            let session = args.ulong()?;
            let data = args.bytes()?;
            let signature = args.bytes()?;
            token.verify(session, &data, &signature)?;
            vec![]
        }
        CallId::VerifyUpdate => {
            let session = args.ulong()?;
            token.verify_update(session, &args.bytes()?)?;
            vec![]
        }
        CallId::VerifyFinal => {
            let session = args.ulong()?;
            token.verify_final(session, &args.bytes()?)?;
            vec![]
        }
        CallId::VerifyRecoverInit => {
            let (session, mechanism, key) = (args.ulong()?, args.mechanism()?, args.ulong()?);
            token.verify_recover_init(session, &mechanism, key)?;
            vec![]
        }
        CallId::VerifyRecover => crypt(args, |session, signature, capacity| {
            token.verify_recover(session, signature, capacity)
        })?,
        CallId::DigestEncryptUpdate => crypt(args, |session, data, capacity| {
            token.digest_encrypt_update(session, data, capacity)
        })?,
        CallId::DecryptDigestUpdate => crypt(args, |session, data, capacity| {
            token.decrypt_digest_update(session, data, capacity)
        })?,
        CallId::SignEncryptUpdate => crypt(args, |session, data, capacity| {
            token.sign_encrypt_update(session, data, capacity)
        })?,
        CallId::DecryptVerifyUpdate => crypt(args, |session, data, capacity| {
            token.decrypt_verify_update(session, data, capacity)
        })?,
        CallId::GenerateKey => {
            let (session, mechanism) = (args.ulong()?, args.mechanism()?);
            let template = args.attribute_array()?;
            vec![Value::Ulong(token.generate_key(session, &mechanism, &template)?)]
        }
        CallId::GenerateKeyPair => {
            let (session, mechanism) = (args.ulong()?, args.mechanism()?);
            let public_template = args.attribute_array()?;
            let private_template = args.attribute_array()?;
            let (public_key, private_key) =
                token.generate_key_pair(session, &mechanism, &public_template, &private_template)?;
            vec![Value::Ulong(public_key), Value::Ulong(private_key)]
        }
        CallId::WrapKey => {
            let (session, mechanism) = (args.ulong()?, args.mechanism()?);
            let wrapping_key = args.ulong()?;
            let key = args.ulong()?;
            let capacity = args.byte_buffer()?;
            let wrapped = token.wrap_key(session, &mechanism, wrapping_key, key, capacity)?;
            vec![bytes(wrapped, capacity)]
        }
        CallId::UnwrapKey => {
            let (session, mechanism) = (args.ulong()?, args.mechanism()?);
            let unwrapping_key = args.ulong()?;
            let wrapped = args.bytes()?;
            let template = args.attribute_array()?;
            vec![Value::Ulong(token.unwrap_key(
                session,
                &mechanism,
                unwrapping_key,
                &wrapped,
                &template,
            )?)]
        }
        CallId::DeriveKey => {
            let (session, mechanism) = (args.ulong()?, args.mechanism()?);
            let base_key = args.ulong()?;
            let template = args.attribute_array()?;
            vec![Value::Ulong(token.derive_key(session, &mechanism, base_key, &template)?)]
        }
        CallId::SeedRandom => {
            let session = args.ulong()?;
            token.seed_random(session, &args.bytes()?)?;
            vec![]
        }
        CallId::GenerateRandom => {
            let session = args.ulong()?;
            let len = args.byte_buffer()?.ok_or(Rejected(CKR_ARGUMENTS_BAD))?;
            vec![Value::ByteArray(Payload::Value(token.generate_random(session, len)?))]
        }
    };
    Ok(outputs)
}

/// Calls shaped `(session, data, buffer) -> bytes`.
fn crypt(
    args: &mut Values,
    operation: impl FnOnce(CK_ULONG, &[u8], Option<CK_ULONG>) -> super::Output,
) -> Result<Vec<Value>, Rejected> {
    let session = args.ulong()?;
    let data = args.bytes()?;
    let capacity = args.byte_buffer()?;
    Ok(vec![bytes(operation(session, &data, capacity)?, capacity)])
}

/// Calls shaped `(session, buffer) -> bytes`.
fn finish(
    args: &mut Values,
    operation: impl FnOnce(CK_ULONG, Option<CK_ULONG>) -> super::Output,
) -> Result<Vec<Value>, Rejected> {
    let session = args.ulong()?;
    let capacity = args.byte_buffer()?;
    Ok(vec![bytes(operation(session, capacity)?, capacity)])
}
