// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

/*!
# Tokenward

Tokenward lets unprivileged applications use a cryptographic token owned by a privileged
daemon through the ordinary PKCS#11 interface. Applications load the `tokenward-pkcs11`
module; the module forwards every call over a Unix socket to the daemon, which performs it
against the real token and sends back the result.

This crate holds everything except the C interface:

* The wire format: a [`buffer::WireBuffer`] of big-endian fields, [`message::Message`]s
  built and parsed against the [`calls`] catalog, and length-prefixed framing in
  [`transport`].
* The client: a per-thread [`session::CallState`] state machine and the [`client::Client`]
  API with one method per PKCS#11 operation.
* The daemon: the [`daemon::Token`] trait, a request dispatcher, and a Tokio accept loop
  that checks each peer's credentials before serving it.

## The protocol in brief

Each message is a `u32` length followed by a body that starts with a `u32` call id. The
rest of the body is the call's arguments, in the order the catalog declares, with no type
tags. Responses either repeat the request's call id and carry the outputs, or carry call id
0 and a single PKCS#11 return value.

Before its first request, a client sends one byte along with its process credentials as
`SCM_CREDENTIALS` ancillary data; the daemon only serves users it trusts. The first request
of a process is `Initialize` carrying [`HANDSHAKE`].

Native mechanism parameters may hold pointers, so only mechanisms on a fixed allow-list
can be sent; see [`mechanism`].
*/

pub mod buffer;
pub mod calls;
pub mod client;
pub mod config;
pub mod daemon;
pub mod error;
pub mod mechanism;
pub mod message;
pub mod session;
pub mod transport;
pub mod types;

pub use client::{AttributeQuery, Client};
pub use error::Error;

/// The protocol version string a client sends with `Initialize`.
pub const HANDSHAKE: &[u8] = b"TOKENWARD-PKCS11-PROTOCOL-V-1";
