// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! The per-thread call session.
//!
//! Each thread that talks to the daemon owns one [`CallState`]: a socket and a pair of
//! reusable messages. A call moves the state through
//! `Invalid -> Ready -> Prep -> Transit -> Parse -> Ready`, dropping back to `Invalid`
//! whenever the socket fails so that the next call reconnects.

use std::{
    cell::RefCell,
    collections::HashMap,
    path::PathBuf,
    sync::atomic::{AtomicUsize, Ordering},
};

use tracing::{Level, instrument};

use crate::{
    calls::CallId,
    error::{Error, ProtocolError},
    message::{Direction, Header, Message, Value, Values},
    transport::Connection,
};

/// Where calls should go, as recorded when the client was initialized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// The process that initialized the client.
    pub pid: i32,
    pub socket_path: PathBuf,
    /// The largest response body accepted from the daemon.
    pub max_response_size: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    /// No socket is open.
    Invalid,
    /// Connected and idle.
    Ready,
    /// A request is being built.
    Prep,
    /// The request is on the wire and the response hasn't fully arrived.
    Transit,
    /// The response is being decoded.
    Parse,
}

/// The calling thread's connection to the daemon.
#[derive(Debug)]
pub struct CallState {
    status: CallStatus,
    connection: Option<Connection>,
    /// The process and socket the connection was made for.
    owner: Option<(i32, PathBuf)>,
    request: Option<Message>,
    response: Option<Message>,
}

impl Default for CallState {
    fn default() -> Self {
        Self::new()
    }
}

impl CallState {
    pub fn new() -> Self {
        Self {
            status: CallStatus::Invalid,
            connection: None,
            owner: None,
            request: Some(Message::new()),
            response: Some(Message::new()),
        }
    }

    pub fn status(&self) -> CallStatus {
        self.status
    }

    /// Close the socket, if any.
    pub fn disconnect(&mut self) {
        if self.connection.take().is_some() {
            tracing::debug!("Disconnected from the daemon");
        }
        self.owner = None;
        self.status = CallStatus::Invalid;
    }

    /// Make one round trip to the daemon.
    ///
    /// The socket is (re)opened first if there is none, or if it was opened by another
    /// process or for another socket path.
    ///
    /// # Panics
    ///
    /// Panics if another call is already in progress on this state.
    #[instrument(level = Level::DEBUG, skip_all, fields(call = call.name()))]
    pub fn call(
        &mut self,
        endpoint: &Endpoint,
        call: CallId,
        arguments: &[Value],
    ) -> Result<Values, Error> {
        assert!(
            matches!(self.status, CallStatus::Invalid | CallStatus::Ready),
            "call {call} started while another call is in progress ({:?})",
            self.status
        );

        self.lookup(endpoint)?;

        self.status = CallStatus::Prep;
        let mut request = self.request.take().expect("request message is attached");
        let mut response = self.response.take().expect("response message is attached");
        let result = self.round_trip(endpoint, call, arguments, &mut request, &mut response);
        self.request = Some(request);
        self.response = Some(response);

        match &result {
            Err(Error::Transport(error)) => {
                tracing::warn!(%error, "Call failed on the transport; the next call reconnects");
                self.disconnect();
            }
            // The socket may still hold part of a frame, so it can't be reused.
            Err(error) if self.status == CallStatus::Transit => {
                tracing::warn!(%error, "Call failed mid-exchange; the next call reconnects");
                self.disconnect();
            }
            _ => self.status = CallStatus::Ready,
        }
        result
    }

    fn lookup(&mut self, endpoint: &Endpoint) -> Result<(), Error> {
        let stale = match &self.owner {
            Some((pid, path)) => *pid != endpoint.pid || *path != endpoint.socket_path,
            None => false,
        };
        if stale {
            tracing::debug!("Connection belongs to another process or socket; dropping it");
            self.disconnect();
        }
        if self.status == CallStatus::Invalid {
            let connection = Connection::connect(&endpoint.socket_path)?;
            self.connection = Some(connection);
            self.owner = Some((endpoint.pid, endpoint.socket_path.clone()));
            self.status = CallStatus::Ready;
        }
        Ok(())
    }

    fn round_trip(
        &mut self,
        endpoint: &Endpoint,
        call: CallId,
        arguments: &[Value],
        request: &mut Message,
        response: &mut Message,
    ) -> Result<Values, Error> {
        request.prepare(call, Direction::Request)?;
        request.write_all(arguments)?;

        self.status = CallStatus::Transit;
        let connection = self
            .connection
            .as_mut()
            .ok_or(crate::error::TransportError::Disconnected)?;
        connection.send(request)?;
        connection.receive(response, endpoint.max_response_size)?;

        self.status = CallStatus::Parse;
        match response.parse(Direction::Response)? {
            Header::Error(rv) => {
                tracing::debug!(rv, "Daemon returned an error");
                Err(Error::Token(rv))
            }
            Header::Call(answered) if answered != call => Err(ProtocolError::CallMismatch {
                expected: call as u32,
                received: answered as u32,
            }
            .into()),
            Header::Call(_) => response.read_all(),
        }
    }
}

/// A pool of call states, one per caller.
///
/// The client asks the pool for the calling thread's state on every call rather than
/// holding one itself.
pub trait CallStates: Send + Sync {
    /// Run `f` with exclusive access to the caller's state.
    fn with_state<R>(&self, f: impl FnOnce(&mut CallState) -> R) -> R;
}

thread_local! {
    static THREAD_STATES: RefCell<HashMap<usize, CallState>> = RefCell::new(HashMap::new());
}

static NEXT_POOL: AtomicUsize = AtomicUsize::new(0);

/// Call states kept in thread-local storage.
///
/// A thread's state, and its socket, are dropped when the thread exits.
#[derive(Debug)]
pub struct PerThread {
    id: usize,
}

impl Default for PerThread {
    fn default() -> Self {
        Self::new()
    }
}

impl PerThread {
    pub fn new() -> Self {
        Self {
            id: NEXT_POOL.fetch_add(1, Ordering::Relaxed),
        }
    }
}

impl CallStates for PerThread {
    fn with_state<R>(&self, f: impl FnOnce(&mut CallState) -> R) -> R {
        THREAD_STATES.with(|states| {
            let mut states = states
                .try_borrow_mut()
                .expect("nested call on a thread that already has a call in progress");
            f(states.entry(self.id).or_default())
        })
    }
}

/// The id of the calling process.
pub fn current_pid() -> i32 {
    rustix::process::getpid().as_raw_nonzero().get()
}

#[cfg(test)]
mod tests {
    use std::{
        io::{Read, Write},
        os::unix::net::{UnixListener, UnixStream},
    };

    use cryptoki_sys::CKR_PIN_INCORRECT;

    use super::*;
    use crate::{error::TransportError, types::Payload};

    fn read_frame(stream: &mut UnixStream) -> Option<Vec<u8>> {
        let mut header = [0_u8; 4];
        stream.read_exact(&mut header).ok()?;
        let mut body = vec![0_u8; u32::from_be_bytes(header) as usize];
        stream.read_exact(&mut body).ok()?;
        Some(body)
    }

    fn write_frame(stream: &mut UnixStream, body: &[u8]) {
        let mut frame = (body.len() as u32).to_be_bytes().to_vec();
        frame.extend_from_slice(body);
        stream.write_all(&frame).unwrap();
    }

    /// Serve each accepted connection with `answer`, which gets the request body and
    /// returns the response body, or `None` to hang up.
    fn serve(
        connections: usize,
        answer: impl Fn(&[u8]) -> Option<Vec<u8>> + Send + 'static,
    ) -> (tempfile::TempDir, PathBuf, std::thread::JoinHandle<usize>) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("socket");
        let listener = UnixListener::bind(&path).unwrap();
        let server = std::thread::spawn(move || {
            let mut requests = 0;
            for _ in 0..connections {
                let (mut stream, _) = listener.accept().unwrap();
                let mut credentials = [1_u8; 1];
                stream.read_exact(&mut credentials).unwrap();
                assert_eq!(credentials, [0]);
                while let Some(request) = read_frame(&mut stream) {
                    requests += 1;
                    match answer(&request) {
                        Some(response) => write_frame(&mut stream, &response),
                        None => break,
                    }
                }
            }
            requests
        });
        (dir, path, server)
    }

    fn endpoint(path: &std::path::Path) -> Endpoint {
        Endpoint {
            pid: current_pid(),
            socket_path: path.to_path_buf(),
            max_response_size: 1024,
        }
    }

    /// Echo the call id back with no arguments.
    fn empty_response(request: &[u8]) -> Option<Vec<u8>> {
        Some(request[..4].to_vec())
    }

    #[test]
    fn successful_call_leaves_ready() -> Result<(), Error> {
        let (_dir, path, server) = serve(1, empty_response);
        let mut state = CallState::new();
        assert_eq!(state.status(), CallStatus::Invalid);

        state.call(&endpoint(&path), CallId::Logout, &[Value::Ulong(1)])?;
        assert_eq!(state.status(), CallStatus::Ready);
        state.call(&endpoint(&path), CallId::Logout, &[Value::Ulong(2)])?;
        state.disconnect();
        assert_eq!(server.join().unwrap(), 2);
        Ok(())
    }

    #[test]
    fn error_response() {
        let (_dir, path, _server) = serve(1, |_| {
            let mut response = vec![0, 0, 0, 0];
            response.extend_from_slice(&(CKR_PIN_INCORRECT as u32).to_be_bytes());
            Some(response)
        });
        let mut state = CallState::new();
        let result = state.call(
            &endpoint(&path),
            CallId::Login,
            &[
                Value::Ulong(1),
                Value::Ulong(1),
                Value::ByteArray(Payload::Value(b"1234".to_vec())),
            ],
        );
        assert!(matches!(result, Err(Error::Token(CKR_PIN_INCORRECT))));
        assert_eq!(state.status(), CallStatus::Ready);
    }

    #[test]
    fn call_mismatch_is_a_protocol_error() {
        let (_dir, path, _server) = serve(1, |_| {
            Some((CallId::Logout as u32).to_be_bytes().to_vec())
        });
        let mut state = CallState::new();
        let result = state.call(&endpoint(&path), CallId::FindObjectsFinal, &[Value::Ulong(4)]);
        assert!(matches!(
            result,
            Err(Error::Protocol(ProtocolError::CallMismatch { expected: 31, received: 22 }))
        ));
        assert_eq!(state.status(), CallStatus::Ready);
    }

    #[test]
    fn transport_failure_invalidates_then_reconnects() -> Result<(), Error> {
        let calls = std::sync::atomic::AtomicUsize::new(0);
        let (_dir, path, server) = serve(2, move |request| {
            // Hang up on the first request only.
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                None
            } else {
                empty_response(request)
            }
        });
        let mut state = CallState::new();
        let result = state.call(&endpoint(&path), CallId::CloseSession, &[Value::Ulong(1)]);
        assert!(matches!(
            result,
            Err(Error::Transport(TransportError::Disconnected))
        ));
        assert_eq!(state.status(), CallStatus::Invalid);

        state.call(&endpoint(&path), CallId::CloseSession, &[Value::Ulong(1)])?;
        assert_eq!(state.status(), CallStatus::Ready);
        state.disconnect();
        assert_eq!(server.join().unwrap(), 2);
        Ok(())
    }

    #[test]
    fn unread_response_body_is_not_reused() -> Result<(), Error> {
        let calls = std::sync::atomic::AtomicUsize::new(0);
        let (_dir, path, server) = serve(2, move |request| {
            // The first answer is too large to accept and leaves its body unread.
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                let mut response = request[..4].to_vec();
                response.resize(2000, 0xAA);
                Some(response)
            } else {
                empty_response(request)
            }
        });
        let mut state = CallState::new();
        let result = state.call(&endpoint(&path), CallId::Logout, &[Value::Ulong(1)]);
        assert!(matches!(
            result,
            Err(Error::Transport(TransportError::FrameTooLarge { size: 2000, limit: 1024 }))
        ));
        assert_eq!(state.status(), CallStatus::Invalid);

        state.call(&endpoint(&path), CallId::Logout, &[Value::Ulong(1)])?;
        assert_eq!(state.status(), CallStatus::Ready);
        state.disconnect();
        assert_eq!(server.join().unwrap(), 2);
        Ok(())
    }

    #[test]
    fn unencodable_argument_is_not_sent() -> Result<(), Error> {
        let (_dir, path, server) = serve(1, empty_response);
        let mut state = CallState::new();
        let result = state.call(
            &endpoint(&path),
            CallId::CloseSession,
            &[Value::Ulong(u64::from(u32::MAX) as cryptoki_sys::CK_ULONG + 1)],
        );
        assert!(matches!(result, Err(Error::ArgumentsBad(_))));
        assert_eq!(state.status(), CallStatus::Ready);

        state.call(&endpoint(&path), CallId::CloseSession, &[Value::Ulong(1)])?;
        state.disconnect();
        assert_eq!(server.join().unwrap(), 1);
        Ok(())
    }

    #[test]
    fn new_pid_reconnects() -> Result<(), Error> {
        let (_dir, path, server) = serve(2, empty_response);
        let mut state = CallState::new();
        let parent = endpoint(&path);
        state.call(&parent, CallId::CloseSession, &[Value::Ulong(1)])?;

        let child = Endpoint {
            pid: parent.pid + 1,
            ..parent
        };
        state.call(&child, CallId::CloseSession, &[Value::Ulong(1)])?;
        state.disconnect();
        assert_eq!(server.join().unwrap(), 2);
        Ok(())
    }

    #[test]
    fn connect_failure_stays_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = CallState::new();
        let result = state.call(
            &endpoint(&dir.path().join("missing")),
            CallId::GetInfo,
            &[],
        );
        assert!(matches!(
            result,
            Err(Error::Transport(TransportError::Connect { .. }))
        ));
        assert_eq!(state.status(), CallStatus::Invalid);
    }

    #[test]
    fn per_thread_states_are_independent() {
        let pool = PerThread::new();
        pool.with_state(|state| state.status = CallStatus::Ready);
        std::thread::scope(|scope| {
            scope.spawn(|| {
                pool.with_state(|state| assert_eq!(state.status(), CallStatus::Invalid));
            });
        });
        pool.with_state(|state| assert_eq!(state.status(), CallStatus::Ready));
        PerThread::new().with_state(|state| assert_eq!(state.status(), CallStatus::Invalid));
    }

    #[test]
    #[should_panic(expected = "nested call")]
    fn nested_call_panics() {
        let pool = PerThread::new();
        pool.with_state(|_| pool.with_state(|_| ()));
    }
}
