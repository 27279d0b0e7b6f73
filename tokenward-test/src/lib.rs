// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Utilities for testing tokenward components, useful across the library's integration tests
//! and the PKCS #11 module.
//!
//! [`DaemonBuilder`] starts a daemon serving a [`MockToken`] on a socket in a temporary
//! directory. The daemon runs on its own thread with its own Tokio runtime, so it can be
//! driven by the blocking client from plain `#[test]` functions as well as from async tests.

use std::{
    path::{Path, PathBuf},
    sync::{Arc, mpsc},
    thread::JoinHandle,
};

use anyhow::Context;
use tokenward::{
    config::{ClientConfig, DaemonConfig},
    daemon::{Daemon, Token},
};
use tokio_util::sync::CancellationToken;

mod token;

pub use token::{MECHANISMS, MockToken, SLOTS, USER_PIN};

/// Configure a daemon for a test.
pub struct DaemonBuilder {
    token: Arc<dyn Token>,
    allowed_uids: Vec<u32>,
    owner: Option<u32>,
    max_request_size: Option<u32>,
}

impl DaemonBuilder {
    pub fn new(token: Arc<dyn Token>) -> Self {
        Self {
            token,
            allowed_uids: vec![],
            owner: None,
            max_request_size: None,
        }
    }

    /// Serve the token on behalf of `uid` instead of the current user.
    pub fn owner(mut self, uid: u32) -> Self {
        self.owner = Some(uid);
        self
    }

    pub fn allowed_uids(mut self, uids: Vec<u32>) -> Self {
        self.allowed_uids = uids;
        self
    }

    pub fn max_request_size(mut self, size: u32) -> Self {
        self.max_request_size = Some(size);
        self
    }

    /// Start the daemon; it runs until the returned handle is halted or dropped.
    pub fn start(self) -> anyhow::Result<DaemonHandle> {
        let directory = tempfile::tempdir()?;
        let mut config = DaemonConfig {
            socket_path: socket_in(directory.path()),
            allowed_uids: self.allowed_uids,
            ..Default::default()
        };
        if let Some(size) = self.max_request_size {
            config.max_request_size = size;
        }
        let server = spawn(config.clone(), self.token.clone(), self.owner)?;

        Ok(DaemonHandle {
            _directory: directory,
            config,
            token: self.token,
            owner: self.owner,
            server: Some(server),
        })
    }
}

struct Server {
    halt_token: CancellationToken,
    thread: JoinHandle<anyhow::Result<()>>,
}

impl Server {
    fn halt(self) -> anyhow::Result<()> {
        self.halt_token.cancel();
        self.thread
            .join()
            .map_err(|_| anyhow::anyhow!("daemon thread panicked"))?
    }
}

/// A running test daemon.
///
/// The temporary directory holding the socket lives as long as the handle.
pub struct DaemonHandle {
    _directory: tempfile::TempDir,
    config: DaemonConfig,
    token: Arc<dyn Token>,
    owner: Option<u32>,
    server: Option<Server>,
}

impl DaemonHandle {
    pub fn socket_path(&self) -> &Path {
        &self.config.socket_path
    }

    /// A client configuration pointing at this daemon.
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            socket_path: self.config.socket_path.clone(),
            ..Default::default()
        }
    }

    /// Stop the daemon, closing every client connection, and start it again on the same
    /// socket with the same token.
    pub fn restart(&mut self) -> anyhow::Result<()> {
        if let Some(server) = self.server.take() {
            server.halt()?;
        }
        self.server = Some(spawn(self.config.clone(), self.token.clone(), self.owner)?);
        Ok(())
    }

    /// Stop the daemon and wait for it to exit.
    pub fn halt(mut self) -> anyhow::Result<()> {
        match self.server.take() {
            Some(server) => server.halt(),
            None => Ok(()),
        }
    }
}

impl Drop for DaemonHandle {
    fn drop(&mut self) {
        if let Some(server) = self.server.take() {
            if let Err(error) = server.halt() {
                tracing::error!(?error, "Test daemon exited with an error");
            }
        }
    }
}

fn spawn(
    config: DaemonConfig,
    token: Arc<dyn Token>,
    owner: Option<u32>,
) -> anyhow::Result<Server> {
    let (ready_tx, ready_rx) = mpsc::channel();
    let thread = std::thread::Builder::new()
        .name("tokenward-test-daemon".into())
        .spawn(move || {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(2)
                .enable_all()
                .build()?;
            runtime.block_on(async move {
                let mut daemon = Daemon::new(config, token);
                if let Some(uid) = owner {
                    daemon = daemon.with_owner(uid);
                }
                let listener = match daemon.listen() {
                    Ok(listener) => listener,
                    Err(error) => {
                        let _ = ready_tx.send(Err(format!("{error:?}")));
                        return Err(error);
                    }
                };
                let listener = daemon.run(listener);
                let _ = ready_tx.send(Ok(listener.halt_token()));
                listener.wait_to_finish().await
            })
        })?;

    let halt_token = ready_rx
        .recv()
        .context("the daemon thread exited before it started listening")?
        .map_err(anyhow::Error::msg)?;
    Ok(Server { halt_token, thread })
}

/// The path a test daemon would use inside `directory`; handy for pointing a client at
/// a socket that doesn't exist.
pub fn socket_in(directory: &Path) -> PathBuf {
    directory.join("tokenward.socket")
}
