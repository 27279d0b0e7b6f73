// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! The daemon's accept loop and per-connection handling.

use std::{os::fd::AsFd, sync::Arc};

use anyhow::Context;
use tokio::net::{UnixListener, UnixStream};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{Instrument, instrument};

use crate::{
    config::DaemonConfig,
    daemon::{Token, dispatch},
    transport::{self, PeerCredentials},
};

/// A token daemon.
pub struct Daemon {
    config: Arc<DaemonConfig>,
    token: Arc<dyn Token>,
    owner: u32,
}

/// A running daemon.
pub struct Listener {
    task: tokio::task::JoinHandle<anyhow::Result<()>>,
    halt_token: CancellationToken,
}

impl Listener {
    /// Stop accepting new connections and wait for existing connections to complete.
    ///
    /// Connections waiting for their next request are closed right away; requests
    /// already handed to the token run to completion first.
    pub async fn halt(self) -> anyhow::Result<()> {
        self.halt_token.cancel();
        self.task.await??;

        Ok(())
    }

    /// Get a cancellation token which can be used to start the graceful shutdown of this
    /// listener.
    pub fn halt_token(&self) -> CancellationToken {
        self.halt_token.clone()
    }

    pub async fn wait_to_finish(self) -> anyhow::Result<()> {
        self.task.await??;
        Ok(())
    }
}

impl Daemon {
    /// Create a daemon serving `token`.
    ///
    /// The user the daemon runs as owns the token; other users must be listed in the
    /// configuration's `allowed_uids`.
    pub fn new(config: DaemonConfig, token: Arc<dyn Token>) -> Self {
        Self {
            config: Arc::new(config),
            token,
            owner: rustix::process::getuid().as_raw(),
        }
    }

    /// Serve the token on behalf of `uid` rather than the daemon's own user.
    ///
    /// This is for daemons started by a service manager under a dedicated account.
    pub fn with_owner(mut self, uid: u32) -> Self {
        self.owner = uid;
        self
    }

    /// Bind the configured socket path, replacing any stale socket left behind.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn listen(&self) -> anyhow::Result<UnixListener> {
        let path = &self.config.socket_path;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create socket directory {parent:?}"))?;
        }
        match std::fs::remove_file(path) {
            Ok(()) => tracing::info!(path = %path.display(), "Removed stale socket"),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
            Err(error) => return Err(error).context("failed to remove stale socket"),
        }
        UnixListener::bind(path).with_context(|| format!("failed to bind {path:?}"))
    }

    /// Run the daemon.
    #[instrument(skip_all, name = "daemon")]
    pub fn run(self, listener: UnixListener) -> Listener {
        let halt_token = CancellationToken::new();
        let server_halt_token = halt_token.clone();
        let task = tokio::spawn(
            async move {
                transport::enable_credentials(listener.as_fd())
                    .context("failed to enable SO_PASSCRED on the listener")?;
                let connection_tracker = TaskTracker::new();

                loop {
                    let stream = tokio::select! {
                        _ = server_halt_token.cancelled() => {
                            tracing::info!(
                                "Shutdown requested, no new connections will be accepted"
                            );
                            break;
                        },
                        conn = listener.accept() => match conn {
                            Ok((stream, _)) => stream,
                            Err(error) => {
                                tracing::error!(
                                    ?error,
                                    "Failed to accept incoming client connection"
                                );
                                continue;
                            }
                        },
                    };
                    connection_tracker.spawn(
                        handle(
                            self.config.clone(),
                            self.token.clone(),
                            self.owner,
                            stream,
                            server_halt_token.clone(),
                        )
                        .instrument(tracing::Span::current()),
                    );
                }

                tracing::debug!("Beginning shutdown");
                connection_tracker.close();
                connection_tracker.wait().await;
                tracing::info!("All connections are now closed");

                Ok::<_, anyhow::Error>(())
            }
            .instrument(tracing::Span::current()),
        );

        Listener { task, halt_token }
    }
}

fn authorized(config: &DaemonConfig, owner: u32, peer: &PeerCredentials) -> bool {
    peer.uid == owner || config.allowed_uids.contains(&peer.uid)
}

#[instrument(
    skip_all,
    err,
    fields(
        connection_id = %uuid::Uuid::now_v7(),
        pid = tracing::field::Empty,
        uid = tracing::field::Empty,
    )
)]
async fn handle(
    config: Arc<DaemonConfig>,
    token: Arc<dyn Token>,
    owner: u32,
    mut stream: UnixStream,
    halt_token: CancellationToken,
) -> anyhow::Result<()> {
    transport::enable_credentials(stream.as_fd())?;
    let peer = tokio::select! {
        _ = halt_token.cancelled() => return Ok(()),
        peer = transport::receive_credentials(&stream) => {
            peer.context("failed to receive client credentials")?
        }
    };
    let span = tracing::Span::current();
    span.record("pid", peer.pid);
    span.record("uid", peer.uid);
    if !authorized(&config, owner, &peer) {
        tracing::warn!("Client is not permitted to use the token; closing connection");
        return Ok(());
    }
    tracing::info!("Client connected");

    loop {
        let request = tokio::select! {
            _ = halt_token.cancelled() => {
                tracing::debug!("Shutdown requested; closing idle connection");
                break;
            },
            frame = transport::read_frame(&mut stream, config.max_request_size) => match frame? {
                Some(request) => request,
                None => {
                    tracing::info!("Client closed the connection");
                    break;
                }
            },
        };

        let token = token.clone();
        let span = tracing::Span::current();
        let response = tokio::task::spawn_blocking(move || {
            span.in_scope(|| dispatch(token.as_ref(), &request))
        })
        .await?;
        transport::write_frame(&mut stream, &response).await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owner_and_allowed_uids_are_authorized() {
        let config = DaemonConfig {
            allowed_uids: vec![2000],
            ..Default::default()
        };
        let peer = |uid| PeerCredentials {
            pid: 1,
            uid,
            gid: uid,
        };
        assert!(authorized(&config, 1000, &peer(1000)));
        assert!(authorized(&config, 1000, &peer(2000)));
        assert!(!authorized(&config, 1000, &peer(0)));
        assert!(!authorized(&DaemonConfig::default(), 1000, &peer(2000)));
    }
}
