// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

use std::{
    env,
    ffi::OsString,
    path::{Path, PathBuf},
};

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// The environment variable naming a client configuration file.
pub const CLIENT_CONFIG_ENV: &str = "TOKENWARD_CLIENT_CONFIG";
/// The environment variable that overrides the daemon socket path.
pub const SOCKET_ENV: &str = "TOKENWARD_SOCKET";

/// Configuration for the PKCS#11 module side of the connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// The path to the daemon's Unix socket.
    ///
    /// Defaults to "$XDG_RUNTIME_DIR/tokenward/pkcs11.socket", or to
    /// "/run/tokenward/pkcs11.socket" if `XDG_RUNTIME_DIR` isn't set.
    #[serde(default = "default_client_socket_path")]
    pub socket_path: PathBuf,

    /// The largest response, in bytes, accepted from the daemon.
    ///
    /// The daemon announces the size of each response before sending it; larger
    /// responses are refused before any memory is allocated for them. Defaults to 16 MiB.
    #[serde(default = "default_max_message_size")]
    pub max_response_size: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            socket_path: default_client_socket_path(),
            max_response_size: default_max_message_size(),
        }
    }
}

impl std::fmt::Display for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            toml::ser::to_string_pretty(&self).unwrap_or_default()
        )
    }
}

impl ClientConfig {
    /// Load the client configuration from the process environment.
    ///
    /// The file named by `TOKENWARD_CLIENT_CONFIG` is read if that variable is set, and
    /// `TOKENWARD_SOCKET` then overrides the socket path.
    ///
    /// # Errors
    ///
    /// Returns an error if the named configuration file can't be read or parsed.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_sources(
            env::var_os(CLIENT_CONFIG_ENV).map(PathBuf::from),
            env::var_os(SOCKET_ENV),
        )
    }

    fn from_sources(file: Option<PathBuf>, socket: Option<OsString>) -> anyhow::Result<Self> {
        let mut config = match file {
            Some(path) => private_load_config::<ClientConfig>(&path)?,
            None => ClientConfig::default(),
        };
        if let Some(socket) = socket.filter(|socket| !socket.is_empty()) {
            config.socket_path = PathBuf::from(socket);
        }
        Ok(config)
    }
}

/// Configuration for the token daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// The path to bind the daemon's Unix socket to.
    ///
    /// Defaults to "/run/tokenward/pkcs11.socket".
    #[serde(default = "default_daemon_socket_path")]
    pub socket_path: PathBuf,

    /// User IDs, besides the daemon's own, permitted to use the token.
    ///
    /// Peers are identified by the credentials they pass when connecting. Any other user
    /// is disconnected before a single request is read.
    #[serde(default)]
    pub allowed_uids: Vec<u32>,

    /// The largest request, in bytes, the daemon will read.
    ///
    /// Clients announcing a larger request are disconnected. Defaults to 16 MiB.
    #[serde(default = "default_max_message_size")]
    pub max_request_size: u32,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: default_daemon_socket_path(),
            allowed_uids: vec![],
            max_request_size: default_max_message_size(),
        }
    }
}

impl std::fmt::Display for DaemonConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            toml::ser::to_string_pretty(&self).unwrap_or_default()
        )
    }
}

fn default_client_socket_path() -> PathBuf {
    runtime_socket_path(env::var_os("XDG_RUNTIME_DIR"))
}

fn runtime_socket_path(runtime_dir: Option<OsString>) -> PathBuf {
    runtime_dir
        .filter(|dir| !dir.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/run"))
        .join("tokenward/pkcs11.socket")
}

fn default_daemon_socket_path() -> PathBuf {
    PathBuf::from("/run/tokenward/pkcs11.socket")
}

fn default_max_message_size() -> u32 {
    16 * 1024 * 1024
}

fn private_load_config<T>(path: &Path) -> anyhow::Result<T>
where
    T: Default + std::fmt::Display + serde::de::DeserializeOwned,
{
    let config = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read from path {path:?}"))?;
    tracing::info!(path=%path.display(), "Read from configuration file");
    toml::from_str(&config)
        .inspect_err(|error| {
            eprintln!("Failed to parse configuration loaded from {path:?}:\n{error}");
            eprintln!("Example config file:\n\n{}", T::default());
        })
        .context("configuration file is invalid")
}

/// Load the configuration with fallback options.
///
/// If `path` is [`None`], the `default` path, which should be relative to
/// CONFIGURATION_DIRECTORY, is checked. If the default config doesn't exist, the [`Default`]
/// implementation is returned. It's expected that CONFIGURATION_DIRECTORY is set via systemd.
///
/// # Errors
///
/// In the event that one of the config files exists, but is invalid, an error is returned.
pub fn load_config<T>(path: Option<PathBuf>, default: &Path) -> anyhow::Result<T>
where
    T: Default + std::fmt::Display + serde::de::DeserializeOwned,
{
    path.or_else(|| {
        env::var("CONFIGURATION_DIRECTORY")
            .inspect_err(|error| {
                tracing::warn!(
                    ?error,
                    "CONFIGURATION_DIRECTORY environment variable isn't readable"
                );
            })
            .map(PathBuf::from)
            .ok()
            .map(|base_path| base_path.join(default))
            .filter(|path| path.is_file())
    })
    .map_or_else(
        || {
            tracing::warn!("No configuration file found; using defaults");
            Ok(T::default())
        },
        |path| {
            tracing::info!(?path, "Attempting to load configuration");
            private_load_config::<T>(&path)
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_directory_socket() {
        assert_eq!(
            runtime_socket_path(Some("/run/user/1000".into())),
            PathBuf::from("/run/user/1000/tokenward/pkcs11.socket")
        );
        assert_eq!(
            runtime_socket_path(None),
            PathBuf::from("/run/tokenward/pkcs11.socket")
        );
        assert_eq!(
            runtime_socket_path(Some("".into())),
            PathBuf::from("/run/tokenward/pkcs11.socket")
        );
    }

    #[test]
    fn socket_override_beats_file() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("client.toml");
        std::fs::write(
            &path,
            "socket_path = \"/from/file.socket\"\nmax_response_size = 4096\n",
        )?;

        let config = ClientConfig::from_sources(Some(path.clone()), None)?;
        assert_eq!(config.socket_path, PathBuf::from("/from/file.socket"));
        assert_eq!(config.max_response_size, 4096);

        let config = ClientConfig::from_sources(Some(path), Some("/from/env.socket".into()))?;
        assert_eq!(config.socket_path, PathBuf::from("/from/env.socket"));
        assert_eq!(config.max_response_size, 4096);
        Ok(())
    }

    #[test]
    fn missing_client_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ClientConfig::from_sources(Some(dir.path().join("nope.toml")), None).is_err());
    }

    #[test]
    fn daemon_defaults_fill_missing_fields() -> anyhow::Result<()> {
        let config: DaemonConfig = toml::from_str("allowed_uids = [1000, 1001]")?;
        assert_eq!(config.allowed_uids, vec![1000, 1001]);
        assert_eq!(config.socket_path, default_daemon_socket_path());
        assert_eq!(config.max_request_size, default_max_message_size());
        Ok(())
    }

    #[test]
    fn display_round_trips() -> anyhow::Result<()> {
        let config = DaemonConfig {
            allowed_uids: vec![42],
            ..Default::default()
        };
        let parsed: DaemonConfig = toml::from_str(&config.to_string())?;
        assert_eq!(parsed, config);
        Ok(())
    }

    #[test]
    fn load_explicit_path() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("daemon.toml");
        std::fs::write(&path, "max_request_size = 100\n")?;
        let config: DaemonConfig = load_config(Some(path), Path::new("daemon.toml"))?;
        assert_eq!(config.max_request_size, 100);

        let bad = dir.path().join("bad.toml");
        std::fs::write(&bad, "max_request_size = \"lots\"\n")?;
        assert!(load_config::<DaemonConfig>(Some(bad), Path::new("daemon.toml")).is_err());
        Ok(())
    }
}
