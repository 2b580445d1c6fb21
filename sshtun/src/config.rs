// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Serializable tunnel descriptions
//!
//! ```json
//! {
//!   "name": "db",
//!   "forward_type": "local",
//!   "local": "localhost:15432",
//!   "remote": "localhost:5432",
//!   "server": "bastion.example.com:22",
//!   "user": "deploy",
//!   "auth": { "method": "key_file", "path": "/home/deploy/.ssh/id_ed25519" },
//!   "timeout_secs": 10
//! }
//! ```
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::common::authentication::{AlgorithmPreferences, AuthMethod};
use crate::common::endpoint::{Endpoint, ForwardType};
use crate::tunnel::{ConfigError, Tunnel, DEFAULT_TIMEOUT, DEFAULT_USER};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum AuthSpec {
  Auto,
  KeyFile {
    #[serde(default)]
    path: Option<PathBuf>,
    #[serde(default)]
    passphrase: Option<String>,
  },
  Agent,
  Password {
    password: String,
  },
  /// Password read from the named environment variable when the tunnel is built
  PasswordEnv {
    variable: String,
  },
}

impl Default for AuthSpec {
  fn default() -> Self {
    AuthSpec::Auto
  }
}

impl AuthSpec {
  fn into_method(self) -> Result<AuthMethod, ConfigError> {
    Ok(match self {
      AuthSpec::Auto => AuthMethod::Auto,
      AuthSpec::KeyFile { path, passphrase } => AuthMethod::KeyFile {
        path: path.filter(|p| !p.as_os_str().is_empty()),
        passphrase,
      },
      AuthSpec::Agent => AuthMethod::Agent,
      AuthSpec::Password { password } => AuthMethod::Password(password),
      AuthSpec::PasswordEnv { variable } => match std::env::var(&variable) {
        Ok(password) => AuthMethod::Password(password),
        Err(_) => return Err(ConfigError::MissingEnvironment(variable)),
      },
    })
  }
}

fn default_user() -> String {
  String::from(DEFAULT_USER)
}

fn default_timeout_secs() -> u64 {
  DEFAULT_TIMEOUT.as_secs()
}

/// Everything needed to build a [Tunnel], in a form that can live in a config file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TunnelSpec {
  #[serde(default)]
  pub name: String,
  #[serde(default)]
  pub forward_type: ForwardType,
  pub local: Endpoint,
  pub remote: Endpoint,
  pub server: Endpoint,
  #[serde(default = "default_user")]
  pub user: String,
  #[serde(default)]
  pub auth: AuthSpec,
  #[serde(default)]
  pub algorithms: AlgorithmPreferences,
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
}

impl TunnelSpec {
  pub fn from_json(document: &str) -> Result<Self, serde_json::Error> {
    serde_json::from_str(document)
  }

  pub fn timeout(&self) -> Duration {
    Duration::from_secs(self.timeout_secs)
  }

  /// Builds a tunnel using the default transport
  pub fn into_tunnel(self) -> Result<Tunnel, ConfigError> {
    let timeout = self.timeout();
    let mut tunnel = match &self.forward_type {
      ForwardType::Local => Tunnel::new(0, "", 0),
      ForwardType::Remote => Tunnel::new_remote(0, "", 0),
    };
    tunnel.set_name(self.name);
    tunnel.set_local_endpoint(self.local);
    tunnel.set_remote_endpoint(self.remote);
    tunnel.set_server_endpoint(self.server);
    tunnel.set_user(self.user);
    tunnel.set_auth(self.auth.into_method()?);
    tunnel.set_algorithms(self.algorithms);
    tunnel.set_timeout(timeout);
    Ok(tunnel)
  }
}
