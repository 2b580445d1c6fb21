// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Single-tunnel port forwarding over a secure transport
//!
//! A [Tunnel] listens on one side, local or remote, and forwards every
//! accepted connection to an endpoint on the other side through a session
//! opened by a [transport::Transport].

pub mod common;
pub mod config;
pub mod transport;
pub mod tunnel;
pub mod util;

pub use common::authentication::{AlgorithmPreferences, AuthMethod, KeyReader};
pub use common::endpoint::{Endpoint, ForwardType};
pub use common::state::{
  ConnState, ConnectionId, ConnectionState, TunnelName, TunnelObserver, TunneledConnState,
};
pub use tunnel::{ConfigError, ConnectionError, Tunnel, TunnelError};
pub use util::cancellation::CancellationListener;
