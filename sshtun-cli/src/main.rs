// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
#![warn(unused_imports)]

use anyhow::{Context, Result};
use clap::{Arg, ArgMatches, Command};
use sshtun::config::{AuthSpec, TunnelSpec};
use sshtun::tunnel::{DEFAULT_TIMEOUT, DEFAULT_USER};
use sshtun::ForwardType;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use validators::{
  parse_endpoint, parse_secs, validate_endpoint, validate_env_name, validate_existing_file,
  validate_secs,
};

mod runner;
mod validators;

fn command() -> Command<'static> {
  Command::new(env!("CARGO_BIN_NAME"))
    .version(env!("CARGO_PKG_VERSION"))
    .about(env!("CARGO_PKG_DESCRIPTION"))
    .arg(
      Arg::new("config")
        .help("JSON tunnel description; replaces the endpoint and authentication arguments")
        .long("config")
        .short('c')
        .validator(validate_existing_file)
        .takes_value(true)
        .conflicts_with_all(&["local", "remote", "server", "key", "agent", "password-env"]),
    )
    .arg(
      Arg::new("local")
        .help("Local endpoint, as host:port or unix:path")
        .long("local")
        .short('l')
        .validator(validate_endpoint)
        .takes_value(true)
        .required_unless_present("config"),
    )
    .arg(
      Arg::new("remote")
        .help("Endpoint as seen from the server, as host:port or unix:path")
        .long("remote")
        .short('r')
        .validator(validate_endpoint)
        .takes_value(true)
        .required_unless_present("config"),
    )
    .arg(
      Arg::new("server")
        .long("server")
        .short('s')
        .validator(validate_endpoint)
        .takes_value(true)
        .required_unless_present("config"),
    )
    .arg(
      Arg::new("user")
        .long("user")
        .short('u')
        .takes_value(true)
        .default_value(DEFAULT_USER),
    )
    .arg(
      Arg::new("key")
        .help("Private key file; an empty value probes the default key locations")
        .long("key")
        .short('i')
        .takes_value(true)
        .conflicts_with_all(&["agent", "password-env"]),
    )
    .arg(
      Arg::new("agent")
        .help("Authenticate with the SSH agent named by SSH_AUTH_SOCK")
        .long("agent")
        .short('A')
        .conflicts_with("password-env"),
    )
    .arg(
      Arg::new("password-env")
        .help("Environment variable holding the password")
        .long("password-env")
        .validator(validate_env_name)
        .takes_value(true),
    )
    .arg(
      Arg::new("remote-forward")
        .help("Listen on the server and forward to the local endpoint")
        .long("remote-forward")
        .short('R'),
    )
    .arg(Arg::new("name").long("name").short('n').takes_value(true))
    .arg(
      Arg::new("timeout-secs")
        .long("timeout-secs")
        .validator(validate_secs)
        .takes_value(true),
    )
    .arg(
      Arg::new("cycle-secs")
        .help("Stop and restart the tunnel on this period")
        .long("cycle-secs")
        .validator(validate_secs)
        .takes_value(true),
    )
}

fn main() {
  let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
  let collector = tracing_subscriber::fmt()
    .pretty()
    .with_env_filter(env_filter)
    .finish();
  tracing::subscriber::set_global_default(collector).expect("Logger init must succeed");
  let matches = command().get_matches();
  let rt = tokio::runtime::Builder::new_multi_thread()
    .thread_name("tokio-reactor-worker")
    .enable_all()
    .build()
    .expect("Tokio Runtime setup failure");
  match rt.block_on(main_args_handler(&matches)) {
    Err(err) => {
      tracing::error!(err = ?err, "tunnel_failure");
      std::process::exit(1);
    }
    Ok(_) => tracing::info!("{} exited successfully", env!("CARGO_BIN_NAME")),
  }
}

fn load_spec(path: &Path) -> Result<TunnelSpec> {
  let raw = std::fs::read_to_string(path)
    .with_context(|| format!("Reading tunnel description {}", path.display()))?;
  TunnelSpec::from_json(&raw).with_context(|| format!("Parsing tunnel description {}", path.display()))
}

fn spec_from_args(args: &ArgMatches) -> Result<TunnelSpec> {
  let mut spec = match args.value_of("config") {
    Some(path) => load_spec(Path::new(path))?,
    None => {
      let endpoint = |name: &str| -> Result<_> {
        let raw = args
          .value_of(name)
          .with_context(|| format!("--{} is required", name))?;
        parse_endpoint(raw).with_context(|| format!("Invalid --{}", name))
      };
      let auth = if let Some(path) = args.value_of("key") {
        AuthSpec::KeyFile {
          path: Some(PathBuf::from(path)).filter(|p| !p.as_os_str().is_empty()),
          passphrase: None,
        }
      } else if args.is_present("agent") {
        AuthSpec::Agent
      } else if let Some(variable) = args.value_of("password-env") {
        AuthSpec::PasswordEnv {
          variable: variable.to_string(),
        }
      } else {
        AuthSpec::Auto
      };
      TunnelSpec {
        name: String::new(),
        forward_type: ForwardType::Local,
        local: endpoint("local")?,
        remote: endpoint("remote")?,
        server: endpoint("server")?,
        user: args.value_of("user").unwrap_or(DEFAULT_USER).to_string(),
        auth,
        algorithms: Default::default(),
        timeout_secs: DEFAULT_TIMEOUT.as_secs(),
      }
    }
  };
  if args.occurrences_of("user") > 0 {
    if let Some(user) = args.value_of("user") {
      spec.user = user.to_string();
    }
  }
  if args.is_present("remote-forward") {
    spec.forward_type = ForwardType::Remote;
  }
  if let Some(name) = args.value_of("name") {
    spec.name = name.to_string();
  }
  if let Some(secs) = args.value_of("timeout-secs") {
    spec.timeout_secs = parse_secs(secs)?.as_secs();
  }
  Ok(spec)
}

async fn main_args_handler(matches: &'_ ArgMatches) -> Result<()> {
  let spec = spec_from_args(matches)?;
  let cycle: Option<Duration> = matches.value_of("cycle-secs").map(parse_secs).transpose()?;
  tracing::info!(
    name = %spec.name,
    forward = %spec.forward_type,
    local = %spec.local,
    remote = %spec.remote,
    server = %spec.server,
    user = %spec.user,
    "Running tunnel"
  );
  let tunnel = spec.into_tunnel().context("Building tunnel")?;

  let shutdown = CancellationToken::new();
  let interrupt = {
    let shutdown = shutdown.clone();
    tokio::spawn(async move {
      if tokio::signal::ctrl_c().await.is_ok() {
        tracing::info!("Interrupt received, stopping");
      }
      shutdown.cancel();
    })
  };
  let res = runner::run_until_shutdown(tunnel, shutdown, cycle).await;
  interrupt.abort();
  res
}

#[cfg(test)]
mod tests {
  use super::*;
  use sshtun::Endpoint;

  fn parse(args: &[&str]) -> Result<TunnelSpec> {
    let matches = command().try_get_matches_from(std::iter::once("sshtun").chain(args.iter().copied()))?;
    spec_from_args(&matches)
  }

  #[test]
  fn endpoint_arguments_build_a_local_tunnel() {
    let spec = parse(&["--local", "localhost:8080", "--remote", "db:5432", "--server", "bastion:22"]).unwrap();
    assert_eq!(spec.forward_type, ForwardType::Local);
    assert_eq!(spec.local, Endpoint::tcp("localhost", 8080));
    assert_eq!(spec.remote, Endpoint::tcp("db", 5432));
    assert_eq!(spec.server, Endpoint::tcp("bastion", 22));
    assert_eq!(spec.user, DEFAULT_USER);
    assert_eq!(spec.auth, AuthSpec::Auto);
  }

  #[test]
  fn flags_select_remote_forwarding_and_authentication() {
    let spec = parse(&[
      "-l", "unix:/tmp/app.sock", "-r", "0.0.0.0:9000", "-s", "bastion:2222", "-R", "-A", "-u", "deploy",
      "--name", "app", "--timeout-secs", "5",
    ])
    .unwrap();
    assert_eq!(spec.forward_type, ForwardType::Remote);
    assert_eq!(spec.auth, AuthSpec::Agent);
    assert_eq!(spec.user, "deploy");
    assert_eq!(spec.name, "app");
    assert_eq!(spec.timeout_secs, 5);
  }

  #[test]
  fn password_environment_variables_are_named() {
    let spec = parse(&["-l", "a:1", "-r", "b:2", "-s", "c:3", "--password-env", "TUNNEL_PW"]).unwrap();
    assert_eq!(
      spec.auth,
      AuthSpec::PasswordEnv {
        variable: "TUNNEL_PW".into()
      }
    );
  }

  #[test]
  fn conflicting_authentication_is_rejected() {
    assert!(parse(&["-l", "a:1", "-r", "b:2", "-s", "c:3", "-A", "--password-env", "PW"]).is_err());
  }

  #[test]
  fn missing_endpoints_are_rejected() {
    assert!(parse(&["-l", "a:1", "-r", "b:2"]).is_err());
  }
}
