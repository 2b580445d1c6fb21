// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use anyhow::{Error as AnyErr, Result};
use sshtun::Endpoint;
use std::path::Path;
use std::time::Duration;

pub fn validate_existing_file(v: &str) -> Result<(), String> {
  if !Path::new(&v).exists() {
    Err(String::from("A file must exist at the given path"))
  } else {
    Ok(())
  }
}

pub fn parse_endpoint(v: &str) -> Result<Endpoint> {
  v.parse::<Endpoint>().map_err(AnyErr::from)
}

pub fn parse_secs(v: &str) -> Result<Duration> {
  match v.parse::<u64>() {
    Ok(0) => Err(AnyErr::msg("Durations must be at least one second")),
    Ok(secs) => Ok(Duration::from_secs(secs)),
    Err(_) => Err(AnyErr::msg("Durations must be a whole number of seconds")),
  }
}

pub fn parse_env_name(v: &str) -> Result<&str> {
  let valid = !v.is_empty()
    && !v.starts_with(|c: char| c.is_ascii_digit())
    && v.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
  if valid {
    Ok(v)
  } else {
    Err(AnyErr::msg(
      "Environment variable names may only contain letters, digits, and underscores",
    ))
  }
}

pub fn validate_endpoint(v: &str) -> Result<(), String> {
  parse_endpoint(v).map(|_| ()).map_err(|e| e.to_string())
}

pub fn validate_secs(v: &str) -> Result<(), String> {
  parse_secs(v).map(|_| ()).map_err(|e| e.to_string())
}

pub fn validate_env_name(v: &str) -> Result<(), String> {
  parse_env_name(v).map(|_| ()).map_err(|e| e.to_string())
}
