// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! An in-process transport
//!
//! Sessions live entirely in memory: channels are [tokio::io::duplex] pairs
//! handed to destinations registered with [MemoryTransport::serve], and remote
//! listeners receive connections injected with [MemoryTransport::connect_remote].
//! Dial and close counters make session lifetimes observable.
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use futures::stream::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use super::{Incoming, IncomingConnection, Transport, TransportConfig, TransportError, TransportSession};
use crate::common::endpoint::Endpoint;
use crate::util::tunnel_stream::WrappedStream;

const CHANNEL_BUFFER_SIZE: usize = 64 * 1024;

type ListenerSender = mpsc::UnboundedSender<Result<IncomingConnection, TransportError>>;

#[derive(Default)]
struct MemoryNetwork {
  dials: AtomicUsize,
  closes: AtomicUsize,
  open: AtomicUsize,
  fail_dials: AtomicBool,
  refuse_listen: AtomicBool,
  dial_delay: Mutex<Duration>,
  destinations: Mutex<HashMap<Endpoint, mpsc::UnboundedSender<WrappedStream>>>,
  listeners: Mutex<HashMap<Endpoint, ListenerSender>>,
}

impl MemoryNetwork {
  fn destinations(&self) -> std::sync::MutexGuard<'_, HashMap<Endpoint, mpsc::UnboundedSender<WrappedStream>>> {
    self.destinations.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn listeners(&self) -> std::sync::MutexGuard<'_, HashMap<Endpoint, ListenerSender>> {
    self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
  }
}

/// A [Transport] whose server lives in the same process
#[derive(Clone, Default)]
pub struct MemoryTransport {
  network: Arc<MemoryNetwork>,
}

impl MemoryTransport {
  pub fn new() -> Self {
    Self::default()
  }

  /// Registers `endpoint` as reachable through sessions, yielding the server-side
  /// end of every channel opened to it
  pub fn serve(&self, endpoint: Endpoint) -> UnboundedReceiverStream<WrappedStream> {
    let (tx, rx) = mpsc::unbounded_channel();
    self.network.destinations().insert(endpoint, tx);
    UnboundedReceiverStream::new(rx)
  }

  /// Simulates a client connecting to a remote listener opened by a session
  pub fn connect_remote(&self, endpoint: &Endpoint, peer: &str) -> Result<WrappedStream, TransportError> {
    let listeners = self.network.listeners();
    let sender = listeners
      .get(endpoint)
      .ok_or_else(|| TransportError::Rejected(format!("nothing listening on {}", endpoint)))?;
    let (client, server) = WrappedStream::duplex(CHANNEL_BUFFER_SIZE);
    sender
      .send(Ok(IncomingConnection::new(server, peer)))
      .map_err(|_| TransportError::Closed)?;
    Ok(client)
  }

  /// Makes the remote listener on `endpoint` report `error` as its next accept result
  pub fn fail_listener(&self, endpoint: &Endpoint, error: TransportError) -> bool {
    match self.network.listeners().get(endpoint) {
      Some(sender) => sender.send(Err(error)).is_ok(),
      None => false,
    }
  }

  /// Ends the remote listener on `endpoint` as if the server dropped it
  pub fn close_listener(&self, endpoint: &Endpoint) -> bool {
    self.network.listeners().remove(endpoint).is_some()
  }

  pub fn is_listening(&self, endpoint: &Endpoint) -> bool {
    self.network.listeners().contains_key(endpoint)
  }

  pub fn set_fail_dials(&self, fail: bool) {
    self.network.fail_dials.store(fail, Ordering::SeqCst);
  }

  pub fn set_refuse_listen(&self, refuse: bool) {
    self.network.refuse_listen.store(refuse, Ordering::SeqCst);
  }

  /// Delays every dial, widening the window in which dials can overlap
  pub fn set_dial_delay(&self, delay: Duration) {
    *self
      .network
      .dial_delay
      .lock()
      .unwrap_or_else(PoisonError::into_inner) = delay;
  }

  /// Dial attempts made so far, failed ones included
  pub fn dial_count(&self) -> usize {
    self.network.dials.load(Ordering::SeqCst)
  }

  pub fn close_count(&self) -> usize {
    self.network.closes.load(Ordering::SeqCst)
  }

  /// Sessions dialed successfully and not yet closed
  pub fn open_sessions(&self) -> usize {
    self.network.open.load(Ordering::SeqCst)
  }
}

impl Transport for MemoryTransport {
  fn dial<'a>(
    &'a self,
    server: &'a Endpoint,
    config: &'a TransportConfig,
  ) -> BoxFuture<'a, Result<Box<dyn TransportSession>, TransportError>> {
    let network = self.network.clone();
    async move {
      network.dials.fetch_add(1, Ordering::SeqCst);
      let delay = *network.dial_delay.lock().unwrap_or_else(PoisonError::into_inner);
      if !delay.is_zero() {
        tokio::time::sleep(delay).await;
      }
      if network.fail_dials.load(Ordering::SeqCst) {
        return Err(TransportError::Io(std::io::Error::new(
          std::io::ErrorKind::ConnectionRefused,
          format!("connection to {} refused", server),
        )));
      }
      tracing::trace!(%server, user = %config.user, "Memory session opened");
      network.open.fetch_add(1, Ordering::SeqCst);
      let session: Box<dyn TransportSession> = Box::new(MemorySession {
        network,
        closed: AtomicBool::new(false),
        listening: Mutex::new(Vec::new()),
      });
      Ok(session)
    }
    .boxed()
  }
}

struct MemorySession {
  network: Arc<MemoryNetwork>,
  closed: AtomicBool,
  listening: Mutex<Vec<Endpoint>>,
}

impl MemorySession {
  fn ensure_open(&self) -> Result<(), TransportError> {
    if self.closed.load(Ordering::SeqCst) {
      Err(TransportError::Closed)
    } else {
      Ok(())
    }
  }

  fn drop_listeners(&self) {
    let endpoints = std::mem::take(&mut *self.listening.lock().unwrap_or_else(PoisonError::into_inner));
    let mut listeners = self.network.listeners();
    for endpoint in endpoints {
      listeners.remove(&endpoint);
    }
  }
}

impl TransportSession for MemorySession {
  fn listen<'a>(&'a self, address: &'a Endpoint) -> BoxFuture<'a, Result<Incoming, TransportError>> {
    async move {
      self.ensure_open()?;
      if self.network.refuse_listen.load(Ordering::SeqCst) {
        return Err(TransportError::Rejected(format!("listen on {} refused", address)));
      }
      let mut listeners = self.network.listeners();
      if listeners.contains_key(address) {
        return Err(TransportError::Rejected(format!("{} is already in use", address)));
      }
      let (tx, rx) = mpsc::unbounded_channel();
      listeners.insert(address.clone(), tx);
      self
        .listening
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .push(address.clone());
      let incoming: Incoming = UnboundedReceiverStream::new(rx).boxed();
      Ok(incoming)
    }
    .boxed()
  }

  fn dial_channel<'a>(
    &'a self,
    address: &'a Endpoint,
  ) -> BoxFuture<'a, Result<WrappedStream, TransportError>> {
    async move {
      self.ensure_open()?;
      let (local, remote) = WrappedStream::duplex(CHANNEL_BUFFER_SIZE);
      let delivered = match self.network.destinations().get(address) {
        Some(destination) => destination.send(remote).is_ok(),
        None => false,
      };
      if delivered {
        Ok(local)
      } else {
        Err(TransportError::Rejected(format!("connect to {} refused", address)))
      }
    }
    .boxed()
  }

  fn close<'a>(&'a self) -> BoxFuture<'a, ()> {
    async move {
      if !self.closed.swap(true, Ordering::SeqCst) {
        self.drop_listeners();
        self.network.closes.fetch_add(1, Ordering::SeqCst);
        self.network.open.fetch_sub(1, Ordering::SeqCst);
      }
    }
    .boxed()
  }
}

impl Drop for MemorySession {
  fn drop(&mut self) {
    // Dropping without close still ends the session, but is not counted as a close
    if !self.closed.swap(true, Ordering::SeqCst) {
      self.drop_listeners();
      self.network.open.fetch_sub(1, Ordering::SeqCst);
    }
  }
}
