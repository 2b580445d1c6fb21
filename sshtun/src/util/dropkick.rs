// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

/// Runs a closure when dropped
///
/// A tunnel run holds one of these so its run-state unwinds whether `start`
/// returns or its future is dropped part-way through.
#[must_use = "the callback runs as soon as the guard is dropped"]
pub struct Dropkick<F: FnOnce()> {
  callback: Option<F>,
}

impl<F: FnOnce()> Dropkick<F> {
  pub fn callback(callback: F) -> Self {
    Self {
      callback: Some(callback),
    }
  }
}

impl<F: FnOnce()> Drop for Dropkick<F> {
  fn drop(&mut self) {
    if let Some(callback) = self.callback.take() {
      callback();
    }
  }
}

#[cfg(test)]
mod tests {
  use super::Dropkick;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::sync::Arc;
  use std::time::Duration;

  #[test]
  fn dropkick_callback_notifies() {
    let mut m = false;
    drop(Dropkick::callback(|| m = true));
    assert!(m, "Callback Dropkick must run when dropped");
  }

  #[tokio::test]
  async fn abandoned_futures_run_their_callback_once() {
    let calls = Arc::new(AtomicUsize::new(0));
    let pending = {
      let calls = calls.clone();
      async move {
        let _guard = Dropkick::callback(move || {
          calls.fetch_add(1, Ordering::SeqCst);
        });
        tokio::time::sleep(Duration::from_secs(60)).await;
      }
    };
    let res = tokio::time::timeout(Duration::from_millis(10), pending).await;
    assert!(res.is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }
}
