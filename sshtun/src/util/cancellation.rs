// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::future::Future;

use tokio_util::sync::CancellationToken;

/// A [CancellationToken] that cannot be triggered by its recipient
///
/// A tunnel run receives one of these as its shutdown signal; it derives its
/// own child tokens from it, so the run can be stopped on its own without
/// affecting whoever owns the parent token.
#[derive(Debug, Clone, Default)]
#[repr(transparent)]
pub struct CancellationListener {
  token: CancellationToken,
}

impl CancellationListener {
  /// A listener whose parent is never cancelled
  pub fn detached() -> Self {
    Self::default()
  }

  pub fn child_token(&self) -> CancellationToken {
    self.token.child_token()
  }

  pub fn is_cancelled(&self) -> bool {
    self.token.is_cancelled()
  }
}

impl From<CancellationToken> for CancellationListener {
  fn from(token: CancellationToken) -> Self {
    Self { token }
  }
}

impl From<&CancellationToken> for CancellationListener {
  fn from(token: &CancellationToken) -> Self {
    Self {
      token: token.clone(),
    }
  }
}

/// Runs `fut` to completion unless `token` fires first, yielding `None` when cancelled
///
/// Cancellation wins ties, so a future that becomes ready in the same poll as
/// the token is discarded.
pub async fn cancellable<F: Future>(token: &CancellationToken, fut: F) -> Option<F::Output> {
  tokio::select! {
    biased;
    _ = token.cancelled() => None,
    res = fut => Some(res),
  }
}

#[cfg(test)]
mod tests {
  use super::{cancellable, CancellationListener};
  use std::time::Duration;
  use tokio_util::sync::CancellationToken;

  #[tokio::test]
  async fn child_tokens_follow_the_parent() {
    let parent = CancellationToken::new();
    let listener = CancellationListener::from(&parent);
    let child = listener.child_token();
    assert!(!child.is_cancelled());
    parent.cancel();
    assert!(listener.is_cancelled());
    assert!(child.is_cancelled());
  }

  #[tokio::test]
  async fn cancelling_a_child_leaves_the_listener_alone() {
    let listener = CancellationListener::detached();
    let child = listener.child_token();
    child.cancel();
    assert!(!listener.is_cancelled());
  }

  #[tokio::test]
  async fn cancellable_abandons_pending_work() {
    let token = CancellationToken::new();
    token.cancel();
    let res = cancellable(&token, tokio::time::sleep(Duration::from_secs(60))).await;
    assert!(res.is_none());

    let token = CancellationToken::new();
    assert_eq!(cancellable(&token, async { 5 }).await, Some(5));
  }
}
