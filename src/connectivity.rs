//! Online/offline state shared by the queue worker and the autosave loop.

use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

use crate::event::Notifier;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Connectivity {
  Online,
  Offline,
}

impl fmt::Display for Connectivity {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Connectivity::Online => write!(f, "online"),
      Connectivity::Offline => write!(f, "offline"),
    }
  }
}

/// Holds the current connectivity and wakes watchers on transitions.
///
/// Platform glue (network reachability callbacks, failed requests) calls
/// [`ConnectivityMonitor::set`]; consumers either read [`is_online`] or hold a
/// [`watch::Receiver`] to be woken when the state flips.
///
/// [`is_online`]: ConnectivityMonitor::is_online
pub struct ConnectivityMonitor {
  tx: watch::Sender<Connectivity>,
  notifier: Arc<Notifier>,
}

impl ConnectivityMonitor {
  pub fn new(initial: Connectivity, notifier: Arc<Notifier>) -> Self {
    let (tx, _rx) = watch::channel(initial);
    Self { tx, notifier }
  }

  pub fn current(&self) -> Connectivity {
    *self.tx.borrow()
  }

  pub fn is_online(&self) -> bool {
    self.current() == Connectivity::Online
  }

  pub fn watch(&self) -> watch::Receiver<Connectivity> {
    self.tx.subscribe()
  }

  /// Record a connectivity observation. Only real transitions are broadcast.
  pub fn set(&self, state: Connectivity) {
    let changed = self.tx.send_if_modified(|current| {
      if *current == state {
        false
      } else {
        *current = state;
        true
      }
    });

    if changed {
      info!("Connectivity changed: {}", state);
      self.notifier.connectivity(state);
    }
  }

  pub fn set_online(&self, online: bool) {
    self.set(if online {
      Connectivity::Online
    } else {
      Connectivity::Offline
    });
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_only_transitions_are_broadcast() {
    let notifier = Arc::new(Notifier::new());
    let mut events = notifier.subscribe_connectivity();
    let monitor = ConnectivityMonitor::new(Connectivity::Offline, notifier);

    monitor.set(Connectivity::Offline);
    monitor.set_online(true);
    monitor.set_online(true);
    monitor.set_online(false);

    assert_eq!(events.recv().await.unwrap(), Connectivity::Online);
    assert_eq!(events.recv().await.unwrap(), Connectivity::Offline);
    assert!(events.try_recv().is_err());
  }

  #[tokio::test]
  async fn test_watchers_see_restore() {
    let monitor = ConnectivityMonitor::new(Connectivity::Offline, Arc::new(Notifier::new()));
    let mut rx = monitor.watch();

    monitor.set_online(true);
    rx.changed().await.unwrap();
    assert_eq!(*rx.borrow(), Connectivity::Online);
    assert!(monitor.is_online());
  }
}
