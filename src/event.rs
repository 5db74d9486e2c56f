use std::time::Duration;
use tokio::sync::mpsc;
use tracing::warn;

use crate::connectivity::{ConnectivityHandle, ConnectivityState};

/// Daemon events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
  /// Periodic wake
  Tick,
  /// Process resumed (SIGUSR1); the analogue of a page becoming visible again
  Resume,
  /// Ctrl-C
  Shutdown,
  /// A published connectivity transition
  Connectivity(ConnectivityState),
}

/// Event handler that merges the tick timer, process signals and
/// connectivity transitions into one stream
pub struct EventHandler {
  rx: mpsc::UnboundedReceiver<Event>,
}

impl EventHandler {
  /// `tick` of `None` disables the periodic wake.
  pub fn new(tick: Option<Duration>, connectivity: &ConnectivityHandle) -> Self {
    let (tx, rx) = mpsc::unbounded_channel();

    // Tick
    if let Some(period) = tick {
      let tx = tx.clone();
      tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately
        interval.tick().await;
        loop {
          interval.tick().await;
          if tx.send(Event::Tick).is_err() {
            break;
          }
        }
      });
    }

    // Connectivity transitions
    {
      let tx = tx.clone();
      let mut changes = connectivity.subscribe();
      tokio::spawn(async move {
        while changes.changed().await.is_ok() {
          let state = *changes.borrow_and_update();
          if tx.send(Event::Connectivity(state)).is_err() {
            break;
          }
        }
      });
    }

    // Ctrl-C
    {
      let tx = tx.clone();
      tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
          Ok(()) => {
            let _ = tx.send(Event::Shutdown);
          }
          Err(e) => warn!(error = %e, "could not listen for ctrl-c"),
        }
      });
    }

    #[cfg(unix)]
    spawn_resume_listener(tx);

    Self { rx }
  }

  /// Receive the next event
  pub async fn next(&mut self) -> Option<Event> {
    self.rx.recv().await
  }
}

#[cfg(unix)]
fn spawn_resume_listener(tx: mpsc::UnboundedSender<Event>) {
  use tokio::signal::unix::{signal, SignalKind};

  tokio::spawn(async move {
    let mut resume = match signal(SignalKind::user_defined1()) {
      Ok(s) => s,
      Err(e) => {
        warn!(error = %e, "could not listen for SIGUSR1");
        return;
      }
    };
    while resume.recv().await.is_some() {
      if tx.send(Event::Resume).is_err() {
        break;
      }
    }
  });
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::connectivity::ConnectivityMonitor;
  use crate::sync::SyncHandle;

  #[tokio::test(start_paused = true)]
  async fn test_ticks_after_each_period() {
    let mut events = EventHandler::new(
      Some(Duration::from_secs(60)),
      &ConnectivityHandle::fixed(ConnectivityState::Online),
    );

    let started = tokio::time::Instant::now();
    assert_eq!(events.next().await, Some(Event::Tick));
    assert!(started.elapsed() >= Duration::from_secs(60));
  }

  #[tokio::test]
  async fn test_forwards_connectivity_transitions() {
    let monitor = ConnectivityMonitor::new(
      ConnectivityState::Online,
      Duration::from_millis(10),
      SyncHandle::new(),
    );
    let mut events = EventHandler::new(None, &monitor.handle());

    monitor.report(ConnectivityState::Offline);
    let event = tokio::time::timeout(Duration::from_secs(5), events.next())
      .await
      .unwrap();
    assert_eq!(event, Some(Event::Connectivity(ConnectivityState::Offline)));
  }
}
