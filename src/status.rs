//! Best-effort network reachability tracking.
//!
//! The status is a single `AtomicU64`: bit 63 holds the online flag and the
//! low bits hold the time of the last check in milliseconds since the epoch.
//! Concurrent writers race, and the last write wins, but the timestamp never
//! moves backwards.

use chrono::{DateTime, TimeZone, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::network::{OutboundRequest, Transport};

const ONLINE_BIT: u64 = 1 << 63;
const TIME_MASK: u64 = !ONLINE_BIT;

type Clock = Arc<dyn Fn() -> u64 + Send + Sync>;

/// Snapshot of the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OnlineStatus {
  pub is_online: bool,
  pub last_checked_ms: u64,
}

impl OnlineStatus {
  fn unpack(word: u64) -> Self {
    Self {
      is_online: word & ONLINE_BIT != 0,
      last_checked_ms: word & TIME_MASK,
    }
  }

  fn pack(self) -> u64 {
    let flag = if self.is_online { ONLINE_BIT } else { 0 };
    flag | (self.last_checked_ms & TIME_MASK)
  }

  pub fn last_checked_at(&self) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(self.last_checked_ms as i64).single()
  }
}

/// What a refresh did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
  /// Status was fresh, or another caller already claimed the probe
  Skipped,
  Online,
  Offline,
  /// The probe failed for a reason that says nothing about reachability
  Inconclusive,
}

pub struct OnlineStatusTracker {
  word: AtomicU64,
  timeout: Duration,
  clock: Clock,
}

impl OnlineStatusTracker {
  /// Starts offline with a zero timestamp, so the first check is due immediately.
  pub fn new(timeout: Duration) -> Self {
    Self::with_clock(timeout, Arc::new(system_millis))
  }

  pub fn with_clock(timeout: Duration, clock: Clock) -> Self {
    Self {
      word: AtomicU64::new(0),
      timeout,
      clock,
    }
  }

  pub fn snapshot(&self) -> OnlineStatus {
    OnlineStatus::unpack(self.word.load(Ordering::Acquire))
  }

  pub fn is_online(&self) -> bool {
    self.snapshot().is_online
  }

  pub fn mark_online(&self) {
    self.record(true);
  }

  pub fn mark_offline(&self) {
    self.record(false);
  }

  fn record(&self, is_online: bool) {
    let now = (self.clock)();
    let previous = self
      .word
      .fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| {
        let prev = OnlineStatus::unpack(word);
        Some(
          OnlineStatus {
            is_online,
            last_checked_ms: now.max(prev.last_checked_ms),
          }
          .pack(),
        )
      });
    // The closure always returns Some, so fetch_update cannot fail.
    if let Ok(word) = previous {
      if OnlineStatus::unpack(word).is_online != is_online {
        info!(online = is_online, "Network status changed");
      }
    }
  }

  fn stale_at(&self, status: OnlineStatus, now: u64) -> bool {
    now.saturating_sub(status.last_checked_ms) >= self.timeout.as_millis() as u64
  }

  pub fn is_stale(&self) -> bool {
    self.stale_at(self.snapshot(), (self.clock)())
  }

  /// Claim the right to probe by bumping the timestamp while stale.
  ///
  /// Exactly one caller wins per staleness window; everyone else sees a fresh
  /// status and skips.
  fn try_claim_probe(&self) -> bool {
    let now = (self.clock)();
    let mut current = self.word.load(Ordering::Acquire);
    loop {
      let status = OnlineStatus::unpack(current);
      if !self.stale_at(status, now) {
        return false;
      }
      let claimed = OnlineStatus {
        is_online: status.is_online,
        last_checked_ms: now.max(status.last_checked_ms),
      }
      .pack();
      match self
        .word
        .compare_exchange(current, claimed, Ordering::AcqRel, Ordering::Acquire)
      {
        Ok(_) => return true,
        Err(actual) => current = actual,
      }
    }
  }

  /// Probe the health endpoint if the status is stale.
  pub async fn refresh_if_stale(
    &self,
    transport: &dyn Transport,
    probe: &OutboundRequest,
  ) -> ProbeOutcome {
    if !self.try_claim_probe() {
      return ProbeOutcome::Skipped;
    }

    match transport.send(probe).await {
      Ok(response) => {
        debug!(status = response.status, "Health probe answered");
        self.mark_online();
        ProbeOutcome::Online
      }
      Err(e) if e.is_connectivity() => {
        debug!(error = %e, "Health probe could not reach the network");
        self.mark_offline();
        ProbeOutcome::Offline
      }
      Err(e) => {
        debug!(error = %e, "Health probe failed");
        ProbeOutcome::Inconclusive
      }
    }
  }

  /// Run `refresh_if_stale` on a detached task; the caller never waits for it.
  pub fn spawn_refresh(
    self: &Arc<Self>,
    transport: Arc<dyn Transport>,
    probe: OutboundRequest,
  ) -> JoinHandle<ProbeOutcome> {
    let tracker = Arc::clone(self);
    tokio::spawn(async move { tracker.refresh_if_stale(transport.as_ref(), &probe).await })
  }
}

fn system_millis() -> u64 {
  Utc::now().timestamp_millis().max(0) as u64
}
