//! Replays queued writes against the server.

use chrono::Utc;
use color_eyre::Result;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::policy::{Disposition, Failure, RetryPolicy};
use crate::network::Network;
use crate::store::{OfflineStore, OperationKind, PendingOperation};

/// What started a sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
  Manual,
  /// Connectivity came back
  OnlineTransition,
  /// The host asked for a background sync (`sync-data`)
  BackgroundSync,
  /// Timer while online
  Periodic,
}

impl SyncTrigger {
  /// Only timer sweeps wait out the backoff; every other trigger retries
  /// everything still pending.
  pub fn respects_backoff(&self) -> bool {
    matches!(self, SyncTrigger::Periodic)
  }
}

/// Counts for one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncOutcome {
  pub success: usize,
  pub failed: usize,
  /// Failures that were terminal (counted in `failed` too)
  pub abandoned: usize,
  /// Another sweep held the lock; nothing was attempted
  pub already_running: bool,
}

impl SyncOutcome {
  pub fn attempted(&self) -> usize {
    self.success + self.failed
  }
}

/// Drains the pending-operation queue.
///
/// Sweeps in one process are serialized; operations are claimed in the
/// store before they are sent, so a sweep in another process sharing the
/// database can't pick up the same operation.
pub struct Reconciler<N: Network> {
  store: OfflineStore,
  network: Arc<N>,
  policy: RetryPolicy,
  sweep_lock: Arc<Mutex<()>>,
}

impl<N: Network> Reconciler<N> {
  pub fn new(store: OfflineStore, network: Arc<N>, policy: RetryPolicy) -> Self {
    Self {
      store,
      network,
      policy,
      sweep_lock: Arc::new(Mutex::new(())),
    }
  }

  pub fn store(&self) -> &OfflineStore {
    &self.store
  }

  /// Replay every due operation.
  pub async fn sync_pending_operations(&self, trigger: SyncTrigger) -> SyncOutcome {
    self.sweep(None, trigger).await
  }

  /// Replay due offline sales only.
  pub async fn sync_offline_sales(&self, trigger: SyncTrigger) -> SyncOutcome {
    self.sweep(Some(OperationKind::Sale), trigger).await
  }

  async fn sweep(&self, kind: Option<OperationKind>, trigger: SyncTrigger) -> SyncOutcome {
    let Ok(_guard) = self.sweep_lock.try_lock() else {
      debug!(?trigger, "sync already running, skipping");
      return SyncOutcome {
        already_running: true,
        ..Default::default()
      };
    };

    match self.run(kind, trigger).await {
      Ok(outcome) => {
        if outcome.attempted() > 0 {
          info!(
            ?trigger,
            success = outcome.success,
            failed = outcome.failed,
            abandoned = outcome.abandoned,
            "sync finished"
          );
        }
        outcome
      }
      Err(e) => {
        error!(?trigger, error = %e, "sync sweep failed");
        SyncOutcome::default()
      }
    }
  }

  async fn run(&self, kind: Option<OperationKind>, trigger: SyncTrigger) -> Result<SyncOutcome> {
    let due = self
      .store
      .due_operations(kind, Utc::now(), trigger.respects_backoff())?;
    debug!(?trigger, count = due.len(), "operations due");

    let mut outcome = SyncOutcome::default();
    for id in due {
      // Claimed one at a time so the lease covers only this send.
      let operation = match self.store.claim(id, Utc::now()) {
        Ok(Some(operation)) => operation,
        Ok(None) => continue,
        Err(e) => {
          warn!(op_id = id, error = %e, "failed to claim operation");
          continue;
        }
      };

      match self.replay(&operation).await {
        Ok(()) => match self.store.mark_as_synced(operation.id) {
          Ok(_) => outcome.success += 1,
          Err(e) => {
            warn!(op_id = operation.id, error = %e, "failed to mark operation synced");
            outcome.failed += 1;
            if let Err(e) = self.store.release_claim(operation.id) {
              warn!(op_id = operation.id, error = %e, "failed to release claim");
            }
          }
        },
        Err(failure) => {
          outcome.failed += 1;
          let counted = failure.counts_attempt();
          let attempts = operation.attempts + u32::from(counted);
          let retry_at = match self.policy.decide(attempts, &failure, Utc::now()) {
            Disposition::Retry(at) => Some(at),
            Disposition::Abandon => {
              outcome.abandoned += 1;
              None
            }
          };

          warn!(
            op_id = operation.id,
            url = %operation.url,
            attempts,
            error = %failure,
            abandoned = retry_at.is_none(),
            "operation replay failed"
          );

          match self
            .store
            .record_failure(operation.id, &failure.to_string(), retry_at, counted)
          {
            Ok(true) => {}
            Ok(false) => warn!(op_id = operation.id, "claim lost before recording failure"),
            Err(e) => warn!(op_id = operation.id, error = %e, "failed to record replay failure"),
          }
        }
      }
    }

    Ok(outcome)
  }

  async fn replay(&self, operation: &PendingOperation) -> std::result::Result<(), Failure> {
    match self.network.fetch(&operation.to_request()).await {
      Ok(response) if response.is_ok() => Ok(()),
      Ok(response) => Err(Failure::Status(response.status)),
      Err(e) => Err(Failure::Transport(e.to_string())),
    }
  }
}

impl<N: Network> Clone for Reconciler<N> {
  fn clone(&self) -> Self {
    Self {
      store: self.store.clone(),
      network: Arc::clone(&self.network),
      policy: self.policy.clone(),
      sweep_lock: Arc::clone(&self.sweep_lock),
    }
  }
}
