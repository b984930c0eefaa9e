//! Replaying queued writes: the reconciler, its retry policy and the
//! connectivity monitor that triggers it.

mod connectivity;
mod policy;
mod reconciler;

pub use connectivity::{ConnectivityMonitor, NetworkState};
pub use policy::{Disposition, Failure, RetryPolicy};
pub use reconciler::{Reconciler, SyncOutcome, SyncTrigger};
