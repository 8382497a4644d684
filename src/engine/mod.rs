pub mod project;
pub mod provider;
pub mod scheduler;
pub mod status;

pub use project::{Build, BuildStatus, Project, ProjectId};
pub use provider::{RefreshOutcome, SyncProvider};
pub use scheduler::{Scheduler, SchedulerState};
pub use status::{aggregate, AggregateStatus};

use std::sync::{Mutex, MutexGuard};

/// Lock, recovering the data if a listener panicked while holding it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
