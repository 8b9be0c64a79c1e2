//! Ownership recovery loop
//!
//! Claiming a query, or losing it through invalidation, starts a background
//! thread that re-runs the query until this node owns it again. Running out
//! of attempts is fatal: the repository is poisoned and the fatal hook runs.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use rand::Rng;

use crate::config::Config;
use crate::entity::Query;
use crate::error::Result;

/// Something that can try to (re)acquire ownership of a query
pub trait Reacquire: Send + Sync + 'static {
    fn entity_type(&self) -> &'static str;

    /// Run the query (loading it from peers) and report whether it is owned now
    fn try_acquire(&self, query: &Query) -> Result<bool>;
}

/// Details of an unrecoverable ownership loss
#[derive(Debug, Clone)]
pub struct FatalOwnershipLoss {
    pub entity_type: &'static str,
    pub query: Query,
    pub attempts: u32,
    pub last_error: Option<String>,
}

pub type FatalHook = Arc<dyn Fn(&FatalOwnershipLoss) + Send + Sync>;

/// Default fatal policy: panic the detecting thread after the repository is poisoned
pub fn default_fatal_hook() -> FatalHook {
    Arc::new(|loss: &FatalOwnershipLoss| {
        panic!(
            "fatal ownership loss: {} {} after {} attempts",
            loss.entity_type, loss.query, loss.attempts
        );
    })
}

/// Shared recovery settings and state
pub struct RecoveryPolicy {
    max_attempts: u32,
    backoff_min: Duration,
    backoff_max: Duration,
    fatal_hook: RwLock<FatalHook>,
    poisoned: AtomicBool,
    /// (entity type, query) pairs with a running loop
    active: Mutex<HashSet<(&'static str, Query)>>,
}

impl RecoveryPolicy {
    pub fn new(max_attempts: u32, backoff_min: Duration, backoff_max: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff_min,
            backoff_max: backoff_max.max(backoff_min),
            fatal_hook: RwLock::new(default_fatal_hook()),
            poisoned: AtomicBool::new(false),
            active: Mutex::new(HashSet::new()),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.ownership_max_attempts,
            Duration::from_millis(config.ownership_backoff_min_ms),
            Duration::from_millis(config.ownership_backoff_max_ms),
        )
    }

    pub fn set_fatal_hook(&self, hook: FatalHook) {
        *self.fatal_hook.write() = hook;
    }

    /// Set once ownership recovery has failed for good
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }

    fn backoff(&self) -> Duration {
        if self.backoff_min == self.backoff_max {
            return self.backoff_min;
        }
        rand::thread_rng().gen_range(self.backoff_min..=self.backoff_max)
    }

    fn fail(&self, loss: FatalOwnershipLoss) {
        self.poisoned.store(true, Ordering::Release);
        tracing::error!(
            entity_type = loss.entity_type,
            query = %loss.query,
            attempts = loss.attempts,
            last_error = loss.last_error.as_deref().unwrap_or("none"),
            "ownership could not be reacquired; refusing to run with unknown ownership"
        );
        let hook = Arc::clone(&self.fatal_hook.read());
        hook(&loss);
    }
}

/// Start a recovery loop for `query`, unless one is already running
///
/// A loop that cannot be started is an immediate fatal ownership loss.
pub fn spawn_recovery(
    policy: Arc<RecoveryPolicy>,
    target: Arc<dyn Reacquire>,
    query: Query,
) -> Option<JoinHandle<()>> {
    spawn_recovery_with(policy, target, query, |name, task| {
        std::thread::Builder::new().name(name).spawn(task)
    })
}

type Task = Box<dyn FnOnce() + Send>;

fn spawn_recovery_with<S>(
    policy: Arc<RecoveryPolicy>,
    target: Arc<dyn Reacquire>,
    query: Query,
    spawn: S,
) -> Option<JoinHandle<()>>
where
    S: FnOnce(String, Task) -> std::io::Result<JoinHandle<()>>,
{
    let entity_type = target.entity_type();
    if !policy.active.lock().insert((entity_type, query.clone())) {
        tracing::debug!(entity_type, query = %query, "ownership recovery already running");
        return None;
    }

    let task: Task = {
        let policy = Arc::clone(&policy);
        let query = query.clone();
        Box::new(move || run_recovery(&policy, target.as_ref(), &query))
    };

    match spawn(format!("own-{}", entity_type), task) {
        Ok(handle) => Some(handle),
        Err(e) => {
            tracing::error!(entity_type, error = %e, "failed to spawn ownership recovery thread");
            policy.active.lock().remove(&(entity_type, query.clone()));
            policy.fail(FatalOwnershipLoss {
                entity_type,
                query,
                attempts: 0,
                last_error: Some(format!("recovery thread did not start: {}", e)),
            });
            None
        }
    }
}

fn run_recovery(policy: &RecoveryPolicy, target: &dyn Reacquire, query: &Query) {
    let entity_type = target.entity_type();
    let mut attempts = 0u32;
    let mut last_error = None;

    loop {
        match target.try_acquire(query) {
            Ok(true) => {
                tracing::info!(entity_type, query = %query, attempts, "ownership acquired");
                policy.active.lock().remove(&(entity_type, query.clone()));
                return;
            }
            Ok(false) => {
                tracing::debug!(entity_type, query = %query, attempts, "ownership not granted yet");
            }
            Err(e) => {
                tracing::warn!(entity_type, query = %query, attempts, error = %e, "ownership load failed");
                last_error = Some(e.to_string());
            }
        }

        attempts += 1;
        if attempts >= policy.max_attempts {
            policy.active.lock().remove(&(entity_type, query.clone()));
            policy.fail(FatalOwnershipLoss {
                entity_type,
                query: query.clone(),
                attempts,
                last_error,
            });
            return;
        }

        std::thread::sleep(policy.backoff());
    }
}
