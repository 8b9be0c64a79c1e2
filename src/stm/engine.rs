//! Transaction manager
//!
//! Runs transaction bodies with automatic re-execution on conflict and hands
//! out held-open commits for two-phase protocols.

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::entity::EntityTag;
use crate::error::{RepoError, Result};
use super::Txn;

thread_local! {
    /// Set while a transaction body runs on this thread
    static IN_BODY: Cell<bool> = const { Cell::new(false) };
}

/// Marks the current thread as running a body; nesting is a protocol error
struct BodyGuard;

impl BodyGuard {
    fn enter() -> Result<Self> {
        IN_BODY.with(|flag| {
            if flag.get() {
                return Err(RepoError::Protocol(
                    "transaction started inside another transaction body; pass the handle instead"
                        .to_string(),
                ));
            }
            flag.set(true);
            Ok(BodyGuard)
        })
    }
}

impl Drop for BodyGuard {
    fn drop(&mut self) {
        IN_BODY.with(|flag| flag.set(false));
    }
}

/// Counters exposed for diagnostics
#[derive(Debug, Default)]
pub struct StmStats {
    pub commits: AtomicU64,
    pub conflicts: AtomicU64,
    pub load_retries: AtomicU64,
    pub timeouts: AtomicU64,
}

/// The optimistic transaction manager
#[derive(Debug, Default)]
pub struct Stm {
    stats: Arc<StmStats>,
}

impl Stm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> &StmStats {
        &self.stats
    }

    /// True while the current thread is inside a transaction body
    pub fn in_transaction() -> bool {
        IN_BODY.with(|flag| flag.get())
    }

    /// Run `body` until it commits
    ///
    /// Conflicts re-run the body transparently; `RetryRequired` runs the
    /// deferred loads first. Any other error aborts and is returned as is.
    pub fn run<R, F>(&self, timeout: Duration, body: F) -> Result<R>
    where
        F: FnMut(&mut Txn) -> Result<R>,
    {
        let (result, continuation) = self.run_to_commit(timeout, body)?;
        continuation.commit()?;
        Ok(result)
    }

    /// Run `body` up to the commit point and hold the commit locks
    ///
    /// The returned continuation must be committed or rolled back; dropping
    /// it rolls back.
    pub fn run_to_commit<R, F>(&self, timeout: Duration, mut body: F) -> Result<(R, Continuation)>
    where
        F: FnMut(&mut Txn) -> Result<R>,
    {
        let deadline = Instant::now() + timeout;
        let mut attempt: u32 = 0;

        loop {
            if attempt > 0 && Instant::now() >= deadline {
                self.stats.timeouts.fetch_add(1, Ordering::Relaxed);
                return Err(RepoError::Timeout(format!(
                    "transaction did not commit within {:?} ({} attempts)",
                    timeout, attempt
                )));
            }

            let mut txn = Txn::begin();
            let outcome = {
                let _guard = BodyGuard::enter()?;
                body(&mut txn)
            };
            let outcome = outcome.and_then(|result| txn.lock_and_validate().map(|_| result));

            match outcome {
                Ok(result) => {
                    let continuation = Continuation {
                        txn: Some(txn),
                        stats: Arc::clone(&self.stats),
                    };
                    return Ok((result, continuation));
                }
                Err(RepoError::Conflict) => {
                    self.stats.conflicts.fetch_add(1, Ordering::Relaxed);
                    txn.abort();
                    backoff(attempt);
                }
                Err(RepoError::RetryRequired) => {
                    self.stats.load_retries.fetch_add(1, Ordering::Relaxed);
                    for load in txn.abort() {
                        load()?;
                    }
                }
                Err(e) => {
                    txn.abort();
                    return Err(e);
                }
            }

            attempt = attempt.saturating_add(1);
        }
    }
}

fn backoff(attempt: u32) {
    if attempt < 3 {
        std::thread::yield_now();
    } else {
        std::thread::sleep(Duration::from_micros(50 * u64::from(attempt.min(40))));
    }
}

/// A transaction that passed validation and holds its commit locks
///
/// Other transactions touching the locked cells conflict and retry until the
/// continuation is committed or rolled back.
pub struct Continuation {
    txn: Option<Txn>,
    stats: Arc<StmStats>,
}

impl Continuation {
    /// Publish the writes and run commit effects
    pub fn commit(mut self) -> Result<()> {
        let mut txn = self
            .txn
            .take()
            .ok_or_else(|| RepoError::Protocol("continuation already completed".to_string()))?;

        let effects = txn.commit_locked();
        self.stats.commits.fetch_add(1, Ordering::Relaxed);

        for effect in effects {
            effect();
        }
        Ok(())
    }

    /// Release the locks and discard the writes
    pub fn rollback(mut self) {
        if let Some(mut txn) = self.txn.take() {
            txn.abort();
        }
    }

    /// Run `f` against the held transaction (reads, and writes to already locked cells)
    pub fn in_context<R>(&mut self, f: impl FnOnce(&mut Txn) -> R) -> Result<R> {
        match self.txn.as_mut() {
            Some(txn) => Ok(f(txn)),
            None => Err(RepoError::Protocol("continuation already completed".to_string())),
        }
    }

    /// Register an effect to run after commit
    pub fn on_commit<F>(&mut self, effect: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.in_context(|txn| txn.on_commit(effect))
    }

    pub fn written_tags(&self) -> Vec<EntityTag> {
        self.txn.as_ref().map(Txn::written_tags).unwrap_or_default()
    }

    pub fn is_completed(&self) -> bool {
        self.txn.is_none()
    }
}

impl Drop for Continuation {
    fn drop(&mut self) {
        if let Some(mut txn) = self.txn.take() {
            txn.abort();
        }
    }
}

impl std::fmt::Debug for Continuation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Continuation")
            .field("completed", &self.is_completed())
            .finish()
    }
}
