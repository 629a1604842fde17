//! Duration-tiered admission, one sequential walk across all configured
//! tiers rather than an independent gate per tier — the two are not
//! equivalent. Starting from the loosest tier, the dispatcher greedily
//! grabs every token immediately available, tightening its filter bound
//! each time, and then asks the Task List for the longest-waiting task
//! that fits under whatever bound it ended up with. Every token grabbed
//! along the way is bound to that one task: a finalizer per token releases
//! it as soon as the task's own duration no longer exceeds that tier's
//! bound, or once the task stops, whichever comes first. This is what
//! makes a tier's limit bind on tasks that actually exceed it rather than
//! on every task that merely passes through admission at that moment —
//! e.g. with tiers `[(30, 2), (5, 1)]`, two 30s tasks both end up holding
//! the 5s tier's single token for their whole run (since 30 > 5) and so
//! serialize against each other, while a 1s task releases both tokens
//! immediately and never waits on either.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::backend_pool::BackendPool;
use crate::config::TierLevel;
use crate::task::Task;
use crate::tasklist::TaskList;

pub struct Dispatcher {
    tasklist: Arc<TaskList>,
    backends: Arc<BackendPool>,
}

impl Dispatcher {
    pub fn new(tasklist: Arc<TaskList>, backends: Arc<BackendPool>) -> Self {
        Self { tasklist, backends }
    }

    /// Spawns the dispatch loop and returns immediately; it runs until the
    /// process exits. `tiers` must already be ordered loosest-bound-first
    /// (enforced by `config::parse_tiers`).
    pub fn spawn(self: Arc<Self>, tiers: Vec<TierLevel>) {
        tokio::spawn(async move { self.run(tiers).await });
    }

    async fn run(&self, tiers: Vec<TierLevel>) {
        let gates: Vec<Arc<Semaphore>> = tiers.iter().map(|t| Arc::new(Semaphore::new(t.limit))).collect();

        loop {
            let mut held: Vec<(f64, OwnedSemaphorePermit)> = Vec::new();

            let first = gates[0]
                .clone()
                .acquire_owned()
                .await
                .expect("semaphore never closed");
            held.push((tiers[0].bound, first));
            let mut filter_bound = tiers[0].bound;

            for i in 1..tiers.len() {
                match gates[i].clone().try_acquire_owned() {
                    Ok(permit) => {
                        held.push((tiers[i].bound, permit));
                        filter_bound = tiers[i].bound;
                    }
                    Err(_) => break,
                }
            }

            let task = self.tasklist.take(filter_bound).await;
            let backend = self.backends.take().await;
            task.proceed_with(backend);

            for (bound, permit) in held {
                tokio::spawn(hold_until_releasable(task.clone(), bound, permit));
            }

            let backend_return = self.backends.clone();
            let task_for_return = task.clone();
            tokio::spawn(async move {
                task_for_return.stopper().stopped().await;
                backend_return.put(backend).await;
            });
        }
    }
}

/// Releases `permit` (on drop, when this function returns) as soon as
/// `task`'s duration no longer exceeds `bound`, or when the task stops,
/// whichever comes first.
async fn hold_until_releasable(task: Arc<Task>, bound: f64, permit: OwnedSemaphorePermit) {
    let _permit = permit;
    let mut duration_changes = task.duration_changes();
    loop {
        if *duration_changes.borrow() <= bound {
            return;
        }
        tokio::select! {
            _ = task.stopper().stopped() => return,
            changed = duration_changes.changed() => {
                if changed.is_err() {
                    task.stopper().stopped().await;
                    return;
                }
            }
        }
    }
}
