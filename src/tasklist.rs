//! Insertion-ordered queue of waiting tasks, indexed by a set of duration
//! "slices" so that a duration-bounded dispatcher can find the
//! longest-waiting task that still fits under its bound without rescanning
//! the whole queue every time.
//!
//! Each slice remembers, for one particular bound, how far it has already
//! scanned. A tighter slice skips more entries (anything whose duration
//! doesn't fit) so its offset only ever moves ahead of a looser slice's;
//! when two slices' offsets coincide the tighter one is redundant and gets
//! dropped — it can always be recreated lazily from its looser neighbor.
//! The loosest slice (bound == the task list's own `max_duration`, always
//! present) only advances on an actual match, since everything fits under
//! it, so its offset is a safe lower bound for trimming dead entries off
//! the front of the backing `Vec`.

use std::sync::Mutex;

use tokio::sync::Notify;

use crate::task::TaskHandle;

struct Slice {
    bound: f64,
    offset: usize,
}

struct Inner {
    /// `None` marks an entry already handed out to some bound.
    tasks: Vec<Option<(TaskHandle, f64)>>,
    /// Sorted ascending by `bound`; last entry is always the bottom slice.
    slices: Vec<Slice>,
}

pub struct TaskList {
    inner: Mutex<Inner>,
    notify: Notify,
    max_duration: f64,
}

impl TaskList {
    pub fn new(max_duration: f64) -> Self {
        Self {
            inner: Mutex::new(Inner {
                tasks: Vec::new(),
                slices: vec![Slice {
                    bound: max_duration,
                    offset: 0,
                }],
            }),
            notify: Notify::new(),
            max_duration,
        }
    }

    pub fn push(&self, task: TaskHandle, duration: f64) {
        let mut inner = self.inner.lock().unwrap();
        inner.tasks.push(Some((task, duration.min(self.max_duration))));
        drop(inner);
        self.notify.notify_waiters();
    }

    /// Waits for and removes the earliest-inserted task whose duration fits
    /// under `bound`.
    pub async fn take(&self, bound: f64) -> TaskHandle {
        loop {
            let notified = self.notify.notified();
            {
                let mut inner = self.inner.lock().unwrap();
                if let Some(task) = inner.serve(bound) {
                    return task;
                }
            }
            notified.await;
        }
    }
}

impl Inner {
    fn serve(&mut self, bound: f64) -> Option<TaskHandle> {
        let idx = self.slice_for(bound);
        let offset = self.slices[idx].offset;

        let mut found = None;
        let mut scan = offset;
        while scan < self.tasks.len() {
            match &self.tasks[scan] {
                None => scan += 1,
                Some((_, duration)) => {
                    if *duration <= bound {
                        found = Some(scan);
                        break;
                    }
                    scan += 1;
                }
            }
        }

        self.slices[idx].offset = match found {
            Some(i) => i + 1,
            None => scan,
        };

        let result = found.map(|i| self.tasks[i].take().expect("checked Some above").0);

        self.collapse_dominated();
        self.trim_dead_prefix();
        result
    }

    /// Finds (or lazily creates) the slice tracking exactly `bound`.
    fn slice_for(&mut self, bound: f64) -> usize {
        if let Some(i) = self.slices.iter().position(|s| s.bound == bound) {
            return i;
        }
        // Duplicate state from the nearest looser slice — a new, tighter
        // bound can only have already skipped at least as much as a looser
        // one has.
        let looser = self
            .slices
            .iter()
            .position(|s| s.bound > bound)
            .unwrap_or(self.slices.len() - 1);
        let offset = self.slices[looser].offset;
        let insert_at = self.slices.partition_point(|s| s.bound < bound);
        self.slices.insert(insert_at, Slice { bound, offset });
        insert_at
    }

    fn collapse_dominated(&mut self) {
        let mut i = 0;
        while i + 1 < self.slices.len() {
            if self.slices[i].offset == self.slices[i + 1].offset {
                self.slices.remove(i);
            } else {
                i += 1;
            }
        }
    }

    fn trim_dead_prefix(&mut self) {
        let trim = self.slices.iter().map(|s| s.offset).min().unwrap_or(0);
        if trim == 0 {
            return;
        }
        self.tasks.drain(0..trim);
        for slice in &mut self.slices {
            slice.offset -= trim;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stopper::Stopper;
    use crate::task::Task;
    use std::sync::Arc;

    fn handle(duration: f64) -> TaskHandle {
        Arc::new(Task::new_for_test(Stopper::new(), duration))
    }

    #[tokio::test]
    async fn serves_fifo_within_a_bound() {
        let list = TaskList::new(30.0);
        let a = handle(5.0);
        let b = handle(5.0);
        list.push(a.clone(), 5.0);
        list.push(b.clone(), 5.0);

        let first = list.take(30.0).await;
        assert!(Arc::ptr_eq(&first, &a));
        let second = list.take(30.0).await;
        assert!(Arc::ptr_eq(&second, &b));
    }

    #[tokio::test]
    async fn tighter_bound_skips_looser_tasks() {
        let list = TaskList::new(30.0);
        let loose = handle(20.0);
        let tight = handle(2.0);
        list.push(loose.clone(), 20.0);
        list.push(tight.clone(), 2.0);

        let served = list.take(5.0).await;
        assert!(Arc::ptr_eq(&served, &tight));

        let served = list.take(30.0).await;
        assert!(Arc::ptr_eq(&served, &loose));
    }

    #[tokio::test]
    async fn take_waits_for_push() {
        let list = Arc::new(TaskList::new(30.0));
        let waiter = {
            let list = list.clone();
            tokio::spawn(async move { list.take(30.0).await })
        };
        tokio::task::yield_now().await;
        let t = handle(1.0);
        list.push(t.clone(), 1.0);
        let served = waiter.await.unwrap();
        assert!(Arc::ptr_eq(&served, &t));
    }
}
