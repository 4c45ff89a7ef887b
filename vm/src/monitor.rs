use std::collections::HashMap;
use std::sync::{Condvar, Mutex, MutexGuard};

use common::{ObjectId, ThreadId};
use tracing::info;

use crate::error::ExecError;
use crate::internal;

#[derive(Debug)]
struct MonitorState {
    owner: ThreadId,
    entry_count: u64,
}

/// Per-object monitors: exclusive, re-entrant for the owning thread,
/// blocking on contended acquisition, with a wait/notify-all protocol used
/// for join semantics.
#[derive(Default)]
pub struct Monitors {
    table: Mutex<HashMap<ObjectId, MonitorState>>,
    released: Condvar,
    generations: Mutex<HashMap<ObjectId, u64>>,
    notified: Condvar,
}

impl Monitors {
    fn lock_table(&self) -> Result<MutexGuard<'_, HashMap<ObjectId, MonitorState>>, ExecError> {
        self.table
            .lock()
            .map_err(|e| internal!("lock poisoned: {e}"))
    }

    fn lock_generations(&self) -> Result<MutexGuard<'_, HashMap<ObjectId, u64>>, ExecError> {
        self.generations
            .lock()
            .map_err(|e| internal!("lock poisoned: {e}"))
    }

    /// Acquires the monitor for `id`, blocking until it is available.
    /// Re-entrant for the owning thread.
    pub fn enter(&self, id: &ObjectId, thread: &ThreadId) -> Result<(), ExecError> {
        let mut table = self.lock_table()?;
        loop {
            match table.get_mut(id) {
                None => {
                    table.insert(
                        id.clone(),
                        MonitorState {
                            owner: thread.clone(),
                            entry_count: 1,
                        },
                    );
                    info!("entered monitor for {id:?} with thread {thread}");
                    return Ok(());
                }
                Some(monitor) if &monitor.owner == thread => {
                    monitor.entry_count += 1;
                    return Ok(());
                }
                Some(_) => {
                    table = self
                        .released
                        .wait(table)
                        .map_err(|e| internal!("lock poisoned: {e}"))?;
                }
            }
        }
    }

    pub fn exit(&self, id: &ObjectId, thread: &ThreadId) -> Result<(), ExecError> {
        let mut table = self.lock_table()?;
        let monitor = table
            .get_mut(id)
            .ok_or_else(|| internal!("no monitor found for {id:?}"))?;
        if &monitor.owner != thread {
            return Err(internal!(
                "monitor for {id:?} exited by non-owner thread {thread}"
            ));
        }

        monitor.entry_count -= 1;
        if monitor.entry_count == 0 {
            table.remove(id);
            info!("thread {thread} is no longer the owner of {id:?}");
            self.released.notify_all();
        }
        Ok(())
    }

    pub fn owned_by(&self, id: &ObjectId, thread: &ThreadId) -> Result<bool, ExecError> {
        let table = self.lock_table()?;
        Ok(table.get(id).is_some_and(|m| &m.owner == thread))
    }

    /// Wakes every thread waiting on `id`. The caller should hold the
    /// monitor, matching Object.notifyAll semantics.
    pub fn notify_all(&self, id: &ObjectId) -> Result<(), ExecError> {
        let mut generations = self.lock_generations()?;
        *generations.entry(id.clone()).or_insert(0) += 1;
        self.notified.notify_all();
        Ok(())
    }

    /// Releases the monitor (which the calling thread must own), blocks
    /// until a later notify_all on the same object, then re-acquires the
    /// monitor at the previous re-entry depth.
    pub fn wait(&self, id: &ObjectId, thread: &ThreadId) -> Result<(), ExecError> {
        let depth = {
            let mut table = self.lock_table()?;
            let monitor = table
                .get(id)
                .ok_or_else(|| internal!("wait on monitor not held: {id:?}"))?;
            if &monitor.owner != thread {
                return Err(internal!("wait on {id:?} by non-owner thread {thread}"));
            }
            let depth = monitor.entry_count;
            table.remove(id);
            self.released.notify_all();
            depth
        };

        {
            let mut generations = self.lock_generations()?;
            let target = *generations.get(id).unwrap_or(&0) + 1;
            while *generations.get(id).unwrap_or(&0) < target {
                generations = self
                    .notified
                    .wait(generations)
                    .map_err(|e| internal!("lock poisoned: {e}"))?;
            }
        }

        self.enter(id, thread)?;
        let mut table = self.lock_table()?;
        if let Some(monitor) = table.get_mut(id) {
            monitor.entry_count = depth;
        }
        Ok(())
    }
}
