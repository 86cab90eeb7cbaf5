use std::{
    collections::HashMap,
    sync::{Arc, Condvar, Mutex, MutexGuard},
};

/// Mutual exclusion keyed by volume name.
///
/// Waiters on the same key run strictly one at a time, in arrival order
/// (ticket queue). Disjoint keys do not contend. Releasing happens when the
/// guard drops, so an error or panic inside a critical section never wedges
/// the key.
pub struct KeyedLocks {
    keys: Mutex<HashMap<String, Arc<TicketQueue>>>,
}

struct TicketQueue {
    state: Mutex<QueueState>,
    cv: Condvar,
}

#[derive(Default)]
struct QueueState {
    next_ticket: u64,
    now_serving: u64,
}

pub struct KeyedGuard {
    queue: Arc<TicketQueue>,
}

impl Default for KeyedLocks {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self {
            keys: Mutex::new(HashMap::new()),
        }
    }

    /// Block until `key` is exclusively owned by the caller.
    pub fn lock(&self, key: &str) -> KeyedGuard {
        let queue = self.queue_for(key);
        let mut st = lock_unpoisoned(&queue.state);
        let ticket = st.next_ticket;
        st.next_ticket += 1;
        while st.now_serving != ticket {
            st = queue
                .cv
                .wait(st)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        drop(st);
        KeyedGuard { queue }
    }

    /// Acquire every key at once, in lexicographic order. The fixed global
    /// order keeps multi-key and single-key acquisition deadlock-free.
    pub fn lock_all<I, S>(&self, keys: I) -> Vec<KeyedGuard>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut names: Vec<String> = keys.into_iter().map(|k| k.as_ref().to_string()).collect();
        names.sort_unstable();
        names.dedup();
        names.iter().map(|k| self.lock(k)).collect()
    }

    fn queue_for(&self, key: &str) -> Arc<TicketQueue> {
        let mut map = lock_unpoisoned(&self.keys);
        map.entry(key.to_string())
            .or_insert_with(|| {
                Arc::new(TicketQueue {
                    state: Mutex::new(QueueState::default()),
                    cv: Condvar::new(),
                })
            })
            .clone()
    }
}

impl Drop for KeyedGuard {
    fn drop(&mut self) {
        let mut st = lock_unpoisoned(&self.queue.state);
        st.now_serving += 1;
        drop(st);
        self.queue.cv.notify_all();
    }
}

fn lock_unpoisoned<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
