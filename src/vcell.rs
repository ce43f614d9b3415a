use std::sync::atomic::{AtomicU64, Ordering::SeqCst};

// Process-wide run counter. Restarting any root bumps it, which is
// exactly the semantic of a real process restart: every volatile
// handle in the process goes stale at once.
static RUN_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn current_run_id() -> u64 {
    RUN_ID.load(SeqCst)
}

pub(crate) fn bump_run_id() {
    RUN_ID.fetch_add(1, SeqCst);
}

/// A value paired with the run id it was created under. Dereference
/// yields the value only while the run id is current, which is how
/// non-persistent resources are safely expressed as nullable across
/// restarts.
#[derive(Debug)]
pub struct Volatile<T: Copy> {
    run_id: u64,
    value: T,
}

impl<T: Copy> Volatile<T> {
    pub fn new(value: T) -> Volatile<T> {
        Volatile {
            run_id: current_run_id(),
            value,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.run_id == current_run_id()
    }

    /// The stored value, or `None` after a restart.
    pub fn get(&self) -> Option<T> {
        if self.is_valid() {
            Some(self.value)
        } else {
            None
        }
    }

    /// Store a fresh value, revalidating the handle.
    pub fn reset(&mut self, value: T) {
        self.run_id = current_run_id();
        self.value = value;
    }
}

impl<T: Copy> Clone for Volatile<T> {
    /// Cloning a stale handle yields a permanently invalidated clone;
    /// only `reset` revives one.
    fn clone(&self) -> Volatile<T> {
        Volatile {
            run_id: if self.is_valid() { self.run_id } else { 0 },
            value: self.value,
        }
    }
}
