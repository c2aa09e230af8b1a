/// Monotonic AEAD nonce counter with store-then-use persistence
///
/// The value handed out by `next` is never reissued: its successor is
/// durably stored before the caller sees it, so a crash at any point leaves
/// the persisted floor above every counter already used.
use super::store::NonceStore;
use super::NonceError;
use parking_lot::Mutex;
use tracing::{debug, info};

/// Counter value used when nothing has been persisted; 0 is never issued
pub const INITIAL_COUNTER: u64 = 1;

struct CounterState {
    /// Next value to hand out
    next: u64,
    restored: bool,
}

/// Issues nonce counters under a single lock so concurrent triggers cannot
/// observe the same value
pub struct NonceManager<S: NonceStore> {
    store: S,
    state: Mutex<CounterState>,
}

impl<S: NonceStore> NonceManager<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            state: Mutex::new(CounterState {
                next: INITIAL_COUNTER,
                restored: false,
            }),
        }
    }

    /// Load the persisted counter. Absent or zero starts at `INITIAL_COUNTER`.
    pub fn restore(&self) -> Result<u64, NonceError> {
        let mut state = self.state.lock();
        Self::restore_locked(&self.store, &mut state)
    }

    fn restore_locked(store: &S, state: &mut CounterState) -> Result<u64, NonceError> {
        let persisted = store.load()?;
        state.next = persisted.max(INITIAL_COUNTER);
        state.restored = true;
        info!("Nonce counter restored at {}", state.next);
        Ok(state.next)
    }

    /// Hand out the current counter after persisting its successor.
    ///
    /// If the store fails, nothing is handed out and the in-memory counter is
    /// unchanged; the caller must not send anything.
    pub fn next(&self) -> Result<u64, NonceError> {
        let mut state = self.state.lock();
        if !state.restored {
            Self::restore_locked(&self.store, &mut state)?;
        }

        let current = state.next;
        let successor = current.checked_add(1).ok_or(NonceError::Exhausted)?;
        self.store.store(successor)?;
        state.next = successor;

        debug!("Issued nonce counter {}", current);
        Ok(current)
    }

    /// Value the next call to `next` will return
    pub fn peek(&self) -> u64 {
        self.state.lock().next
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}
