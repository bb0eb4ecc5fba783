use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use uuid::Uuid;

/// Per-position in-flight markers. Holding a [`InFlightGuard`] means no other
/// close for that position may start in this process; unrelated positions
/// never contend.
#[derive(Clone, Default)]
pub struct InFlight {
    inner: Arc<Mutex<HashSet<Uuid>>>,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `position_id` busy. `None` if someone already holds it.
    pub fn try_acquire(&self, position_id: Uuid) -> Option<InFlightGuard> {
        if !self.inner.lock().insert(position_id) {
            return None;
        }
        Some(InFlightGuard {
            set: Arc::clone(&self.inner),
            position_id,
        })
    }

    pub fn contains(&self, position_id: &Uuid) -> bool {
        self.inner.lock().contains(position_id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Releases the marker on drop, including when the holding task is cancelled
/// or times out.
pub struct InFlightGuard {
    set: Arc<Mutex<HashSet<Uuid>>>,
    position_id: Uuid,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.set.lock().remove(&self.position_id);
    }
}
