//! The single authoritative session value.
//!
//! [`SessionState`] is owned by the session manager's event loop.  Writes go
//! through [`SessionState::commit`], which takes `&mut self`: the borrow
//! checker guarantees one writer, and a mutator cannot reach back into the
//! state while it runs.  Everyone else reads through a cloneable
//! [`SessionReader`].
//!
//! After a successful commit the new snapshot is published to the
//! [`EventBroadcaster`] once the write lock has been released.

use std::sync::{Arc, PoisonError, RwLock};

use tracing::trace;

use vpn_core::SessionSnapshot;

use super::broadcaster::EventBroadcaster;

/// Read-only view of the current snapshot.  Never blocks on a commit for
/// longer than a pointer swap.
#[derive(Clone)]
pub struct SessionReader {
    current: Arc<RwLock<Arc<SessionSnapshot>>>,
}

impl SessionReader {
    pub fn read(&self) -> Arc<SessionSnapshot> {
        Arc::clone(&self.current.read().unwrap_or_else(PoisonError::into_inner))
    }
}

pub struct SessionState {
    current: Arc<RwLock<Arc<SessionSnapshot>>>,
    broadcaster: EventBroadcaster<SessionSnapshot>,
}

impl SessionState {
    /// Creates the state and publishes `initial` so the first subscriber
    /// has a value to receive.
    pub fn new(initial: SessionSnapshot, broadcaster: EventBroadcaster<SessionSnapshot>) -> Self {
        let initial = Arc::new(initial);
        broadcaster.publish(Arc::clone(&initial));
        Self {
            current: Arc::new(RwLock::new(initial)),
            broadcaster,
        }
    }

    pub fn read(&self) -> Arc<SessionSnapshot> {
        self.reader().read()
    }

    pub fn reader(&self) -> SessionReader {
        SessionReader {
            current: Arc::clone(&self.current),
        }
    }

    pub fn broadcaster(&self) -> &EventBroadcaster<SessionSnapshot> {
        &self.broadcaster
    }

    /// Applies `mutator` to the current snapshot and installs the result.
    ///
    /// The revision is assigned here.  If the mutator returns a snapshot with
    /// the same content as the current one, nothing is installed or
    /// published and the current snapshot is returned.
    pub fn commit<F>(&mut self, mutator: F) -> Arc<SessionSnapshot>
    where
        F: FnOnce(&SessionSnapshot) -> SessionSnapshot,
    {
        let committed = {
            let mut guard = self
                .current
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            let mut next = mutator(&guard);
            if next.same_content(&guard) {
                return Arc::clone(&guard);
            }
            next.revision = guard.revision + 1;
            let next = Arc::new(next);
            *guard = Arc::clone(&next);
            next
        };
        trace!(
            revision = committed.revision,
            status = committed.status.label(),
            "session committed"
        );
        self.broadcaster.publish(Arc::clone(&committed));
        committed
    }
}
