use std::sync::{Arc, Mutex};

use super::{reduce, ProjectAction, ProjectState};

/// Shared handle to the current project snapshot.
///
/// Readers take cheap `Arc` snapshots; writers go through [`ProjectStore::dispatch`],
/// which swaps in a new snapshot under the lock so there is one logical writer
/// at a time.
#[derive(Debug, Clone)]
pub struct ProjectStore {
    inner: Arc<Mutex<Arc<ProjectState>>>,
}

impl ProjectStore {
    pub fn new(state: ProjectState) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Arc::new(state))),
        }
    }

    pub fn snapshot(&self) -> Arc<ProjectState> {
        match self.inner.lock() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    pub fn dispatch(&self, action: ProjectAction) -> Arc<ProjectState> {
        let mut guard = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let next = Arc::new(reduce(&guard, action));
        *guard = Arc::clone(&next);
        next
    }

    pub fn replace(&self, state: ProjectState) {
        let mut guard = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = Arc::new(state);
    }
}
