//! Rollback of partially completed multi-step operations.

use std::future::Future;

use futures::future::BoxFuture;
use tracing::{debug, warn};

use crate::error::Result;

type UndoStep<'a> = Box<dyn FnOnce() -> BoxFuture<'a, Result<()>> + Send + 'a>;

/// Inverse actions of completed steps, run newest first on failure.
pub struct UndoStack<'a> {
    steps: Vec<(String, UndoStep<'a>)>,
}

impl<'a> UndoStack<'a> {
    pub fn new() -> Self {
        Self { steps: Vec::new() }
    }

    pub fn push<F, Fut>(&mut self, description: impl Into<String>, undo: F)
    where
        F: FnOnce() -> Fut + Send + 'a,
        Fut: Future<Output = Result<()>> + Send + 'a,
    {
        let step: UndoStep<'a> = Box::new(move || -> BoxFuture<'a, Result<()>> { Box::pin(undo()) });
        self.steps.push((description.into(), step));
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Keep everything that was done.
    pub fn commit(mut self) {
        self.steps.clear();
    }

    /// Undo completed steps in reverse order. Failures are logged; the
    /// caller still reports its original error.
    pub async fn unwind(mut self) {
        while let Some((description, undo)) = self.steps.pop() {
            match undo().await {
                Ok(()) => debug!(step = %description, "Rolled back"),
                Err(e) => warn!(step = %description, error = %e, "Rollback step failed"),
            }
        }
    }
}

impl Default for UndoStack<'_> {
    fn default() -> Self {
        Self::new()
    }
}
