//! Table catalog.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use fathom_core::{Schema, TableRef};

use crate::error::{DistError, DistResult};

/// Persists table metadata.
#[async_trait]
pub trait Catalog: Send + Sync + 'static {
    /// Records the new schema of a table.
    ///
    /// # Errors
    /// Returns `Catalog` if the change could not be persisted; the caller
    /// must then keep the old schema.
    async fn alter_table(&self, target: &TableRef, schema: &Schema) -> DistResult<()>;
}

#[derive(Debug, Default)]
struct State {
    schemas: HashMap<TableRef, Schema>,
    alter_count: u64,
    force_fail: bool,
}

/// Catalog held in memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCatalog {
    state: Arc<Mutex<State>>,
}

impl InMemoryCatalog {
    /// Creates an empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().expect("catalog lock poisoned")
    }

    /// Returns the last recorded schema of a table.
    ///
    /// # Panics
    /// Panics if the mutex is poisoned.
    #[must_use]
    pub fn schema(&self, target: &TableRef) -> Option<Schema> {
        self.lock().schemas.get(target).cloned()
    }

    /// Number of successful alters.
    ///
    /// # Panics
    /// Panics if the mutex is poisoned.
    #[must_use]
    pub fn alter_count(&self) -> u64 {
        self.lock().alter_count
    }

    /// Makes the next alter fail.
    ///
    /// # Panics
    /// Panics if the mutex is poisoned.
    pub fn fail_next_alter(&self) {
        self.lock().force_fail = true;
    }
}

#[async_trait]
impl Catalog for InMemoryCatalog {
    async fn alter_table(&self, target: &TableRef, schema: &Schema) -> DistResult<()> {
        let mut state = self.lock();
        if std::mem::take(&mut state.force_fail) {
            return Err(DistError::Catalog {
                message: format!("cannot persist metadata of {target}"),
            });
        }
        state.schemas.insert(target.clone(), schema.clone());
        state.alter_count += 1;
        Ok(())
    }
}
