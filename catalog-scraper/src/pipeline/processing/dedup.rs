use std::collections::HashSet;
use std::sync::Mutex;

use catalog_core::{Product, RecordIdentity};

/// Outcome of offering a record to the deduplicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Accepted,
    Duplicate,
}

/// Suppresses repeated records by derived identity.
///
/// `admit` is a single atomic check-and-insert behind a mutex, so the
/// prefetching mode cannot race two copies of the same record past the
/// check. Identities first admitted during this run are tracked separately
/// so cross-run mode persists exactly the new ones at run end.
#[derive(Debug, Default)]
pub struct Deduplicator {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    seen: HashSet<RecordIdentity>,
    admitted: Vec<RecordIdentity>,
}

impl Deduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed with identities persisted by earlier runs.
    pub fn preseeded(identities: impl IntoIterator<Item = RecordIdentity>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                seen: identities.into_iter().collect(),
                admitted: Vec::new(),
            }),
        }
    }

    pub fn admit(&self, product: &Product) -> Admission {
        let identity = product.identity();
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if inner.seen.insert(identity.clone()) {
            inner.admitted.push(identity);
            Admission::Accepted
        } else {
            Admission::Duplicate
        }
    }

    /// Identities first admitted during this run, in admission order.
    pub fn admitted_this_run(&self) -> Vec<RecordIdentity> {
        match self.inner.lock() {
            Ok(guard) => guard.admitted.clone(),
            Err(poisoned) => poisoned.into_inner().admitted.clone(),
        }
    }

    pub fn seen_count(&self) -> usize {
        match self.inner.lock() {
            Ok(guard) => guard.seen.len(),
            Err(poisoned) => poisoned.into_inner().seen.len(),
        }
    }
}
