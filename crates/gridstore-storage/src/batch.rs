//! Transaction tokens.
//!
//! A [`Token`] buffers `store`/`erase` operations until it is handed to
//! exactly one of [`PersistentStore::commit`] or [`PersistentStore::abort`].
//! Both consume the token, so a token can never be terminated twice.
//!
//! Tokens created by [`PersistentStore::begin_async`] are deferred: their
//! commit queues a [`BatchTask`] on the manager's task pool and the outcome
//! is reported to a [`Collector`] instead of the caller.

use crate::backend::BatchOp;
use crate::store::PersistentStore;
use crate::task::{Collector, Completion, notify_collector};
use gridstore_common::{PersistenceError, Receipt, StoreId};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

static NEXT_TOKEN_ID: AtomicU64 = AtomicU64::new(1);

/// Where a committed token's outcome is reported
#[derive(Clone, Default)]
pub(crate) struct Deferred {
    pub(crate) collector: Option<Arc<dyn Collector>>,
    pub(crate) receipt: Option<Receipt>,
}

/// An atomic unit of store/erase operations against one store
pub struct Token {
    id: u64,
    store: StoreId,
    ops: Mutex<Vec<BatchOp>>,
    deferred: Option<Deferred>,
}

impl Token {
    pub(crate) fn new(store: StoreId, deferred: Option<Deferred>) -> Self {
        Self {
            id: NEXT_TOKEN_ID.fetch_add(1, Ordering::Relaxed),
            store,
            ops: Mutex::new(Vec::new()),
            deferred,
        }
    }

    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Id of the store this token belongs to
    #[must_use]
    pub const fn store_id(&self) -> &StoreId {
        &self.store
    }

    /// Whether commit runs in the background
    #[must_use]
    pub const fn is_deferred(&self) -> bool {
        self.deferred.is_some()
    }

    /// Number of buffered operations
    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.lock().is_empty()
    }

    pub(crate) fn push(&self, op: BatchOp) {
        self.ops.lock().push(op);
    }

    pub(crate) fn take_ops(&self) -> Vec<BatchOp> {
        std::mem::take(&mut *self.ops.lock())
    }

    pub(crate) fn take_deferred(&mut self) -> Option<Deferred> {
        self.deferred.take()
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("id", &self.id)
            .field("store", &self.store)
            .field("ops", &self.len())
            .field("deferred", &self.is_deferred())
            .finish()
    }
}

/// Deferred commit of a token, executed on the task pool
pub(crate) struct BatchTask {
    store: PersistentStore,
    token: Token,
    deferred: Deferred,
}

impl BatchTask {
    pub(crate) const fn new(store: PersistentStore, token: Token, deferred: Deferred) -> Self {
        Self {
            store,
            token,
            deferred,
        }
    }

    /// Apply and commit all queued operations under one read lock, then
    /// report the receipt.
    pub(crate) fn execute(self) {
        let ops = self.token.take_ops();
        match self.store.commit_ops(&ops) {
            Ok(()) => self.notify(Completion::Done(self.receipt())),
            Err(e) => self.abort(Some(e)),
        }
    }

    /// Discard the batch and report an asynchronous failure
    pub(crate) fn abort(self, cause: Option<PersistenceError>) {
        let discarded = self.token.take_ops().len();
        debug!(
            "Aborted batch {} on store {} ({} operations)",
            self.token.id(),
            self.store.id(),
            discarded
        );
        let cause = cause.unwrap_or_else(|| {
            PersistenceError::persistence(format!("transaction aborted: {}", self.token.id()))
        });
        let err = self
            .store
            .enrich(cause)
            .into_async(self.deferred.receipt.clone());
        self.notify(Completion::Failed(err));
    }

    fn receipt(&self) -> Receipt {
        self.deferred
            .receipt
            .clone()
            .unwrap_or_else(|| Receipt::from(self.token.id()))
    }

    fn notify(&self, item: Completion) {
        if let Some(collector) = &self.deferred.collector {
            notify_collector(collector.as_ref(), item);
        }
    }
}
