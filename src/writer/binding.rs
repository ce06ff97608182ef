//! Transaction-scoped writer bindings
//!
//! Guarantees that every write issued inside one transaction shares exactly
//! one batched writer (and so one physical connection) per strictness flag,
//! and that the writer is flushed and closed exactly once, at transaction
//! completion, never eagerly by an individual write call.
//!
//! There is no thread-local ambient registry: callers pass an explicit
//! `&Transaction` handle, and the binding table is keyed by (transaction
//! id, strict flag). The completion protocol mirrors the classic
//! synchronization callbacks:
//!
//! - before completion: flush every bound writer
//! - after completion (commit or rollback): close each writer and unbind it
//! - suspend: detach the bindings from the active registry without closing
//! - resume: reattach them

use crate::backend::{Connection, StoreBackend};
use crate::config::{FailureMode, WriterConfig};
use crate::error::{Result, StoreError};
use crate::record::Record;
use crate::writer::BatchedWriter;
use dashmap::DashMap;
use log::warn;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

pub type TransactionId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum TxnState {
    Active = 0,
    Suspended = 1,
    Committed = 2,
    RolledBack = 3,
}

impl TxnState {
    fn from_u8(v: u8) -> TxnState {
        match v {
            0 => TxnState::Active,
            1 => TxnState::Suspended,
            2 => TxnState::Committed,
            _ => TxnState::RolledBack,
        }
    }
}

/// Per-transaction record of one bound writer: the instance, a reference
/// count, and whether the binding is still open for further use.
struct WriterBinding {
    writer: Arc<BatchedWriter>,
    ref_count: u64,
    open: bool,
}

/// State shared between a `Transaction` handle and the coordinator.
pub(crate) struct TransactionShared {
    id: TransactionId,
    backend: Arc<dyn StoreBackend>,
    state: AtomicU8,
    rollback_only: AtomicBool,
    /// The transaction's one physical connection, acquired on first write.
    /// Writers reference it weakly; this is the strong owner.
    conn: Mutex<Option<Arc<Mutex<Box<dyn Connection>>>>>,
    /// Bindings keyed by strictness flag.
    bindings: Mutex<Vec<(bool, WriterBinding)>>,
}

impl TransactionShared {
    fn state(&self) -> TxnState {
        TxnState::from_u8(self.state.load(Ordering::Acquire))
    }
}

/// Vends transactions and transaction-bound writers for one store.
pub struct TransactionCoordinator {
    backend: Arc<dyn StoreBackend>,
    config: WriterConfig,
    active: Arc<DashMap<TransactionId, Arc<TransactionShared>>>,
    txn_id_gen: AtomicU64,
}

impl TransactionCoordinator {
    pub(crate) fn new(backend: Arc<dyn StoreBackend>, config: WriterConfig) -> Self {
        Self {
            backend,
            config,
            active: Arc::new(DashMap::new()),
            txn_id_gen: AtomicU64::new(1),
        }
    }

    /// Begin a new transaction.
    pub fn begin(&self) -> Transaction {
        let id = self.txn_id_gen.fetch_add(1, Ordering::SeqCst);
        let shared = Arc::new(TransactionShared {
            id,
            backend: self.backend.clone(),
            state: AtomicU8::new(TxnState::Active as u8),
            rollback_only: AtomicBool::new(false),
            conn: Mutex::new(None),
            bindings: Mutex::new(Vec::new()),
        });
        self.active.insert(id, shared.clone());
        Transaction {
            shared,
            registry: self.active.clone(),
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Acquire a writer.
    ///
    /// Outside a transaction the writer is brand-new, owns its connection,
    /// and is closed (committing) when the returned handle is closed or
    /// dropped. Inside a transaction the binding keyed by (transaction,
    /// strict) is reused if present, otherwise created; the writer then
    /// borrows the transaction's connection and is only ever closed by
    /// transaction completion.
    pub fn acquire_writer(
        &self,
        tx: Option<&Transaction>,
        strict: bool,
    ) -> Result<WriterHandle> {
        let mode = if strict {
            FailureMode::Strict
        } else {
            FailureMode::BestEffort
        };

        let Some(tx) = tx else {
            let writer =
                BatchedWriter::owned(self.backend.clone(), self.config.clone(), mode)?;
            return Ok(WriterHandle {
                writer: Arc::new(writer),
                binding: None,
            });
        };

        let shared = &tx.shared;
        if shared.state() != TxnState::Active {
            return Err(StoreError::Transaction(format!(
                "transaction {} is not active",
                shared.id
            )));
        }

        let mut bindings = shared.bindings.lock();
        if let Some((_, binding)) = bindings.iter_mut().find(|(s, b)| *s == strict && b.open) {
            binding.ref_count += 1;
            return Ok(WriterHandle {
                writer: binding.writer.clone(),
                binding: Some(BoundTo {
                    shared: shared.clone(),
                    strict,
                }),
            });
        }

        // First write for this (transaction, strict) pair: lazily acquire
        // the transaction's connection, then bind a fresh writer to it.
        let conn = {
            let mut slot = shared.conn.lock();
            match slot.as_ref() {
                Some(conn) => conn.clone(),
                None => {
                    let conn: Arc<Mutex<Box<dyn Connection>>> =
                        Arc::new(Mutex::new(self.backend.connections().acquire()?));
                    *slot = Some(conn.clone());
                    conn
                }
            }
        };
        let writer = Arc::new(BatchedWriter::borrowed(
            self.backend.clone(),
            self.config.clone(),
            mode,
            Arc::downgrade(&conn),
        ));
        bindings.push((
            strict,
            WriterBinding {
                writer: writer.clone(),
                ref_count: 1,
                open: true,
            },
        ));
        Ok(WriterHandle {
            writer,
            binding: Some(BoundTo {
                shared: shared.clone(),
                strict,
            }),
        })
    }
}

struct BoundTo {
    shared: Arc<TransactionShared>,
    strict: bool,
}

/// A vended writer: either transaction-bound (shared, closed at transaction
/// completion) or standalone (closed, committing, when this handle goes).
pub struct WriterHandle {
    writer: Arc<BatchedWriter>,
    binding: Option<BoundTo>,
}

impl WriterHandle {
    /// Write one record. Inside a transaction, a failure first marks the
    /// transaction rollback-only, then propagates, so the eventual rollback
    /// and the caller's error handling stay consistent.
    pub fn write(&self, record: &mut Record) -> Result<()> {
        match self.writer.write(record) {
            Ok(()) => Ok(()),
            Err(err) => {
                if let Some(bound) = &self.binding {
                    bound.shared.rollback_only.store(true, Ordering::Release);
                }
                Err(err)
            }
        }
    }

    pub fn flush(&self) -> Result<()> {
        self.writer.flush()
    }

    pub fn stats(&self) -> crate::writer::WriteStats {
        self.writer.stats()
    }

    pub fn pending_count(&self, type_name: &str) -> usize {
        self.writer.pending_count(type_name)
    }

    /// The underlying shared writer (bindings with the same strictness flag
    /// in the same transaction see the same instance).
    pub fn writer(&self) -> &Arc<BatchedWriter> {
        &self.writer
    }

    /// Finish with this handle. A standalone writer flushes, commits and
    /// releases its connection here; a transaction-bound writer only drops
    /// its reference and stays open until the transaction completes.
    pub fn close(mut self) -> Result<()> {
        self.finish()
    }

    fn finish(&mut self) -> Result<()> {
        match self.binding.take() {
            Some(bound) => {
                let mut bindings = bound.shared.bindings.lock();
                if let Some((_, binding)) = bindings
                    .iter_mut()
                    .find(|(s, b)| *s == bound.strict && b.open)
                {
                    binding.ref_count = binding.ref_count.saturating_sub(1);
                }
                Ok(())
            }
            None => self.writer.close(),
        }
    }
}

impl Drop for WriterHandle {
    fn drop(&mut self) {
        if let Err(err) = self.finish() {
            warn!("writer close failed on drop: {}", err);
        }
    }
}

/// An explicit transaction context handle.
///
/// All writes passed this handle share one connection; commit flushes every
/// bound writer before committing that connection, and rollback discards
/// every buffered-but-unflushed batch.
pub struct Transaction {
    shared: Arc<TransactionShared>,
    registry: Arc<DashMap<TransactionId, Arc<TransactionShared>>>,
}

impl Transaction {
    pub fn id(&self) -> TransactionId {
        self.shared.id
    }

    pub fn is_active(&self) -> bool {
        self.shared.state() == TxnState::Active
    }

    /// Mark this transaction so it can only roll back.
    pub fn set_rollback_only(&self) {
        self.shared.rollback_only.store(true, Ordering::Release);
    }

    pub fn is_rollback_only(&self) -> bool {
        self.shared.rollback_only.load(Ordering::Acquire)
    }

    /// Detach this transaction's bindings from the active registry without
    /// closing them, so a nested transaction can run. Writers stay intact.
    pub fn suspend(&self) -> Result<()> {
        self.transition(TxnState::Active, TxnState::Suspended)?;
        self.registry.remove(&self.shared.id);
        Ok(())
    }

    /// Rebind a suspended transaction's resources.
    pub fn resume(&self) -> Result<()> {
        self.transition(TxnState::Suspended, TxnState::Active)?;
        self.registry.insert(self.shared.id, self.shared.clone());
        Ok(())
    }

    /// Commit: flush every bound writer, commit the shared connection, then
    /// close and unbind the writers. Rollback-only transactions refuse to
    /// commit and roll back instead.
    pub fn commit(self) -> Result<()> {
        if self.is_rollback_only() {
            let id = self.shared.id;
            self.complete(false)?;
            return Err(StoreError::Transaction(format!(
                "transaction {} is rollback-only",
                id
            )));
        }
        self.complete(true)
    }

    /// Roll back: nothing buffered-but-unflushed is ever executed.
    pub fn rollback(self) -> Result<()> {
        self.complete(false)
    }

    fn transition(&self, from: TxnState, to: TxnState) -> Result<()> {
        self.shared
            .state
            .compare_exchange(
                from as u8,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map_err(|actual| {
                StoreError::Transaction(format!(
                    "transaction {} is {:?}, expected {:?}",
                    self.shared.id,
                    TxnState::from_u8(actual),
                    from
                ))
            })?;
        Ok(())
    }

    fn complete(&self, commit: bool) -> Result<()> {
        self.transition(
            TxnState::Active,
            if commit {
                TxnState::Committed
            } else {
                TxnState::RolledBack
            },
        )?;

        let bindings = std::mem::take(&mut *self.shared.bindings.lock());

        // Before completion: flush every bound writer. A flush failure
        // turns the commit into a rollback.
        let mut do_commit = commit;
        let mut flush_error = None;
        if commit {
            for (_, binding) in &bindings {
                if let Err(err) = binding.writer.flush() {
                    flush_error = Some(err);
                    do_commit = false;
                    break;
                }
            }
        }

        // After completion: close each writer exactly once and unbind it.
        // The connection is still alive here, so prepared statements are
        // released on it. Bound writers never commit on close.
        for (_, binding) in bindings {
            if do_commit {
                if let Err(err) = binding.writer.close() {
                    warn!("writer close failed after commit: {}", err);
                }
            } else {
                binding.writer.abandon();
            }
        }

        let conn_result = self.finish_connection(do_commit);
        self.registry.remove(&self.shared.id);

        if let Some(err) = flush_error {
            self.shared
                .state
                .store(TxnState::RolledBack as u8, Ordering::Release);
            return Err(err);
        }
        conn_result
    }

    fn finish_connection(&self, commit: bool) -> Result<()> {
        let taken = self.shared.conn.lock().take();
        let Some(conn) = taken else {
            return Ok(());
        };
        let outcome = {
            let mut guard = conn.lock();
            if commit {
                guard.commit()
            } else {
                guard.rollback()
            }
        };
        // The writers hold only weak references, so once the bindings are
        // gone we are the sole owner and can hand the connection back.
        match Arc::try_unwrap(conn) {
            Ok(mutex) => {
                self.shared
                    .backend
                    .connections()
                    .release(mutex.into_inner());
            }
            Err(_still_shared) => {
                warn!(
                    "transaction {} connection still referenced at completion",
                    self.shared.id
                );
            }
        }
        outcome
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if matches!(self.shared.state(), TxnState::Active | TxnState::Suspended) {
            warn!(
                "transaction {} dropped without completion; rolling back",
                self.shared.id
            );
            self.shared
                .state
                .store(TxnState::Active as u8, Ordering::Release);
            if let Err(err) = self.complete(false) {
                warn!("rollback on drop failed: {}", err);
            }
        }
    }
}
