//! # Error Sinks
//!
//! Where collected errors end up. The collector hands batches of
//! [`ReducedError`]s to an [`ErrorSink`]; hosts plug in their own logger or
//! reporting backend by implementing the trait.

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use tracing::trace;

use crate::collector::ReducedError;
use crate::logging::log_reduced_error;
use crate::types::{Error, Result};

/// Destination for collected errors
pub trait ErrorSink: Send + Sync {
    /// Accepts a batch; an `Err` marks the whole batch as failed
    fn emit(&self, batch: &[ReducedError]) -> Result<()>;
}

/// Writes every error as a structured `tracing` event
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl ErrorSink for TracingSink {
    fn emit(&self, batch: &[ReducedError]) -> Result<()> {
        trace!(batch = batch.len(), "Emitting error batch");
        for error in batch {
            log_reduced_error(error);
        }
        Ok(())
    }
}

/// Keeps emitted errors in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    emitted: Mutex<Vec<ReducedError>>,
    batches: AtomicUsize,
    failures_pending: AtomicUsize,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` emissions fail
    pub fn fail_next(&self, count: usize) {
        self.failures_pending.store(count, Ordering::SeqCst);
    }

    /// Everything emitted so far, in order
    pub fn emitted(&self) -> Vec<ReducedError> {
        self.emitted.lock().clone()
    }

    /// Number of successful emissions
    pub fn batch_count(&self) -> usize {
        self.batches.load(Ordering::SeqCst)
    }

    pub fn clear(&self) {
        self.emitted.lock().clear();
        self.batches.store(0, Ordering::SeqCst);
    }
}

impl ErrorSink for MemorySink {
    fn emit(&self, batch: &[ReducedError]) -> Result<()> {
        let should_fail = self
            .failures_pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |pending| pending.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(Error::Sink("memory sink configured to fail".into()));
        }

        self.emitted.lock().extend_from_slice(batch);
        self.batches.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::{ClassifierConfig, ErrorClassifier};
    use crate::collector::{CollectionMode, ModeTable};
    use crate::context::{ErrorContext, Fault};

    fn reduced(message: &str) -> ReducedError {
        let error = ErrorClassifier::new(ClassifierConfig::default())
            .classify_error(&Fault::new(message), &ErrorContext::new());
        let table = ModeTable::default();
        ReducedError::reduce(&error, &ErrorContext::new(), CollectionMode::Full, table.get(CollectionMode::Full))
    }

    #[test]
    fn test_memory_sink_records_batches() {
        let sink = MemorySink::new();
        sink.emit(&[reduced("one"), reduced("two")]).unwrap();
        sink.emit(&[reduced("three")]).unwrap();

        assert_eq!(sink.batch_count(), 2);
        assert_eq!(sink.emitted().len(), 3);

        sink.clear();
        assert!(sink.emitted().is_empty());
    }

    #[test]
    fn test_memory_sink_failures() {
        let sink = MemorySink::new();
        sink.fail_next(2);

        assert!(matches!(sink.emit(&[reduced("a")]), Err(Error::Sink(_))));
        assert!(sink.emit(&[reduced("b")]).is_err());
        assert!(sink.emit(&[reduced("c")]).is_ok());
        assert_eq!(sink.emitted().len(), 1);
    }

    #[test_log::test]
    fn test_tracing_sink_accepts_every_severity() {
        let sink = TracingSink;
        let batch = vec![reduced("xyz123"), reduced("out of memory"), reduced("validation failed")];
        assert!(sink.emit(&batch).is_ok());
    }
}
