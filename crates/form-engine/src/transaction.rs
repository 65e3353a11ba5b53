//! Transactions
//!
//! A transaction groups updates so that subscribers and the event sink hear
//! about them once, when the transaction closes, and so that they can be
//! undone. The data the transaction started from is kept as a compressed
//! [`TransactionSnapshot`]; undoing re-runs the processor from scratch over
//! it, which leaves the session exactly as it was before the transaction.

use std::ops::{Deref, DerefMut};

use serde_json::Value;

use crate::error::{EngineError, Result};
use crate::events::SessionEvent;
use crate::processor::Processor;
use crate::session::Session;
use crate::snapshot::TransactionSnapshot;

/// Handle passed to the body of [`Session::transaction`].
///
/// Dereferences to the session, so updates and reads go through it as usual.
pub struct Transaction<'s> {
    session: &'s mut Session,
    snapshot: TransactionSnapshot,
    /// Whether the session had run its initial update when the transaction
    /// started
    had_initial_update: bool,
    rolled_back: bool,
}

impl Transaction<'_> {
    /// Restore the state the transaction started from.
    ///
    /// Fails with `RollbackOfInitialUpdateUnsupported` when the transaction
    /// started before the session's first update.
    pub fn rollback(&mut self) -> Result<()> {
        if !self.had_initial_update {
            return Err(EngineError::RollbackOfInitialUpdateUnsupported);
        }
        self.session.restore(&self.snapshot, "rollback requested")?;
        self.rolled_back = true;
        Ok(())
    }

    pub fn is_rolled_back(&self) -> bool {
        self.rolled_back
    }
}

impl Deref for Transaction<'_> {
    type Target = Session;

    fn deref(&self) -> &Session {
        self.session
    }
}

impl DerefMut for Transaction<'_> {
    fn deref_mut(&mut self) -> &mut Session {
        self.session
    }
}

impl Session {
    /// Run `body` as a transaction.
    ///
    /// Notifications are held back until `body` returns. If it returns an
    /// error, the session is restored to where it started and the error is
    /// passed on. Transactions cannot be nested.
    pub fn transaction<T, F>(&mut self, body: F) -> Result<T>
    where
        F: FnOnce(&mut Transaction<'_>) -> Result<T>,
    {
        if self.in_transaction {
            return Err(EngineError::NestedTransactionUnsupported);
        }
        let snapshot = TransactionSnapshot::capture(
            &self.state.data,
            &self.state.external,
            self.config.snapshot_compression_level,
        )?;
        let had_initial_update = self.state.initialized;
        log::debug!(
            "Session {}: transaction started ({} byte snapshot)",
            self.session_id,
            snapshot.compressed_size()
        );

        self.in_transaction = true;
        let mut tx = Transaction {
            session: self,
            snapshot,
            had_initial_update,
            rolled_back: false,
        };
        let result = body(&mut tx);
        let Transaction {
            session, snapshot, ..
        } = tx;
        session.in_transaction = false;

        match result {
            Ok(value) => {
                session.flush();
                Ok(value)
            }
            Err(err) => {
                let reason = err.to_string();
                let restored = if had_initial_update {
                    session.restore(&snapshot, &reason)
                } else {
                    session.discard_initial_update(&snapshot, &reason)
                };
                if let Err(restore_err) = restored {
                    log::warn!(
                        "Session {}: failed to restore after '{}': {}",
                        session.session_id,
                        reason,
                        restore_err
                    );
                }
                Err(err)
            }
        }
    }

    /// Rebuild every result from the snapshot and drop pending notifications
    pub(crate) fn restore(&mut self, snapshot: &TransactionSnapshot, reason: &str) -> Result<()> {
        let (data, external) = snapshot.restore()?;
        self.pending = None;
        self.state.reset(Value::Null);

        let eq = |a: &Value, b: &Value| a == b;
        Processor::new(&self.model, &mut self.state, &self.config).run(data, external, &eq)?;

        log::debug!("Session {}: rolled back ({})", self.session_id, reason);
        self.emit(SessionEvent::rolled_back(&self.session_id, reason));
        Ok(())
    }

    /// Return to the uninitialized state a transaction started from
    fn discard_initial_update(&mut self, snapshot: &TransactionSnapshot, reason: &str) -> Result<()> {
        let (_, external) = snapshot.restore()?;
        self.pending = None;
        self.state.reset(external);

        log::debug!("Session {}: discarded initial update ({})", self.session_id, reason);
        self.emit(SessionEvent::rolled_back(&self.session_id, reason));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{validator, Definition};
    use crate::events::VecEventSink;
    use crate::model::Model;
    use crate::path::PathExpr;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    fn p() -> PathExpr {
        PathExpr::internal()
    }

    fn form() -> Session {
        Session::new(Model::shared(vec![
            Definition::array(
                p().field("list"),
                vec![Definition::validate(
                    p().field("list").current().field("v"),
                    vec![validator(|v, _| v.clone())],
                )],
            ),
            Definition::annotate(p().field("title"), "label", p().field("title")),
        ]))
    }

    fn count_calls(session: &mut Session) -> Arc<AtomicUsize> {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        session
            .subscribe_to_field_annotation("title", "label", Some(Value::Null), move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        fired
    }

    #[test]
    fn test_rollback_restores_everything() {
        let mut s = form();
        let d0 = json!({"title": "A", "list": [{"v": "a"}, {"v": "b"}]});
        s.update(d0.clone()).unwrap();
        let fired = count_calls(&mut s);
        let delivered = fired.load(Ordering::SeqCst);

        let errors = s.errors();
        let annotations = s.annotations().clone();

        s.transaction(|tx| {
            tx.update(json!({"title": "B", "list": [{"v": "c"}]}))?;
            assert_eq!(tx.field_annotation("title", "label", None)?, json!("B"));
            tx.rollback()?;
            assert!(tx.is_rolled_back());
            Ok(())
        })
        .unwrap();

        assert_eq!(s.data(), &d0);
        assert_eq!(s.errors(), errors);
        assert_eq!(s.annotations(), &annotations);
        assert_eq!(fired.load(Ordering::SeqCst), delivered);
    }

    #[test]
    fn test_error_in_body_rolls_back_and_is_returned() {
        let mut s = form();
        let d0 = json!({"title": "A", "list": [{"v": "a"}]});
        s.update(d0.clone()).unwrap();

        let result: Result<()> = s.transaction(|tx| {
            tx.update(json!({"title": "B", "list": []}))?;
            tx.field_annotation("title", "missing", None)?;
            Ok(())
        });

        assert!(matches!(result, Err(EngineError::AnnotationNotFoundForField { .. })));
        assert_eq!(s.data(), &d0);
        assert_eq!(s.field_annotation("title", "label", None).unwrap(), json!("A"));
        assert_eq!(s.field_errors("list[0].v"), vec![json!("a")]);
    }

    #[test]
    fn test_commit_notifies_once() {
        let mut s = form();
        s.update(json!({"title": "A"})).unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        s.subscribe_to_field_annotation("title", "label", None, move |v| {
            sink.lock().unwrap().push(v.clone());
        })
        .unwrap();

        s.transaction(|tx| {
            tx.update(json!({"title": "B"}))?;
            tx.update(json!({"title": "C"}))
        })
        .unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![json!("A"), json!("C")]);
    }

    #[test]
    fn test_updates_after_rollback_are_kept() {
        let mut s = form();
        s.update(json!({"title": "A"})).unwrap();

        s.transaction(|tx| {
            tx.update(json!({"title": "B"}))?;
            tx.rollback()?;
            tx.update(json!({"title": "C"}))
        })
        .unwrap();

        assert_eq!(s.field_annotation("title", "label", None).unwrap(), json!("C"));
    }

    #[test]
    fn test_nested_transaction_is_an_error() {
        let mut s = form();
        s.update(json!({})).unwrap();

        let result = s.transaction(|tx| tx.transaction(|_| Ok(())));
        assert!(matches!(result, Err(EngineError::NestedTransactionUnsupported)));

        // the session is usable again afterwards
        assert!(s.transaction(|_| Ok(())).is_ok());
    }

    #[test]
    fn test_rollback_of_initial_update() {
        let mut s = form();

        let result = s.transaction(|tx| {
            tx.update(json!({"title": "A"}))?;
            tx.rollback()
        });

        assert!(matches!(result, Err(EngineError::RollbackOfInitialUpdateUnsupported)));
        assert!(!s.is_initialized());
        assert!(s.errors().is_none());
        assert!(s.annotations().is_empty());
    }

    #[test]
    fn test_events_held_until_commit() {
        let sink = Arc::new(VecEventSink::new());
        let mut s = form().with_event_sink(sink.clone());
        s.update(json!({"title": "A"})).unwrap();
        sink.clear();

        s.transaction(|tx| {
            tx.update(json!({"title": "B"}))?;
            assert!(sink.events().is_empty());
            Ok(())
        })
        .unwrap();
        assert!(sink
            .events()
            .iter()
            .any(|e| matches!(e, SessionEvent::UpdateCompleted { .. })));
    }

    #[test]
    fn test_rollback_discards_events() {
        let sink = Arc::new(VecEventSink::new());
        let mut s = form().with_event_sink(sink.clone());
        s.update(json!({"title": "A"})).unwrap();
        sink.clear();

        s.transaction(|tx| {
            tx.update(json!({"title": "B"}))?;
            tx.rollback()
        })
        .unwrap();

        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            SessionEvent::TransactionRolledBack { reason, .. } if reason == "rollback requested"
        ));
    }
}
