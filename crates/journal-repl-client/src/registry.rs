//! Subscription bookkeeping.

use crate::delta::DeltaApplier;
use crate::error::ReplicationError;
use journal_repl_core::store::lock_writer;
use journal_repl_core::{JournalKey, JournalState, JournalStructure, TxListener, WriterFactory, WriterHandle};
use std::sync::Arc;

/// One replicated journal.
pub(crate) struct Subscription {
    pub(crate) index: u32,
    pub(crate) remote_key: JournalKey,
    pub(crate) local_key: JournalKey,
    listener: Option<Arc<dyn TxListener>>,
    writer: Option<WriterHandle>,
    pub(crate) applier: Option<DeltaApplier>,
    pub(crate) state_sent: bool,
}

impl Subscription {
    fn is_bound(&self) -> bool {
        self.writer.is_some()
    }

    /// Committed state of the bound writer.
    pub(crate) fn local_state(&self) -> Result<JournalState, ReplicationError> {
        let writer = self.writer.as_ref().ok_or_else(|| {
            ReplicationError::Protocol(format!("journal {} has no local writer", self.local_key))
        })?;
        Ok(lock_writer(writer)?.state())
    }
}

/// Subscriptions in registration order. Position is the wire index.
#[derive(Default)]
pub(crate) struct SubscriptionRegistry {
    subscriptions: Vec<Subscription>,
}

impl SubscriptionRegistry {
    pub(crate) fn len(&self) -> usize {
        self.subscriptions.len()
    }

    /// Register a journal; returns its index.
    pub(crate) fn subscribe(
        &mut self,
        remote_key: JournalKey,
        local_key: JournalKey,
        listener: Option<Arc<dyn TxListener>>,
    ) -> Result<u32, ReplicationError> {
        let index = u32::try_from(self.subscriptions.len())
            .map_err(|_| ReplicationError::Configuration("too many subscriptions".to_string()))?;

        tracing::debug!(index, remote = %remote_key, local = %local_key, "Subscribed");

        self.subscriptions.push(Subscription {
            index,
            remote_key,
            local_key,
            listener,
            writer: None,
            applier: None,
            state_sent: false,
        });
        Ok(index)
    }

    pub(crate) fn get(&self, index: u32) -> Option<&Subscription> {
        self.subscriptions.get(index as usize)
    }

    pub(crate) fn get_mut(&mut self, index: u32) -> Option<&mut Subscription> {
        self.subscriptions.get_mut(index as usize)
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut Subscription> {
        self.subscriptions.iter_mut()
    }

    /// Install `writer` for `index` and reset its state flag.
    ///
    /// Commit-on-close is disabled on the writer and the subscription's
    /// listener, if any, is attached to it.
    pub(crate) fn bind(&mut self, index: u32, writer: WriterHandle) -> Result<(), ReplicationError> {
        let subscription = self.get_mut(index).ok_or_else(|| unknown(index))?;

        let structure = {
            let mut guard = lock_writer(&writer)?;
            guard.set_commit_on_close(false);
            if let Some(listener) = &subscription.listener {
                guard.set_tx_listener(Some(listener.clone()));
            }
            guard.structure().clone()
        };

        subscription.applier = Some(DeltaApplier::new(writer.clone(), structure));
        subscription.writer = Some(writer);
        subscription.state_sent = false;
        Ok(())
    }

    /// Make sure `index` has a writer able to take rows shaped by `remote`.
    ///
    /// Unbound subscriptions open a journal mirroring `remote` at the local
    /// key's location. Bound ones must already match `remote`.
    pub(crate) fn open(
        &mut self,
        index: u32,
        remote: &JournalStructure,
        factory: &dyn WriterFactory,
    ) -> Result<(), ReplicationError> {
        let subscription = self.get(index).ok_or_else(|| unknown(index))?;

        if let Some(applier) = &subscription.applier {
            applier.structure().check_compatible(remote)?;
            return Ok(());
        }

        let structure = remote.relocated(subscription.local_key.derived_location());
        tracing::debug!(index, location = %structure.location, "Opening local journal");
        let writer = factory.writer(&structure)?;
        self.bind(index, writer)
    }

    /// Close every writer and forget appliers and state flags.
    ///
    /// Writers have commit-on-close disabled, so uncommitted rows are
    /// discarded. Subscriptions themselves are kept.
    pub(crate) fn release(&mut self) {
        for subscription in &mut self.subscriptions {
            subscription.applier = None;
            subscription.state_sent = false;
            let Some(writer) = subscription.writer.take() else {
                continue;
            };
            let closed = lock_writer(&writer).and_then(|mut writer| writer.close());
            if let Err(err) = closed {
                tracing::warn!(
                    error = %err,
                    journal = %subscription.local_key,
                    "Failed to close local journal"
                );
            }
        }
    }

    /// Same subscriptions at the same indices, with nothing bound.
    pub(crate) fn unbound(&self) -> Self {
        let subscriptions = self
            .subscriptions
            .iter()
            .map(|subscription| Subscription {
                index: subscription.index,
                remote_key: subscription.remote_key.clone(),
                local_key: subscription.local_key.clone(),
                listener: subscription.listener.clone(),
                writer: None,
                applier: None,
                state_sent: false,
            })
            .collect();
        Self { subscriptions }
    }

    /// Whether every subscription has a writer.
    pub(crate) fn all_bound(&self) -> bool {
        self.subscriptions.iter().all(Subscription::is_bound)
    }
}

fn unknown(index: u32) -> ReplicationError {
    ReplicationError::Protocol(format!("unknown journal index {index}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use journal_repl_core::{
        ColumnMetadata, ColumnType, JournalWriter, MemoryJournal, MemoryWriterFactory,
    };
    use std::sync::Mutex;

    fn quotes(location: &str) -> JournalStructure {
        JournalStructure::new(location).column(ColumnMetadata::new("bid", ColumnType::Double))
    }

    #[test]
    fn indices_follow_registration_order() {
        let mut registry = SubscriptionRegistry::default();
        for (i, class) in ["A", "B", "C"].into_iter().enumerate() {
            let index = registry
                .subscribe(JournalKey::new(class), JournalKey::new(class), None)
                .unwrap();
            assert_eq!(index as usize, i);
        }
        assert_eq!(registry.len(), 3);
        assert_eq!(registry.get(1).unwrap().remote_key.class, "B");
    }

    #[test]
    fn open_mirrors_remote_at_local_location() {
        let factory = MemoryWriterFactory::new();
        let mut registry = SubscriptionRegistry::default();
        registry
            .subscribe(
                JournalKey::with_location("Quote", "remote/quotes"),
                JournalKey::with_location("Quote", "local/quotes"),
                None,
            )
            .unwrap();

        registry.open(0, &quotes("remote/quotes"), &factory).unwrap();

        let journal = factory.journal("local/quotes").unwrap();
        let journal = journal.lock().unwrap();
        assert_eq!(journal.structure().columns.len(), 1);
        assert!(!journal.commit_on_close());
        assert!(registry.all_bound());
        assert!(!registry.get(0).unwrap().state_sent);
    }

    #[test]
    fn bound_writer_must_match_remote() {
        let factory = MemoryWriterFactory::new();
        let mut registry = SubscriptionRegistry::default();
        registry
            .subscribe(JournalKey::new("Quote"), JournalKey::new("Quote"), None)
            .unwrap();
        let writer: WriterHandle = Arc::new(Mutex::new(MemoryJournal::new(quotes("Quote"))));
        registry.bind(0, writer).unwrap();

        let remote = JournalStructure::new("Quote").column(ColumnMetadata::new("bid", ColumnType::Long));
        let err = registry.open(0, &remote, &factory).unwrap_err();

        assert!(matches!(err, ReplicationError::IncompatibleJournal(_)));
        assert!(factory.journal("Quote").is_none());
    }

    #[test]
    fn bind_attaches_listener_and_resets_flag() {
        let commits = Arc::new(Mutex::new(Vec::new()));
        let seen = commits.clone();
        let listener: Arc<dyn TxListener> = Arc::new(move |location: &str, state: JournalState| {
            seen.lock().unwrap().push((location.to_string(), state.tx));
        });

        let mut registry = SubscriptionRegistry::default();
        registry
            .subscribe(JournalKey::new("Quote"), JournalKey::new("Quote"), Some(listener))
            .unwrap();
        registry.get_mut(0).unwrap().state_sent = true;

        let journal = Arc::new(Mutex::new(MemoryJournal::new(quotes("Quote"))));
        let writer: WriterHandle = journal.clone();
        registry.bind(0, writer).unwrap();
        assert!(!registry.get(0).unwrap().state_sent);

        journal.lock().unwrap().stage_tx(5, 5);
        journal.lock().unwrap().commit().unwrap();
        assert_eq!(*commits.lock().unwrap(), vec![("Quote".to_string(), 5)]);
    }

    #[test]
    fn release_closes_writers_and_keeps_subscriptions() {
        let factory = MemoryWriterFactory::new();
        let mut registry = SubscriptionRegistry::default();
        registry
            .subscribe(JournalKey::new("Quote"), JournalKey::new("Quote"), None)
            .unwrap();
        registry.open(0, &quotes("remote"), &factory).unwrap();
        registry.get_mut(0).unwrap().state_sent = true;

        registry.release();

        assert_eq!(registry.len(), 1);
        assert!(!registry.all_bound());
        let subscription = registry.get(0).unwrap();
        assert!(subscription.applier.is_none());
        assert!(!subscription.state_sent);
        assert!(factory.journal("Quote").unwrap().lock().unwrap().is_closed());
    }

    #[test]
    fn unbound_copy_keeps_indices_and_drops_writers() {
        let factory = MemoryWriterFactory::new();
        let mut registry = SubscriptionRegistry::default();
        for location in ["a", "b"] {
            registry
                .subscribe(
                    JournalKey::with_location("Quote", location),
                    JournalKey::with_location("Quote", location),
                    None,
                )
                .unwrap();
        }
        registry.open(1, &quotes("b"), &factory).unwrap();
        registry.get_mut(1).unwrap().state_sent = true;

        let copy = registry.unbound();

        assert_eq!(copy.len(), 2);
        assert!(!copy.all_bound());
        let subscription = copy.get(1).unwrap();
        assert_eq!(subscription.index, 1);
        assert_eq!(subscription.local_key.derived_location(), "b");
        assert!(subscription.applier.is_none());
        assert!(!subscription.state_sent);
        assert!(registry.get(1).unwrap().applier.is_some());
    }
}
