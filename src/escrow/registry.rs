// ============================================================================
// Contract Registry
// Owns the live escrow contracts and drives them with ledger polls
// ============================================================================

use super::contract::{ContractState, EscrowContract, Observation, PollStep};
use crate::domain::{ExchangeConfig, TransactionId};
use crate::error::{ExchangeError, ExchangeResult};
use crate::interfaces::{
    DurableStore, EventHandler, ExchangeEvent, LedgerClient, LedgerTxId, SettlementListener,
};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Outcome of one `poll_all` cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PollReport {
    /// Contracts whose ledger transaction was queried
    pub polled: usize,
    /// Contracts skipped because of ledger backoff
    pub backed_off: usize,
    /// Queries that failed with a transient ledger error
    pub ledger_errors: usize,
    /// Contracts finalized and removed this cycle
    pub settled: Vec<TransactionId>,
    /// Contracts failed, compensated and removed this cycle
    pub failed: Vec<(TransactionId, ExchangeError)>,
    /// Terminal contracts kept because a side effect failed
    pub retained: usize,
}

/// Explicitly constructed registry of escrow contracts.
///
/// The contract map is locked only for in-memory updates and store writes.
/// Ledger queries and settlement callbacks run with it unlocked, while
/// `poll_guard` keeps a second poll cycle (or an abort) from working on the
/// same contracts concurrently.
pub struct ContractRegistry {
    contracts: Mutex<BTreeMap<TransactionId, EscrowContract>>,
    poll_guard: Mutex<()>,
    ledger: Arc<dyn LedgerClient>,
    store: Arc<dyn DurableStore>,
    listener: Arc<dyn SettlementListener>,
    config: Arc<ExchangeConfig>,
    event_handler: Arc<dyn EventHandler>,
}

impl ContractRegistry {
    pub fn new(
        config: Arc<ExchangeConfig>,
        ledger: Arc<dyn LedgerClient>,
        store: Arc<dyn DurableStore>,
        listener: Arc<dyn SettlementListener>,
        event_handler: Arc<dyn EventHandler>,
    ) -> Self {
        Self {
            contracts: Mutex::new(BTreeMap::new()),
            poll_guard: Mutex::new(()),
            ledger,
            store,
            listener,
            config,
            event_handler,
        }
    }

    // ========================================================================
    // Membership
    // ========================================================================

    pub fn register(&self, contract: EscrowContract) -> ExchangeResult<()> {
        let mut contracts = self.contracts.lock();
        if contracts.contains_key(&contract.transaction_id) {
            return Err(ExchangeError::DuplicateContract(contract.transaction_id));
        }
        debug!(
            "Registered {:?} contract {} with {}",
            contract.role, contract.transaction_id, contract.counterparty
        );
        contracts.insert(contract.transaction_id, contract);
        Ok(())
    }

    /// Remove a contract from memory. Its durable record is left alone.
    pub fn unregister(&self, transaction_id: &TransactionId) -> Option<EscrowContract> {
        self.contracts.lock().remove(transaction_id)
    }

    pub fn get(&self, transaction_id: &TransactionId) -> Option<EscrowContract> {
        self.contracts.lock().get(transaction_id).cloned()
    }

    pub fn contains(&self, transaction_id: &TransactionId) -> bool {
        self.contracts.lock().contains_key(transaction_id)
    }

    pub fn transaction_ids(&self) -> Vec<TransactionId> {
        self.contracts.lock().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.contracts.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.contracts.lock().is_empty()
    }

    // ========================================================================
    // Transitions
    // ========================================================================

    fn with_contract<T, F>(&self, transaction_id: &TransactionId, f: F) -> ExchangeResult<T>
    where
        F: FnOnce(&mut EscrowContract, &dyn DurableStore) -> ExchangeResult<T>,
    {
        let (result, event) = {
            let mut contracts = self.contracts.lock();
            let contract = contracts
                .get_mut(transaction_id)
                .ok_or(ExchangeError::UnknownTransaction(*transaction_id))?;
            let before = contract.state();
            let result = f(contract, self.store.as_ref());
            (result, state_event(contract, before))
        };
        // A failed store write may still leave the contract advanced
        if let Some(event) = event {
            self.event_handler.on_event(event);
        }
        result
    }

    /// Persist and activate a registered contract (the commit point).
    pub fn activate(&self, transaction_id: &TransactionId) -> ExchangeResult<()> {
        self.with_contract(transaction_id, |contract, store| contract.activate(store))?;
        info!("Contract {} activated", transaction_id);
        Ok(())
    }

    pub fn attach_ledger_tx(
        &self,
        transaction_id: &TransactionId,
        ledger_tx_id: LedgerTxId,
    ) -> ExchangeResult<()> {
        let shown = ledger_tx_id.clone();
        self.with_contract(transaction_id, |contract, store| {
            contract.set_ledger_tx_id(ledger_tx_id, store)
        })?;
        info!("Contract {} awaits ledger tx {}", transaction_id, shown);
        Ok(())
    }

    /// Fail a contract from outside the poll loop (broadcast refused, the
    /// counterparty reported a failure) and run its compensation now.
    ///
    /// A contract that was never activated has nothing to compensate and
    /// is simply dropped.
    pub fn abort(
        &self,
        transaction_id: &TransactionId,
        reason: ExchangeError,
    ) -> ExchangeResult<PollReport> {
        let _guard = self.poll_guard.lock();
        let mut report = PollReport::default();

        let state = self
            .get(transaction_id)
            .map(|contract| contract.state())
            .ok_or(ExchangeError::UnknownTransaction(*transaction_id))?;
        match state {
            ContractState::Created => {
                self.unregister(transaction_id);
                return Ok(report);
            }
            ContractState::Activated | ContractState::AwaitingConfirmation => {
                warn!("Aborting contract {}: {}", transaction_id, reason);
                self.with_contract(transaction_id, |contract, _| contract.fail(reason))?;
            }
            _ => {}
        }

        self.resolve(transaction_id, &mut report);
        Ok(report)
    }

    // ========================================================================
    // Polling
    // ========================================================================

    /// Advance every activated contract by one observation.
    ///
    /// Terminal contracts run their settlement side effects; the durable
    /// record is deleted only after those succeed.
    pub fn poll_all(&self) -> PollReport {
        let _guard = self.poll_guard.lock();
        let mut report = PollReport::default();

        // Select work without touching the ledger
        let mut queries: Vec<(TransactionId, Option<LedgerTxId>)> = Vec::new();
        let mut resolvable: Vec<TransactionId> = Vec::new();
        {
            let mut contracts = self.contracts.lock();
            for (id, contract) in contracts.iter_mut() {
                match contract.state() {
                    ContractState::Created => {}
                    ContractState::Activated | ContractState::AwaitingConfirmation => {
                        if contract.is_record_stale() {
                            match contract.persist(self.store.as_ref()) {
                                Ok(()) => debug!("Record of contract {} rewritten", id),
                                Err(err) => warn!("Record of contract {} still stale: {}", id, err),
                            }
                        }
                        if contract.begin_poll() {
                            queries.push((*id, contract.ledger_tx_id().cloned()));
                        } else {
                            report.backed_off += 1;
                        }
                    }
                    ContractState::Confirmed
                    | ContractState::Finalized
                    | ContractState::Failed => resolvable.push(*id),
                }
            }
        }

        // Query the ledger unlocked
        let observations: Vec<(TransactionId, Option<LedgerTxId>, Observation)> = queries
            .into_iter()
            .map(|(id, ledger_tx)| {
                let observation = match &ledger_tx {
                    Some(tx) => Observation::from(self.ledger.confirmations(tx)),
                    None => Observation::NoLedgerTx,
                };
                (id, ledger_tx, observation)
            })
            .collect();
        report.polled = observations.len();

        // Apply observations
        let mut events = Vec::new();
        {
            let mut contracts = self.contracts.lock();
            for (id, queried_tx, observation) in observations {
                let Some(contract) = contracts.get_mut(&id) else {
                    continue;
                };
                // Skip results that no longer describe the contract
                if contract.ledger_tx_id() != queried_tx.as_ref() || !contract.state().is_pending()
                {
                    continue;
                }

                let before = contract.state();
                match contract.observe(observation, &self.config) {
                    Ok(PollStep::Waiting { confirmations }) => {
                        debug!("Contract {} has {} confirmations", id, confirmations);
                    }
                    Ok(PollStep::Backoff { skip_polls }) => {
                        report.ledger_errors += 1;
                        warn!(
                            "Ledger unavailable for contract {}, skipping {} polls",
                            id, skip_polls
                        );
                    }
                    Ok(PollStep::Confirmed) => {
                        info!("Contract {} confirmed", id);
                        resolvable.push(id);
                    }
                    Ok(PollStep::Failed(reason)) => {
                        warn!("Contract {} failed: {}", id, reason);
                        resolvable.push(id);
                    }
                    Err(err) => warn!("Contract {} not advanced: {}", id, err),
                }
                if let Some(event) = state_event(contract, before) {
                    events.push(event);
                }
            }
        }
        self.event_handler.on_events(events);

        for id in resolvable {
            self.resolve(&id, &mut report);
        }
        report
    }

    /// Run the side effects of a terminal contract and forget it.
    ///
    /// Each step is recorded on the contract, so a failure part way leaves
    /// it to be retried from that step on the next cycle without repeating
    /// earlier ones.
    fn resolve(&self, transaction_id: &TransactionId, report: &mut PollReport) {
        let Some(contract) = self.get(transaction_id) else {
            return;
        };

        match contract.state() {
            ContractState::Confirmed => {
                if let Err(err) = self.listener.on_settled(&contract) {
                    warn!("Settlement of {} deferred: {}", transaction_id, err);
                    report.retained += 1;
                    return;
                }
                if let Err(err) = self.with_contract(transaction_id, |contract, _| contract.finalize())
                {
                    warn!("Contract {} not finalized: {}", transaction_id, err);
                    report.retained += 1;
                    return;
                }
            }
            ContractState::Failed if !contract.is_compensated() => {
                let reason = contract
                    .failure()
                    .cloned()
                    .unwrap_or(ExchangeError::ConfirmationTimeout);
                if let Err(err) = self.listener.on_failed(&contract, &reason) {
                    warn!("Rollback of {} deferred: {}", transaction_id, err);
                    report.retained += 1;
                    return;
                }
                if let Some(contract) = self.contracts.lock().get_mut(transaction_id) {
                    contract.mark_compensated();
                }
            }
            ContractState::Finalized | ContractState::Failed => {}
            ContractState::Created
            | ContractState::Activated
            | ContractState::AwaitingConfirmation => return,
        }

        if let Err(err) = self.store.delete(transaction_id) {
            warn!("Record of {} kept: {}", transaction_id, err);
            report.retained += 1;
            return;
        }

        if let Some(contract) = self.unregister(transaction_id) {
            match contract.state() {
                ContractState::Finalized => {
                    info!("Contract {} settled", transaction_id);
                    report.settled.push(*transaction_id);
                }
                _ => {
                    let reason = contract
                        .failure()
                        .cloned()
                        .unwrap_or(ExchangeError::ConfirmationTimeout);
                    info!("Contract {} rolled back: {}", transaction_id, reason);
                    report.failed.push((*transaction_id, reason));
                }
            }
        }
    }

    // ========================================================================
    // Recovery
    // ========================================================================

    /// Repopulate the registry from the durable store after a restart.
    ///
    /// Returns the number of contracts loaded. Records already in memory are
    /// skipped.
    pub fn load_from_durable_store(&self) -> ExchangeResult<usize> {
        let records = self.store.load_all()?;
        let mut contracts = self.contracts.lock();
        let mut loaded = 0;

        for record in records {
            if contracts.contains_key(&record.transaction_id) {
                continue;
            }
            if !record.state.is_pending() {
                // Only activated, unresolved contracts are ever persisted
                warn!(
                    "Ignoring stored contract {} in state {}",
                    record.transaction_id, record.state
                );
                continue;
            }
            let contract = EscrowContract::from_record(record);
            contracts.insert(contract.transaction_id, contract);
            loaded += 1;
        }

        info!("Recovered {} escrow contracts", loaded);
        Ok(loaded)
    }
}

fn state_event(contract: &EscrowContract, before: ContractState) -> Option<ExchangeEvent> {
    (contract.state() != before).then(|| ExchangeEvent::ContractStateChanged {
        transaction_id: contract.transaction_id,
        from: before,
        to: contract.state(),
        timestamp: Utc::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::PeerId;
    use crate::escrow::Role;
    use crate::interfaces::{
        ChannelEventHandler, InMemoryLedger, InMemoryStore, LedgerAddress, LedgerClient,
        NoOpEventHandler, TransferTemplate,
    };
    use crate::numeric::Amount;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingListener {
        settled: AtomicUsize,
        failed: AtomicUsize,
        refuse: AtomicBool,
    }

    impl SettlementListener for CountingListener {
        fn on_settled(&self, _contract: &EscrowContract) -> ExchangeResult<()> {
            if self.refuse.load(Ordering::SeqCst) {
                return Err(ExchangeError::LedgerUnavailable("busy".into()));
            }
            self.settled.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn on_failed(&self, _contract: &EscrowContract, _reason: &ExchangeError) -> ExchangeResult<()> {
            if self.refuse.load(Ordering::SeqCst) {
                return Err(ExchangeError::LedgerUnavailable("busy".into()));
            }
            self.failed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Fixture {
        ledger: Arc<InMemoryLedger>,
        store: Arc<InMemoryStore>,
        listener: Arc<CountingListener>,
        registry: ContractRegistry,
    }

    fn fixture() -> Fixture {
        let ledger = Arc::new(InMemoryLedger::new());
        let store = Arc::new(InMemoryStore::new());
        let listener = Arc::new(CountingListener::default());
        let config = ExchangeConfig::new(["EUR"])
            .with_required_confirmations(6)
            .with_max_unconfirmed_polls(3)
            .with_max_backoff_polls(2);
        let registry = ContractRegistry::new(
            Arc::new(config),
            ledger.clone(),
            store.clone(),
            listener.clone(),
            Arc::new(NoOpEventHandler),
        );
        Fixture {
            ledger,
            store,
            listener,
            registry,
        }
    }

    fn contract() -> EscrowContract {
        EscrowContract::new(
            TransactionId::new(),
            Role::Sender,
            Amount::ONE,
            Amount::ZERO,
            Amount::from_integer(30000),
            "EUR".to_string(),
            PeerId::new("bob"),
            Some(LedgerAddress::new("bc1qbob")),
        )
    }

    /// Register, activate and broadcast a contract.
    fn broadcasting(f: &Fixture) -> (TransactionId, LedgerTxId) {
        let contract = contract();
        let id = contract.transaction_id;
        f.registry.register(contract).unwrap();
        f.registry.activate(&id).unwrap();
        let tx = f
            .ledger
            .broadcast(&TransferTemplate {
                transaction_id: id,
                destination: LedgerAddress::new("bc1qbob"),
                amount: Amount::ONE,
                fee: Amount::ZERO,
            })
            .unwrap();
        f.registry.attach_ledger_tx(&id, tx.clone()).unwrap();
        (id, tx)
    }

    #[test]
    fn test_duplicate_registration() {
        let f = fixture();
        let contract = contract();
        f.registry.register(contract.clone()).unwrap();
        assert_eq!(
            f.registry.register(contract.clone()),
            Err(ExchangeError::DuplicateContract(contract.transaction_id))
        );
        assert_eq!(f.registry.len(), 1);
    }

    #[test]
    fn test_unknown_transaction() {
        let f = fixture();
        let id = TransactionId::new();
        assert_eq!(
            f.registry.activate(&id),
            Err(ExchangeError::UnknownTransaction(id))
        );
    }

    #[test]
    fn test_created_contracts_are_not_polled() {
        let f = fixture();
        f.registry.register(contract()).unwrap();
        let report = f.registry.poll_all();
        assert_eq!(report.polled, 0);
        assert_eq!(f.ledger.query_count(), 0);
    }

    #[test]
    fn test_confirmed_contract_settles_and_is_removed() {
        let f = fixture();
        let (id, tx) = broadcasting(&f);
        assert_eq!(f.store.len(), 1);

        let report = f.registry.poll_all();
        assert_eq!(report.polled, 1);
        assert!(report.settled.is_empty());

        f.ledger.set_confirmations(&tx, 6);
        let report = f.registry.poll_all();
        assert_eq!(report.settled, vec![id]);
        assert_eq!(f.listener.settled.load(Ordering::SeqCst), 1);
        assert!(f.registry.is_empty());
        assert!(f.store.is_empty());
    }

    #[test]
    fn test_listener_error_keeps_contract_for_next_cycle() {
        let f = fixture();
        let (id, tx) = broadcasting(&f);
        f.ledger.set_confirmations(&tx, 6);
        f.listener.refuse.store(true, Ordering::SeqCst);

        let report = f.registry.poll_all();
        assert_eq!(report.retained, 1);
        assert_eq!(f.registry.get(&id).unwrap().state(), ContractState::Confirmed);
        assert_eq!(f.store.len(), 1);

        f.listener.refuse.store(false, Ordering::SeqCst);
        let queries = f.ledger.query_count();
        let report = f.registry.poll_all();
        assert_eq!(report.settled, vec![id]);
        // A confirmed contract is not queried again
        assert_eq!(f.ledger.query_count(), queries);
        assert_eq!(f.listener.settled.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_store_delete_failure_does_not_repeat_side_effects() {
        let f = fixture();
        let (id, tx) = broadcasting(&f);
        f.ledger.drop_transaction(&tx);

        for _ in 0..2 {
            f.registry.poll_all();
        }
        f.store.set_failing(true);
        let report = f.registry.poll_all();
        assert_eq!(report.retained, 1);
        assert_eq!(f.listener.failed.load(Ordering::SeqCst), 1);

        f.store.set_failing(false);
        let report = f.registry.poll_all();
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0], (id, ExchangeError::ConfirmationTimeout));
        assert_eq!(f.listener.failed.load(Ordering::SeqCst), 1);
        assert!(f.store.is_empty());
    }

    #[test]
    fn test_stale_record_rewritten_on_next_poll() {
        let f = fixture();
        let contract = contract();
        let id = contract.transaction_id;
        f.registry.register(contract).unwrap();
        f.registry.activate(&id).unwrap();

        f.store.set_failing(true);
        let tx = LedgerTxId::new("tx1");
        assert!(matches!(
            f.registry.attach_ledger_tx(&id, tx.clone()),
            Err(ExchangeError::Store(_))
        ));
        let live = f.registry.get(&id).unwrap();
        assert_eq!(live.ledger_tx_id(), Some(&tx));
        assert!(live.is_record_stale());

        // Still failing: the contract keeps being polled on its ledger tx
        f.ledger.set_confirmations(&tx, 1);
        assert_eq!(f.registry.poll_all().polled, 1);
        assert!(f.registry.get(&id).unwrap().is_record_stale());

        f.store.set_failing(false);
        f.registry.poll_all();
        assert!(!f.registry.get(&id).unwrap().is_record_stale());
        let stored = f.store.get(&id).unwrap().unwrap();
        assert_eq!(stored.ledger_tx_id, Some(tx));
        assert_eq!(stored.state, ContractState::AwaitingConfirmation);
    }

    #[test]
    fn test_double_spend_fails_contract() {
        let f = fixture();
        let (id, tx) = broadcasting(&f);
        f.ledger.mark_conflicted(&tx);

        let report = f.registry.poll_all();
        assert_eq!(report.failed, vec![(id, ExchangeError::DoubleSpendObserved)]);
        assert_eq!(f.listener.failed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_ledger_outage_backs_off_and_never_fails() {
        let f = fixture();
        let (id, tx) = broadcasting(&f);
        f.ledger.set_available(false);

        let mut reports = Vec::new();
        for _ in 0..10 {
            reports.push(f.registry.poll_all());
        }
        assert!(reports.iter().all(|r| r.failed.is_empty()));
        assert!(reports.iter().any(|r| r.backed_off > 0));
        assert_eq!(
            f.registry.get(&id).unwrap().state(),
            ContractState::AwaitingConfirmation
        );

        f.ledger.set_available(true);
        f.ledger.set_confirmations(&tx, 6);
        let settled: Vec<TransactionId> = (0..3)
            .flat_map(|_| f.registry.poll_all().settled)
            .collect();
        assert_eq!(settled, vec![id]);
    }

    #[test]
    fn test_abort_compensates_once() {
        let f = fixture();
        let (id, _) = broadcasting(&f);

        let report = f
            .registry
            .abort(&id, ExchangeError::BroadcastFailed("rejected".into()))
            .unwrap();
        assert_eq!(report.failed.len(), 1);
        assert_eq!(f.listener.failed.load(Ordering::SeqCst), 1);
        assert!(f.store.is_empty());

        assert_eq!(
            f.registry
                .abort(&id, ExchangeError::ConfirmationTimeout)
                .unwrap_err(),
            ExchangeError::UnknownTransaction(id)
        );
        assert_eq!(f.listener.failed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_abort_unactivated_contract_just_drops_it() {
        let f = fixture();
        let contract = contract();
        let id = contract.transaction_id;
        f.registry.register(contract).unwrap();

        f.registry
            .abort(&id, ExchangeError::ConfirmationTimeout)
            .unwrap();
        assert!(f.registry.is_empty());
        assert_eq!(f.listener.failed.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_recovery_from_store() {
        let f = fixture();
        let (id, tx) = broadcasting(&f);
        assert_eq!(f.registry.load_from_durable_store().unwrap(), 0);

        let restarted = ContractRegistry::new(
            Arc::new(ExchangeConfig::new(["EUR"])),
            f.ledger.clone(),
            f.store.clone(),
            f.listener.clone(),
            Arc::new(NoOpEventHandler),
        );
        assert_eq!(restarted.load_from_durable_store().unwrap(), 1);
        let recovered = restarted.get(&id).unwrap();
        assert_eq!(recovered.ledger_tx_id(), Some(&tx));
        assert_eq!(recovered.state(), ContractState::AwaitingConfirmation);

        f.ledger.set_confirmations(&tx, 6);
        assert_eq!(restarted.poll_all().settled, vec![id]);
    }

    #[test]
    fn test_state_changes_are_published() {
        let ledger = Arc::new(InMemoryLedger::new());
        let (handler, events) = ChannelEventHandler::unbounded();
        let registry = ContractRegistry::new(
            Arc::new(ExchangeConfig::new(["EUR"])),
            ledger,
            Arc::new(InMemoryStore::new()),
            Arc::new(CountingListener::default()),
            Arc::new(handler),
        );
        let contract = contract();
        let id = contract.transaction_id;
        registry.register(contract).unwrap();
        registry.activate(&id).unwrap();

        let event = events.try_recv().unwrap();
        assert!(matches!(
            event,
            ExchangeEvent::ContractStateChanged {
                from: ContractState::Created,
                to: ContractState::Activated,
                ..
            }
        ));
    }
}
