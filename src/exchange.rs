// ============================================================================
// Exchange
// Wires the matching engine, contract registry and collaborators together
// ============================================================================

use crate::domain::{ExchangeConfig, Order, OrderId, Owner, PeerId, Side, TransactionId};
use crate::engine::{MatchResult, MatchingEngine, TradePhase};
use crate::error::{ExchangeError, ExchangeResult};
use crate::escrow::{ContractRegistry, PollReport, Role};
use crate::interfaces::{
    DurableStore, EventHandler, LedgerAddress, LedgerClient, LedgerTxId, MatchNotice,
    PeerMessage, Transport,
};
use crate::numeric::Amount;
use std::sync::Arc;
use tracing::{info, warn};

/// One node of the peer exchange.
///
/// Owns the engine and the registry; the registry reports contract outcomes
/// straight back to the engine.
pub struct Exchange {
    config: Arc<ExchangeConfig>,
    engine: Arc<MatchingEngine>,
    registry: Arc<ContractRegistry>,
    ledger: Arc<dyn LedgerClient>,
    transport: Arc<dyn Transport>,
    /// Where counterparties send cryptocurrency we buy
    receive_address: LedgerAddress,
}

impl Exchange {
    pub fn new(
        config: ExchangeConfig,
        ledger: Arc<dyn LedgerClient>,
        store: Arc<dyn DurableStore>,
        transport: Arc<dyn Transport>,
        event_handler: Arc<dyn EventHandler>,
        receive_address: LedgerAddress,
    ) -> ExchangeResult<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let engine = Arc::new(MatchingEngine::new(
            Arc::clone(&config),
            Arc::clone(&event_handler),
        ));
        let registry = Arc::new(ContractRegistry::new(
            Arc::clone(&config),
            Arc::clone(&ledger),
            store,
            engine.clone(),
            event_handler,
        ));

        Ok(Self {
            config,
            engine,
            registry,
            ledger,
            transport,
            receive_address,
        })
    }

    pub fn config(&self) -> &ExchangeConfig {
        &self.config
    }

    pub fn engine(&self) -> &Arc<MatchingEngine> {
        &self.engine
    }

    pub fn registry(&self) -> &Arc<ContractRegistry> {
        &self.registry
    }

    // ========================================================================
    // Orders
    // ========================================================================

    /// Place a local order, announce what rests and tell every counterparty
    /// about its trades.
    pub fn submit_order(
        &self,
        side: Side,
        currency: &str,
        price: Amount,
        quantity: Amount,
    ) -> ExchangeResult<MatchResult> {
        let result = self
            .engine
            .submit_local_order(Order::local(side, currency, price, quantity))?;

        self.announce_matches(&result);
        if let Some(resting) = &result.resting {
            self.broadcast(PeerMessage::OrderSubmitted {
                order_id: resting.id,
                side: resting.side,
                currency: resting.currency.clone(),
                price: resting.price,
                quantity: resting.remaining(),
            });
        }
        Ok(result)
    }

    pub fn cancel_order(&self, order_id: &OrderId) -> ExchangeResult<Order> {
        let order = self.engine.cancel_order(order_id)?;
        self.broadcast(PeerMessage::OrderCancelled { order_id: order.id });
        Ok(order)
    }

    /// Cancel by position in [`MatchingEngine::my_orders`]
    pub fn cancel_order_at(&self, index: usize) -> ExchangeResult<Order> {
        let order = self.engine.cancel_order_at(index)?;
        self.broadcast(PeerMessage::OrderCancelled { order_id: order.id });
        Ok(order)
    }

    fn announce_matches(&self, result: &MatchResult) {
        for trade in &result.trades {
            if let Some((peer, notice)) = MatchNotice::for_counterparty(trade) {
                self.send(&peer, PeerMessage::TradeMatched(notice));
            }
        }
    }

    // ========================================================================
    // Settlement
    // ========================================================================

    /// Pay out a trade where this node sells.
    ///
    /// The contract is persisted before the transfer is broadcast. If the
    /// ledger refuses the transfer the trade is rolled back, the contract
    /// record removed and the counterparty told.
    pub fn execute_trade(
        &self,
        transaction_id: &TransactionId,
        destination: LedgerAddress,
    ) -> ExchangeResult<LedgerTxId> {
        if self.local_role(transaction_id)? != Role::Sender {
            return Err(ExchangeError::InvalidOrder(format!(
                "trade {} is paid by the counterparty",
                transaction_id
            )));
        }
        let (contract, template) = self.engine.start_execute(transaction_id, destination)?;
        let counterparty = contract.counterparty.clone();

        self.registry.register(contract)?;
        if let Err(err) = self.registry.activate(transaction_id) {
            self.registry.unregister(transaction_id);
            return Err(err);
        }

        let ledger_tx_id = match self.ledger.broadcast(&template) {
            Ok(id) => id,
            Err(err) => {
                let err = ExchangeError::from(err);
                warn!("Broadcast for trade {} failed: {}", transaction_id, err);
                self.registry.abort(transaction_id, err.clone())?;
                self.send(
                    &counterparty,
                    PeerMessage::PaymentFailed {
                        transaction_id: *transaction_id,
                        reason: err.to_string(),
                    },
                );
                return Err(err);
            }
        };

        // The transfer is out; from here on the trade can no longer be
        // rolled back, so a lagging record is left to the next poll.
        if let Err(err) = self
            .registry
            .attach_ledger_tx(transaction_id, ledger_tx_id.clone())
        {
            warn!(
                "Ledger tx {} for trade {} not yet persisted: {}",
                ledger_tx_id, transaction_id, err
            );
        }
        self.engine
            .finish_execute(transaction_id, template.amount, ledger_tx_id.clone())?;

        info!(
            "Trade {} paid with ledger tx {}",
            transaction_id, ledger_tx_id
        );
        self.send(
            &counterparty,
            PeerMessage::PaymentReady {
                transaction_id: *transaction_id,
                ledger_tx_id: ledger_tx_id.clone(),
                amount: template.amount,
            },
        );
        Ok(ledger_tx_id)
    }

    /// Start watching the transfer a seller announced.
    fn accept_payment(
        &self,
        peer: &PeerId,
        transaction_id: &TransactionId,
        ledger_tx_id: LedgerTxId,
        amount: Amount,
    ) -> ExchangeResult<()> {
        self.ensure_counterparty(peer, transaction_id)?;
        if self.local_role(transaction_id)? != Role::Receiver {
            return Err(ExchangeError::InvalidOrder(format!(
                "payment announced for trade {} where this node sells",
                transaction_id
            )));
        }
        self.check_payment(transaction_id, amount)?;
        let (contract, _) = self
            .engine
            .start_execute(transaction_id, self.receive_address.clone())?;

        self.registry.register(contract)?;
        if let Err(err) = self.registry.activate(transaction_id) {
            self.registry.unregister(transaction_id);
            return Err(err);
        }
        if let Err(err) = self
            .registry
            .attach_ledger_tx(transaction_id, ledger_tx_id.clone())
        {
            warn!(
                "Ledger tx {} for trade {} not yet persisted: {}",
                ledger_tx_id, transaction_id, err
            );
        }
        self.engine
            .finish_execute(transaction_id, amount, ledger_tx_id)?;
        Ok(())
    }

    // An announced payment must fit the trade before any contract exists.
    fn check_payment(&self, transaction_id: &TransactionId, amount: Amount) -> ExchangeResult<()> {
        let active = self
            .engine
            .active_transaction(transaction_id)
            .ok_or(ExchangeError::UnknownTransaction(*transaction_id))?;
        if active.phase == TradePhase::Broadcast || self.registry.contains(transaction_id) {
            return Err(ExchangeError::AlreadyFinalized(*transaction_id));
        }
        if amount.is_negative() || amount > active.trade.quantity {
            return Err(ExchangeError::InvalidOrder(format!(
                "payment of {} outside matched quantity {}",
                amount, active.trade.quantity
            )));
        }
        Ok(())
    }

    /// Give up on a trade: compensate through the registry when a contract
    /// exists, otherwise roll the book back directly.
    fn fail_trade(&self, transaction_id: &TransactionId, reason: ExchangeError) -> ExchangeResult<()> {
        if self.registry.contains(transaction_id) {
            self.registry.abort(transaction_id, reason)?;
        } else {
            self.engine.rollback(transaction_id)?;
        }
        Ok(())
    }

    // The seller of the crypto pays out; the buyer watches.
    fn local_role(&self, transaction_id: &TransactionId) -> ExchangeResult<Role> {
        let active = self
            .engine
            .active_transaction(transaction_id)
            .ok_or(ExchangeError::UnknownTransaction(*transaction_id))?;
        match active.trade.local_side() {
            Some(Side::Ask) => Ok(Role::Sender),
            Some(Side::Bid) => Ok(Role::Receiver),
            None => Err(ExchangeError::UnknownTransaction(*transaction_id)),
        }
    }

    fn ensure_counterparty(&self, peer: &PeerId, transaction_id: &TransactionId) -> ExchangeResult<()> {
        let active = self
            .engine
            .active_transaction(transaction_id)
            .ok_or(ExchangeError::UnknownTransaction(*transaction_id))?;
        if active.trade.counterparty_peer() != Some(peer) {
            return Err(ExchangeError::UnknownTransaction(*transaction_id));
        }
        Ok(())
    }

    // ========================================================================
    // Inbound Messages
    // ========================================================================

    /// Route a message received from `peer`.
    pub fn handle_peer_message(&self, peer: &PeerId, message: PeerMessage) -> ExchangeResult<()> {
        match message {
            PeerMessage::OrderSubmitted {
                order_id,
                side,
                currency,
                price,
                quantity,
            } => {
                let order = Order::with_id(
                    order_id,
                    side,
                    Owner::Remote(peer.clone()),
                    currency,
                    price,
                    quantity,
                );
                let result = self.engine.notice_remote_order(order)?;
                self.announce_matches(&result);
                Ok(())
            }

            PeerMessage::OrderCancelled { order_id } => {
                self.engine.remove_remote_order(peer, &order_id)?;
                Ok(())
            }

            PeerMessage::TradeMatched(notice) => {
                if let Err(err) = self.engine.accept_remote_match(peer, &notice) {
                    warn!("Refusing match {} from {}: {}", notice.transaction_id, peer, err);
                    self.send(
                        peer,
                        PeerMessage::PaymentFailed {
                            transaction_id: notice.transaction_id,
                            reason: err.to_string(),
                        },
                    );
                    return Err(err);
                }
                Ok(())
            }

            PeerMessage::PaymentReady {
                transaction_id,
                ledger_tx_id,
                amount,
            } => self.accept_payment(peer, &transaction_id, ledger_tx_id, amount),

            PeerMessage::PaymentFailed {
                transaction_id,
                reason,
            } => {
                self.ensure_counterparty(peer, &transaction_id)?;
                warn!("Peer {} failed trade {}: {}", peer, transaction_id, reason);
                self.fail_trade(&transaction_id, ExchangeError::BroadcastFailed(reason))
            }
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Reload persisted contracts after a restart
    pub fn recover(&self) -> ExchangeResult<usize> {
        self.registry.load_from_durable_store()
    }

    /// Run one poll cycle over all contracts
    pub fn poll(&self) -> PollReport {
        self.registry.poll_all()
    }

    /// Poll on the current tokio runtime until `shutdown` turns true
    #[cfg(feature = "async")]
    pub fn spawn_polling(
        &self,
        period: std::time::Duration,
        shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(crate::escrow::run_polling(
            Arc::clone(&self.registry),
            period,
            shutdown,
        ))
    }

    // ========================================================================
    // Transport
    // ========================================================================

    // Delivery failures never undo local state; the peer resynchronises
    // from later messages.
    fn send(&self, peer: &PeerId, message: PeerMessage) {
        if let Err(err) = self.transport.send(peer, message) {
            warn!("Message to {} not delivered: {}", peer, err);
        }
    }

    fn broadcast(&self, message: PeerMessage) {
        if let Err(err) = self.transport.broadcast(message) {
            warn!("Broadcast not delivered: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::escrow::{ContractRecord, ContractState};
    use crate::interfaces::{
        InMemoryLedger, InMemoryStore, NoOpEventHandler, RecordingTransport, StoreError,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Node {
        exchange: Exchange,
        ledger: Arc<InMemoryLedger>,
        store: Arc<InMemoryStore>,
        transport: Arc<RecordingTransport>,
    }

    fn node(ledger: Arc<InMemoryLedger>, address: &str) -> Node {
        let store = Arc::new(InMemoryStore::new());
        let transport = Arc::new(RecordingTransport::new());
        let config = ExchangeConfig::new(["EUR"]).with_max_unconfirmed_polls(3);
        let exchange = Exchange::new(
            config,
            ledger.clone(),
            store.clone(),
            transport.clone(),
            Arc::new(NoOpEventHandler),
            LedgerAddress::new(address),
        )
        .unwrap();
        Node {
            exchange,
            ledger,
            store,
            transport,
        }
    }

    /// Deliver everything `from` sent to `to`.
    fn deliver(from: &Node, from_peer: &PeerId, to: &Node) -> Vec<ExchangeResult<()>> {
        from.transport
            .take()
            .into_iter()
            .map(|(_, message)| to.exchange.handle_peer_message(from_peer, message))
            .collect()
    }

    fn amount(value: i64) -> Amount {
        Amount::from_integer(value)
    }

    /// Accepts a fixed number of writes, then refuses until topped up.
    #[derive(Default)]
    struct RationedStore {
        inner: InMemoryStore,
        puts_left: AtomicUsize,
    }

    impl DurableStore for RationedStore {
        fn put(&self, key: &TransactionId, record: &ContractRecord) -> Result<(), StoreError> {
            self.puts_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .map_err(|_| StoreError::Unavailable("disk full".to_string()))?;
            self.inner.put(key, record)
        }

        fn get(&self, key: &TransactionId) -> Result<Option<ContractRecord>, StoreError> {
            self.inner.get(key)
        }

        fn delete(&self, key: &TransactionId) -> Result<(), StoreError> {
            self.inner.delete(key)
        }

        fn load_all(&self) -> Result<Vec<ContractRecord>, StoreError> {
            self.inner.load_all()
        }
    }

    /// Alice's ask matched by Bob's bid, known to both nodes.
    fn matched(alice: &Node, bob: &Node, quantity: i64) -> TransactionId {
        let alice_id = PeerId::new("alice");
        let bob_id = PeerId::new("bob");
        alice
            .exchange
            .submit_order(Side::Ask, "EUR", amount(100), amount(quantity))
            .unwrap();
        deliver(alice, &alice_id, bob);
        let tx = bob
            .exchange
            .submit_order(Side::Bid, "EUR", amount(100), amount(quantity))
            .unwrap()
            .trades[0]
            .id;
        deliver(bob, &bob_id, alice);
        tx
    }

    #[test]
    fn test_invalid_config_rejected() {
        let result = Exchange::new(
            ExchangeConfig::default(),
            Arc::new(InMemoryLedger::new()),
            Arc::new(InMemoryStore::new()),
            Arc::new(RecordingTransport::new()),
            Arc::new(NoOpEventHandler),
            LedgerAddress::new("x"),
        );
        assert!(matches!(result, Err(ExchangeError::Config(_))));
    }

    #[test]
    fn test_two_nodes_trade_and_settle() {
        let ledger = Arc::new(InMemoryLedger::new());
        let alice = node(ledger.clone(), "bc1qalice");
        let bob = node(ledger.clone(), "bc1qbob");
        let alice_id = PeerId::new("alice");
        let bob_id = PeerId::new("bob");

        // Alice offers 3 at 100, Bob learns about it
        alice
            .exchange
            .submit_order(Side::Ask, "EUR", amount(100), amount(3))
            .unwrap();
        assert!(deliver(&alice, &alice_id, &bob).iter().all(|r| r.is_ok()));

        // Bob buys 2; Alice learns about the trade
        let result = bob
            .exchange
            .submit_order(Side::Bid, "EUR", amount(110), amount(2))
            .unwrap();
        let tx = result.trades[0].id;
        assert_eq!(result.trades[0].price, amount(100));
        assert!(deliver(&bob, &bob_id, &alice).iter().all(|r| r.is_ok()));
        assert!(alice.exchange.engine().active_transaction(&tx).is_some());

        // Alice pays; Bob starts watching the same ledger tx
        let ledger_tx = alice
            .exchange
            .execute_trade(&tx, LedgerAddress::new("bc1qbob"))
            .unwrap();
        assert_eq!(alice.store.len(), 1);
        assert!(deliver(&alice, &alice_id, &bob).iter().all(|r| r.is_ok()));
        let watched = bob.exchange.registry().get(&tx).unwrap();
        assert_eq!(watched.role, Role::Receiver);
        assert_eq!(watched.state(), ContractState::AwaitingConfirmation);
        assert_eq!(watched.ledger_tx_id(), Some(&ledger_tx));

        ledger.set_confirmations(&ledger_tx, 6);
        assert_eq!(alice.exchange.poll().settled, vec![tx]);
        assert_eq!(bob.exchange.poll().settled, vec![tx]);
        assert!(alice.exchange.engine().active_transactions().is_empty());
        assert!(bob.exchange.engine().active_transactions().is_empty());
        assert!(alice.store.is_empty() && bob.store.is_empty());

        // Alice still offers the unmatched 1
        let mine = alice.exchange.engine().my_orders();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].remaining(), amount(1));
    }

    #[test]
    fn test_rejected_broadcast_rolls_back_and_notifies() {
        let ledger = Arc::new(InMemoryLedger::new());
        let alice = node(ledger.clone(), "bc1qalice");
        let bob = node(ledger.clone(), "bc1qbob");
        let alice_id = PeerId::new("alice");
        let bob_id = PeerId::new("bob");

        alice
            .exchange
            .submit_order(Side::Ask, "EUR", amount(100), amount(1))
            .unwrap();
        deliver(&alice, &alice_id, &bob);
        let tx = bob
            .exchange
            .submit_order(Side::Bid, "EUR", amount(100), amount(1))
            .unwrap()
            .trades[0]
            .id;
        deliver(&bob, &bob_id, &alice);

        ledger.reject_broadcasts(true);
        assert!(matches!(
            alice.exchange.execute_trade(&tx, LedgerAddress::new("bc1qbob")),
            Err(ExchangeError::BroadcastFailed(_))
        ));
        assert!(alice.store.is_empty());
        assert!(alice.exchange.registry().is_empty());
        assert!(alice.exchange.engine().active_transaction(&tx).is_none());
        // Alice's ask is back on her book
        assert_eq!(alice.exchange.engine().my_orders().len(), 1);

        let sent = alice.transport.sent();
        assert!(matches!(
            sent.last(),
            Some((Some(to), PeerMessage::PaymentFailed { transaction_id, .. }))
                if *to == bob_id && *transaction_id == tx
        ));
        assert!(deliver(&alice, &alice_id, &bob).iter().all(|r| r.is_ok()));
        assert!(bob.exchange.engine().active_transaction(&tx).is_none());
    }

    #[test]
    fn test_only_seller_executes() {
        let ledger = Arc::new(InMemoryLedger::new());
        let alice = node(ledger.clone(), "bc1qalice");
        let bob = node(ledger, "bc1qbob");
        let alice_id = PeerId::new("alice");

        alice
            .exchange
            .submit_order(Side::Ask, "EUR", amount(100), amount(1))
            .unwrap();
        deliver(&alice, &alice_id, &bob);
        let tx = bob
            .exchange
            .submit_order(Side::Bid, "EUR", amount(100), amount(1))
            .unwrap()
            .trades[0]
            .id;

        assert!(matches!(
            bob.exchange.execute_trade(&tx, LedgerAddress::new("bc1qalice")),
            Err(ExchangeError::InvalidOrder(_))
        ));
        assert!(bob.exchange.registry().is_empty());
    }

    #[test]
    fn test_messages_from_strangers_are_ignored() {
        let ledger = Arc::new(InMemoryLedger::new());
        let alice = node(ledger.clone(), "bc1qalice");
        let bob = node(ledger, "bc1qbob");
        let alice_id = PeerId::new("alice");

        alice
            .exchange
            .submit_order(Side::Ask, "EUR", amount(100), amount(1))
            .unwrap();
        deliver(&alice, &alice_id, &bob);
        let tx = bob
            .exchange
            .submit_order(Side::Bid, "EUR", amount(100), amount(1))
            .unwrap()
            .trades[0]
            .id;

        let mallory = PeerId::new("mallory");
        let forged = PeerMessage::PaymentFailed {
            transaction_id: tx,
            reason: "forged".to_string(),
        };
        assert_eq!(
            bob.exchange.handle_peer_message(&mallory, forged),
            Err(ExchangeError::UnknownTransaction(tx))
        );
        assert!(bob.exchange.engine().active_transaction(&tx).is_some());
    }

    #[test]
    fn test_cancel_is_broadcast() {
        let ledger = Arc::new(InMemoryLedger::new());
        let alice = node(ledger.clone(), "bc1qalice");
        let bob = node(ledger, "bc1qbob");
        let alice_id = PeerId::new("alice");

        let order = alice
            .exchange
            .submit_order(Side::Ask, "EUR", amount(100), amount(1))
            .unwrap()
            .resting
            .unwrap();
        deliver(&alice, &alice_id, &bob);
        assert!(bob.exchange.engine().get_order(&order.id).is_some());

        alice.exchange.cancel_order_at(0).unwrap();
        deliver(&alice, &alice_id, &bob);
        assert!(bob.exchange.engine().get_order(&order.id).is_none());
    }

    #[test]
    fn test_unconfirmed_payment_times_out_on_both_sides() {
        let ledger = Arc::new(InMemoryLedger::new());
        let alice = node(ledger.clone(), "bc1qalice");
        let bob = node(ledger.clone(), "bc1qbob");
        let alice_id = PeerId::new("alice");
        let bob_id = PeerId::new("bob");

        alice
            .exchange
            .submit_order(Side::Ask, "EUR", amount(100), amount(1))
            .unwrap();
        deliver(&alice, &alice_id, &bob);
        let tx = bob
            .exchange
            .submit_order(Side::Bid, "EUR", amount(100), amount(1))
            .unwrap()
            .trades[0]
            .id;
        deliver(&bob, &bob_id, &alice);
        let ledger_tx = alice
            .exchange
            .execute_trade(&tx, LedgerAddress::new("bc1qbob"))
            .unwrap();
        deliver(&alice, &alice_id, &bob);

        ledger.drop_transaction(&ledger_tx);
        let mut failed = Vec::new();
        for _ in 0..3 {
            failed.extend(alice.exchange.poll().failed);
            failed.extend(bob.exchange.poll().failed);
        }
        assert_eq!(
            failed,
            vec![
                (tx, ExchangeError::ConfirmationTimeout),
                (tx, ExchangeError::ConfirmationTimeout)
            ]
        );
        assert_eq!(alice.exchange.engine().my_orders().len(), 1);
        assert!(bob.exchange.engine().my_orders().is_empty());
        assert!(alice.ledger.broadcasts().len() == 1);
    }

    #[test]
    fn test_sent_transfer_survives_store_failure() {
        let ledger = Arc::new(InMemoryLedger::new());
        let store = Arc::new(RationedStore::default());
        let transport = Arc::new(RecordingTransport::new());
        let alice = Node {
            exchange: Exchange::new(
                ExchangeConfig::new(["EUR"]).with_max_unconfirmed_polls(3),
                ledger.clone(),
                store.clone(),
                transport.clone(),
                Arc::new(NoOpEventHandler),
                LedgerAddress::new("bc1qalice"),
            )
            .unwrap(),
            ledger: ledger.clone(),
            store: Arc::new(InMemoryStore::new()),
            transport,
        };
        let bob = node(ledger.clone(), "bc1qbob");
        let tx = matched(&alice, &bob, 1);

        // Only the activation record gets written
        store.puts_left.store(1, Ordering::SeqCst);
        let ledger_tx = alice
            .exchange
            .execute_trade(&tx, LedgerAddress::new("bc1qbob"))
            .unwrap();
        let contract = alice.exchange.registry().get(&tx).unwrap();
        assert_eq!(contract.state(), ContractState::AwaitingConfirmation);
        assert_eq!(contract.ledger_tx_id(), Some(&ledger_tx));
        assert!(matches!(
            alice.transport.sent().last(),
            Some((_, PeerMessage::PaymentReady { transaction_id, .. })) if *transaction_id == tx
        ));

        // Polling past the observation window neither fails nor rolls back
        for _ in 0..5 {
            assert!(alice.exchange.poll().failed.is_empty());
        }
        assert!(alice.exchange.engine().my_orders().is_empty());

        store.puts_left.store(usize::MAX, Ordering::SeqCst);
        alice.exchange.poll();
        let stored = store.get(&tx).unwrap().unwrap();
        assert_eq!(stored.ledger_tx_id, Some(ledger_tx.clone()));

        ledger.set_confirmations(&ledger_tx, 6);
        assert_eq!(alice.exchange.poll().settled, vec![tx]);
        assert!(alice.exchange.engine().my_orders().is_empty());
        assert_eq!(ledger.broadcasts().len(), 1);
    }

    #[test]
    fn test_oversized_payment_leaves_no_contract() {
        let ledger = Arc::new(InMemoryLedger::new());
        let alice = node(ledger.clone(), "bc1qalice");
        let bob = node(ledger, "bc1qbob");
        let alice_id = PeerId::new("alice");
        let tx = matched(&alice, &bob, 1);

        let announce = |quantity: i64| PeerMessage::PaymentReady {
            transaction_id: tx,
            ledger_tx_id: LedgerTxId::new("ltx"),
            amount: amount(quantity),
        };
        assert!(matches!(
            bob.exchange.handle_peer_message(&alice_id, announce(5)),
            Err(ExchangeError::InvalidOrder(_))
        ));
        assert!(bob.exchange.registry().is_empty());
        assert!(bob.store.is_empty());

        bob.exchange
            .handle_peer_message(&alice_id, announce(1))
            .unwrap();
        assert_eq!(bob.exchange.registry().len(), 1);
        assert_eq!(
            bob.exchange.handle_peer_message(&alice_id, announce(1)),
            Err(ExchangeError::AlreadyFinalized(tx))
        );
        assert_eq!(bob.store.len(), 1);
    }
}
