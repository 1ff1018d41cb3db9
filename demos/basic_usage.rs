// ============================================================================
// Basic Usage Example
// Two nodes trade over an in-process transport and settle on a shared ledger
// ============================================================================

use peer_exchange::domain::REQUIRED_CONFIRMATIONS;
use peer_exchange::interfaces::RecordingTransport;
use peer_exchange::prelude::*;
use std::sync::Arc;

struct Node {
    name: PeerId,
    exchange: Exchange,
    outbox: Arc<RecordingTransport>,
}

impl Node {
    fn new(name: &str, ledger: Arc<InMemoryLedger>) -> ExchangeResult<Self> {
        let outbox = Arc::new(RecordingTransport::new());
        let exchange = Exchange::new(
            ExchangeConfig::bitcoin_fiat(),
            ledger,
            Arc::new(InMemoryStore::new()),
            outbox.clone(),
            Arc::new(LoggingEventHandler),
            LedgerAddress::new(format!("bc1q{}", name)),
        )?;
        Ok(Self {
            name: PeerId::new(name),
            exchange,
            outbox,
        })
    }

    /// Hand every queued message to `other`
    fn deliver_to(&self, other: &Node) -> ExchangeResult<()> {
        for (_, message) in self.outbox.take() {
            other.exchange.handle_peer_message(&self.name, message)?;
        }
        Ok(())
    }
}

fn print_book(node: &Node) -> ExchangeResult<()> {
    let snapshot = node.exchange.engine().snapshot("EUR", 5)?;
    println!("\n=== {}'s EUR book ===", node.name);
    println!("Bids:");
    for (price, qty) in &snapshot.bids {
        println!("  {} @ {}", qty, price);
    }
    println!("Asks:");
    for (price, qty) in &snapshot.asks {
        println!("  {} @ {}", qty, price);
    }
    println!("Spread: {:?}", snapshot.spread);
    Ok(())
}

fn main() -> ExchangeResult<()> {
    #[cfg(feature = "logging")]
    peer_exchange::utils::init_logging(peer_exchange::utils::DEFAULT_FILTER)?;

    println!("=== Peer Exchange Example ===\n");

    let ledger = Arc::new(InMemoryLedger::new());
    let alice = Node::new("alice", ledger.clone())?;
    let bob = Node::new("bob", ledger.clone())?;

    // Alice offers coins at rising prices
    println!("Alice places asks...");
    for i in 0i64..3 {
        alice.exchange.submit_order(
            Side::Ask,
            "EUR",
            Amount::from_integer(25_000 + i * 100),
            Amount::ONE,
        )?;
    }
    alice.deliver_to(&bob)?;
    print_book(&bob)?;

    // Bob crosses the two cheapest asks
    println!("\nBob bids 2 @ 25100...");
    let result = bob.exchange.submit_order(
        Side::Bid,
        "EUR",
        Amount::from_integer(25_100),
        Amount::from_integer(2),
    )?;
    for trade in &result.trades {
        println!("  Trade {}: {} @ {}", trade.id, trade.quantity, trade.price);
    }
    bob.deliver_to(&alice)?;

    // Alice pays out each trade; Bob watches the transfers
    for trade in &result.trades {
        let ledger_tx = alice
            .exchange
            .execute_trade(&trade.id, LedgerAddress::new("bc1qbob"))?;
        println!("Alice broadcast {} for trade {}", ledger_tx, trade.id);
        ledger.set_confirmations(&ledger_tx, REQUIRED_CONFIRMATIONS);
    }
    alice.deliver_to(&bob)?;

    for node in [&alice, &bob] {
        let report = node.exchange.poll();
        println!(
            "{} settled {} trade(s), {} failed",
            node.name,
            report.settled.len(),
            report.failed.len()
        );
    }

    print_book(&alice)?;
    print_book(&bob)?;
    Ok(())
}
