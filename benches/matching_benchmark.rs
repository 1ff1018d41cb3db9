// ============================================================================
// Peer Exchange Benchmarks
// ============================================================================
//
// Benchmark Categories:
// 1. Matching - Local orders crossing a book of remote orders
// 2. Order Book Operations - Resting orders and snapshots
// 3. Compensation - Matching followed by rollback
// 4. Settlement - Registry poll cycles over many pending contracts
// ============================================================================

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use peer_exchange::prelude::*;
use std::hint::black_box;
use std::sync::Arc;

fn engine() -> MatchingEngine {
    MatchingEngine::new(
        Arc::new(ExchangeConfig::new(["EUR"])),
        Arc::new(NoOpEventHandler),
    )
}

/// Book with `levels` remote asks starting at 50 000, one per price.
fn populated_engine(levels: i64, quantity: i64) -> MatchingEngine {
    let engine = engine();
    for i in 0..levels {
        let ask = Order::remote(
            PeerId::new(format!("peer{}", i % 16)),
            Side::Ask,
            "EUR",
            Amount::from_integer(50_000 + i),
            Amount::from_integer(quantity),
        );
        engine.notice_remote_order(ask).unwrap();
    }
    engine
}

// ============================================================================
// Matching Benchmarks
// ============================================================================

fn benchmark_price_time_matching(c: &mut Criterion) {
    let mut group = c.benchmark_group("price_time_matching");

    for levels in [100, 1000, 10000].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(levels), levels, |b, &levels| {
            // Deep levels so the book never drains
            let engine = populated_engine(levels, 1_000_000);

            b.iter(|| {
                let bid = Order::local(Side::Bid, "EUR", Amount::from_integer(50_005), Amount::ONE);
                let result = engine.submit_local_order(bid).unwrap();
                for trade in &result.trades {
                    engine.settle(&trade.id);
                }
                black_box(result)
            });
        });
    }

    group.finish();
}

fn benchmark_multi_level_sweep(c: &mut Criterion) {
    c.bench_function("multi_level_sweep", |b| {
        let engine = populated_engine(100, 1_000_000);

        b.iter(|| {
            // Crosses the first six levels without exhausting them
            let bid = Order::local(
                Side::Bid,
                "EUR",
                Amount::from_integer(50_005),
                Amount::from_integer(5_000_000),
            );
            let result = engine.submit_local_order(bid).unwrap();
            for trade in &result.trades {
                engine.rollback(&trade.id).unwrap();
            }
            black_box(result)
        });
    });
}

// ============================================================================
// Order Book Operations
// ============================================================================

fn benchmark_order_submission_no_match(c: &mut Criterion) {
    c.bench_function("order_submission_no_match", |b| {
        let engine = populated_engine(1000, 1);

        b.iter(|| {
            // Bid far below every ask: rests, then leaves again
            let bid = Order::local(Side::Bid, "EUR", Amount::from_integer(40_000), Amount::ONE);
            let result = engine.submit_local_order(bid).unwrap();
            if let Some(resting) = &result.resting {
                engine.cancel_order(&resting.id).unwrap();
            }
            black_box(result)
        });
    });
}

fn benchmark_order_book_snapshot(c: &mut Criterion) {
    let mut group = c.benchmark_group("order_book_snapshot");

    for depth in [5, 20, 100].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(depth), depth, |b, &depth| {
            let engine = populated_engine(1000, 1);

            b.iter(|| black_box(engine.snapshot("EUR", depth).unwrap()));
        });
    }

    group.finish();
}

// ============================================================================
// Settlement Benchmarks
// ============================================================================

fn benchmark_registry_poll(c: &mut Criterion) {
    let mut group = c.benchmark_group("registry_poll");

    for contracts in [10, 100, 1000].iter() {
        group.bench_with_input(
            BenchmarkId::from_parameter(contracts),
            contracts,
            |b, &contracts| {
                let ledger = Arc::new(InMemoryLedger::new());
                let registry = ContractRegistry::new(
                    Arc::new(ExchangeConfig::new(["EUR"])),
                    ledger.clone(),
                    Arc::new(InMemoryStore::new()),
                    Arc::new(peer_exchange::interfaces::NoOpSettlementListener),
                    Arc::new(NoOpEventHandler),
                );

                for i in 0..contracts {
                    let transaction_id = TransactionId::new();
                    let contract = EscrowContract::new(
                        transaction_id,
                        Role::Receiver,
                        Amount::ONE,
                        Amount::ZERO,
                        Amount::from_integer(50_000),
                        "EUR".to_string(),
                        PeerId::new(format!("peer{}", i)),
                        None,
                    );
                    registry.register(contract).unwrap();
                    registry.activate(&transaction_id).unwrap();
                    // Broadcast transactions sit at zero confirmations
                    let template = peer_exchange::interfaces::TransferTemplate {
                        transaction_id,
                        destination: LedgerAddress::new("bc1qbench"),
                        amount: Amount::ONE,
                        fee: Amount::ZERO,
                    };
                    let ledger_tx = ledger.broadcast(&template).unwrap();
                    registry.attach_ledger_tx(&transaction_id, ledger_tx).unwrap();
                }

                b.iter(|| black_box(registry.poll_all()));
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    benchmark_price_time_matching,
    benchmark_multi_level_sweep,
    benchmark_order_submission_no_match,
    benchmark_order_book_snapshot,
    benchmark_registry_poll,
);
criterion_main!(benches);
