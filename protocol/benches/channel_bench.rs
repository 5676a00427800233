// Ledger-operation and serialization benchmarks for the DUET protocol.
//
// Covers seed generation, the simulated ledger's handshake steps (address
// derivation, co-signing, transaction construction), and wire/persistence
// encoding of channel states at various bundle counts.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use duet_protocol::channel::state::ChannelState;
use duet_protocol::ledger::sim::SimLedger;
use duet_protocol::ledger::{ChannelOptions, LedgerClient, Seed, TransferSplit};
use duet_protocol::wire::ChannelMessage;

fn opts() -> ChannelOptions {
    ChannelOptions {
        tx_count_limit: 100,
        deposit_amount: 50,
        settlement_address: "duet1masterpay".to_string(),
    }
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .build()
        .expect("bench runtime")
}

/// Drives the sim through init and `n` full transaction handshakes.
fn state_with_bundles(n: usize) -> ChannelState {
    let rt = runtime();
    rt.block_on(async {
        let sim = SimLedger::new();
        let (master, slave) = (Seed::generate(), Seed::generate());
        let state = sim.master_initialize(&master, &opts()).await.unwrap();
        let mut state = sim
            .slave_co_initialize(&slave, "duet1slavepay", &state)
            .await
            .unwrap();
        for _ in 0..n {
            state = sim.master_new_address(&master, &state).await.unwrap();
            state = sim.slave_sign_address(&slave, &state).await.unwrap();
            state = sim
                .master_new_transaction(&master, &state, &TransferSplit { master: 0, slave: 1 })
                .await
                .unwrap();
            state = sim.slave_sign_transaction(&slave, &state).await.unwrap();
        }
        state
    })
}

fn bench_seed_generation(c: &mut Criterion) {
    c.bench_function("ledger/seed_generate", |b| {
        b.iter(Seed::generate);
    });
}

fn bench_address_handshake(c: &mut Criterion) {
    let rt = runtime();
    let sim = SimLedger::new();
    let (master, slave) = (Seed::generate(), Seed::generate());
    let state = rt.block_on(async {
        let state = sim.master_initialize(&master, &opts()).await.unwrap();
        sim.slave_co_initialize(&slave, "duet1slavepay", &state)
            .await
            .unwrap()
    });

    c.bench_function("ledger/address_handshake", |b| {
        b.iter(|| {
            rt.block_on(async {
                let pending = sim.master_new_address(&master, &state).await.unwrap();
                sim.slave_sign_address(&slave, &pending).await.unwrap()
            })
        });
    });
}

fn bench_transaction_handshake(c: &mut Criterion) {
    let rt = runtime();
    let sim = SimLedger::new();
    let (master, slave) = (Seed::generate(), Seed::generate());
    let state = rt.block_on(async {
        let state = sim.master_initialize(&master, &opts()).await.unwrap();
        let state = sim
            .slave_co_initialize(&slave, "duet1slavepay", &state)
            .await
            .unwrap();
        let state = sim.master_new_address(&master, &state).await.unwrap();
        sim.slave_sign_address(&slave, &state).await.unwrap()
    });
    let split = TransferSplit { master: 0, slave: 10 };

    c.bench_function("ledger/transaction_handshake", |b| {
        b.iter(|| {
            rt.block_on(async {
                let proposed = sim
                    .master_new_transaction(&master, &state, &split)
                    .await
                    .unwrap();
                sim.slave_sign_transaction(&slave, &proposed).await.unwrap()
            })
        });
    });
}

fn bench_wire_encoding(c: &mut Criterion) {
    let mut group = c.benchmark_group("wire/flash_state_round_trip");

    for bundles in [0usize, 10, 50] {
        let state = state_with_bundles(bundles);
        let msg = ChannelMessage::FlashState {
            channel_state: state,
        };

        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::from_parameter(bundles), &msg, |b, msg| {
            b.iter(|| {
                let bytes = msg.encode();
                ChannelMessage::decode(&bytes).unwrap()
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_seed_generation,
    bench_address_handshake,
    bench_transaction_handshake,
    bench_wire_encoding,
);
criterion_main!(benches);
