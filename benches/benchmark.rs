//! Broadcaster and simulator benchmarks.
//!
//! - Fan-out of one reading to a growing number of in-memory clients
//! - Generation of a simulated reading burst

use std::{sync::Arc, time::Duration};

use axum::extract::ws::Message;
use bascula_daemon::{
    scale::generate_simulated_weights,
    server::{Broadcaster, Client, HealthMetrics, ScaleActivity},
};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use futures_util::sink::{self, SinkExt};
use tokio::runtime::Runtime;

fn broadcaster_with_clients(count: usize) -> Broadcaster {
    let broadcaster = Broadcaster::new(
        HealthMetrics::new().unwrap(),
        Arc::new(ScaleActivity::default()),
        Duration::from_secs(1),
    );
    for _ in 0..count {
        let sink = sink::drain::<Message>().sink_map_err(axum::Error::new);
        broadcaster.add_client(Client::new(None, sink));
    }
    broadcaster
}

/// Benchmarks delivering one reading to every connected client.
fn bench_broadcast(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("broadcast");

    for clients in [1usize, 10, 100] {
        let broadcaster = broadcaster_with_clients(clients);
        group.bench_with_input(BenchmarkId::from_parameter(clients), &clients, |b, _| {
            b.to_async(&rt).iter(|| async {
                broadcaster.broadcast("12.50");
                broadcaster.wait_for_sends().await;
            });
        });
    }
    group.finish();
}

fn bench_simulated_weights(c: &mut Criterion) {
    c.bench_function("simulated_burst", |b| b.iter(generate_simulated_weights));
}

criterion_group!(benches, bench_broadcast, bench_simulated_weights);
criterion_main!(benches);
