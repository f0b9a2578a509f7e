//! Benchmarks for the connection registry
//!
//! Target: put/remove <1us under contention

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rpc_transport::infrastructure::TransportMetrics;
use rpc_transport::{Connection, ConnectionId, ConnectionRegistry};
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn make_connection(parent: &CancellationToken, metrics: &Arc<TransportMetrics>) -> Arc<Connection> {
    let addr: SocketAddr = "127.0.0.1:40000".parse().unwrap();
    let (tx, _rx) = mpsc::channel(1);
    Arc::new(Connection::new(
        ConnectionId::next(),
        addr,
        addr,
        tx,
        parent,
        Arc::clone(metrics),
    ))
}

fn bench_put_remove(c: &mut Criterion) {
    let registry = ConnectionRegistry::new();
    let parent = CancellationToken::new();
    let metrics = Arc::new(TransportMetrics::new());
    let connection = make_connection(&parent, &metrics);

    c.bench_function("registry_put_remove", |b| {
        b.iter(|| {
            registry.put(connection.id(), Arc::clone(&connection));
            black_box(registry.remove(black_box(connection.id())));
        })
    });
}

fn bench_put_remove_contended(c: &mut Criterion) {
    let registry = Arc::new(ConnectionRegistry::new());
    let parent = CancellationToken::new();
    let metrics = Arc::new(TransportMetrics::new());
    let connections: Vec<_> = (0..4).map(|_| make_connection(&parent, &metrics)).collect();

    c.bench_function("registry_put_remove_4_threads", |b| {
        b.iter(|| {
            thread::scope(|scope| {
                for connection in &connections {
                    let registry = Arc::clone(&registry);
                    scope.spawn(move || {
                        for _ in 0..256 {
                            registry.put(connection.id(), Arc::clone(connection));
                            registry.remove(connection.id());
                        }
                    });
                }
            });
        })
    });
}

fn bench_snapshot(c: &mut Criterion) {
    let registry = ConnectionRegistry::new();
    let parent = CancellationToken::new();
    let metrics = Arc::new(TransportMetrics::new());
    for _ in 0..1000 {
        let connection = make_connection(&parent, &metrics);
        registry.put(connection.id(), connection);
    }

    c.bench_function("registry_snapshot_1000", |b| {
        b.iter(|| black_box(registry.snapshot().len()))
    });
}

criterion_group!(benches, bench_put_remove, bench_put_remove_contended, bench_snapshot);
criterion_main!(benches);
