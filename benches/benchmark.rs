//! Engine Performance Benchmark Suite
//!
//! Measures the admission path in isolation and end to end:
//! - Admission/removal cycles against the registry and publisher
//! - Penguin lookup over a populated registry
//! - TCP connect-to-admission latency through a live listener

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use penguin_engine::{
    server::{Engine, ServerKind},
    store::MemoryStore,
};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::{net::TcpStream, runtime::Runtime};

fn build_engine(rt: &Runtime, max_users: usize) -> Arc<Engine> {
    rt.block_on(async {
        Engine::builder(1, ServerKind::World)
            .max_users(max_users)
            .bind_interface(true)
            .store(Arc::new(MemoryStore::ready()))
            .build()
            .expect("engine should build")
    })
}

fn bench_admission(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let engine = build_engine(&rt, 10_000);
    let addr: SocketAddr = "127.0.0.1:40000".parse().unwrap();

    let mut group = c.benchmark_group("admission");
    for batch in [1usize, 100, 1_000] {
        group.bench_with_input(BenchmarkId::new("admit_then_remove", batch), &batch, |b, &batch| {
            b.iter(|| {
                let clients: Vec<_> = (0..batch).filter_map(|_| engine.build_protocol(addr)).collect();
                for client in &clients {
                    engine.disconnect(client);
                }
            });
        });
    }
    group.finish();
}

fn bench_lookup(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let engine = build_engine(&rt, 10_000);
    let addr: SocketAddr = "127.0.0.1:40001".parse().unwrap();

    for id in 1..=1_000u32 {
        if let Some(client) = engine.build_protocol(addr) {
            client.set_penguin_id(id);
        }
    }

    c.bench_function("get_penguin_by_id/1000", |b| {
        b.iter(|| engine.get_penguin_by_id("999").unwrap())
    });
}

fn bench_tcp_admission(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let engine = build_engine(&rt, 10_000);
    let addr = rt.block_on(async {
        engine.run("127.0.0.1", 0).await.expect("listener should bind");
        engine.local_addr().expect("listener address")
    });

    let mut group = c.benchmark_group("tcp");
    group.measurement_time(Duration::from_secs(10));
    group.bench_function("connect_and_admit", |b| {
        b.to_async(&rt).iter(|| async {
            let before = engine.metrics().admitted.get();
            let stream = TcpStream::connect(addr).await.expect("connect");
            while engine.metrics().admitted.get() == before {
                tokio::task::yield_now().await;
            }
            drop(stream);
        });
    });
    group.finish();
}

criterion_group!(benches, bench_admission, bench_lookup, bench_tcp_admission);
criterion_main!(benches);
