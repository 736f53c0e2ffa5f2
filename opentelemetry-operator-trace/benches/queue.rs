use chrono::Utc;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use opentelemetry::trace::{SpanContext, SpanId, TraceFlags, TraceId, TraceState};
use opentelemetry_operator_trace::{ResourceKey, TraceContextCodec, TracingQueue, UnitOfWork, UnitParent};
use std::hint::black_box;

fn unit(key: &ResourceKey, i: usize) -> UnitOfWork {
    UnitOfWork::new(key.clone()).with_parent(UnitParent {
        trace_id: format!("{i:032x}"),
        span_id: format!("{i:016x}"),
        ..Default::default()
    })
}

fn criterion_benchmark(c: &mut Criterion) {
    queue_benchmark_group(c);
    codec_benchmark_group(c);
}

fn queue_benchmark_group(c: &mut Criterion) {
    let mut group = c.benchmark_group("tracing_queue");
    for merges in [1, 10, 100] {
        group.bench_function(BenchmarkId::new("add_merge", merges), |b| {
            let key = ResourceKey::new("default", "web");
            let units: Vec<_> = (1..=merges).map(|i| unit(&key, i)).collect();
            b.iter(|| {
                let queue = TracingQueue::new();
                for unit in &units {
                    queue.add(unit.clone());
                }
                black_box(queue.len())
            })
        });
    }
    group.bench_function("add_distinct_keys", |b| {
        let units: Vec<_> = (1..=100)
            .map(|i| unit(&ResourceKey::new("default", format!("web-{i}")), i))
            .collect();
        b.iter(|| {
            let queue = TracingQueue::new();
            for unit in &units {
                queue.add(unit.clone());
            }
            black_box(queue.len())
        })
    });
    group.finish();
}

fn codec_benchmark_group(c: &mut Criterion) {
    let mut group = c.benchmark_group("codec");
    let codec = TraceContextCodec::new();
    let span_context = SpanContext::new(
        TraceId::from_hex("4bf92f3577b34da6a3ce929d0e0e4736").unwrap_or(TraceId::INVALID),
        SpanId::from_hex("00f067aa0ba902b7").unwrap_or(SpanId::INVALID),
        TraceFlags::SAMPLED,
        true,
        TraceState::from_key_value([("vendor", "value")]).unwrap_or_default(),
    );
    let now = Utc::now();

    group.bench_function("inject", |b| {
        b.iter(|| black_box(codec.inject(&span_context, "operatortrace_ts", now)))
    });

    let encoded = codec.inject(&span_context, "operatortrace_ts", now);
    let (trace_parent, trace_state) = encoded.unwrap_or_default();
    group.bench_function("parse_context", |b| {
        b.iter(|| {
            black_box(codec.parse_context(&trace_parent, &trace_state, "operatortrace_ts"))
        })
    });
    group.bench_function("build_trace_parent", |b| {
        b.iter(|| {
            black_box(
                codec.build_trace_parent("4bf92f3577b34da6a3ce929d0e0e4736", "00f067aa0ba902b7"),
            )
        })
    });
    group.finish();
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
