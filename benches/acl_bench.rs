//! Criterion micro-benchmarks for the ACL hot path.
//!
//! These benchmarks measure:
//! - Policy compilation from rule text
//! - Longest-prefix lookups against compiled policies
//! - Filtering node lists by a policy
//!
//! Run with: `cargo bench --bench acl_bench`

use std::sync::Arc;

use consulate::cluster::acl::{AclFilter, Filterable, Policy};
use consulate::cluster::context::ProcessContext;
use consulate::cluster::types::Node;
use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

/// Rule text with `n` key prefixes and `n` service prefixes.
fn rules(n: usize) -> String {
    let keys: Vec<String> = (0..n)
        .map(|i| format!(r#""app/{i}/": "write""#))
        .collect();
    let services: Vec<String> = (0..n).map(|i| format!(r#""svc-{i}": "read""#)).collect();
    format!(
        r#"{{"key": {{{}}}, "service": {{{}}}, "node": {{"web-": "read"}}}}"#,
        keys.join(", "),
        services.join(", ")
    )
}

fn deny_parent() -> Arc<Policy> {
    ProcessContext::new().deny_all()
}

fn bench_compile(c: &mut Criterion) {
    let mut group = c.benchmark_group("policy_compile");

    for n in [1, 10, 100].iter() {
        let text = rules(*n);
        group.bench_with_input(BenchmarkId::from_parameter(n), n, |b, _| {
            b.iter(|| Policy::compile(deny_parent(), black_box(&text)).unwrap());
        });
    }

    group.finish();
}

fn bench_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("policy_lookup");
    let policy = Policy::compile(deny_parent(), &rules(100)).unwrap();

    group.bench_function("key_hit", |b| {
        b.iter(|| policy.key_write(black_box("app/42/config/db")));
    });
    group.bench_function("key_miss", |b| {
        b.iter(|| policy.key_read(black_box("other/path")));
    });
    group.bench_function("service_hit", |b| {
        b.iter(|| policy.service_read(black_box("svc-99")));
    });

    group.finish();
}

fn bench_filter_nodes(c: &mut Criterion) {
    let mut group = c.benchmark_group("filter_nodes");
    let policy = Arc::new(Policy::compile(deny_parent(), &rules(10)).unwrap());
    let filter = AclFilter::new(policy, true);

    for size in [10, 100, 1_000].iter() {
        let nodes: Vec<Node> = (0..*size)
            .map(|i| Node {
                node: if i % 2 == 0 {
                    format!("web-{i}")
                } else {
                    format!("db-{i}")
                },
                ..Node::default()
            })
            .collect();

        group.throughput(Throughput::Elements(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, _| {
            b.iter(|| {
                let mut batch = nodes.clone();
                Filterable::Nodes(&mut batch).filter(&filter);
                black_box(batch)
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_compile, bench_lookup, bench_filter_nodes);
criterion_main!(benches);
