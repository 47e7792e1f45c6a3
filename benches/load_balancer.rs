#![allow(clippy::all)]
//! Benchmarks for the load balancer.
//!
//! Tests: strategy selection (round-robin, weighted, least-connections,
//! least-response-time, ip hash, consistent hash), ring rebuild and lookup,
//! facade select/release, health check cycles.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use intelligent_lb::load_balancer::health::ProbeFuture;
use intelligent_lb::load_balancer::ring::{ConsistentHashRing, HashRing};
use intelligent_lb::load_balancer::strategy::{
    ConsistentHashStrategy, IpHashStrategy, LeastConnectionsStrategy, LeastResponseTimeStrategy,
    RoundRobinStrategy, WeightedRoundRobinStrategy,
};
use intelligent_lb::load_balancer::{
    HashKey, HealthCheckConfig, HealthProbe, LoadBalancer, LoadBalancerConfig,
    LoadBalancingStrategy, Node, NodeConfig, NoopEventSink, RequestContext, Strategy,
    StrategyType,
};
use std::hint::black_box;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

const NODE_COUNTS: [usize; 4] = [3, 10, 50, 200];

struct OkProbe;

impl HealthProbe for OkProbe {
    fn probe<'a>(&'a self, _node: &'a Node, _config: &'a HealthCheckConfig) -> ProbeFuture<'a> {
        Box::pin(async { Ok(200) })
    }
}

fn node_configs(count: usize) -> Vec<NodeConfig> {
    (0..count)
        .map(|i| {
            NodeConfig::new(
                format!("node-{i}"),
                format!("10.{}.{}.{}", (i >> 16) & 0xff, (i >> 8) & 0xff, i & 0xff),
                8080,
            )
            .with_weight((i % 5) as u32 + 1)
        })
        .collect()
}

fn make_nodes(count: usize) -> Vec<Arc<Node>> {
    node_configs(count)
        .iter()
        .map(|config| Arc::new(Node::new(config)))
        .collect()
}

fn context(i: u32) -> RequestContext {
    let [a, b, c, d] = i.to_be_bytes();
    RequestContext::new(IpAddr::V4(Ipv4Addr::new(a.max(1), b, c, d)))
}

// ---------------------------------------------------------------------------
// Strategy selection benchmarks
// ---------------------------------------------------------------------------

fn bench_strategy(
    c: &mut Criterion,
    group_name: &str,
    make: fn(&[Arc<Node>]) -> Box<dyn Strategy>,
) {
    let mut group = c.benchmark_group(group_name);

    for node_count in NODE_COUNTS {
        let nodes = make_nodes(node_count);
        let strategy = make(&nodes);
        let contexts: Vec<RequestContext> = (0..256).map(context).collect();

        group.bench_with_input(BenchmarkId::new("select", node_count), &node_count, |b, _| {
            let mut i = 0usize;
            b.iter(|| {
                i = i.wrapping_add(1);
                black_box(strategy.select(&nodes, &contexts[i % contexts.len()]));
            });
        });
    }

    group.finish();
}

fn bench_round_robin(c: &mut Criterion) {
    bench_strategy(c, "load_balancer/round_robin", |_| {
        Box::new(RoundRobinStrategy::new())
    });
}

fn bench_weighted_round_robin(c: &mut Criterion) {
    bench_strategy(c, "load_balancer/weighted_round_robin", |_| {
        Box::new(WeightedRoundRobinStrategy::new())
    });
}

fn bench_least_connections(c: &mut Criterion) {
    bench_strategy(c, "load_balancer/least_connections", |nodes| {
        for (i, node) in nodes.iter().enumerate() {
            for _ in 0..(i % 7) {
                node.acquire();
            }
        }
        Box::new(LeastConnectionsStrategy::new())
    });
}

fn bench_least_response_time(c: &mut Criterion) {
    bench_strategy(c, "load_balancer/least_response_time", |nodes| {
        for (i, node) in nodes.iter().enumerate() {
            node.mark_healthy(Duration::from_millis((i % 13) as u64 + 1));
        }
        Box::new(LeastResponseTimeStrategy::new())
    });
}

fn bench_ip_hash(c: &mut Criterion) {
    bench_strategy(c, "load_balancer/ip_hash", |_| {
        Box::new(IpHashStrategy::new(HashKey::ClientIp))
    });
}

fn bench_consistent_hash(c: &mut Criterion) {
    bench_strategy(c, "load_balancer/consistent_hash", |nodes| {
        let ring = Arc::new(ConsistentHashRing::new());
        ring.rebuild(nodes, 100);
        Box::new(ConsistentHashStrategy::new(ring, HashKey::ClientIp))
    });
}

// ---------------------------------------------------------------------------
// Ring benchmarks
// ---------------------------------------------------------------------------

fn bench_ring(c: &mut Criterion) {
    let mut group = c.benchmark_group("load_balancer/ring");

    for node_count in NODE_COUNTS {
        let nodes = make_nodes(node_count);

        group.bench_with_input(BenchmarkId::new("build", node_count), &node_count, |b, _| {
            b.iter(|| black_box(HashRing::build(&nodes, 100)));
        });

        let ring = HashRing::build(&nodes, 100);
        group.bench_with_input(BenchmarkId::new("lookup", node_count), &node_count, |b, _| {
            let mut i = 0u32;
            b.iter(|| {
                i = i.wrapping_add(1);
                black_box(ring.lookup(&i.to_be_bytes(), |_| true));
            });
        });
    }

    group.finish();
}

// ---------------------------------------------------------------------------
// Facade benchmarks
// ---------------------------------------------------------------------------

fn make_balancer(node_count: usize, algorithm: StrategyType) -> LoadBalancer {
    LoadBalancer::builder(LoadBalancerConfig {
        nodes: node_configs(node_count),
        strategy: LoadBalancingStrategy::new(algorithm),
        ..LoadBalancerConfig::default()
    })
    .event_sink(Arc::new(NoopEventSink))
    .probe(Arc::new(OkProbe))
    .build()
    .unwrap()
}

fn bench_select_release(c: &mut Criterion) {
    let mut group = c.benchmark_group("load_balancer/select_release");

    for algorithm in [
        StrategyType::RoundRobin,
        StrategyType::LeastConnections,
        StrategyType::ConsistentHash,
    ] {
        let lb = make_balancer(50, algorithm);
        let ctx = context(42);

        group.bench_function(algorithm.to_string(), |b| {
            b.iter(|| {
                let node = lb.select_node(&ctx).unwrap();
                lb.release_connection(node.id(), &ctx);
                black_box(node);
            });
        });
    }

    group.finish();
}

fn bench_health_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("load_balancer/health_cycle");
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap();

    for node_count in [3, 10, 50] {
        let lb = make_balancer(node_count, StrategyType::RoundRobin);

        group.bench_with_input(
            BenchmarkId::new("check_health", node_count),
            &node_count,
            |b, _| {
                b.to_async(&rt).iter(|| async {
                    black_box(lb.check_health().await);
                });
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_round_robin,
    bench_weighted_round_robin,
    bench_least_connections,
    bench_least_response_time,
    bench_ip_hash,
    bench_consistent_hash,
    bench_ring,
    bench_select_release,
    bench_health_cycle,
);
criterion_main!(benches);
