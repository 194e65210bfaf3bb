use criterion::{black_box, criterion_group, criterion_main, Criterion};
use ha_core::cluster::{ClusterCoordinator, Node, NodeRegistry};
use ha_core::config::ClusterConfig;
use ha_core::events::ListenerRegistry;
use ha_core::transport::InMemoryNetwork;
use std::sync::Arc;
use tokio::runtime::Runtime;

pub fn cluster_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("cluster");
    let rt = Runtime::new().unwrap();

    group.bench_function("election", |b| {
        b.iter(|| {
            rt.block_on(async {
                let network = InMemoryNetwork::new();
                let nodes: Vec<_> = (0..5)
                    .map(|i: u16| {
                        let node = Arc::new(ClusterCoordinator::new(
                            Node::new(format!("n{}", i), "127.0.0.1", 7000 + i),
                            ClusterConfig::default(),
                            network.clone(),
                            ListenerRegistry::new(),
                        ));
                        network.attach(&node);
                        node
                    })
                    .collect();
                for (own, node) in nodes.iter().enumerate() {
                    for i in (0..5u16).filter(|i| *i as usize != own) {
                        node.register_node(&format!("n{}", i), "127.0.0.1", 7000 + i);
                    }
                }

                black_box(nodes[0].start_election().await);
            });
        })
    });

    group.finish();
}

fn gossip_merge(c: &mut Criterion) {
    let source = NodeRegistry::new(Node::new("source", "127.0.0.1", 7000));
    for i in 0..100 {
        source.register_node(&format!("n{}", i), "10.0.0.1", 7000 + i);
    }
    let message = source.build_gossip_message(1);

    c.bench_function("gossip_merge_100_nodes", |b| {
        b.iter(|| {
            let registry = NodeRegistry::new(Node::new("sink", "127.0.0.1", 7000));
            black_box(registry.handle_gossip(&message))
        })
    });
}

criterion_group!(benches, cluster_benchmark, gossip_merge);
criterion_main!(benches);
