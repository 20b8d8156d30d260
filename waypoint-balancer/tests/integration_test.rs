//! Integration tests for waypoint-balancer

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use waypoint_balancer::*;
use waypoint_core::{
    HealthStatus, InstanceMetadata, LoadBalancingContext, ServiceEndpoint, ServiceInstance,
};

fn instance(id: &str, weight: u32) -> Arc<ServiceInstance> {
    Arc::new(
        ServiceInstance::new("orders", ServiceEndpoint::new(format!("{}.internal", id), 8080))
            .with_id(id)
            .with_metadata(InstanceMetadata::new().with_weight(weight)),
    )
}

#[test]
fn test_weighted_round_robin_through_balancer() {
    let lb = LoadBalancer::with_strategy(LoadBalancingStrategy::WeightedRoundRobin).unwrap();
    lb.update_instances(vec![instance("a", 1), instance("b", 2), instance("c", 3)]);

    let mut counts: HashMap<String, usize> = HashMap::new();
    for _ in 0..12 {
        let pick = lb.select_instance(None).unwrap();
        lb.record_request(&pick, true, Duration::from_millis(5));
        *counts.entry(pick.instance_id.clone()).or_default() += 1;
    }
    assert_eq!((counts["a"], counts["b"], counts["c"]), (2, 4, 6));
}

#[test]
fn test_consistent_hash_session_affinity() {
    let lb = LoadBalancer::with_strategy(LoadBalancingStrategy::ConsistentHash).unwrap();
    let pool = vec![instance("a", 1), instance("b", 1), instance("c", 1)];
    lb.update_instances(pool.clone());

    let ctx = LoadBalancingContext::new().with_session_id("session-7");
    let owner = lb.select_instance(Some(&ctx)).unwrap().instance_id.clone();

    // Pool refresh with the same members keeps the mapping.
    lb.update_instances(pool.iter().rev().cloned().collect());
    assert_eq!(lb.select_instance(Some(&ctx)).unwrap().instance_id, owner);
}

#[test]
fn test_health_based_with_configured_delegate() {
    let config = LoadBalancerConfig::new(LoadBalancingStrategy::HealthBased)
        .with_health_based_delegate(LoadBalancingStrategy::LeastConnections);
    let lb = LoadBalancer::new(config).unwrap();

    let pool = vec![instance("a", 1), instance("b", 1), instance("c", 1)];
    pool[0].set_health(HealthStatus::Unhealthy);
    lb.update_instances(pool.clone());

    let first = lb.select_instance(None).unwrap();
    let second = lb.select_instance(None).unwrap();
    assert_eq!(first.instance_id, "b");
    assert_eq!(second.instance_id, "c");

    pool[1].set_health(HealthStatus::Unhealthy);
    pool[2].set_health(HealthStatus::Unhealthy);
    assert!(lb.select_instance(None).is_none());
}

#[test]
fn test_adaptive_shifts_traffic_after_degradation() {
    let config = LoadBalancerConfig::new(LoadBalancingStrategy::Adaptive)
        .with_adaptive_window(5)
        .with_adaptive_exploration(0.05);
    let lb = LoadBalancer::new(config).unwrap();
    let pool = vec![instance("a", 1), instance("b", 1)];
    lb.update_instances(pool.clone());

    for _ in 0..30 {
        lb.observe(&pool[0], false, Duration::from_millis(400));
        lb.observe(&pool[1], true, Duration::from_millis(20));
    }
    let to_b = (0..500)
        .filter_map(|_| lb.select_instance(None))
        .filter(|i| i.instance_id == "b")
        .count();
    assert!(to_b > 450, "b picked {} times", to_b);
}

#[test]
fn test_concurrent_selection_and_pool_updates() {
    let lb = Arc::new(LoadBalancer::with_strategy(LoadBalancingStrategy::RoundRobin).unwrap());
    lb.update_instances(vec![instance("a", 1), instance("b", 1)]);

    let workers: Vec<_> = (0..4)
        .map(|n| {
            let lb = Arc::clone(&lb);
            std::thread::spawn(move || {
                for round in 0..200 {
                    if n == 0 && round % 20 == 0 {
                        lb.update_instances(vec![instance("a", 1), instance("b", 1)]);
                    }
                    if let Some(pick) = lb.select_instance(None) {
                        lb.record_request(&pick, true, Duration::from_millis(1));
                    }
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    let stats = lb.stats();
    assert_eq!(stats.total_selections, 800);
    assert_eq!(stats.total_requests, 800);
}

#[test]
fn test_config_from_json() {
    let config: LoadBalancerConfig = serde_json::from_str(
        r#"{"strategy": "weighted_least_connections", "fallback_strategy": "random"}"#,
    )
    .unwrap();
    assert_eq!(config.strategy, LoadBalancingStrategy::WeightedLeastConnections);
    assert_eq!(config.fallback_strategy, Some(LoadBalancingStrategy::Random));
    assert_eq!(config.virtual_nodes, 150);
}
