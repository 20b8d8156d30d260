//! Integration tests for waypoint-discovery

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use waypoint_balancer::{LoadBalancerConfig, LoadBalancingStrategy};
use waypoint_breaker::{CircuitBreakerConfig, CircuitState};
use waypoint_core::{
    HealthStatus, InstanceMetadata, LoadBalancingContext, ServiceEndpoint, ServiceInstance,
    ServiceQuery,
};
use waypoint_discovery::*;

fn instance(id: &str, port: u16) -> ServiceInstance {
    ServiceInstance::new("orders", ServiceEndpoint::new("10.0.0.1", port)).with_id(id)
}

async fn registry_with(count: u16) -> InMemoryRegistry {
    let registry = InMemoryRegistry::new();
    for n in 0..count {
        registry.register(instance(&format!("i-{}", n), 8000 + n)).await;
    }
    registry
}

#[tokio::test]
async fn test_health_change_hides_cached_instance() {
    let registry = registry_with(3).await;
    let resolver = ResolutionCoordinator::builder(Arc::new(registry.clone()))
        .load_balancer(LoadBalancerConfig::new(LoadBalancingStrategy::RoundRobin))
        .build()
        .unwrap();
    let query = ServiceQuery::new("orders");

    resolver.discover(&query).await.unwrap();
    registry.set_health("i-1", HealthStatus::Unhealthy).await.unwrap();

    for _ in 0..6 {
        let pick = resolver.resolve(&query, None).await.unwrap().unwrap();
        assert_ne!(pick.instance_id, "i-1");
        resolver.record_outcome(&pick, true, Duration::from_millis(3));
    }
    assert_eq!(registry.call_count(), 1);
}

#[tokio::test]
async fn test_session_affinity_through_resolver() {
    let registry = registry_with(4).await;
    let resolver = ResolutionCoordinator::builder(Arc::new(registry.clone()))
        .load_balancer(LoadBalancerConfig::new(LoadBalancingStrategy::ConsistentHash))
        .build()
        .unwrap();
    let query = ServiceQuery::new("orders");

    for session in ["alice", "bob", "carol"] {
        let ctx = LoadBalancingContext::new().with_session_id(session);
        let first = resolver.resolve(&query, Some(&ctx)).await.unwrap().unwrap();
        for _ in 0..5 {
            let again = resolver.resolve(&query, Some(&ctx)).await.unwrap().unwrap();
            assert_eq!(again.instance_id, first.instance_id);
        }
    }

    // Sticky strategies need a key; without one there is no fallback.
    assert!(resolver.resolve(&query, None).await.unwrap().is_none());
}

#[tokio::test]
async fn test_fallback_strategy_without_context() {
    let registry = registry_with(2).await;
    let resolver = ResolutionCoordinator::builder(Arc::new(registry.clone()))
        .load_balancer(
            LoadBalancerConfig::new(LoadBalancingStrategy::IpHash)
                .with_fallback(LoadBalancingStrategy::RoundRobin),
        )
        .build()
        .unwrap();

    let pick = resolver.resolve(&ServiceQuery::new("orders"), None).await.unwrap();
    assert!(pick.is_some());

    let stats = resolver.get_stats();
    let balancer = stats.load_balancers.values().next().unwrap();
    assert_eq!(balancer.fallback_selections, 1);
}

#[tokio::test]
async fn test_queries_get_their_own_balancers() {
    let registry = InMemoryRegistry::new();
    registry
        .register(
            instance("canary", 9000)
                .with_metadata(InstanceMetadata::new().with_version("2.0").with_tag("canary")),
        )
        .await;
    registry
        .register(instance("stable", 9001).with_metadata(InstanceMetadata::new().with_version("1.0")))
        .await;
    let resolver = ResolutionCoordinator::new(Arc::new(registry.clone())).unwrap();

    let canary = ServiceQuery::new("orders").with_tag("canary");
    let stable = ServiceQuery::new("orders").with_version("1.0");
    assert_eq!(
        resolver.resolve(&canary, None).await.unwrap().unwrap().instance_id,
        "canary"
    );
    assert_eq!(
        resolver.resolve(&stable, None).await.unwrap().unwrap().instance_id,
        "stable"
    );

    let stats = resolver.get_stats();
    assert_eq!(stats.load_balancers.len(), 2);
    assert_eq!(stats.cache.size, 2);
    assert_eq!(stats.coordinator.resolutions, 2);
}

#[tokio::test(start_paused = true)]
async fn test_registry_breaker_recovers() {
    let registry = registry_with(1).await;
    registry.set_unavailable(true);
    let resolver = ResolutionCoordinator::builder(Arc::new(registry.clone()))
        .circuit_breaker(
            CircuitBreakerConfig::default()
                .failure_threshold(3)
                .recovery_timeout(Duration::from_secs(1))
                .exponential_backoff(false),
        )
        .build()
        .unwrap();
    let query = ServiceQuery::new("orders");

    for _ in 0..3 {
        assert!(resolver.resolve(&query, None).await.is_err());
    }
    assert!(resolver.resolve(&query, None).await.unwrap_err().is_circuit_open());
    assert_eq!(registry.call_count(), 3);

    registry.set_unavailable(false);
    tokio::time::advance(Duration::from_millis(1001)).await;

    let pick = resolver.resolve(&query, None).await.unwrap();
    assert_eq!(pick.unwrap().instance_id, "i-0");
    let breaker = resolver.breakers().get("registry:orders").unwrap();
    assert_eq!(breaker.state(), CircuitState::HalfOpen);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_resolution() {
    let registry = registry_with(5).await;
    let resolver = Arc::new(
        ResolutionCoordinator::builder(Arc::new(registry.clone()))
            .load_balancer(LoadBalancerConfig::new(LoadBalancingStrategy::RoundRobin))
            .build()
            .unwrap(),
    );

    let mut handles = Vec::new();
    for _ in 0..8 {
        let resolver = Arc::clone(&resolver);
        handles.push(tokio::spawn(async move {
            let query = ServiceQuery::new("orders");
            let mut seen = HashSet::new();
            for _ in 0..50 {
                let pick = resolver.resolve(&query, None).await.unwrap().unwrap();
                seen.insert(pick.instance_id.clone());
                tokio::task::yield_now().await;
                resolver.record_outcome(&pick, true, Duration::from_millis(2));
            }
            seen
        }));
    }

    let mut seen = HashSet::new();
    for handle in handles {
        seen.extend(handle.await.unwrap());
    }
    assert_eq!(seen.len(), 5);

    let stats = resolver.get_stats();
    assert_eq!(stats.coordinator.resolutions, 400);
    let balancer = stats.load_balancers.values().next().unwrap();
    assert_eq!(balancer.total_requests, 400);
    assert!(balancer.instances.iter().all(|i| i.active_connections == 0));
}

#[tokio::test]
async fn test_resolver_from_config_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("resolver.toml");
    std::fs::write(
        &path,
        r#"
        instance_breakers_enabled = false

        [cache]
        strategy = "ttl"
        ttl = 60000

        [load_balancer]
        strategy = "weighted_round_robin"
        "#,
    )
    .unwrap();
    let config = ConfigLoader::load(&path).unwrap();

    let registry = InMemoryRegistry::new();
    registry
        .register(instance("big", 1).with_metadata(InstanceMetadata::new().with_weight(3)))
        .await;
    registry.register(instance("small", 2)).await;

    let resolver = ResolutionCoordinator::builder(Arc::new(registry.clone()))
        .config(config)
        .build()
        .unwrap();
    let query = ServiceQuery::new("orders");

    let mut big = 0;
    for _ in 0..8 {
        let pick = resolver.resolve(&query, None).await.unwrap().unwrap();
        if pick.instance_id == "big" {
            big += 1;
        }
        resolver.record_outcome(&pick, false, Duration::from_millis(1));
    }
    assert_eq!(big, 6);
    assert!(resolver.breakers().get("orders:big").is_none());
    assert!(resolver.breakers().get("registry:orders").is_some());
}
