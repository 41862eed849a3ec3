//! Cache maintenance across silos.

use std::time::Duration;

use moonpool_directory::{CacheConfig, DirectoryConfig, SiloStatus};

use crate::harness::{activation, init_tracing, silo, Cluster};

const PORTS: [u16; 3] = [4500, 4501, 4502];

/// Adaptive cache whose background maintainer never fires during a test;
/// passes are triggered with `maintain_cache`.
fn adaptive_cluster() -> Cluster {
    let config = DirectoryConfig::builder()
        .cache(CacheConfig::Adaptive {
            max_size: 1_000,
            initial_ttl: Duration::from_secs(30),
            max_ttl: Duration::from_secs(240),
            ttl_extension_factor: 2.0,
            maintenance_interval: Duration::from_secs(3_600),
        })
        .build()
        .expect("config");
    Cluster::new(&PORTS, config)
}

fn lru_cluster() -> Cluster {
    let config = DirectoryConfig::builder()
        .cache(CacheConfig::lru(100))
        .build()
        .expect("config");
    Cluster::new(&PORTS, config)
}

#[tokio::test(start_paused = true)]
async fn test_unchanged_entry_gets_longer_ttl() {
    init_tracing();
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let cluster = adaptive_cluster();
            let a = cluster.node(&silo(4500));
            let owner = cluster.node(&silo(4501));
            let g = cluster.grain_owned_by(owner.local(), "hot");
            let address = activation(a.local(), &g, 1);
            a.register(address.clone(), true).await.expect("register");

            let adaptive = a.adaptive_cache().expect("adaptive cache");
            assert_eq!(adaptive.ttl_of(&g), Some(Duration::from_secs(30)));

            assert_eq!(a.local_lookup(&g), Some(vec![address.clone()]));
            tokio::time::advance(Duration::from_secs(35)).await;
            a.maintain_cache().await;

            assert_eq!(adaptive.ttl_of(&g), Some(Duration::from_secs(60)));
            assert_eq!(a.local_lookup(&g), Some(vec![address]));
            assert_eq!(a.stats().snapshot().cache_validations_sent, 1);
            assert_eq!(owner.stats().snapshot().cache_validations_received, 1);
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_changed_entry_is_replaced() {
    init_tracing();
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let cluster = adaptive_cluster();
            let a = cluster.node(&silo(4500));
            let owner = cluster.node(&silo(4502));
            let g = cluster.grain_owned_by(owner.local(), "stateless");
            let first = activation(a.local(), &g, 1);
            a.register(first.clone(), false).await.expect("register");

            // Registered at the owner directly: the caller's cache does not
            // know about it.
            let second = activation(owner.local(), &g, 2);
            owner.register(second.clone(), false).await.expect("register");

            assert_eq!(a.local_lookup(&g), Some(vec![first.clone()]));
            tokio::time::advance(Duration::from_secs(35)).await;
            a.maintain_cache().await;

            let cached = a.cache().lookup(&g).expect("still cached");
            assert_eq!(cached.activations, vec![first, second]);
            let current = owner.lookup(&g).await.expect("lookup");
            assert_eq!(Some(cached.version), current.version);
            assert_eq!(
                a.adaptive_cache().and_then(|c| c.ttl_of(&g)),
                Some(Duration::from_secs(30))
            );
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_missing_entry_is_removed() {
    init_tracing();
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let cluster = adaptive_cluster();
            let a = cluster.node(&silo(4500));
            let owner = cluster.node(&silo(4501));
            let g = cluster.grain_owned_by(owner.local(), "gone");
            a.register(activation(a.local(), &g, 1), true)
                .await
                .expect("register");
            owner.delete_grain(&g).await.expect("delete");

            assert!(a.local_lookup(&g).is_some());
            tokio::time::advance(Duration::from_secs(35)).await;
            a.maintain_cache().await;

            assert!(a.cache().lookup(&g).is_none());
            assert_eq!(a.local_lookup(&g), None);
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_unread_expired_entry_is_evicted_without_validation() {
    init_tracing();
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let cluster = adaptive_cluster();
            let a = cluster.node(&silo(4500));
            let g = cluster.grain_owned_by(&silo(4501), "cold");
            a.register(activation(a.local(), &g, 1), true)
                .await
                .expect("register");
            assert_eq!(a.cache().len(), 1);

            tokio::time::advance(Duration::from_secs(35)).await;
            a.maintain_cache().await;

            assert!(a.cache().is_empty());
            assert_eq!(a.stats().snapshot().cache_validations_sent, 0);
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_entry_not_yet_expired_is_left_alone() {
    init_tracing();
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let cluster = adaptive_cluster();
            let a = cluster.node(&silo(4500));
            let g = cluster.grain_owned_by(&silo(4502), "fresh");
            a.register(activation(a.local(), &g, 1), true)
                .await
                .expect("register");

            tokio::time::advance(Duration::from_secs(10)).await;
            a.maintain_cache().await;

            assert!(a.cache().lookup(&g).is_some());
            assert_eq!(a.stats().snapshot().cache_validations_sent, 0);
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_cache_drops_activations_of_dead_silo() {
    init_tracing();
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let cluster = lru_cluster();
            let a = cluster.node(&silo(4500));
            let failed = silo(4502);
            let g = cluster.grain_owned_by(&silo(4501), "remote-host");
            let on_failed = activation(&failed, &g, 1);
            let on_a = activation(a.local(), &g, 2);
            a.register(on_failed.clone(), false).await.expect("register");
            a.register(on_a.clone(), false).await.expect("register");
            assert_eq!(
                a.cache().lookup(&g).map(|c| c.activations),
                Some(vec![on_failed, on_a.clone()])
            );

            cluster.membership.update_status(&failed, SiloStatus::Dead);

            match a.cache().lookup(&g) {
                Some(cached) => assert_eq!(cached.activations, vec![on_a]),
                // Dropped outright if the ring change made this silo the owner.
                None => assert_eq!(cluster.owner_of(&g), *a.local()),
            }
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_lru_cache_has_no_maintenance() {
    init_tracing();
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let cluster = lru_cluster();
            let a = cluster.node(&silo(4500));
            assert!(a.adaptive_cache().is_none());
            let g = cluster.grain_owned_by(&silo(4501), "lru");
            a.register(activation(a.local(), &g, 1), true)
                .await
                .expect("register");

            tokio::time::advance(Duration::from_secs(35)).await;
            a.maintain_cache().await;

            assert!(a.cache().lookup(&g).is_some());
            assert_eq!(a.stats().snapshot().cache_validations_sent, 0);
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_cached_entry_without_viable_activation_is_a_miss() {
    init_tracing();
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let cluster = lru_cluster();
            let a = cluster.node(&silo(4500));
            let g = cluster.grain_owned_by(&silo(4501), "unknown-host");
            a.cache_placement_decision(activation(&silo(4999), &g, 1));
            assert!(a.cache().lookup(&g).is_some());

            assert_eq!(a.local_lookup(&g), None);
            let stats = a.stats().snapshot();
            assert_eq!(stats.cache_lookups, 1);
            assert_eq!(stats.cache_hits, 0);
        })
        .await;
}
