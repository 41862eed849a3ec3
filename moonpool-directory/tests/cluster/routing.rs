//! Ownership, forwarding and the hop limit.

use std::rc::Rc;
use std::time::Duration;

use moonpool_directory::{
    DirectoryConfig, DirectoryError, LocalDirectory, SharedMembership, TokioProviders,
    UnregistrationCause,
};

use crate::harness::{activation, grain, init_tracing, silo, Cluster};

const PORTS: [u16; 3] = [4500, 4501, 4502];

fn cluster() -> Cluster {
    Cluster::new(&PORTS, DirectoryConfig::default())
}

#[tokio::test(start_paused = true)]
async fn test_every_node_agrees_on_owner() {
    init_tracing();
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let cluster = cluster();
            for i in 0..200 {
                let g = grain(&format!("user-{i}"));
                let owners: Vec<_> = cluster
                    .nodes
                    .iter()
                    .map(|node| node.primary_for_grain(&g).expect("owner"))
                    .collect();
                assert!(owners.iter().all(|owner| *owner == owners[0]));
                assert!(owners[0].is_some());
            }
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_register_is_forwarded_and_cached() {
    init_tracing();
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let cluster = cluster();
            let a = cluster.node(&silo(4500));
            let owner = silo(4501);
            let g = cluster.grain_owned_by(&owner, "forwarded");
            let address = activation(a.local(), &g, 1);

            let registered = a
                .register(address.clone(), true)
                .await
                .expect("register")
                .expect("viable host");
            assert_eq!(registered.address, address);

            let owner_partition = cluster.node(&owner).partition_snapshot();
            assert!(owner_partition.contains_key(&g));
            assert!(!a.partition_snapshot().contains_key(&g));

            let cached = a.cache().lookup(&g).expect("cached on the caller");
            assert_eq!(cached.activations, vec![address.clone()]);
            assert_eq!(cached.version, registered.version);
            assert_eq!(a.local_lookup(&g), Some(vec![address]));

            let stats = a.stats().snapshot();
            assert_eq!(stats.remote_registrations, 1);
            assert_eq!(stats.forwards, 1);
            assert_eq!(cluster.node(&owner).stats().snapshot().local_registrations, 1);
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_single_activation_race_has_one_winner() {
    init_tracing();
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let cluster = cluster();
            let x = cluster.node(&silo(4500));
            let y = cluster.node(&silo(4501));
            let g = cluster.grain_owned_by(&silo(4502), "race");

            let (from_x, from_y) = futures::join!(
                x.register(activation(x.local(), &g, 1), true),
                y.register(activation(y.local(), &g, 2), true),
            );
            let from_x = from_x.expect("register").expect("viable");
            let from_y = from_y.expect("register").expect("viable");
            assert_eq!(from_x.address, from_y.address);

            let found = cluster
                .node(&silo(4502))
                .lookup(&g)
                .await
                .expect("lookup");
            assert_eq!(found.activations, vec![from_x.address]);
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_refused_multi_registration_is_not_cached() {
    init_tracing();
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let cluster = cluster();
            let a = cluster.node(&silo(4500));
            let owner = cluster.node(&silo(4502));
            let g = cluster.grain_owned_by(owner.local(), "single");
            let first = activation(owner.local(), &g, 1);
            owner.register(first.clone(), true).await.expect("register");

            let registered = a
                .register(activation(a.local(), &g, 2), false)
                .await
                .expect("register")
                .expect("viable");
            assert_eq!(registered.address, first);
            assert!(a.cache().lookup(&g).is_none());

            let found = owner.lookup(&g).await.expect("lookup");
            assert_eq!(found.activations, vec![first]);
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_lookup_miss_then_forwarded_lookup_fills_cache() {
    init_tracing();
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let cluster = cluster();
            let owner = cluster.node(&silo(4501));
            let a = cluster.node(&silo(4500));
            let g = cluster.grain_owned_by(owner.local(), "heal");
            let address = activation(owner.local(), &g, 7);
            owner.register(address.clone(), false).await.expect("register");

            assert_eq!(a.local_lookup(&g), None);
            let found = a.lookup(&g).await.expect("lookup");
            assert_eq!(found.activations, vec![address.clone()]);
            assert_eq!(a.local_lookup(&g), Some(vec![address]));

            let stats = a.stats().snapshot();
            assert_eq!(stats.full_lookups, 1);
            assert_eq!(stats.cache_lookups, 2);
            assert_eq!(stats.cache_hits, 1);
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_forwarded_request_reaches_owner() {
    init_tracing();
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let cluster = cluster();
            let g = cluster.grain_owned_by(&silo(4502), "misrouted");
            let address = activation(&silo(4500), &g, 3);

            // A forwarded request landing on a non-owner is forwarded again.
            let b = cluster.transport_directory(&silo(4501));
            let registered = b
                .register(address.clone(), true, 1)
                .await
                .expect("register")
                .expect("viable");
            assert_eq!(registered.address, address);
            assert!(cluster
                .node(&silo(4502))
                .partition_snapshot()
                .contains_key(&g));
            assert_eq!(cluster.node(&silo(4501)).stats().snapshot().forwards, 1);
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_hop_limit_stops_forwarding() {
    init_tracing();
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let cluster = cluster();
            let g = cluster.grain_owned_by(&silo(4502), "looping");
            let hop_limit = DirectoryConfig::default().hop_limit();

            let b = cluster.transport_directory(&silo(4501));
            let result = b.lookup(g.clone(), hop_limit).await;
            match result {
                Err(DirectoryError::HopLimitExceeded {
                    grain,
                    owner,
                    hop_count,
                }) => {
                    assert_eq!(grain, g);
                    assert_eq!(owner, silo(4502));
                    assert_eq!(hop_count, hop_limit);
                }
                other => panic!("expected HopLimitExceeded, got {other:?}"),
            }
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_remote_unregister_respects_grace_window() {
    init_tracing();
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let config = DirectoryConfig::builder()
                .lazy_deregistration_delay(Duration::from_secs(30))
                .build()
                .expect("config");
            let cluster = Cluster::new(&PORTS, config);
            let a = cluster.node(&silo(4500));
            let owner = cluster.node(&silo(4501));
            let g = cluster.grain_owned_by(owner.local(), "grace");
            let address = activation(a.local(), &g, 11);
            a.register(address.clone(), true).await.expect("register");

            tokio::time::advance(Duration::from_secs(1)).await;
            a.unregister(address.clone(), UnregistrationCause::NonexistentActivation)
                .await
                .expect("unregister");
            assert!(owner.partition_snapshot().contains_key(&g));
            // The caller's cache entry is dropped even though the owner kept it.
            assert!(a.cache().lookup(&g).is_none());

            tokio::time::advance(Duration::from_secs(30)).await;
            a.unregister(address.clone(), UnregistrationCause::NonexistentActivation)
                .await
                .expect("unregister");
            assert!(!owner.partition_snapshot().contains_key(&g));
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_force_unregister_is_immediate_across_silos() {
    init_tracing();
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let cluster = cluster();
            let a = cluster.node(&silo(4500));
            let owner = cluster.node(&silo(4502));
            let g = cluster.grain_owned_by(owner.local(), "force");
            let address = activation(a.local(), &g, 12);
            a.register(address.clone(), true).await.expect("register");

            a.unregister(address, UnregistrationCause::Force)
                .await
                .expect("unregister");
            assert!(owner.lookup(&g).await.expect("lookup").is_empty());
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_unregister_many_spans_owners() {
    init_tracing();
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let cluster = cluster();
            let a = cluster.node(&silo(4500));
            let mut addresses = Vec::new();
            for (i, port) in PORTS.iter().enumerate() {
                let g = cluster.grain_owned_by(&silo(*port), &format!("batch{i}"));
                let address = activation(a.local(), &g, i as u64 + 1);
                a.register(address.clone(), false).await.expect("register");
                addresses.push(address);
            }

            a.unregister_many(addresses.clone(), UnregistrationCause::Force)
                .await
                .expect("unregister many");
            for address in &addresses {
                let found = a.lookup(&address.grain).await.expect("lookup");
                assert!(found.is_empty(), "{} still registered", address.grain);
            }
            let stats = a.stats().snapshot();
            assert_eq!(stats.local_unregistrations, 1);
            assert_eq!(stats.remote_unregistrations, 2);
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_delete_grain_clears_owner_and_cache() {
    init_tracing();
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let cluster = cluster();
            let a = cluster.node(&silo(4500));
            let owner = cluster.node(&silo(4501));
            let g = cluster.grain_owned_by(owner.local(), "delete");
            a.register(activation(a.local(), &g, 1), false)
                .await
                .expect("register");
            assert!(a.cache().lookup(&g).is_some());

            a.delete_grain(&g).await.expect("delete");
            assert!(a.cache().lookup(&g).is_none());
            assert!(!owner.partition_snapshot().contains_key(&g));
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_multi_activation_registrations_accumulate_in_cache() {
    init_tracing();
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let cluster = cluster();
            let a = cluster.node(&silo(4500));
            let g = cluster.grain_owned_by(&silo(4502), "stateless");
            let first = activation(a.local(), &g, 1);
            let second = activation(a.local(), &g, 2);
            a.register(first.clone(), false).await.expect("register");
            let last = a
                .register(second.clone(), false)
                .await
                .expect("register")
                .expect("viable");

            let cached = a.cache().lookup(&g).expect("cached");
            assert_eq!(cached.activations, vec![first, second]);
            assert_eq!(cached.version, last.version);
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_nonexistent_activation_from_other_cluster_is_routed_to_origin() {
    init_tracing();
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let cluster = cluster();

            // A one-silo cluster with its own membership, reachable over the
            // same transport.
            let foreign = silo(5999);
            let foreign_membership = Rc::new(SharedMembership::with_members(vec![foreign.clone()]));
            let config = DirectoryConfig::builder()
                .lazy_deregistration_delay(Duration::ZERO)
                .build()
                .expect("config");
            let foreign_directory = LocalDirectory::new(
                foreign.clone(),
                config,
                TokioProviders::new(),
                foreign_membership,
                cluster.transport.clone(),
            );
            cluster
                .transport
                .attach(foreign.clone(), foreign_directory.endpoint());
            foreign_directory.start();

            let g = grain("visitor");
            let address = activation(&foreign, &g, 1);
            foreign_directory
                .register(address.clone(), true)
                .await
                .expect("register");

            cluster.nodes[0]
                .unregister_after_nonexistent_activation(address, Some(foreign))
                .await
                .expect("routed unregister");
            assert!(foreign_directory.partition_snapshot().is_empty());
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_stopping_silo_is_skipped_for_new_registrations() {
    init_tracing();
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let cluster = cluster();
            let b = cluster.node(&silo(4501));
            let g = cluster.grain_owned_by(b.local(), "skip");
            b.stop().await.expect("stop");

            // B no longer considers itself the owner and forwards instead.
            let owner = b.primary_for_grain(&g).expect("owner").expect("other silo");
            assert_ne!(owner, silo(4501));
        })
        .await;
}
