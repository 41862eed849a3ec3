//! Partition handoff when silos join, stop or fail.

use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

use moonpool_directory::{
    DirectoryConfig, DirectoryError, DirectoryPartition, DirectoryRing, DirectoryStatus, GrainId,
    HandoffChunk, RegistrationStatus, SiloAddress, SiloStatus, VersionSource,
};

use crate::harness::{activation, grain, init_tracing, settle, silo, Cluster, RecordingCatalog};

const PORTS: [u16; 3] = [4500, 4501, 4502];

fn cluster() -> Cluster {
    Cluster::new(&PORTS, DirectoryConfig::default())
}

/// A port whose silo, once joined, owns at least one of `grains`.
fn joining_port(grains: &[GrainId]) -> u16 {
    (4503..5000)
        .find(|port| {
            let joining = silo(*port);
            let mut ring = DirectoryRing::new(joining.clone());
            for p in PORTS.iter().chain(std::iter::once(port)) {
                ring.add(silo(*p));
            }
            grains
                .iter()
                .any(|g| ring.owner(g.uniform_hash(), false).as_ref() == Some(&joining))
        })
        .expect("some port takes over a grain")
}

fn predecessor_of(cluster: &Cluster, silo: &SiloAddress) -> SiloAddress {
    cluster.nodes[0]
        .find_predecessors(silo, 1)
        .and_then(|p| p.into_iter().next())
        .expect("ring has a predecessor")
}

#[tokio::test(start_paused = true)]
async fn test_join_hands_off_range_to_new_silo() {
    init_tracing();
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let mut cluster = cluster();
            let a = cluster.nodes[0].clone();
            let grains: Vec<GrainId> = (0..200).map(|i| grain(&format!("moving-{i}"))).collect();
            let port = joining_port(&grains);
            for (i, g) in grains.iter().enumerate() {
                a.register(activation(a.local(), g, i as u64 + 1), true)
                    .await
                    .expect("register");
            }

            let d = cluster.join(port);
            settle().await;

            let mut moved = 0;
            for g in &grains {
                let owner = cluster.owner_of(g);
                for node in &cluster.nodes {
                    assert_eq!(
                        node.partition_snapshot().contains_key(g),
                        node.local() == &owner,
                        "{g} on {}, owner {owner}",
                        node.local()
                    );
                }
                if owner == *d.local() {
                    moved += 1;
                }
            }
            assert!(moved > 0);

            for node in &cluster.nodes {
                for g in &grains {
                    let found = node.lookup(g).await.expect("lookup");
                    assert_eq!(found.activations.len(), 1);
                }
            }
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_join_handoff_conflict_deletes_pushed_activation() {
    init_tracing();
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let mut cluster = cluster();
            let a = cluster.node(&silo(4500)).clone();
            let b = cluster.node(&silo(4501)).clone();
            let catalog = Rc::new(RecordingCatalog::default());
            b.set_catalog(catalog.clone());

            let grains: Vec<GrainId> = (0..200).map(|i| grain(&format!("contested-{i}"))).collect();
            let d = cluster.start_node(joining_port(&grains));
            let g = grains
                .iter()
                .find(|g| matches!(d.primary_for_grain(g), Ok(Some(owner)) if owner == *d.local()))
                .cloned()
                .expect("joining silo owns a grain");
            let old_owner = cluster.owner_of(&g);
            assert_ne!(old_owner, *d.local());

            let pushed = activation(b.local(), &g, 10);
            b.register(pushed.clone(), true).await.expect("register");
            assert!(cluster.node(&old_owner).partition_snapshot().contains_key(&g));

            // The joining silo already placed its own activation before the
            // old owner hands the range over.
            let kept = activation(a.local(), &g, 20);
            let registered = d
                .register(kept.clone(), true)
                .await
                .expect("register")
                .expect("viable");
            assert_eq!(registered.address, kept);

            cluster.announce(d.local());
            settle().await;

            let found = d.lookup(&g).await.expect("lookup");
            assert_eq!(found.activations, vec![kept]);
            assert_eq!(*catalog.deleted.borrow(), vec![pushed]);
            assert!(!cluster.node(&old_owner).partition_snapshot().contains_key(&g));
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_graceful_stop_then_failure_keeps_entries() {
    init_tracing();
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let cluster = cluster();
            let a = cluster.node(&silo(4500));
            let leaving = silo(4502);
            let g = cluster.grain_owned_by(&leaving, "leaving");
            let address = activation(a.local(), &g, 1);
            a.register(address.clone(), true).await.expect("register");

            let predecessor = predecessor_of(&cluster, &leaving);
            let c = cluster.node(&leaving);
            c.stop().await.expect("stop");
            assert_eq!(c.status(), DirectoryStatus::Stopped);
            assert!(c.partition_snapshot().is_empty());

            let replica = cluster
                .node(&predecessor)
                .handoff()
                .replica_of(&leaving)
                .expect("holder keeps a replica");
            assert!(replica.contains_key(&g));

            cluster.membership.update_status(&leaving, SiloStatus::Dead);
            settle().await;

            let holder = cluster.node(&predecessor);
            assert!(holder.partition_snapshot().contains_key(&g));
            assert!(holder.handoff().replica_of(&leaving).is_none());

            for node in cluster.nodes.iter().filter(|n| *n.local() != leaving) {
                let found = node.lookup(&g).await.expect("lookup");
                assert_eq!(found.activations, vec![address.clone()]);
            }
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_shutting_down_announcement_hands_off_partition() {
    init_tracing();
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let cluster = cluster();
            let a = cluster.node(&silo(4500));
            let leaving = silo(4501);
            let g = cluster.grain_owned_by(&leaving, "announced");
            let address = activation(a.local(), &g, 4);
            a.register(address.clone(), true).await.expect("register");
            let predecessor = predecessor_of(&cluster, &leaving);

            // Peers drop the silo from their rings before its final
            // partition reaches them.
            cluster
                .membership
                .update_status(&leaving, SiloStatus::ShuttingDown);
            settle().await;

            assert_eq!(cluster.node(&leaving).status(), DirectoryStatus::Stopped);
            let holder = cluster.node(&predecessor);
            assert!(holder.partition_snapshot().contains_key(&g));
            let found = holder.lookup(&g).await.expect("lookup");
            assert_eq!(found.activations, vec![address]);
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_stop_fails_while_holder_unreachable() {
    init_tracing();
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let cluster = cluster();
            let leaving = silo(4502);
            let c = cluster.node(&leaving);
            let g = cluster.grain_owned_by(&leaving, "stuck");
            c.register(activation(c.local(), &g, 1), true)
                .await
                .expect("register");

            let predecessor = predecessor_of(&cluster, &leaving);
            assert!(cluster.transport.detach(&predecessor));

            let err = c.stop().await.expect_err("holder is unreachable");
            assert!(matches!(err, DirectoryError::StopPreparationFailed { .. }));
            assert_eq!(c.status(), DirectoryStatus::Stopping);
            assert!(c.partition_snapshot().contains_key(&g));

            cluster
                .transport
                .attach(predecessor.clone(), cluster.node(&predecessor).endpoint());
            c.stop().await.expect("stop after reattach");
            assert_eq!(c.status(), DirectoryStatus::Stopped);
            let replica = cluster
                .node(&predecessor)
                .handoff()
                .replica_of(&leaving)
                .expect("replica");
            assert!(replica.contains_key(&g));
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_merge_conflict_deletes_losing_activation() {
    init_tracing();
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let cluster = cluster();
            let a = cluster.node(&silo(4500));
            let catalog = Rc::new(RecordingCatalog::default());
            a.set_catalog(catalog.clone());

            let g = cluster.grain_owned_by(a.local(), "conflict");
            let registered = activation(a.local(), &g, 5);
            a.register(registered.clone(), true).await.expect("register");

            // Entry for the same grain from a silo that is no longer part of
            // the ring, holding a competing activation.
            let competing = activation(a.local(), &g, 3);
            let mut departed = DirectoryPartition::new(
                cluster.membership.clone(),
                VersionSource::new(1),
                Duration::ZERO,
            );
            departed.add_single_activation(&competing, RegistrationStatus::ClusterLocal, Duration::ZERO);
            let entries: HashMap<_, _> = departed
                .items()
                .into_iter()
                .map(|(grain, info)| (grain, Some(info)))
                .collect();

            cluster
                .transport_directory(a.local())
                .accept_handoff_partition(HandoffChunk {
                    source: silo(4999),
                    entries,
                    full: true,
                })
                .await
                .expect("accept");
            settle().await;

            let found = a.lookup(&g).await.expect("lookup");
            assert_eq!(found.activations, vec![competing]);
            assert_eq!(*catalog.deleted.borrow(), vec![registered]);
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_catalog_told_about_removed_silo() {
    init_tracing();
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let cluster = cluster();
            let a = cluster.node(&silo(4500));
            let catalog = Rc::new(RecordingCatalog::default());
            a.set_catalog(catalog.clone());

            cluster.membership.update_status(&silo(4502), SiloStatus::Dead);
            assert_eq!(
                *catalog.removed_silos.borrow(),
                vec![(silo(4502), SiloStatus::Dead)]
            );
            assert!(!a.is_silo_in_cluster(&silo(4502)));

            // A second notification for a silo already off the ring is ignored.
            cluster.membership.update_status(&silo(4502), SiloStatus::Dead);
            assert_eq!(catalog.removed_silos.borrow().len(), 1);
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_failed_silo_activations_are_dropped() {
    init_tracing();
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let cluster = cluster();
            let a = cluster.node(&silo(4500));
            let failed = silo(4502);
            let g = cluster.grain_owned_by(a.local(), "hosted-on-failed");
            a.register(activation(&failed, &g, 1), true)
                .await
                .expect("register");
            assert!(a.partition_snapshot().contains_key(&g));

            cluster.membership.update_status(&failed, SiloStatus::Dead);
            assert!(!a.partition_snapshot().contains_key(&g));
            assert!(a.lookup(&g).await.expect("lookup").is_empty());
        })
        .await;
}
