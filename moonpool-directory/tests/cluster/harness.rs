//! In-process cluster of directories for multi-node tests.

use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Duration;

use moonpool_directory::{
    ActivationAddress, ActivationCatalog, ActivationId, DirectoryConfig, DirectoryTransport, GrainId,
    GrainType, LocalDirectory, LoopbackTransport, RemoteGrainDirectory, SharedMembership,
    SiloAddress, SiloStatus, TokioProviders,
};

pub type Directory = LocalDirectory<TokioProviders>;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

pub fn silo(port: u16) -> SiloAddress {
    SiloAddress::new(SocketAddr::from(([127, 0, 0, 1], port)), 1)
}

pub fn grain(key: &str) -> GrainId {
    GrainId::new(GrainType(1), key)
}

pub fn activation(host: &SiloAddress, grain: &GrainId, id: u64) -> ActivationAddress {
    ActivationAddress::new(host.clone(), grain.clone(), ActivationId::new(id))
}

/// Let spawned handoff tasks and retry delays run to completion.
///
/// Tests run with paused time, so the sleep returns as soon as every task
/// is idle.
pub async fn settle() {
    tokio::time::sleep(Duration::from_secs(2)).await;
}

/// Records what the directory asks of the activation catalog.
#[derive(Default)]
pub struct RecordingCatalog {
    pub deleted: RefCell<Vec<ActivationAddress>>,
    pub removed_silos: RefCell<Vec<(SiloAddress, SiloStatus)>>,
}

impl ActivationCatalog for RecordingCatalog {
    fn delete_activations(&self, activations: Vec<ActivationAddress>) {
        self.deleted.borrow_mut().extend(activations);
    }

    fn silo_removed(&self, silo: &SiloAddress, status: SiloStatus) {
        self.removed_silos.borrow_mut().push((silo.clone(), status));
    }
}

pub struct Cluster {
    pub membership: Rc<SharedMembership>,
    pub transport: Rc<LoopbackTransport>,
    pub nodes: Vec<Directory>,
    config: DirectoryConfig,
}

impl Cluster {
    /// Start one directory per port, all active from the beginning.
    pub fn new(ports: &[u16], config: DirectoryConfig) -> Self {
        let silos: Vec<_> = ports.iter().map(|port| silo(*port)).collect();
        let membership = Rc::new(SharedMembership::with_members(silos.clone()));
        let transport = Rc::new(LoopbackTransport::new());
        let mut cluster = Self {
            membership,
            transport,
            nodes: Vec::new(),
            config,
        };
        for silo in silos {
            let directory = cluster.build(silo);
            directory.start();
            cluster.nodes.push(directory);
        }
        cluster
    }

    fn build(&self, silo: SiloAddress) -> Directory {
        let directory = LocalDirectory::new(
            silo.clone(),
            self.config.clone(),
            TokioProviders::new(),
            self.membership.clone(),
            self.transport.clone(),
        );
        self.transport.attach(silo, directory.endpoint());
        directory
    }

    /// Start a new directory, then announce it as active.
    pub fn join(&mut self, port: u16) -> Directory {
        let directory = self.start_node(port);
        self.announce(directory.local());
        directory
    }

    /// Start a new directory that the rest of the cluster does not know
    /// about yet.
    pub fn start_node(&mut self, port: u16) -> Directory {
        let directory = self.build(silo(port));
        directory.start();
        self.nodes.push(directory.clone());
        directory
    }

    pub fn announce(&self, silo: &SiloAddress) {
        self.membership.register_node(silo.clone(), SiloStatus::Active);
    }

    pub fn node(&self, silo: &SiloAddress) -> &Directory {
        self.nodes
            .iter()
            .find(|node| node.local() == silo)
            .expect("node is part of the cluster")
    }

    /// The endpoint other silos use to reach `silo`.
    pub fn transport_directory(&self, silo: &SiloAddress) -> Rc<dyn RemoteGrainDirectory> {
        self.transport.directory(silo).expect("silo is attached")
    }

    pub fn owner_of(&self, grain: &GrainId) -> SiloAddress {
        self.nodes[0]
            .primary_for_grain(grain)
            .expect("owner")
            .expect("non-empty ring")
    }

    /// First generated grain owned by `owner`.
    pub fn grain_owned_by(&self, owner: &SiloAddress, prefix: &str) -> GrainId {
        (0..10_000)
            .map(|i| grain(&format!("{prefix}-{i}")))
            .find(|candidate| self.owner_of(candidate) == *owner)
            .expect("some grain hashes to every silo")
    }
}
