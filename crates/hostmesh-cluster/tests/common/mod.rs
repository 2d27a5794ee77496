//! Helpers for tests that run real meshes on the loopback interface

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use hostmesh_cluster::{
    CoordinateStore, HostMessenger, InMemoryCoordinateStore, RecordingFatalHandler,
    RecordingFaultSink,
};
use hostmesh_core::MeshConfig;

pub const JOIN_WAIT: Duration = Duration::from_secs(10);

pub struct TestNode {
    pub messenger: Arc<HostMessenger>,
    pub faults: Arc<RecordingFaultSink>,
    pub fatal: Arc<RecordingFatalHandler>,
}

/// A port that was free a moment ago
pub fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

pub fn node_config(leader_port: u16, name: &str) -> MeshConfig {
    let mut config = MeshConfig::default();
    config.node.display_name = Some(name.to_string());
    config.node.internal_interface = "127.0.0.1".to_string();
    config.node.internal_port = 0;
    config.mesh.coordinators = vec![format!("127.0.0.1:{}", leader_port)];
    config.mesh.join_timeout_secs = 30;
    config.mesh.probe_interval_ms = 50;
    config.mesh.retry_base_ms = 100;
    config.mesh.retry_cap_ms = 1_000;
    config.failure.heartbeat_interval_ms = 100;
    config
}

pub async fn start_node(config: MeshConfig, store: Arc<dyn CoordinateStore>) -> TestNode {
    let faults = Arc::new(RecordingFaultSink::new());
    let fatal = Arc::new(RecordingFatalHandler::new());
    let messenger = HostMessenger::builder(config)
        .fault_sink(faults.clone())
        .fatal_handler(fatal.clone())
        .coordinate_store(store)
        .build()
        .unwrap();
    messenger.start().await.unwrap();
    TestNode {
        messenger,
        faults,
        fatal,
    }
}

/// Start `count` hosts, the first one leading, and wait for the full mesh
pub async fn start_mesh_with(
    count: usize,
    configure: impl Fn(usize, &mut MeshConfig),
) -> Vec<TestNode> {
    let leader_port = free_port();
    let store: Arc<dyn CoordinateStore> = Arc::new(InMemoryCoordinateStore::new());
    let mut nodes = Vec::with_capacity(count);
    for index in 0..count {
        let mut config = node_config(leader_port, &format!("node-{}", index));
        configure(index, &mut config);
        nodes.push(start_node(config, store.clone()).await);
    }
    for node in &nodes {
        node.messenger
            .wait_for_group_join(count, JOIN_WAIT)
            .await
            .unwrap();
    }
    nodes
}

pub async fn start_mesh(count: usize) -> Vec<TestNode> {
    start_mesh_with(count, |_, _| {}).await
}

/// Poll `condition` until it holds or `timeout` passes
pub async fn eventually(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}

pub fn shutdown_all(nodes: &[TestNode]) {
    for node in nodes {
        node.messenger.shutdown();
    }
}
