//! Node registry: idempotent join, load-driven status, liveness sweep and
//! manual decommission.


use render_farm::error::FarmError;
use render_farm::scheduler::{Heartbeat, NodeStatus};
use test_harness::{TestFarm, HEARTBEAT_TIMEOUT_MS};

#[test]
fn test_unknown_node_joins_on_first_heartbeat() {
    let farm = TestFarm::new();

    let ack = farm.nodes.heartbeat(
        Heartbeat::new("node-a")
            .with_capabilities(["blender", "gpu"])
            .with_load(0.25),
    );
    assert!(ack.joined);
    assert_eq!(ack.status, NodeStatus::Online);

    let again = farm.nodes.heartbeat(Heartbeat::new("node-a"));
    assert!(!again.joined);
    assert_eq!(farm.nodes.len(), 1);

    let node = farm.nodes.get("node-a").unwrap();
    assert_eq!(node.load, 0.0);
}

#[test]
fn test_capabilities_kept_unless_resent() {
    let farm = TestFarm::new();
    farm.nodes
        .heartbeat(Heartbeat::new("node-a").with_capabilities(["blender", "gpu"]));

    farm.nodes.heartbeat(Heartbeat::new("node-a"));
    let node = farm.nodes.get("node-a").unwrap();
    assert_eq!(node.capabilities.len(), 2);
    assert!(node.capabilities.contains("gpu"));

    farm.nodes
        .heartbeat(Heartbeat::new("node-a").with_capabilities(Vec::<String>::new()));
    assert!(farm.nodes.get("node-a").unwrap().capabilities.is_empty());
}

#[test]
fn test_reported_load_drives_busy_status() {
    let farm = TestFarm::new();

    let ack = farm.nodes.heartbeat(Heartbeat::new("node-a").with_load(1.0));
    assert_eq!(ack.status, NodeStatus::Busy);
    assert_eq!(farm.nodes.get("node-a").unwrap().status, NodeStatus::Busy);

    let ack = farm.nodes.heartbeat(Heartbeat::new("node-a").with_load(0.4));
    assert_eq!(ack.status, NodeStatus::Online);
}

#[test]
fn test_heartbeat_keeps_address_and_info_when_omitted() {
    let farm = TestFarm::new();

    let mut hb = Heartbeat::new("node-a");
    hb.address = "10.0.0.7:9000".to_string();
    hb.info.insert("gpu".to_string(), serde_json::json!("RTX 4090"));
    farm.nodes.heartbeat(hb);
    farm.nodes.heartbeat(Heartbeat::new("node-a"));

    let node = farm.nodes.get("node-a").unwrap();
    assert_eq!(node.address, "10.0.0.7:9000");
    assert_eq!(node.info["gpu"], "RTX 4090");
}

#[test]
fn test_missed_heartbeats_mark_node_offline_but_keep_it() {
    let farm = TestFarm::new();
    farm.heartbeat("node-a", &[]);
    farm.heartbeat("node-b", &[]);

    farm.advance_ms(HEARTBEAT_TIMEOUT_MS / 2);
    farm.heartbeat("node-b", &[]);
    farm.advance_ms(HEARTBEAT_TIMEOUT_MS / 2 + 1);

    let nodes = farm.nodes.list();
    assert_eq!(nodes.len(), 2);
    assert_eq!(nodes[0].id, "node-a");
    assert_eq!(nodes[0].status, NodeStatus::Offline);
    assert_eq!(nodes[1].status, NodeStatus::Online);
    assert!(!farm.nodes.is_eligible("node-a"));
    assert!(farm.nodes.is_eligible("node-b"));
}

#[test]
fn test_sweep_reports_each_node_once() {
    let farm = TestFarm::new();
    farm.heartbeat("node-a", &[]);
    farm.advance_ms(HEARTBEAT_TIMEOUT_MS + 1);

    assert_eq!(farm.nodes.sweep(), vec!["node-a".to_string()]);
    assert!(farm.nodes.sweep().is_empty());
}

#[test]
fn test_heartbeat_brings_offline_node_back() {
    let farm = TestFarm::new();
    farm.heartbeat("node-a", &[]);
    farm.advance_ms(HEARTBEAT_TIMEOUT_MS + 1);
    farm.nodes.sweep();

    farm.heartbeat("node-a", &[]);
    assert_eq!(farm.nodes.get("node-a").unwrap().status, NodeStatus::Online);
    assert!(farm.nodes.is_eligible("node-a"));
}

#[test]
fn test_mark_offline_and_decommission() {
    let farm = TestFarm::new();
    farm.heartbeat("node-a", &[]);

    farm.nodes.mark_offline("node-a").unwrap();
    assert_eq!(farm.nodes.get("node-a").unwrap().status, NodeStatus::Offline);
    assert!(!farm.nodes.is_eligible("node-a"));

    let removed = farm.nodes.decommission("node-a").unwrap();
    assert_eq!(removed.id, "node-a");
    assert!(farm.nodes.is_empty());

    assert_eq!(
        farm.nodes.mark_offline("node-a"),
        Err(FarmError::NodeNotFound("node-a".to_string()))
    );
    assert!(matches!(
        farm.nodes.decommission("node-a"),
        Err(FarmError::NodeNotFound(_))
    ));
}

#[test]
fn test_unknown_node_is_not_eligible() {
    let farm = TestFarm::new();
    assert!(!farm.nodes.is_eligible("ghost"));
    assert!(farm.nodes.list().is_empty());
}
