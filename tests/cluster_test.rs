//! End-to-end tests for the transfer fabric.
//!
//! Each test stands up a real coordinator, agents and clients over loopback
//! sockets and drives the public client API.

use std::time::{Duration, Instant};

use tokio::net::TcpStream;

use varys::agent::{Agent, AgentConfig, RunningAgent};
use varys::client::{ClientConfig, VarysClient};
use varys::coordinator::{Coordinator, CoordinatorConfig, CoordinatorHandle, FixedRatePolicy, IdentityPolicy, RatePolicy};
use varys::model::CoflowDescription;
use varys::proto::messages::{Heartbeat, RegisterSlave, RequestBestMachines};
use varys::proto::{ControlMessage, wire};
use varys::{CoflowState, Error};

const HOST: &str = "127.0.0.1";

async fn start_coordinator(config: CoordinatorConfig, policy: Box<dyn RatePolicy>) -> (String, CoordinatorHandle) {
    let coordinator = Coordinator::new(config, policy);
    let handle = coordinator.handle();
    let listener = tokio::net::TcpListener::bind((HOST, 0)).await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(coordinator.run(listener));
    (format!("varys://{HOST}:{port}"), handle)
}

async fn start_agent(master_url: &str, slave_id: &str) -> RunningAgent {
    let mut config = AgentConfig::new(master_url, HOST);
    config.slave_id = slave_id.to_string();
    config.heartbeat_ms = 200;
    config.work_dir = std::env::temp_dir().join("varys-cluster-test");
    Agent::start(config).await.expect("agent should start")
}

async fn start_client(master_url: &str, name: &str) -> VarysClient {
    let client = VarysClient::start(ClientConfig::new(master_url, name, HOST));
    client.wait_for_registration().await.expect("registration should succeed");
    client
}

/// A default single-host cluster: coordinator plus one agent.
async fn start_cluster() -> (String, CoordinatorHandle, RunningAgent) {
    let (master_url, handle) = start_coordinator(CoordinatorConfig::default(), Box::new(IdentityPolicy)).await;
    let agent = start_agent(&master_url, "s1").await;
    (master_url, handle, agent)
}

/// Publication is asynchronous (client, agent and coordinator relay); gets
/// poll until the flow becomes visible.
async fn get_fake_eventually(client: &VarysClient, flow_id: &str, coflow_id: &str) -> Vec<u8> {
    for _ in 0..100 {
        match client.get_fake(flow_id, coflow_id).await {
            Ok(bytes) => return bytes,
            Err(Error::NotFound { .. }) => tokio::time::sleep(Duration::from_millis(50)).await,
            Err(e) => panic!("get_fake failed: {e}"),
        }
    }
    panic!("flow {coflow_id}/{flow_id} never appeared");
}

async fn get_object_eventually(client: &VarysClient, flow_id: &str, coflow_id: &str) -> Vec<u8> {
    for _ in 0..100 {
        match client.get_object::<Vec<u8>>(flow_id, coflow_id).await {
            Ok(value) => return value,
            Err(Error::NotFound { .. }) => tokio::time::sleep(Duration::from_millis(50)).await,
            Err(e) => panic!("get_object failed: {e}"),
        }
    }
    panic!("flow {coflow_id}/{flow_id} never appeared");
}

async fn get_file_eventually(client: &VarysClient, flow_id: &str, coflow_id: &str) -> Vec<u8> {
    for _ in 0..100 {
        match client.get_file(flow_id, coflow_id).await {
            Ok(bytes) => return bytes,
            Err(Error::NotFound { .. }) => tokio::time::sleep(Duration::from_millis(50)).await,
            Err(e) => panic!("get_file failed: {e}"),
        }
    }
    panic!("flow {coflow_id}/{flow_id} never appeared");
}

// =============================================================================
// Round trips
// =============================================================================

#[tokio::test]
async fn test_in_memory_round_trip() {
    let (master_url, _handle, _agent) = start_cluster().await;
    let publisher = start_client(&master_url, "publisher").await;
    let consumer = start_client(&master_url, "consumer").await;

    let coflow_id = publisher.register_coflow(CoflowDescription::named("cf1")).await.unwrap();
    publisher
        .put_object("k1", &coflow_id, &vec![0xDEu8, 0xAD, 0xBE, 0xEF], 1)
        .await
        .unwrap();

    let value = get_object_eventually(&consumer, "k1", &coflow_id).await;
    assert_eq!(value, vec![0xDE, 0xAD, 0xBE, 0xEF]);
}

#[tokio::test]
async fn test_file_round_trip_served_by_agent() {
    let (master_url, _handle, agent) = start_cluster().await;
    let publisher = start_client(&master_url, "publisher").await;
    let consumer = start_client(&master_url, "consumer").await;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("blob.bin");
    let content: Vec<u8> = (0..4096u32).map(|i| (i * 7 % 256) as u8).collect();
    std::fs::write(&path, &content).unwrap();

    let coflow_id = publisher.register_coflow(CoflowDescription::named("files")).await.unwrap();
    publisher
        .put_file("blob", &coflow_id, path.to_str().unwrap(), 256, 1024, 1)
        .await
        .unwrap();

    let bytes = get_file_eventually(&consumer, "blob", &coflow_id).await;
    assert_eq!(bytes, content[256..1280]);
    drop(agent);
}

#[tokio::test]
async fn test_fake_round_trip_and_fan_out_finished() {
    let (master_url, handle, _agent) = start_cluster().await;
    let publisher = start_client(&master_url, "publisher").await;
    let consumer_a = start_client(&master_url, "consumer-a").await;
    let consumer_b = start_client(&master_url, "consumer-b").await;

    let coflow_id = publisher.register_coflow(CoflowDescription::named("cf1")).await.unwrap();
    publisher.put_fake("k2", &coflow_id, 1024, 2).await.unwrap();

    let expected: Vec<u8> = (0..1024u64).map(|i| (i % 256) as u8).collect();
    assert_eq!(get_fake_eventually(&consumer_a, "k2", &coflow_id).await, expected);

    let summary = handle.summary().await.unwrap();
    assert_eq!(summary.coflow(&coflow_id).unwrap().state, CoflowState::Running);

    assert_eq!(get_fake_eventually(&consumer_b, "k2", &coflow_id).await, expected);

    let summary = handle.summary().await.unwrap();
    let coflow = summary.coflow(&coflow_id).unwrap();
    assert_eq!(coflow.state, CoflowState::Finished);
    assert_eq!(coflow.flows[0].receiver_count, 2);
}

// =============================================================================
// Rate enforcement
// =============================================================================

#[tokio::test]
async fn test_pushed_rate_limits_transfer() {
    let config = CoordinatorConfig {
        heartbeat_ms: 200,
        allocation_ms: 100,
        ..Default::default()
    };
    // 1000 bytes at 4000 bits/sec is two seconds on the wire.
    let (master_url, _handle) = start_coordinator(config, Box::new(FixedRatePolicy { rate_bps: 4000.0 })).await;
    let _agent = start_agent(&master_url, "s1").await;
    let publisher = start_client(&master_url, "publisher").await;
    let consumer = start_client(&master_url, "consumer").await;

    let coflow_id = publisher.register_coflow(CoflowDescription::named("cf1")).await.unwrap();
    publisher.put_fake("k", &coflow_id, 1000, 2).await.unwrap();

    // The first fetch registers the receiver; the allocation is pushed
    // right behind the lookup reply, so it reaches the client after this
    // first throttle was built (unthrottled pull) but before any later one.
    get_fake_eventually(&consumer, "k", &coflow_id).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let start = Instant::now();
    let bytes = consumer.get_fake("k", &coflow_id).await.unwrap();
    let elapsed = start.elapsed();
    assert_eq!(bytes.len(), 1000);
    assert!(elapsed >= Duration::from_millis(1800), "transfer too fast: {elapsed:?}");
    assert!(elapsed <= Duration::from_secs(6), "transfer too slow: {elapsed:?}");
}

#[tokio::test]
async fn test_completed_get_retires_from_dispatch() {
    let (master_url, handle, _agent) = start_cluster().await;
    let publisher = start_client(&master_url, "publisher").await;
    let consumer = start_client(&master_url, "consumer").await;

    let coflow_id = publisher.register_coflow(CoflowDescription::named("cf1")).await.unwrap();
    publisher.put_fake("k", &coflow_id, 256, 2).await.unwrap();
    get_fake_eventually(&consumer, "k", &coflow_id).await;

    // Once the transfer ends the consumer leaves the dispatch set; the
    // fan-out count keeps it.
    for _ in 0..100 {
        let summary = handle.summary().await.unwrap();
        let flow = &summary.coflow(&coflow_id).unwrap().flows[0];
        if flow.active_count == 0 {
            assert_eq!(flow.receiver_count, 1);
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("completed get never retired");
}

// =============================================================================
// Ranking
// =============================================================================

#[tokio::test]
async fn test_best_rx_ranking_from_heartbeats() {
    let (master_url, _handle) = start_coordinator(CoordinatorConfig::default(), Box::new(IdentityPolicy)).await;
    let authority = master_url.trim_start_matches("varys://").to_string();

    // Three hand-rolled agents so the reported rates are exact.
    let mut conns = Vec::new();
    for (slave_id, host, rx_bps) in [("s1", "h1", 100.0), ("s2", "h2", 10.0), ("s3", "h3", 50.0)] {
        let mut conn = TcpStream::connect(authority.as_str()).await.unwrap();
        wire::write_control(
            &mut conn,
            &ControlMessage::RegisterSlave(RegisterSlave {
                slave_id: slave_id.into(),
                host: host.into(),
                port: 1607,
                web_ui_port: 16016,
                comm_port: 1608,
                public_host: host.into(),
            }),
        )
        .await
        .unwrap();
        match wire::read_control(&mut conn).await.unwrap().unwrap() {
            ControlMessage::RegisteredSlave(_) => {}
            other => panic!("unexpected {other:?}"),
        }
        wire::write_control(
            &mut conn,
            &ControlMessage::Heartbeat(Heartbeat {
                slave_id: slave_id.into(),
                rx_bps,
                tx_bps: 0.0,
            }),
        )
        .await
        .unwrap();
        // Ordering only holds per connection; a round-trip on this one
        // guarantees the heartbeat was processed before the ranking ask.
        wire::write_control(&mut conn, &ControlMessage::RequestSlaveState).await.unwrap();
        match wire::read_control(&mut conn).await.unwrap().unwrap() {
            ControlMessage::SlaveState(_) => {}
            other => panic!("unexpected {other:?}"),
        }
        conns.push(conn);
    }

    let mut asker = TcpStream::connect(authority.as_str()).await.unwrap();
    wire::write_control(
        &mut asker,
        &ControlMessage::RequestBestRxMachines(RequestBestMachines {
            count: 2,
            adjust_bytes: 0,
        }),
    )
    .await
    .unwrap();
    match wire::read_control(&mut asker).await.unwrap().unwrap() {
        ControlMessage::BestRxMachines(p) => assert_eq!(p.hosts, vec!["h2", "h3"]),
        other => panic!("unexpected {other:?}"),
    }
}

// =============================================================================
// Cascades and errors
// =============================================================================

#[tokio::test]
async fn test_coflow_cascade_unregister() {
    let (master_url, handle, _agent) = start_cluster().await;
    let publisher = start_client(&master_url, "publisher").await;
    let consumer = start_client(&master_url, "consumer").await;

    let coflow_id = publisher.register_coflow(CoflowDescription::named("cf1")).await.unwrap();
    publisher.put_fake("f1", &coflow_id, 64, 1).await.unwrap();
    publisher.put_fake("f2", &coflow_id, 64, 1).await.unwrap();
    get_fake_eventually(&consumer, "f1", &coflow_id).await;

    publisher.unregister_coflow(&coflow_id).await.unwrap();

    // Both flows disappear from the catalog.
    for _ in 0..100 {
        let summary = handle.summary().await.unwrap();
        if summary.coflow(&coflow_id).is_none() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(handle.summary().await.unwrap().coflow(&coflow_id).is_none());

    for flow_id in ["f1", "f2"] {
        match consumer.get_fake(flow_id, &coflow_id).await {
            Err(Error::NotFound { .. }) => {}
            other => panic!("expected NotFound for {flow_id}, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn test_client_disconnect_cascades() {
    let (master_url, handle, _agent) = start_cluster().await;
    let publisher = start_client(&master_url, "publisher").await;
    let consumer = start_client(&master_url, "consumer").await;

    let coflow_id = publisher.register_coflow(CoflowDescription::named("cf1")).await.unwrap();
    publisher
        .put_object("f1", &coflow_id, &vec![1u8, 2, 3], 1)
        .await
        .unwrap();
    get_object_eventually(&consumer, "f1", &coflow_id).await;

    // Abrupt death: every handle dropped, connections close unannounced.
    drop(publisher);

    for _ in 0..100 {
        let summary = handle.summary().await.unwrap();
        if summary.coflow(&coflow_id).is_none() && summary.clients.len() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    let summary = handle.summary().await.unwrap();
    assert!(summary.coflow(&coflow_id).is_none());
    assert_eq!(summary.clients.len(), 1);

    match consumer.get_object::<Vec<u8>>("f1", &coflow_id).await {
        Err(Error::NotFound { .. }) => {}
        other => panic!("expected NotFound, got {other:?}"),
    }
}

#[tokio::test]
async fn test_silent_agent_is_swept() {
    let config = CoordinatorConfig {
        heartbeat_ms: 100,
        ..Default::default()
    };
    let (master_url, handle) = start_coordinator(config, Box::new(IdentityPolicy)).await;
    let authority = master_url.trim_start_matches("varys://").to_string();

    // A hand-rolled agent that registers, heartbeats once, then goes
    // silent while keeping its connection open.
    let mut conn = TcpStream::connect(authority.as_str()).await.unwrap();
    wire::write_control(
        &mut conn,
        &ControlMessage::RegisterSlave(RegisterSlave {
            slave_id: "mute".into(),
            host: "h1".into(),
            port: 1607,
            web_ui_port: 16016,
            comm_port: 1608,
            public_host: "h1".into(),
        }),
    )
    .await
    .unwrap();
    wire::read_control(&mut conn).await.unwrap().unwrap();
    wire::write_control(
        &mut conn,
        &ControlMessage::Heartbeat(Heartbeat {
            slave_id: "mute".into(),
            rx_bps: 1.0,
            tx_bps: 1.0,
        }),
    )
    .await
    .unwrap();

    assert_eq!(handle.summary().await.unwrap().agents.len(), 1);

    // Three missed heartbeats later the sweep removes it.
    for _ in 0..100 {
        if handle.summary().await.unwrap().agents.is_empty() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("silent agent never swept");
}

#[tokio::test]
async fn test_type_mismatch_is_an_error() {
    let (master_url, _handle, _agent) = start_cluster().await;
    let publisher = start_client(&master_url, "publisher").await;
    let consumer = start_client(&master_url, "consumer").await;

    let coflow_id = publisher.register_coflow(CoflowDescription::named("cf1")).await.unwrap();
    publisher.put_fake("k", &coflow_id, 64, 1).await.unwrap();
    get_fake_eventually(&consumer, "k", &coflow_id).await;

    match consumer.get_object::<Vec<u8>>("k", &coflow_id).await {
        Err(Error::TypeMismatch { .. }) => {}
        other => panic!("expected TypeMismatch, got {other:?}"),
    }
}

#[tokio::test]
async fn test_get_unknown_flow_is_not_found() {
    let (master_url, _handle, _agent) = start_cluster().await;
    let consumer = start_client(&master_url, "consumer").await;
    match consumer.get_fake("ghost", "COFLOW-000042").await {
        Err(Error::NotFound { .. }) => {}
        other => panic!("expected NotFound, got {other:?}"),
    }
}

#[tokio::test]
async fn test_delete_flow_removes_it() {
    let (master_url, _handle, _agent) = start_cluster().await;
    let publisher = start_client(&master_url, "publisher").await;
    let consumer = start_client(&master_url, "consumer").await;

    let coflow_id = publisher.register_coflow(CoflowDescription::named("cf1")).await.unwrap();
    publisher.put_fake("k", &coflow_id, 64, 3).await.unwrap();
    get_fake_eventually(&consumer, "k", &coflow_id).await;

    publisher.delete_flow("k", &coflow_id).await.unwrap();

    for _ in 0..100 {
        match consumer.get_fake("k", &coflow_id).await {
            Err(Error::NotFound { .. }) => return,
            Ok(_) => tokio::time::sleep(Duration::from_millis(50)).await,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    panic!("flow survived deletion");
}

#[tokio::test]
async fn test_best_machines_via_client_api() {
    let (master_url, _handle, _agent) = start_cluster().await;
    let client = start_client(&master_url, "app").await;

    let hosts = client.get_best_rx_machines(4, 0).await.unwrap();
    assert_eq!(hosts, vec![HOST.to_string()]);
    let host = client.get_best_tx_machine(1_000_000).await.unwrap();
    assert_eq!(host.as_deref(), Some(HOST));
}

#[tokio::test]
async fn test_stop_is_graceful() {
    let (master_url, handle, _agent) = start_cluster().await;
    let client = start_client(&master_url, "app").await;
    let coflow_id = client.register_coflow(CoflowDescription::named("cf1")).await.unwrap();

    client.stop().await;

    for _ in 0..100 {
        let summary = handle.summary().await.unwrap();
        if summary.clients.is_empty() && summary.coflow(&coflow_id).is_none() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("stopped client still registered");
}
