//
// Copyright (c) The Flint Core Contributors
//
// SPDX-License-Identifier: MIT
//

mod common;

use std::time::{Duration, Instant};

use common::*;
use flint_spark::io::{PacketDest, PacketIo};
use flint_spark::packet::{
    DEFAULT_AREA_ID, HandshakeMsg, HelloMsg, PACKET_VERSION, PacketBody,
    PacketEnvelope, ReflectedInfo,
};
use flint_spark::{
    AreaConfig, InterfaceBinding, NeighborEventKind, Spark, SparkNeighState,
};

// Starts two connected instances and waits for the adjacency to form in
// both directions.
async fn create_and_connect_nodes(net: &SimNet) -> (Spark, Spark) {
    net.set_connected_pairs(&[
        (IFACE1, &[(IFACE2, 10)]),
        (IFACE2, &[(IFACE1, 10)]),
    ]);

    let mut node1 = spawn_node(net, DOMAIN_NAME, "node-1");
    let mut node2 = spawn_node(net, DOMAIN_NAME, "node-2");

    node1.update_interface_db(vec![iface1_binding()]).await.unwrap();
    node2.update_interface_db(vec![iface2_binding()]).await.unwrap();

    let event = node1
        .wait_for_event(NeighborEventKind::NeighborUp, EVENT_STEP, EVENT_WAIT)
        .await
        .expect("node-1 adjacency");
    assert_eq!(event.ifname, IFACE1);
    assert_eq!(event.node_name, "node-2");
    assert_eq!(event.transport_v4, Some(ip2_v4()));
    assert_eq!(event.transport_v6, Some(ip2_v6()));

    let event = node2
        .wait_for_event(NeighborEventKind::NeighborUp, EVENT_STEP, EVENT_WAIT)
        .await
        .expect("node-2 adjacency");
    assert_eq!(event.ifname, IFACE2);
    assert_eq!(event.node_name, "node-1");
    assert_eq!(event.transport_v4, Some(ip1_v4()));
    assert_eq!(event.transport_v6, Some(ip1_v6()));

    (node1, node2)
}

//
// Two instances detect each other and report the adjacency with each
// other's transport addresses, in the default area.
//
#[tokio::test]
async fn happy_path_adjacency() {
    let net = SimNet::new();
    let (node1, node2) = create_and_connect_nodes(&net).await;

    assert_eq!(
        node1.get_neighbor_state(IFACE1, "node-2").await,
        Some(SparkNeighState::Established)
    );
    assert_eq!(
        node2.get_neighbor_state(IFACE2, "node-1").await,
        Some(SparkNeighState::Established)
    );
}

//
// After the adjacency forms, make the link slower (and asymmetric) and
// expect both sides to report the RTT change.
//
#[tokio::test]
async fn rtt_change() {
    let net = SimNet::new();
    let (mut node1, mut node2) = create_and_connect_nodes(&net).await;

    // 15ms + 25ms = 40ms round trip.
    net.set_connected_pairs(&[
        (IFACE1, &[(IFACE2, 15)]),
        (IFACE2, &[(IFACE1, 25)]),
    ]);

    for node in [&mut node1, &mut node2] {
        let deadline = Instant::now() + EVENT_WAIT;
        let mut reported = None;
        while Instant::now() < deadline {
            let Some(event) = node
                .wait_for_event(
                    NeighborEventKind::NeighborRttChange,
                    EVENT_STEP,
                    EVENT_WAIT,
                )
                .await
            else {
                break;
            };
            // The estimator converges over a few samples; wait for a
            // report in the expected band.
            if (30_000..=50_000).contains(&event.rtt_us) {
                reported = Some(event.rtt_us);
                break;
            }
        }
        assert!(reported.is_some(), "no RTT report in the 30-50ms band");
    }
}

//
// Once the adjacency is up, liveness heartbeats are point-to-point:
// every one goes unicast to the peer's link-local address, never to the
// discovery group.
//
#[tokio::test]
async fn heartbeats_are_unicast() {
    let net = SimNet::new();
    let (_node1, _node2) = create_and_connect_nodes(&net).await;

    // Let a few heartbeat intervals elapse.
    tokio::time::sleep(HEARTBEAT_TIME * 4).await;

    let mut heartbeats = 0;
    for record in net.tx_log() {
        let Ok(envelope) = PacketEnvelope::decode(&record.data) else {
            continue;
        };
        let PacketBody::Heartbeat(_) = envelope.body else {
            continue;
        };
        heartbeats += 1;

        let expected = match record.ifname.as_str() {
            IFACE1 => ip2_v6(),
            IFACE2 => ip1_v6(),
            ifname => panic!("heartbeat on unexpected interface: {ifname}"),
        };
        match record.dst {
            PacketDest::Unicast(dst) => assert_eq!(dst, expected),
            PacketDest::Multicast => {
                panic!("heartbeat sent to the discovery group")
            }
        }
    }
    assert!(heartbeats > 0, "no heartbeats observed");
}

//
// Cut one direction of the link. The deaf side expires its hold timer;
// the other side notices it is no longer reflected.
//
#[tokio::test]
async fn unidirectional_loss() {
    let net = SimNet::new();
    let (mut node1, mut node2) = create_and_connect_nodes(&net).await;

    net.set_connected_pairs(&[(IFACE1, &[(IFACE2, 10)])]);

    assert!(
        node1
            .wait_for_event(
                NeighborEventKind::NeighborDown,
                EVENT_STEP,
                EVENT_WAIT
            )
            .await
            .is_some()
    );
    assert!(
        node2
            .wait_for_event(
                NeighborEventKind::NeighborDown,
                EVENT_STEP,
                EVENT_WAIT
            )
            .await
            .is_some()
    );
}

//
// Restart one node within the graceful-restart window: the survivor
// reports RESTARTING then RESTARTED, and nobody reports DOWN.
//
#[tokio::test]
async fn graceful_restart() {
    let net = SimNet::new();
    let (mut node1, node2) = create_and_connect_nodes(&net).await;

    node2.stop().await;

    assert!(
        node1
            .wait_for_event(
                NeighborEventKind::NeighborRestarting,
                EVENT_STEP,
                EVENT_WAIT
            )
            .await
            .is_some()
    );

    // Bring node-2 back with a fresh hello sequence origin.
    let mut node2 = spawn_node(&net, DOMAIN_NAME, "node-2");
    node2.update_interface_db(vec![iface2_binding()]).await.unwrap();

    assert!(
        node1
            .wait_for_event(
                NeighborEventKind::NeighborRestarted,
                EVENT_STEP,
                EVENT_WAIT
            )
            .await
            .is_some()
    );
    assert!(
        node2
            .wait_for_event(
                NeighborEventKind::NeighborUp,
                EVENT_STEP,
                EVENT_WAIT
            )
            .await
            .is_some()
    );

    // Neither side may have lost the adjacency.
    assert!(
        node1
            .wait_for_event(
                NeighborEventKind::NeighborDown,
                GR_HOLD_TIME,
                GR_HOLD_TIME * 2
            )
            .await
            .is_none()
    );
    assert!(
        node2
            .wait_for_event(
                NeighborEventKind::NeighborDown,
                GR_HOLD_TIME,
                GR_HOLD_TIME * 2
            )
            .await
            .is_none()
    );
}

//
// Shut a node down and never bring it back: the survivor goes through
// RESTARTING and then declares the neighbor down when the GR window
// closes.
//
#[tokio::test]
async fn gr_hold_expiry() {
    let net = SimNet::new();
    let (mut node1, node2) = create_and_connect_nodes(&net).await;

    let start_time = Instant::now();
    node2.stop().await;

    assert!(
        node1
            .wait_for_event(
                NeighborEventKind::NeighborRestarting,
                EVENT_STEP,
                EVENT_WAIT
            )
            .await
            .is_some()
    );
    assert!(
        node1
            .wait_for_event(
                NeighborEventKind::NeighborDown,
                EVENT_STEP,
                EVENT_WAIT
            )
            .await
            .is_some()
    );

    // The loss is declared by the GR deadline, not the heartbeat hold.
    let elapsed = start_time.elapsed();
    assert!(elapsed >= GR_HOLD_TIME);
    assert!(elapsed <= GR_HOLD_TIME * 2);
}

//
// Cut the link in both directions and watch both hold timers expire.
//
#[tokio::test]
async fn heartbeat_hold_expiry() {
    let net = SimNet::new();
    let (mut node1, mut node2) = create_and_connect_nodes(&net).await;

    let start_time = Instant::now();
    net.set_connected_pairs(&[]);

    assert!(
        node1
            .wait_for_event(
                NeighborEventKind::NeighborDown,
                EVENT_STEP,
                EVENT_WAIT
            )
            .await
            .is_some()
    );
    assert!(
        node2
            .wait_for_event(
                NeighborEventKind::NeighborDown,
                EVENT_STEP,
                EVENT_WAIT
            )
            .await
            .is_some()
    );

    let elapsed = start_time.elapsed();
    assert!(elapsed >= HEARTBEAT_HOLD_TIME - HEARTBEAT_TIME - Duration::from_millis(50));
    assert!(elapsed <= GR_HOLD_TIME);
}

//
// Removing the interface tears the adjacency down immediately on the
// local side; the peer expires its hold timer. Re-adding the interface
// re-forms the adjacency.
//
#[tokio::test]
async fn interface_removal() {
    let net = SimNet::new();
    let (mut node1, mut node2) = create_and_connect_nodes(&net).await;

    node1.update_interface_db(vec![]).await.unwrap();

    let event = node1
        .wait_for_event(
            NeighborEventKind::NeighborDown,
            EVENT_STEP,
            // Removal is instant, not hold-timer driven.
            HEARTBEAT_HOLD_TIME,
        )
        .await
        .expect("node-1 interface removal");
    assert_eq!(event.ifname, IFACE1);

    assert!(
        node2
            .wait_for_event(
                NeighborEventKind::NeighborDown,
                EVENT_STEP,
                EVENT_WAIT
            )
            .await
            .is_some()
    );

    // No further events while the interface stays down.
    assert!(node1.recv_neighbor_event(GR_HOLD_TIME).await.is_none());
    assert!(node2.recv_neighbor_event(GR_HOLD_TIME).await.is_none());

    // Bring the interface back online.
    node1.update_interface_db(vec![iface1_binding()]).await.unwrap();

    assert!(
        node1
            .wait_for_event(
                NeighborEventKind::NeighborUp,
                EVENT_STEP,
                EVENT_WAIT
            )
            .await
            .is_some()
    );
    assert!(
        node2
            .wait_for_event(
                NeighborEventKind::NeighborUp,
                EVENT_STEP,
                EVENT_WAIT
            )
            .await
            .is_some()
    );
}

//
// Instances in different administrative domains never become neighbors,
// and no state is created for them.
//
#[tokio::test]
async fn domain_mismatch() {
    let net = SimNet::new();
    net.set_connected_pairs(&[
        (IFACE1, &[(IFACE2, 10)]),
        (IFACE2, &[(IFACE1, 10)]),
    ]);

    let mut node1 =
        spawn_node(&net, "A_Lannister_Always_Pays_His_Debts", "Lannister");
    let mut node2 = spawn_node(&net, "Winter_Is_Coming", "Stark");

    node1.update_interface_db(vec![iface1_binding()]).await.unwrap();
    node2.update_interface_db(vec![iface2_binding()]).await.unwrap();

    assert!(
        node1
            .wait_for_event(
                NeighborEventKind::NeighborUp,
                GR_HOLD_TIME,
                GR_HOLD_TIME * 2
            )
            .await
            .is_none()
    );
    assert!(
        node2
            .wait_for_event(
                NeighborEventKind::NeighborUp,
                GR_HOLD_TIME,
                GR_HOLD_TIME * 2
            )
            .await
            .is_none()
    );
    assert!(node1.get_neighbor_state(IFACE1, "Stark").await.is_none());
    assert!(node2.get_neighbor_state(IFACE2, "Lannister").await.is_none());
}

//
// A peer that can talk to us but never hear us stays WARM on our side
// and produces no lifecycle events.
//
#[tokio::test]
async fn ignore_unidirectional_peer() {
    let net = SimNet::new();
    net.set_connected_pairs(&[(IFACE2, &[(IFACE1, 10)])]);

    let mut node1 = spawn_node(&net, DOMAIN_NAME, "node-1");
    let mut node2 = spawn_node(&net, DOMAIN_NAME, "node-2");

    node1.update_interface_db(vec![iface1_binding()]).await.unwrap();
    node2.update_interface_db(vec![iface2_binding()]).await.unwrap();

    assert!(node1.recv_neighbor_event(GR_HOLD_TIME * 2).await.is_none());
    assert!(node2.recv_neighbor_event(GR_HOLD_TIME * 2).await.is_none());

    assert_eq!(
        node1.get_neighbor_state(IFACE1, "node-2").await,
        Some(SparkNeighState::Warm)
    );
    assert!(node2.get_neighbor_state(IFACE2, "node-1").await.is_none());
}

//
// An interface connected to itself loops our own hellos back at us; they
// must be dropped without creating any neighbor state.
//
#[tokio::test]
async fn looped_hello() {
    let net = SimNet::new();
    net.set_connected_pairs(&[(IFACE1, &[(IFACE1, 10)])]);

    let mut node1 = spawn_node(&net, DOMAIN_NAME, "node-1");
    node1.update_interface_db(vec![iface1_binding()]).await.unwrap();

    assert!(
        node1
            .wait_for_event(
                NeighborEventKind::NeighborUp,
                GR_HOLD_TIME,
                GR_HOLD_TIME * 2
            )
            .await
            .is_none()
    );
    assert!(node1.get_neighbor_state(IFACE1, "node-1").await.is_none());
}

//
// Different v4 subnets keep negotiation failing (oscillating between
// WARM and NEGOTIATE, never DOWN); correcting the address lets the
// adjacency form.
//
#[tokio::test]
async fn v4_subnet_mismatch() {
    let net = SimNet::new();
    net.set_connected_pairs(&[
        (IFACE1, &[(IFACE2, 10)]),
        (IFACE2, &[(IFACE1, 10)]),
    ]);

    let mut node1 = spawn_node(&net, DOMAIN_NAME, "node-1");
    let mut node2 = spawn_node(&net, DOMAIN_NAME, "node-2");

    let ip1_v4_subnet: ipnetwork::Ipv4Network = "192.168.0.2/31".parse().unwrap();
    let ip2_v4_same_subnet: ipnetwork::Ipv4Network =
        "192.168.0.3/31".parse().unwrap();
    let ip2_v4_diff_subnet: ipnetwork::Ipv4Network =
        "192.168.0.4/31".parse().unwrap();

    node1
        .update_interface_db(vec![InterfaceBinding::new(
            IFACE1.to_owned(),
            IF_INDEX1,
            Some(ip1_v4_subnet),
            ip1_v6(),
        )])
        .await
        .unwrap();
    node2
        .update_interface_db(vec![InterfaceBinding::new(
            IFACE2.to_owned(),
            IF_INDEX2,
            Some(ip2_v4_diff_subnet),
            ip2_v6(),
        )])
        .await
        .unwrap();

    // Subnet validation keeps failing.
    assert!(
        node1
            .wait_for_event(
                NeighborEventKind::NeighborUp,
                GR_HOLD_TIME,
                GR_HOLD_TIME * 2
            )
            .await
            .is_none()
    );
    assert!(
        node2
            .wait_for_event(
                NeighborEventKind::NeighborDown,
                GR_HOLD_TIME,
                GR_HOLD_TIME * 2
            )
            .await
            .is_none()
    );

    let state = node1.get_neighbor_state(IFACE1, "node-2").await;
    assert!(matches!(
        state,
        Some(SparkNeighState::Warm) | Some(SparkNeighState::Negotiate)
    ));
    let state = node2.get_neighbor_state(IFACE2, "node-1").await;
    assert!(matches!(
        state,
        Some(SparkNeighState::Warm) | Some(SparkNeighState::Negotiate)
    ));

    // Move node-2 into the same /31 and expect the adjacency.
    node2
        .update_interface_db(vec![InterfaceBinding::new(
            IFACE2.to_owned(),
            IF_INDEX2,
            Some(ip2_v4_same_subnet),
            ip2_v6(),
        )])
        .await
        .unwrap();

    assert!(
        node1
            .wait_for_event(
                NeighborEventKind::NeighborUp,
                EVENT_STEP,
                EVENT_WAIT
            )
            .await
            .is_some()
    );
    assert!(
        node2
            .wait_for_event(
                NeighborEventKind::NeighborUp,
                EVENT_STEP,
                EVENT_WAIT
            )
            .await
            .is_some()
    );
}

//
// Area negotiation: both sides compute area "2" for each other and agree.
//
#[tokio::test]
async fn area_match() {
    let net = SimNet::new();
    net.set_connected_pairs(&[
        (IFACE1, &[(IFACE2, 10)]),
        (IFACE2, &[(IFACE1, 10)]),
    ]);

    // rsw001: { 1 -> "RSW.*", 2 -> "FSW.*" }
    // fsw002: { 1 -> "FSW.*", 2 -> "RSW.*" }
    let mut config1 = test_config(DOMAIN_NAME, "rsw001");
    config1.areas = vec![
        AreaConfig::new("1", vec!["RSW.*".to_owned()], vec![".*".to_owned()]),
        AreaConfig::new("2", vec!["FSW.*".to_owned()], vec![".*".to_owned()]),
    ];
    let mut config2 = test_config(DOMAIN_NAME, "fsw002");
    config2.areas = vec![
        AreaConfig::new("1", vec!["FSW.*".to_owned()], vec![".*".to_owned()]),
        AreaConfig::new("2", vec!["RSW.*".to_owned()], vec![".*".to_owned()]),
    ];

    let mut node1 = Spark::spawn(config1, net.endpoint()).unwrap();
    let mut node2 = Spark::spawn(config2, net.endpoint()).unwrap();

    node1.update_interface_db(vec![iface1_binding()]).await.unwrap();
    node2.update_interface_db(vec![iface2_binding()]).await.unwrap();

    let event = node1
        .wait_for_event(NeighborEventKind::NeighborUp, EVENT_STEP, EVENT_WAIT)
        .await
        .expect("rsw001 adjacency");
    assert_eq!(event.node_name, "fsw002");
    assert_eq!(event.area, "2");

    let event = node2
        .wait_for_event(NeighborEventKind::NeighborUp, EVENT_STEP, EVENT_WAIT)
        .await
        .expect("fsw002 adjacency");
    assert_eq!(event.node_name, "rsw001");
    assert_eq!(event.area, "2");
}

//
// Neither side's area config accepts the other: hellos are dropped before
// any neighbor state exists.
//
#[tokio::test]
async fn area_no_match() {
    let net = SimNet::new();
    net.set_connected_pairs(&[
        (IFACE1, &[(IFACE2, 10)]),
        (IFACE2, &[(IFACE1, 10)]),
    ]);

    let mut config1 = test_config(DOMAIN_NAME, "rsw001");
    config1.areas = vec![AreaConfig::new(
        "1",
        vec!["RSW.*".to_owned()],
        vec![".*".to_owned()],
    )];
    let mut config2 = test_config(DOMAIN_NAME, "fsw002");
    config2.areas = vec![AreaConfig::new(
        "1",
        vec!["FSW.*".to_owned()],
        vec![".*".to_owned()],
    )];

    let mut node1 = Spark::spawn(config1, net.endpoint()).unwrap();
    let mut node2 = Spark::spawn(config2, net.endpoint()).unwrap();

    node1.update_interface_db(vec![iface1_binding()]).await.unwrap();
    node2.update_interface_db(vec![iface2_binding()]).await.unwrap();

    assert!(
        node1
            .wait_for_event(
                NeighborEventKind::NeighborUp,
                GR_HOLD_TIME,
                GR_HOLD_TIME * 2
            )
            .await
            .is_none()
    );
    assert!(
        node2
            .wait_for_event(
                NeighborEventKind::NeighborUp,
                GR_HOLD_TIME,
                GR_HOLD_TIME * 2
            )
            .await
            .is_none()
    );
    assert!(node1.get_neighbor_state(IFACE1, "fsw002").await.is_none());
    assert!(node2.get_neighbor_state(IFACE2, "rsw001").await.is_none());
}

//
// Both sides accept each other but compute different areas: negotiation
// never concludes and the neighbors oscillate below ESTABLISHED.
//
#[tokio::test]
async fn area_negotiation_disagreement() {
    let net = SimNet::new();
    net.set_connected_pairs(&[
        (IFACE1, &[(IFACE2, 10)]),
        (IFACE2, &[(IFACE1, 10)]),
    ]);

    let mut config1 = test_config(DOMAIN_NAME, "rsw001");
    config1.areas = vec![AreaConfig::new(
        "1",
        vec!["FSW.*".to_owned()],
        vec![".*".to_owned()],
    )];
    let mut config2 = test_config(DOMAIN_NAME, "fsw002");
    config2.areas = vec![AreaConfig::new(
        "2",
        vec!["RSW.*".to_owned()],
        vec![".*".to_owned()],
    )];

    let mut node1 = Spark::spawn(config1, net.endpoint()).unwrap();
    let mut node2 = Spark::spawn(config2, net.endpoint()).unwrap();

    node1.update_interface_db(vec![iface1_binding()]).await.unwrap();
    node2.update_interface_db(vec![iface2_binding()]).await.unwrap();

    assert!(
        node1
            .wait_for_event(
                NeighborEventKind::NeighborUp,
                GR_HOLD_TIME,
                GR_HOLD_TIME * 2
            )
            .await
            .is_none()
    );
    assert!(
        node2
            .wait_for_event(
                NeighborEventKind::NeighborUp,
                GR_HOLD_TIME,
                GR_HOLD_TIME * 2
            )
            .await
            .is_none()
    );

    let state = node1.get_neighbor_state(IFACE1, "fsw002").await;
    assert!(matches!(
        state,
        Some(SparkNeighState::Warm) | Some(SparkNeighState::Negotiate)
    ));
    let state = node2.get_neighbor_state(IFACE2, "rsw001").await;
    assert!(matches!(
        state,
        Some(SparkNeighState::Warm) | Some(SparkNeighState::Negotiate)
    ));
}

//
// One side has no area support at all: both fall back to the well-known
// default area.
//
#[tokio::test]
async fn area_default_fallback() {
    let net = SimNet::new();
    net.set_connected_pairs(&[
        (IFACE1, &[(IFACE2, 10)]),
        (IFACE2, &[(IFACE1, 10)]),
    ]);

    let config1 = test_config(DOMAIN_NAME, "rsw001");
    let mut config2 = test_config(DOMAIN_NAME, "fsw002");
    config2.areas = vec![AreaConfig::new(
        "2",
        vec!["RSW.*".to_owned()],
        vec![".*".to_owned()],
    )];

    let mut node1 = Spark::spawn(config1, net.endpoint()).unwrap();
    let mut node2 = Spark::spawn(config2, net.endpoint()).unwrap();

    node1.update_interface_db(vec![iface1_binding()]).await.unwrap();
    node2.update_interface_db(vec![iface2_binding()]).await.unwrap();

    let event = node1
        .wait_for_event(NeighborEventKind::NeighborUp, EVENT_STEP, EVENT_WAIT)
        .await
        .expect("rsw001 adjacency");
    assert_eq!(event.node_name, "fsw002");
    assert_eq!(event.area, DEFAULT_AREA_ID);

    let event = node2
        .wait_for_event(NeighborEventKind::NeighborUp, EVENT_STEP, EVENT_WAIT)
        .await
        .expect("fsw002 adjacency");
    assert_eq!(event.node_name, "rsw001");
    assert_eq!(event.area, DEFAULT_AREA_ID);
}

//
// An instance speaking the predecessor protocol forms an adjacency with a
// current one, and upgrading it in place looks like a graceful restart.
//
#[tokio::test]
async fn legacy_interop() {
    let net = SimNet::new();
    net.set_connected_pairs(&[
        (IFACE1, &[(IFACE2, 10)]),
        (IFACE2, &[(IFACE1, 10)]),
    ]);

    let mut config1 = test_config(DOMAIN_NAME, "node-1");
    config1.increase_hello_interval = false;
    let mut config2 = test_config(DOMAIN_NAME, "node-2");
    config2.enable_spark2 = false;
    config2.increase_hello_interval = false;

    let mut node1 = Spark::spawn(config1, net.endpoint()).unwrap();
    let mut node2 = Spark::spawn(config2, net.endpoint()).unwrap();

    node1.update_interface_db(vec![iface1_binding()]).await.unwrap();
    node2.update_interface_db(vec![iface2_binding()]).await.unwrap();

    let event = node1
        .wait_for_event(NeighborEventKind::NeighborUp, EVENT_STEP, EVENT_WAIT)
        .await
        .expect("node-1 adjacency");
    assert_eq!(event.node_name, "node-2");
    assert_eq!(event.transport_v4, Some(ip2_v4()));
    assert_eq!(event.transport_v6, Some(ip2_v6()));
    assert_eq!(event.area, DEFAULT_AREA_ID);

    let event = node2
        .wait_for_event(NeighborEventKind::NeighborUp, EVENT_STEP, EVENT_WAIT)
        .await
        .expect("node-2 adjacency");
    assert_eq!(event.node_name, "node-1");
    assert_eq!(event.transport_v4, Some(ip1_v4()));
    assert_eq!(event.transport_v6, Some(ip1_v6()));

    // Upgrade node-2 to the current protocol, mimicking a rollout.
    node2.stop().await;
    assert!(
        node1
            .wait_for_event(
                NeighborEventKind::NeighborRestarting,
                EVENT_STEP,
                EVENT_WAIT
            )
            .await
            .is_some()
    );

    let mut node2 = spawn_node(&net, DOMAIN_NAME, "node-2");
    node2.update_interface_db(vec![iface2_binding()]).await.unwrap();

    assert!(
        node1
            .wait_for_event(
                NeighborEventKind::NeighborRestarted,
                EVENT_STEP,
                EVENT_WAIT
            )
            .await
            .is_some()
    );
    assert!(
        node2
            .wait_for_event(
                NeighborEventKind::NeighborUp,
                EVENT_STEP,
                EVENT_WAIT
            )
            .await
            .is_some()
    );

    assert!(
        node1
            .wait_for_event(
                NeighborEventKind::NeighborDown,
                GR_HOLD_TIME,
                GR_HOLD_TIME * 2
            )
            .await
            .is_none()
    );
    assert!(
        node2
            .wait_for_event(
                NeighborEventKind::NeighborDown,
                GR_HOLD_TIME,
                GR_HOLD_TIME * 2
            )
            .await
            .is_none()
    );
}

//
// A hello whose sequence number moves backwards marks a peer that
// restarted without announcing it: the adjacency survives and RESTARTED
// is reported. Driven by a hand-rolled peer for full control over the
// sequence numbers.
//
#[tokio::test]
async fn sequence_wrap_restart() {
    let net = SimNet::new();
    net.set_connected_pairs(&[
        (IFACE1, &[("iface9", 10)]),
        ("iface9", &[(IFACE1, 10)]),
    ]);

    let mut node1 = spawn_node(&net, DOMAIN_NAME, "node-1");
    node1.update_interface_db(vec![iface1_binding()]).await.unwrap();

    let peer = net.endpoint();
    peer.bind_interface("iface9", 9).await.unwrap();

    // Warm up: announce ourselves before reflecting anything.
    peer_send_hello(&peer, 500, None, false).await;

    // Reflect node-1 as soon as we hear it.
    let hello = peer_recv_hello(&peer).await;
    peer_send_hello(&peer, 501, Some(&hello), false).await;

    // node-1 enters NEGOTIATE and handshakes; answer it.
    peer_recv_handshake(&peer).await;
    let handshake = HandshakeMsg {
        node_name: "node-9".to_owned(),
        version: 20,
        supported_version: 18,
        ifname: "iface9".to_owned(),
        transport_v4: Some("192.168.0.9/24".parse().unwrap()),
        transport_v6: "fe80::9".parse().unwrap(),
        hold_time: Duration::from_secs(2),
        gr_hold_time: Duration::from_secs(30),
        neighbor_area: None,
        established: false,
    };
    peer.send_packet(
        "iface9",
        flint_spark::io::PacketDest::Multicast,
        PacketEnvelope::new(PACKET_VERSION, PacketBody::Handshake(handshake))
            .encode()
            .into(),
    )
    .await
    .unwrap();

    assert!(
        node1
            .wait_for_event(
                NeighborEventKind::NeighborUp,
                EVENT_STEP,
                EVENT_WAIT
            )
            .await
            .is_some()
    );

    // Now restart the sequence from a low origin.
    let hello = peer_recv_hello(&peer).await;
    peer_send_hello(&peer, 5, Some(&hello), false).await;

    assert!(
        node1
            .wait_for_event(
                NeighborEventKind::NeighborRestarted,
                EVENT_STEP,
                EVENT_WAIT
            )
            .await
            .is_some()
    );
    assert_eq!(
        node1.get_neighbor_state(IFACE1, "node-9").await,
        Some(SparkNeighState::Established)
    );
    assert!(
        node1
            .wait_for_event(
                NeighborEventKind::NeighborDown,
                GR_HOLD_TIME,
                GR_HOLD_TIME
            )
            .await
            .is_none()
    );
}

// Sends one hand-crafted hello from the fake peer, optionally reflecting
// a received hello from node-1.
async fn peer_send_hello(
    peer: &SimIo,
    seq_num: u64,
    reflect: Option<&HelloMsg>,
    restarting: bool,
) {
    let mut neighbor_infos = std::collections::BTreeMap::new();
    if let Some(hello) = reflect {
        neighbor_infos.insert(
            hello.node_name.clone(),
            ReflectedInfo::new(
                hello.seq_num,
                hello.sent_ts_us,
                flint_spark::io::now_us(),
            ),
        );
    }

    let hello = HelloMsg {
        node_name: "node-9".to_owned(),
        domain_name: DOMAIN_NAME.to_owned(),
        version: 20,
        supported_version: 18,
        ifname: "iface9".to_owned(),
        transport_v4: Some("192.168.0.9/24".parse().unwrap()),
        transport_v6: "fe80::9".parse().unwrap(),
        seq_num,
        neighbor_infos,
        hold_time: Duration::from_secs(2),
        gr_hold_time: Duration::from_secs(30),
        solicit_response: false,
        restarting,
        sent_ts_us: flint_spark::io::now_us(),
    };
    peer.send_packet(
        "iface9",
        flint_spark::io::PacketDest::Multicast,
        PacketEnvelope::new(PACKET_VERSION, PacketBody::Hello(hello))
            .encode()
            .into(),
    )
    .await
    .unwrap();
}

async fn peer_recv_hello(peer: &SimIo) -> HelloMsg {
    loop {
        let packet = tokio::time::timeout(EVENT_WAIT, peer.recv_packet())
            .await
            .expect("no hello from node-1")
            .unwrap();
        if let Ok(envelope) = PacketEnvelope::decode(&packet.data)
            && let PacketBody::Hello(hello) = envelope.body
        {
            return hello;
        }
    }
}

async fn peer_recv_handshake(peer: &SimIo) -> HandshakeMsg {
    loop {
        let packet = tokio::time::timeout(EVENT_WAIT, peer.recv_packet())
            .await
            .expect("no handshake from node-1")
            .unwrap();
        if let Ok(envelope) = PacketEnvelope::decode(&packet.data)
            && let PacketBody::Handshake(handshake) = envelope.body
        {
            return handshake;
        }
    }
}
