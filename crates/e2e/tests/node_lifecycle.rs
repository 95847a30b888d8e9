//! Node lifecycle end-to-end: allocation, gateway routing, disable,
//! credential rotation and deletion, observed through the fake route
//! table and token store.

use std::collections::BTreeSet;
use wiregate_common::{Error, GatewayNetwork, NodeParams, NodeUpdate};
use wiregate_e2e::controller;

fn params(name: &str, subnets: &[&str]) -> NodeParams {
    NodeParams {
        name: name.to_string(),
        is_gateway: !subnets.is_empty(),
        enabled: true,
        gateway_networks: subnets.iter().map(|s| GatewayNetwork::new(*s)).collect(),
        ..Default::default()
    }
}

#[tokio::test]
async fn create_node_yields_config_and_token() {
    let ctl = controller();
    ctl.orchestrator.initialize("controller").await.unwrap();

    let created = ctl
        .orchestrator
        .create_node(params("node-a", &[]), None)
        .await
        .unwrap();

    // First client address after the controller's own
    assert_eq!(created.node.address, "10.8.0.2");
    assert!(created.node.public_key.is_some());

    let config = ctl.orchestrator.node_config(created.node.id).unwrap();
    assert!(config.contains("10.8.0.2"));
    assert!(config.contains(created.node.private_key.as_deref().unwrap()));
    assert!(config.contains("[Peer]"));

    let verified = ctl.tokens.verify(&created.token).unwrap().unwrap();
    assert_eq!(verified.node_id, created.node.id);
}

#[tokio::test]
async fn route_table_tracks_gateway_network_union() {
    let ctl = controller();
    ctl.orchestrator.initialize("controller").await.unwrap();

    let gw1 = ctl
        .orchestrator
        .create_node(params("gw1", &["192.168.1.0/24", "192.168.2.0/24"]), None)
        .await
        .unwrap();
    let gw2 = ctl
        .orchestrator
        .create_node(params("gw2", &["172.16.0.0/16"]), None)
        .await
        .unwrap();

    let expect = |pairs: &[(&str, &str)]| -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(s, v)| (s.to_string(), v.to_string()))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    };

    assert_eq!(
        ctl.routes.entries(),
        expect(&[
            ("192.168.1.0/24", &gw1.node.address),
            ("192.168.2.0/24", &gw1.node.address),
            ("172.16.0.0/16", &gw2.node.address),
        ])
    );

    // Changing gw1's network set swaps its routes, leaves gw2's alone
    ctl.orchestrator
        .update_node(
            gw1.node.id,
            NodeUpdate {
                gateway_networks: Some(vec![GatewayNetwork::new("192.168.9.0/24")]),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(
        ctl.routes.entries(),
        expect(&[
            ("192.168.9.0/24", &gw1.node.address),
            ("172.16.0.0/16", &gw2.node.address),
        ])
    );

    // Disabling gw2 withdraws only its routes
    ctl.orchestrator.set_enabled(gw2.node.id, false).await.unwrap();
    assert_eq!(
        ctl.routes.entries(),
        expect(&[("192.168.9.0/24", &gw1.node.address)])
    );

    // Deleting gw1 empties the table
    ctl.orchestrator.delete_node(gw1.node.id).await.unwrap();
    assert!(ctl.routes.entries().is_empty());
}

#[tokio::test]
async fn disable_then_reenable_restores_route_set() {
    let ctl = controller();
    let gw = ctl
        .orchestrator
        .create_node(params("gw", &["192.168.1.0/24", "10.99.0.0/16"]), None)
        .await
        .unwrap();

    let before = ctl.routes.entries();
    assert_eq!(before.len(), 2);

    ctl.orchestrator.set_enabled(gw.node.id, false).await.unwrap();
    assert!(ctl.routes.entries().is_empty());

    ctl.orchestrator.set_enabled(gw.node.id, true).await.unwrap();
    assert_eq!(ctl.routes.entries(), before);
}

#[tokio::test]
async fn regenerate_rotates_credentials_preserving_identity() {
    let ctl = controller();
    let created = ctl
        .orchestrator
        .create_node(params("node-a", &[]), None)
        .await
        .unwrap();
    let old = created.node.clone();

    let rotated = ctl
        .orchestrator
        .regenerate_credentials(old.id)
        .await
        .unwrap();

    assert_eq!(rotated.node.id, old.id);
    assert_ne!(rotated.node.public_key, old.public_key);
    assert_ne!(rotated.node.private_key, old.private_key);
    assert_ne!(rotated.node.address, old.address);

    // Every prior token is dead; exactly one fresh default remains
    assert!(ctl.tokens.verify(&created.token).unwrap().is_none());
    assert!(ctl.tokens.verify(&rotated.token).unwrap().is_some());
    let active = ctl
        .tokens
        .list(old.id)
        .unwrap()
        .into_iter()
        .filter(|t| !t.is_revoked())
        .count();
    assert_eq!(active, 1);
}

#[tokio::test]
async fn local_node_rejects_mutation() {
    let ctl = controller();
    ctl.orchestrator.initialize("controller").await.unwrap();

    let local = ctl
        .orchestrator
        .list_nodes()
        .unwrap()
        .into_iter()
        .find(|n| n.is_local)
        .unwrap();
    assert_eq!(local.address, "10.8.0.1");

    assert!(matches!(
        ctl.orchestrator.delete_node(local.id).await,
        Err(Error::Immutable(_))
    ));
    assert!(matches!(
        ctl.orchestrator.regenerate_credentials(local.id).await,
        Err(Error::Immutable(_))
    ));
    assert!(matches!(
        ctl.orchestrator.set_enabled(local.id, false).await,
        Err(Error::Immutable(_))
    ));

    // In particular the controller can never route a gateway subnet
    // through its own tunnel address
    assert!(matches!(
        ctl.orchestrator
            .update_node(
                local.id,
                NodeUpdate {
                    is_gateway: Some(true),
                    gateway_networks: Some(vec![GatewayNetwork::new("192.168.50.0/24")]),
                    ..Default::default()
                },
            )
            .await,
        Err(Error::Immutable(_))
    ));
    assert!(ctl.routes.entries().is_empty());

    // Registry unchanged
    let unchanged = ctl.orchestrator.get_node(local.id).unwrap();
    assert!(!unchanged.is_gateway);
}

#[tokio::test]
async fn initialize_restores_routes_after_reboot() {
    let ctl = controller();
    ctl.orchestrator.initialize("controller").await.unwrap();
    ctl.orchestrator
        .create_node(params("gw", &["192.168.1.0/24"]), None)
        .await
        .unwrap();

    ctl.routes.clear();
    ctl.orchestrator.initialize("controller").await.unwrap();

    assert_eq!(ctl.routes.subnets(), vec!["192.168.1.0/24"]);
    let locals = ctl
        .orchestrator
        .list_nodes()
        .unwrap()
        .into_iter()
        .filter(|n| n.is_local)
        .count();
    assert_eq!(locals, 1);
}

#[tokio::test]
async fn unknown_node_is_not_found() {
    let ctl = controller();
    let id = uuid::Uuid::new_v4();
    assert!(matches!(
        ctl.orchestrator.get_node(id),
        Err(Error::NotFound { .. })
    ));
    assert!(matches!(
        ctl.orchestrator.delete_node(id).await,
        Err(Error::NotFound { .. })
    ));
}
