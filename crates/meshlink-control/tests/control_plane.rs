use std::collections::BTreeSet;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use meshlink_control::api::{router, LoginResponse, PEER_KEY_HEADER};
use meshlink_control::model::{NetworkMap, NewGroup, NewNetwork, NewPeer, NewResource, NewRouter};
use meshlink_control::{ControlConfig, ControlPlane, SetupKey};
use serde_json::{json, Value};
use meshlink_crypto::KeyPair;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

const ADMIN: &str = "admin-secret";

fn plane(range: &str) -> ControlPlane {
    ControlPlane::new(ControlConfig {
        network_range: range.parse().unwrap(),
        setup_keys: vec![SetupKey::new("join-me", "default", vec!["laptops".into()])],
        long_poll_timeout: Duration::from_secs(1),
        ..Default::default()
    })
    .unwrap()
}

async fn register(plane: &ControlPlane, id: &str) {
    plane
        .registry
        .register(NewPeer {
            id: id.into(),
            public_key: KeyPair::generate().public,
            hostname: id.into(),
            address_candidates: Vec::new(),
        })
        .await
        .unwrap();
}

fn login_request(body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/api/agent/login")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn agent_sync_request(peer_id: &str, keys: &KeyPair) -> Request<Body> {
    Request::builder()
        .uri(format!("/api/agent/{}/sync?serial=0", peer_id))
        .header(PEER_KEY_HEADER, keys.public.to_string())
        .body(Body::empty())
        .unwrap()
}

async fn body_json<T: serde::de::DeserializeOwned>(response: axum::response::Response) -> T {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn admin_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {}", ADMIN))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn test_router_route_reaches_group_member() {
    let plane = plane("100.64.0.0/24");
    register(&plane, "p").await;
    register(&plane, "q").await;

    let cancel = CancellationToken::new();
    let task = plane.spawn_sync(cancel.clone());

    let before = plane
        .sync
        .wait_for_newer("q", 0, Duration::from_secs(2))
        .await
        .unwrap();
    assert!(before.routes.is_empty());

    plane
        .store
        .mutate(|t| {
            let staff = t.create_group(NewGroup {
                name: "staff".into(),
                peers: BTreeSet::from(["q".to_string()]),
            })?;
            let net = t.create_network(NewNetwork { name: "office".into(), ..Default::default() })?;
            t.add_resource(
                &net.id,
                NewResource {
                    name: "lan".into(),
                    cidr: "10.50.0.0/24".parse().unwrap(),
                    enabled: true,
                    groups: BTreeSet::from([staff.id]),
                },
            )?;
            t.add_router(&net.id, NewRouter { peer_id: "p".into(), metric: 100, masquerade: true, enabled: true })
        })
        .await
        .unwrap();

    let after = plane
        .sync
        .wait_for_newer("q", before.serial, Duration::from_secs(2))
        .await
        .unwrap();
    let route = after.routes.get(&"10.50.0.0/24".parse().unwrap()).unwrap();
    assert_eq!(route.gateway_peer_id, "p");
    assert!(route.masquerade);
    assert!(!route.is_local_gateway);
    assert!(after.remote_peers.iter().any(|r| r.id == "p"));

    let gateway = plane.sync.current("p").unwrap();
    assert!(gateway.routes.get(&"10.50.0.0/24".parse().unwrap()).unwrap().is_local_gateway);

    cancel.cancel();
    task.await.unwrap();
}

#[tokio::test]
async fn test_admin_routes_require_bearer_token() {
    let plane = plane("100.64.0.0/24");
    let app = router(plane.api_state(ADMIN));

    let response = app
        .clone()
        .oneshot(Request::builder().uri("/api/peers").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/peers")
                .header(header::AUTHORIZATION, "Bearer wrong")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .oneshot(admin_request("GET", "/api/peers", serde_json::Value::Null))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_login_and_sync_over_http() {
    let plane = plane("100.64.0.0/24");
    let app = router(plane.api_state(ADMIN));
    let keys = KeyPair::generate();

    let login = serde_json::json!({
        "setup_key": "join-me",
        "public_key": keys.public.to_string(),
        "hostname": "laptop-1",
    });
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/agent/login")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(login.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let login: LoginResponse = body_json(response).await;
    assert_eq!(login.peer.peer.hostname, "laptop-1");
    assert_eq!(login.peer.groups.len(), 2);
    assert!(login.peer.groups.iter().any(|g| g.name == "laptops"));
    assert_eq!(login.network_map.peer.overlay_ip, login.peer.peer.assigned_overlay_ip);

    plane.sync.sync_all().await.unwrap();
    let uri = format!("/api/agent/{}/sync?serial=0", login.peer.peer.id);

    let response = app
        .clone()
        .oneshot(Request::builder().uri(&uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .oneshot(
            Request::builder()
                .uri(&uri)
                .header(PEER_KEY_HEADER, keys.public.to_string())
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let map: NetworkMap = body_json(response).await;
    assert_eq!(map.peer.id, login.peer.peer.id);
}

#[tokio::test]
async fn test_bad_setup_key_is_rejected() {
    let plane = plane("100.64.0.0/24");
    let app = router(plane.api_state(ADMIN));

    let login = serde_json::json!({
        "setup_key": "nope",
        "public_key": KeyPair::generate().public.to_string(),
        "hostname": "intruder",
    });
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/agent/login")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(login.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_pool_exhaustion_surfaces_as_conflict() {
    // a /30 has two assignable addresses
    let plane = plane("10.9.0.0/30");
    register(&plane, "a").await;
    register(&plane, "b").await;
    let app = router(plane.api_state(ADMIN));

    let login = serde_json::json!({
        "setup_key": "join-me",
        "public_key": KeyPair::generate().public.to_string(),
        "hostname": "third",
    });
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/agent/login")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(login.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
    let error: serde_json::Value = body_json(response).await;
    assert_eq!(error["code"], "pool_exhausted");
}

#[tokio::test]
async fn test_address_conflict_leaves_peer_unchanged() {
    let plane = plane("100.64.0.0/24");
    register(&plane, "a").await;
    register(&plane, "b").await;
    let app = router(plane.api_state(ADMIN));
    let a_ip = plane.registry.lookup("a").await.unwrap().peer.assigned_overlay_ip;

    let response = app
        .clone()
        .oneshot(admin_request(
            "PUT",
            "/api/peers/b",
            serde_json::json!({ "hostname": "renamed", "ip": a_ip.to_string() }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);

    let b = plane.registry.lookup("b").await.unwrap();
    assert_eq!(b.peer.hostname, "b");
}

#[tokio::test]
async fn test_network_crud_over_http() {
    let plane = plane("100.64.0.0/24");
    register(&plane, "gw").await;
    let app = router(plane.api_state(ADMIN));

    let response = app
        .clone()
        .oneshot(admin_request("POST", "/api/networks", serde_json::json!({ "name": "office" })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let network: serde_json::Value = body_json(response).await;
    let id = network["id"].as_str().unwrap().to_string();

    let response = app
        .clone()
        .oneshot(admin_request(
            "POST",
            &format!("/api/networks/{}/routers", id),
            serde_json::json!({ "peer_id": "gw", "metric": 10 }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let response = app
        .clone()
        .oneshot(admin_request(
            "POST",
            &format!("/api/networks/{}/routers", id),
            serde_json::json!({ "peer_id": "ghost" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = app
        .oneshot(admin_request("GET", "/api/networks", serde_json::Value::Null))
        .await
        .unwrap();
    let networks: serde_json::Value = body_json(response).await;
    assert_eq!(networks[0]["routers"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_admin_flow_from_fresh_account() {
    let plane = ControlPlane::new(ControlConfig {
        long_poll_timeout: Duration::from_secs(1),
        ..Default::default()
    })
    .unwrap();
    let app = router(plane.api_state(ADMIN));

    // Account: clear onboarding, move the overlay range
    let response = app
        .clone()
        .oneshot(admin_request("GET", "/api/accounts", Value::Null))
        .await
        .unwrap();
    let accounts: Value = body_json(response).await;
    let mut account = accounts[0].clone();
    assert_eq!(account["onboarding"]["onboarding_flow_pending"], true);

    account["onboarding"]["onboarding_flow_pending"] = false.into();
    account["onboarding"]["signup_form_pending"] = false.into();
    account["settings"]["network_range"] = "100.70.0.0/16".into();
    let body = json!({
        "onboarding": account["onboarding"],
        "settings": account["settings"],
    });
    let uri = format!("/api/accounts/{}", account["id"].as_str().unwrap());
    let response = app.clone().oneshot(admin_request("PUT", &uri, body)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .clone()
        .oneshot(admin_request("GET", "/api/accounts", Value::Null))
        .await
        .unwrap();
    let accounts: Value = body_json(response).await;
    assert_eq!(accounts[0]["onboarding"]["onboarding_flow_pending"], false);
    assert_eq!(accounts[0]["onboarding"]["signup_form_pending"], false);
    assert_eq!(accounts[0]["settings"]["network_range"], "100.70.0.0/16");

    // Setup key
    let body = json!({
        "name": "test-setup-key",
        "type": "reusable",
        "expires_in": 86400,
        "auto_groups": [],
        "usage_limit": 0,
    });
    let response = app
        .clone()
        .oneshot(admin_request("POST", "/api/setup-keys", body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let setup_key: Value = body_json(response).await;
    assert_eq!(setup_key["type"], "reusable");
    assert_eq!(setup_key["valid"], true);
    let secret = setup_key["key"].as_str().unwrap().to_string();

    // Two agents join with it
    let machine2_keys = KeyPair::generate();
    let machine4_keys = KeyPair::generate();
    for (hostname, keys) in [("machine2", &machine2_keys), ("machine4", &machine4_keys)] {
        let response = app
            .clone()
            .oneshot(login_request(json!({
                "setup_key": secret,
                "public_key": keys.public.to_string(),
                "hostname": hostname,
            })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let response = app
        .clone()
        .oneshot(admin_request("GET", "/api/setup-keys", Value::Null))
        .await
        .unwrap();
    let keys: Value = body_json(response).await;
    assert_eq!(keys[0]["used_times"], 2);

    // Pin predictable overlay addresses by sending the listed peers back
    let response = app
        .clone()
        .oneshot(admin_request("GET", "/api/peers", Value::Null))
        .await
        .unwrap();
    let peers: Value = body_json(response).await;
    let find = |hostname: &str| {
        peers
            .as_array()
            .unwrap()
            .iter()
            .find(|p| p["hostname"] == hostname)
            .cloned()
            .unwrap()
    };
    let mut machine2 = find("machine2");
    let mut machine4 = find("machine4");
    machine2["ip"] = "100.70.0.10".into();
    machine4["ip"] = "100.70.0.20".into();

    for peer in [&machine2, &machine4] {
        let uri = format!("/api/peers/{}", peer["id"].as_str().unwrap());
        let response = app
            .clone()
            .oneshot(admin_request("PUT", &uri, peer.clone()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let updated: Value = body_json(response).await;
        assert_eq!(updated["ip"], peer["ip"]);
        assert_eq!(updated["groups"], peer["groups"]);
    }

    let machine2_id = machine2["id"].as_str().unwrap().to_string();
    let machine4_id = machine4["id"].as_str().unwrap().to_string();
    let response = app
        .clone()
        .oneshot(admin_request("GET", &format!("/api/peers/{}", machine2_id), Value::Null))
        .await
        .unwrap();
    let reread: Value = body_json(response).await;
    assert_eq!(reread["ip"], "100.70.0.10");

    // Network, resource, router
    let response = app
        .clone()
        .oneshot(admin_request("POST", "/api/networks", json!({ "name": "lan-network" })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let network: Value = body_json(response).await;
    let network_id = network["id"].as_str().unwrap().to_string();

    let body = json!({
        "name": "lan-network-resource",
        "address": "192.168.1.0/24",
        "enabled": true,
        "groups": [machine2["groups"][0]["id"]],
    });
    let response = app
        .clone()
        .oneshot(admin_request("POST", &format!("/api/networks/{}/resources", network_id), body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let resource: Value = body_json(response).await;
    assert_eq!(resource["address"], "192.168.1.0/24");

    let body = json!({
        "peer": machine2_id,
        "metric": 1,
        "masquerade": false,
        "enabled": true,
    });
    let response = app
        .clone()
        .oneshot(admin_request("POST", &format!("/api/networks/{}/routers", network_id), body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let router_json: Value = body_json(response).await;
    assert_eq!(router_json["peer"], machine2_id.as_str());

    // The gateway sees the network as its own, the other peer routes via it
    plane.sync.sync_all().await.unwrap();
    let lan = "192.168.1.0/24".parse().unwrap();

    let response = app
        .clone()
        .oneshot(agent_sync_request(&machine2_id, &machine2_keys))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let gateway_map: NetworkMap = body_json(response).await;
    assert!(gateway_map.routes.get(&lan).unwrap().is_local_gateway);
    assert_eq!(gateway_map.peer.overlay_ip.to_string(), "100.70.0.10");

    let response = app
        .oneshot(agent_sync_request(&machine4_id, &machine4_keys))
        .await
        .unwrap();
    let client_map: NetworkMap = body_json(response).await;
    let route = client_map.routes.get(&lan).unwrap();
    assert_eq!(route.gateway_peer_id, machine2_id);
    assert_eq!(route.gateway_ip.to_string(), "100.70.0.10");
    assert_eq!(client_map.remote_peers.len(), 1);
}

#[tokio::test]
async fn test_one_off_setup_key_over_http() {
    let plane = plane("100.64.0.0/24");
    let app = router(plane.api_state(ADMIN));

    let body = json!({ "name": "once", "type": "one-off", "expires_in": 0, "auto_groups": [], "usage_limit": 0 });
    let response = app
        .clone()
        .oneshot(admin_request("POST", "/api/setup-keys", body))
        .await
        .unwrap();
    let key: Value = body_json(response).await;
    let secret = key["key"].as_str().unwrap().to_string();

    let join = |hostname: &str| {
        login_request(json!({
            "setup_key": secret,
            "public_key": KeyPair::generate().public.to_string(),
            "hostname": hostname,
        }))
    };
    let response = app.clone().oneshot(join("first")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app.clone().oneshot(join("second")).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let error: Value = body_json(response).await;
    assert_eq!(error["code"], "setup_key_rejected");

    let response = app
        .oneshot(admin_request("GET", "/api/setup-keys", Value::Null))
        .await
        .unwrap();
    let keys: Value = body_json(response).await;
    let once = keys.as_array().unwrap().iter().find(|k| k["name"] == "once").unwrap();
    assert_eq!(once["valid"], false);
}
