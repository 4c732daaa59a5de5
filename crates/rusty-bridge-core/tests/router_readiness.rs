mod common;

use std::sync::Arc;

use serde_json::json;

use common::{harness, harness_with, request, ReentrantPorts};
use rusty_bridge_core::{SessionKey, MAIN_FRAME_PEER};

const A: &str = "https://a.example";
const B: &str = "https://b.example";

#[tokio::test]
async fn queued_messages_flush_in_arrival_order_once() {
    let h = harness();
    h.router
        .dispatch_inbound(A, MAIN_FRAME_PEER, request(1, "eth_chainId"))
        .expect("queue a");
    h.router
        .dispatch_inbound(B, MAIN_FRAME_PEER, request(2, "eth_chainId"))
        .expect("queue b");
    h.router
        .dispatch_inbound(A, MAIN_FRAME_PEER, request(3, "net_version"))
        .expect("queue a again");

    assert_eq!(h.router.pending_len().expect("pending"), 3);
    assert!(h.ports.opened().is_empty(), "no session before readiness");

    assert_eq!(h.router.on_backend_ready().expect("ready"), 3);
    assert_eq!(h.router.pending_len().expect("pending"), 0);
    assert_eq!(
        h.ports.opened(),
        vec![SessionKey::main_frame(A), SessionKey::main_frame(B)]
    );

    let a = h.ports.transport(A, MAIN_FRAME_PEER);
    assert_eq!(a.next_response().await.id, json!(1));
    assert_eq!(a.next_response().await.id, json!(3));
    let b = h.ports.transport(B, MAIN_FRAME_PEER);
    assert_eq!(b.next_response().await.id, json!(2));

    assert_eq!(h.router.on_backend_ready().expect("second ready"), 0);
    assert_eq!(h.router.sessions().expect("sessions").len(), 2);
}

#[tokio::test]
async fn message_arriving_mid_flush_queues_behind_the_flush() {
    let ports = ReentrantPorts::new(A, MAIN_FRAME_PEER, request(3, "net_version"));
    let h = harness_with(Arc::clone(&ports));
    let router = Arc::new(h.router);
    ports.bind(&router);

    router
        .dispatch_inbound(A, MAIN_FRAME_PEER, request(1, "eth_chainId"))
        .expect("queue first");
    router
        .dispatch_inbound(A, MAIN_FRAME_PEER, request(2, "eth_chainId"))
        .expect("queue second");
    assert_eq!(router.pending_len().expect("pending"), 2);

    assert_eq!(router.on_backend_ready().expect("ready"), 3);
    // The third message went in while the second was still queued.
    assert_eq!(ports.pending_after_inject(), Some(2));
    assert_eq!(router.pending_len().expect("pending"), 0);
    assert!(router.is_ready().expect("ready flag"));
    assert_eq!(ports.ports.opened(), vec![SessionKey::main_frame(A)]);

    let transport = ports.ports.transport(A, MAIN_FRAME_PEER);
    assert_eq!(transport.next_response().await.id, json!(1));
    assert_eq!(transport.next_response().await.id, json!(2));
    assert_eq!(transport.next_response().await.id, json!(3));

    router
        .dispatch_inbound(A, MAIN_FRAME_PEER, request(4, "eth_chainId"))
        .expect("dispatch after ready");
    assert_eq!(transport.next_response().await.id, json!(4));
    assert_eq!(transport.sent().len(), 4);
}

#[tokio::test]
async fn messages_after_readiness_are_routed_directly() {
    let h = harness();
    h.router.on_backend_ready().expect("ready");
    assert!(h.router.is_ready().expect("ready flag"));

    h.router
        .dispatch_inbound(A, MAIN_FRAME_PEER, request(9, "eth_blockNumber"))
        .expect("dispatch");
    let response = h.ports.transport(A, MAIN_FRAME_PEER).next_response().await;
    assert_eq!(response.id, json!(9));
    assert_eq!(response.result, Some(json!("0x10")));
    assert_eq!(h.dispatcher.hostnames.lock().expect("hostnames").clone(), vec!["a.example"]);
}

#[tokio::test]
async fn malformed_payloads_are_dropped_quietly() {
    let h = harness();
    h.router.on_backend_ready().expect("ready");

    for payload in [
        json!("not json at all"),
        json!({ "data": { "id": 1, "method": "eth_chainId" } }),
        json!({ "name": "metamask-provider", "data": { "id": 1 } }),
        json!(42),
    ] {
        h.router
            .dispatch_inbound(A, MAIN_FRAME_PEER, payload)
            .expect("malformed input is not an error");
    }
    assert!(h.ports.opened().is_empty());
    assert!(h.router.sessions().expect("sessions").is_empty());
}

#[tokio::test]
async fn failed_session_construction_leaves_registry_clean() {
    let h = harness();
    h.router.on_backend_ready().expect("ready");
    h.ports.fail_next_open();

    let err = h
        .router
        .dispatch_inbound(A, MAIN_FRAME_PEER, request(1, "eth_chainId"))
        .expect_err("port open fails");
    assert!(err.to_string().contains("port refused"));
    assert!(h.router.find_session(A, MAIN_FRAME_PEER).expect("find").is_none());

    h.router
        .dispatch_inbound(A, MAIN_FRAME_PEER, request(2, "eth_chainId"))
        .expect("retry succeeds");
    let response = h.ports.transport(A, MAIN_FRAME_PEER).next_response().await;
    assert_eq!(response.id, json!(2));
}

#[tokio::test]
async fn find_session_matches_both_key_parts() {
    let h = harness();
    h.router.on_backend_ready().expect("ready");
    h.router
        .dispatch_inbound(A, MAIN_FRAME_PEER, request(1, "eth_chainId"))
        .expect("dispatch");

    assert!(h.router.find_session(A, MAIN_FRAME_PEER).expect("find").is_some());
    assert!(h.router.find_session(A, "frame-1").expect("find").is_none());
    assert!(h.router.find_session(B, MAIN_FRAME_PEER).expect("find").is_none());
}

#[tokio::test]
async fn host_post_message_routes_by_parsed_origin() {
    let h = harness();
    h.router.on_backend_ready().expect("ready");

    let raw = json!({
        "name": "metamask-provider",
        "origin": "https://app.example:8443/swap?pair=eth",
        "data": { "id": 5, "method": "test_origin", "params": [] }
    })
    .to_string();
    h.router
        .post_message(json!(raw))
        .expect("post message");

    let transport = h.ports.transport("https://app.example:8443", MAIN_FRAME_PEER);
    let response = transport.next_response().await;
    assert_eq!(response.result, Some(json!("https://app.example:8443")));
    assert_eq!(transport.sent()[0].1, "https://app.example:8443");

    h.router
        .post_message(json!({
            "name": "metamask-provider",
            "data": { "id": 6, "method": "eth_chainId" }
        }))
        .expect("missing origin is dropped");
    assert_eq!(h.ports.opened().len(), 1);
}

#[tokio::test]
async fn page_cannot_spoof_the_request_origin() {
    let h = harness();
    h.router.on_backend_ready().expect("ready");
    h.router
        .dispatch_inbound(
            A,
            MAIN_FRAME_PEER,
            json!({
                "name": "metamask-provider",
                "data": { "id": 1, "method": "test_origin", "origin": "https://evil.example" }
            }),
        )
        .expect("dispatch");
    let response = h.ports.transport(A, MAIN_FRAME_PEER).next_response().await;
    assert_eq!(response.result, Some(json!(A)));
}
