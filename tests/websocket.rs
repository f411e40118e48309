//! End-to-end tests for the upgrade pipeline.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;

use pass_proxy::{ws_pass, CallOptions, EventHooks, ProxyOptions, ProxyServer, Signal};

mod common;

fn ws_target(addr: std::net::SocketAddr) -> ProxyOptions {
    ProxyOptions {
        ws: Some(true),
        ..ProxyOptions::with_target(format!("ws://{addr}"))
    }
}

#[tokio::test]
async fn test_messages_are_relayed_both_ways() {
    let backend = common::start_ws_echo_backend().await;
    let opened = Arc::new(AtomicUsize::new(0));
    let closed = Arc::new(AtomicUsize::new(0));
    let requests = Arc::new(AtomicUsize::new(0));
    let (o, c, r) = (opened.clone(), closed.clone(), requests.clone());
    let events = EventHooks::new()
        .on_proxy_req_ws(move |outgoing, _, _| {
            assert_eq!(outgoing.headers["upgrade"], "websocket");
            r.fetch_add(1, Ordering::SeqCst);
        })
        .on_open(move |_| {
            o.fetch_add(1, Ordering::SeqCst);
        })
        .on_close(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
    let (proxy, addr) = common::start_proxy(ws_target(backend), events).await;

    let (mut socket, response) = tokio_tungstenite::connect_async(format!("ws://{addr}/chat"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SWITCHING_PROTOCOLS);

    socket.send(Message::text("hello")).await.unwrap();
    let echoed = tokio::time::timeout(Duration::from_secs(1), socket.next())
        .await
        .expect("echo should arrive")
        .unwrap()
        .unwrap();
    assert_eq!(echoed.to_text().unwrap(), "hello");

    socket.send(Message::binary(vec![1u8, 2, 3])).await.unwrap();
    let echoed = socket.next().await.unwrap().unwrap();
    assert_eq!(echoed.into_data().to_vec(), vec![1u8, 2, 3]);

    socket.close(None).await.unwrap();
    drop(socket);

    for _ in 0..100 {
        if closed.load(Ordering::SeqCst) == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(requests.load(Ordering::SeqCst), 1);
    assert_eq!(opened.load(Ordering::SeqCst), 1);
    assert_eq!(closed.load(Ordering::SeqCst), 1);
    proxy.close().await;
}

#[tokio::test]
async fn test_non_websocket_request_is_rejected() {
    let backend = common::start_ws_echo_backend().await;
    let proxy = ProxyServer::new(ws_target(backend));

    let request = Request::post("/chat").body(Body::empty()).unwrap();
    let response = proxy.ws(request, CallOptions::new()).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_refused_upgrade_is_relayed_as_a_response() {
    let backend = common::start_raw_backend(
        "HTTP/1.1 403 Forbidden\r\nContent-Length: 6\r\nConnection: close\r\n\r\ndenied",
    )
    .await;
    let (proxy, addr) = common::start_proxy(ws_target(backend), EventHooks::new()).await;

    let err = tokio_tungstenite::connect_async(format!("ws://{addr}/chat"))
        .await
        .unwrap_err();
    match err {
        tokio_tungstenite::tungstenite::Error::Http(response) => {
            assert_eq!(response.status(), StatusCode::FORBIDDEN);
        }
        other => panic!("expected an HTTP error, got {other:?}"),
    }
    proxy.close().await;
}

#[tokio::test]
async fn test_ws_passes_can_be_spliced() {
    let backend = common::start_ws_echo_backend().await;
    let proxy = ProxyServer::new(ws_target(backend));
    proxy
        .after(
            "ws",
            "check_method_and_header",
            ws_pass("deny", |ex| {
                ex.response.end_with(StatusCode::UNAUTHORIZED, "no");
                Signal::Halt
            }),
        )
        .unwrap();
    assert_eq!(
        proxy.ws_pass_names(),
        vec!["check_method_and_header", "deny", "x_headers", "stream"]
    );

    let request = Request::get("/chat")
        .header("upgrade", "websocket")
        .header("connection", "upgrade")
        .body(Body::empty())
        .unwrap();
    let response = proxy.ws(request, CallOptions::new()).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_missing_upgrade_target_goes_to_error_hook() {
    let errors = Arc::new(AtomicUsize::new(0));
    let seen = errors.clone();
    let options = ProxyOptions {
        ws: Some(true),
        ..ProxyOptions::with_forward("http://127.0.0.1:9")
    };
    let proxy = ProxyServer::with_events(
        options,
        EventHooks::new().on_error(move |_, _, _| {
            seen.fetch_add(1, Ordering::SeqCst);
            None
        }),
    );

    let request = Request::get("/chat")
        .header("upgrade", "websocket")
        .header("connection", "upgrade")
        .body(Body::empty())
        .unwrap();
    let response = proxy.ws(request, CallOptions::new()).await.unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(errors.load(Ordering::SeqCst), 1);
}
