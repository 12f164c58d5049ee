//! Integration tests for USB clients mirrored into a remote room.
//!
//! Two relays run side by side: a "hosted" relay the front-end joins, and a
//! "local" relay in bridge mode that USB runtimes attach to. Templates come
//! from a wiremock HTTP server.

use std::future::Future;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use devtool_relay::config::{room_url, BridgeSettings};
use devtool_relay::fragment::{FragmentHeader, Reassembler};
use devtool_relay::protocol::{
    message_type, ClientDescriptor, ClientId, ClientInfo, ClientRole, CustomMessageFrame, Frame,
    RegisterFrame, Session, SessionListFrame, TransportKind,
};
use devtool_relay::transport::{usb, Connection, Inbound, Registered};
use devtool_relay::{RelayConfig, RelayServer};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const WAIT: Duration = Duration::from_secs(5);
const REMOTE_ROOM: &str = "remote";

struct Deployment {
    hosted_endpoint: String,
    local_usb: String,
    shutdown: CancellationToken,
}

impl Drop for Deployment {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn deploy(fragment_threshold: usize) -> Deployment {
    let shutdown = CancellationToken::new();

    let hosted = RelayServer::bind(RelayConfig {
        ws_addr: "127.0.0.1:0".to_string(),
        usb_addr: None,
        ..RelayConfig::default()
    })
    .await
    .unwrap();
    let hosted_endpoint = format!("ws://{}/ws", hosted.local_addr());
    tokio::spawn(hosted.run(shutdown.clone()));

    let local = RelayServer::bind(RelayConfig {
        ws_addr: "127.0.0.1:0".to_string(),
        usb_addr: Some("127.0.0.1:0".to_string()),
        fragment_threshold,
        bridge: Some(BridgeSettings {
            endpoint: hosted_endpoint.clone(),
            room: REMOTE_ROOM.to_string(),
        }),
        ..RelayConfig::default()
    })
    .await
    .unwrap();
    let local_usb = local.usb_addr().unwrap().to_string();
    tokio::spawn(local.run(shutdown.clone()));

    Deployment {
        hosted_endpoint,
        local_usb,
        shutdown,
    }
}

async fn within<T>(future: impl Future<Output = T>) -> T {
    tokio::time::timeout(WAIT, future).await.expect("timed out")
}

async fn connect_usb(deployment: &Deployment) -> Registered {
    let (writer, reader) = usb::connect(&deployment.local_usb).await.unwrap();
    let info = ClientInfo {
        app_id: Some("com.example.app".into()),
        did: Some("device-1".into()),
        ..ClientInfo::default()
    };
    Connection::register_over("usb", writer, reader, RegisterFrame::new(ClientRole::Runtime, info))
        .await
        .unwrap()
}

async fn connect_frontend(deployment: &Deployment) -> Registered {
    Connection::connect(
        &room_url(&deployment.hosted_endpoint, REMOTE_ROOM),
        RegisterFrame::new(ClientRole::Web, ClientInfo::default()),
    )
    .await
    .unwrap()
}

/// Wait until the hosted room lists the bridged client.
async fn bridged_client(inbound: &mut Inbound) -> ClientDescriptor {
    within(async {
        loop {
            if let Some(Frame::ClientList(list)) = inbound.recv().await {
                if let Some(client) = list.into_iter().next() {
                    return client;
                }
            }
        }
    })
    .await
}

async fn next_matching<T>(inbound: &mut Inbound, pick: impl Fn(Frame) -> Option<T>) -> T {
    within(async {
        loop {
            let frame = inbound.recv().await.expect("connection closed");
            if let Some(found) = pick(frame) {
                return found;
            }
        }
    })
    .await
}

fn page_reload(target: ClientId, session: i64, url: &str) -> Frame {
    let message = json!({"id": 11, "method": "Page.reload", "params": {"url": url}});
    Frame::Custom(CustomMessageFrame::new(
        message_type::CDP,
        target,
        session,
        Value::String(message.to_string()),
        target,
    ))
}

async fn template_server(body: &[u8]) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/dist/main.bundle"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body.to_vec()))
        .mount(&server)
        .await;
    server
}

#[tokio::test]
async fn test_usb_client_appears_in_remote_room_with_own_id() {
    let deployment = deploy(1_024_000).await;
    let mut frontend = connect_frontend(&deployment).await;
    let usb = connect_usb(&deployment).await;

    let client = bridged_client(&mut frontend.inbound).await;
    assert_eq!(client.transport, TransportKind::FakeSocket);
    assert_eq!(client.role, ClientRole::Runtime);
    assert_eq!(client.info.app_id.as_deref(), Some("com.example.app"));

    usb.connection
        .send(&Frame::SessionList(SessionListFrame {
            client_id: usb.id,
            sessions: vec![Session::new(4, "https://example.com/card")],
            sender: usb.id,
        }))
        .unwrap();

    let list = next_matching(&mut frontend.inbound, |frame| match frame {
        Frame::SessionList(list) => Some(list),
        _ => None,
    })
    .await;
    assert_eq!(list.client_id, client.id);
    assert_eq!(list.sender, client.id);
    assert_eq!(list.sessions[0].id, 4);
}

#[tokio::test]
async fn test_page_reload_template_is_inlined() {
    let templates = template_server(b"template-bytes").await;
    let deployment = deploy(1_024_000).await;
    let mut frontend = connect_frontend(&deployment).await;
    let mut usb = connect_usb(&deployment).await;
    let client = bridged_client(&mut frontend.inbound).await;

    let url = format!("{}/dist/main.bundle", templates.uri());
    frontend.connection.send(&page_reload(client.id, 4, &url)).unwrap();

    let delivered = next_matching(&mut usb.inbound, |frame| match frame {
        Frame::Custom(custom) if custom.kind == message_type::CDP => Some(custom),
        _ => None,
    })
    .await;
    assert!(delivered.client_id.is_unaddressed());
    assert_eq!(delivered.session_id, 4);

    let message = delivered.message_json().unwrap();
    let data = message["params"]["pageData"].as_str().unwrap();
    assert_eq!(STANDARD.decode(data).unwrap(), b"template-bytes");
    assert!(message["params"]["timestamp"].as_i64().is_some());
}

#[tokio::test]
async fn test_large_template_arrives_as_fragments() {
    let body: Vec<u8> = (0..50u8).collect();
    let templates = template_server(&body).await;
    let deployment = deploy(16).await;
    let mut frontend = connect_frontend(&deployment).await;
    let mut usb = connect_usb(&deployment).await;
    let client = bridged_client(&mut frontend.inbound).await;

    let url = format!("{}/dist/main.bundle", templates.uri());
    frontend.connection.send(&page_reload(client.id, 9, &url)).unwrap();

    let header = next_matching(&mut usb.inbound, |frame| match frame {
        Frame::Custom(custom) if custom.method().as_deref() == Some("Page.reload") => Some(custom),
        _ => None,
    })
    .await;
    let params = header.message_json().unwrap()["params"].clone();
    let header = FragmentHeader::from_params(header.session_id, &params).unwrap();
    assert_eq!(header.total_length, body.len());

    let mut reassembler = Reassembler::new();
    reassembler.begin(&header).unwrap();
    let payload = within(async {
        loop {
            let Some(Frame::Fragment(fragment)) = usb.inbound.recv().await else {
                continue;
            };
            assert_eq!(fragment.frame.session_id, 9);
            if let Some(payload) = reassembler.push(&fragment.envelope).unwrap() {
                return payload;
            }
        }
    })
    .await;
    assert_eq!(payload, body);
}

#[tokio::test]
async fn test_slow_template_does_not_hold_back_other_frames() {
    let templates = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/dist/main.bundle"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(b"slow".to_vec())
                .set_delay(Duration::from_secs(2)),
        )
        .mount(&templates)
        .await;
    let deployment = deploy(1_024_000).await;
    let mut frontend = connect_frontend(&deployment).await;
    let mut usb = connect_usb(&deployment).await;
    let client = bridged_client(&mut frontend.inbound).await;

    let url = format!("{}/dist/main.bundle", templates.uri());
    frontend.connection.send(&page_reload(client.id, 4, &url)).unwrap();
    let enable = json!({"id": 12, "method": "DOM.enable"}).to_string();
    let follow_up = CustomMessageFrame::new(
        message_type::CDP,
        client.id,
        4,
        Value::String(enable),
        client.id,
    );
    frontend.connection.send(&Frame::Custom(follow_up)).unwrap();

    let methods: Vec<String> = within(async {
        let mut methods = Vec::new();
        while methods.len() < 2 {
            if let Some(Frame::Custom(custom)) = usb.inbound.recv().await {
                if let Some(method) = custom.method() {
                    methods.push(method);
                }
            }
        }
        methods
    })
    .await;
    assert_eq!(methods, vec!["DOM.enable".to_string(), "Page.reload".to_string()]);
}

#[tokio::test]
async fn test_usb_disconnect_removes_bridged_client() {
    let deployment = deploy(1_024_000).await;
    let mut frontend = connect_frontend(&deployment).await;
    let usb = connect_usb(&deployment).await;
    bridged_client(&mut frontend.inbound).await;

    usb.connection.close();

    within(async {
        loop {
            if let Some(Frame::ClientList(list)) = frontend.inbound.recv().await {
                if list.is_empty() {
                    break;
                }
            }
        }
    })
    .await;
}
