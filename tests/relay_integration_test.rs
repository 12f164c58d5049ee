//! Integration tests for the relay server.
//!
//! Each test binds a real `RelayServer` on ephemeral ports and talks to it
//! over USB-forwarded TCP and WebSocket, the way runtimes and front-ends do.

use std::future::Future;
use std::time::Duration;

use devtool_relay::config::room_url;
use devtool_relay::frontend::{
    spawn_frontend, FrontendConfig, FrontendEvent, FrontendView, Target, ViewUpdate,
};
use devtool_relay::protocol::{
    message_type, ClientId, ClientInfo, ClientRole, CustomMessageFrame, Frame, RegisterFrame,
    Session, SessionListFrame, TransportKind,
};
use devtool_relay::registry::{SelectionChange, SelectionOptions};
use devtool_relay::transport::{usb, ws, Connection, FrameSource, Inbound, Registered};
use devtool_relay::{RelayConfig, RelayHandle, RelayServer};
use serde_json::json;
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(5);

struct TestRelay {
    ws_endpoint: String,
    usb_addr: String,
    handle: RelayHandle,
    shutdown: CancellationToken,
}

impl Drop for TestRelay {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Start a relay on ephemeral ports.
async fn start_relay() -> TestRelay {
    let config = RelayConfig {
        ws_addr: "127.0.0.1:0".to_string(),
        usb_addr: Some("127.0.0.1:0".to_string()),
        ..RelayConfig::default()
    };
    let server = RelayServer::bind(config).await.unwrap();
    let ws_endpoint = format!("ws://{}/ws", server.local_addr());
    let usb_addr = server.usb_addr().unwrap().to_string();
    let handle = server.handle();
    let shutdown = CancellationToken::new();
    tokio::spawn(server.run(shutdown.clone()));
    TestRelay {
        ws_endpoint,
        usb_addr,
        handle,
        shutdown,
    }
}

fn device_info() -> ClientInfo {
    ClientInfo {
        app_id: Some("com.example.app".into()),
        did: Some("emulator-5554".into()),
        ..ClientInfo::default()
    }
}

async fn connect_usb(relay: &TestRelay) -> Registered {
    let (writer, reader) = usb::connect(&relay.usb_addr).await.unwrap();
    Connection::register_over(
        "usb-runtime",
        writer,
        reader,
        RegisterFrame::new(ClientRole::Runtime, device_info()),
    )
    .await
    .unwrap()
}

async fn connect_web(relay: &TestRelay, room: &str) -> Registered {
    Connection::connect(
        &room_url(&relay.ws_endpoint, room),
        RegisterFrame::new(ClientRole::Web, ClientInfo::default()),
    )
    .await
    .unwrap()
}

async fn within<T>(future: impl Future<Output = T>) -> T {
    tokio::time::timeout(WAIT, future).await.expect("timed out")
}

/// Apply frames to `view` until `done` holds.
async fn pump_until(
    view: &mut FrontendView,
    inbound: &mut Inbound,
    done: impl Fn(&FrontendView) -> bool,
) {
    within(async {
        while !done(view) {
            let frame = inbound.recv().await.expect("relay closed the front-end");
            view.apply(&frame);
        }
    })
    .await;
}

async fn next_custom(inbound: &mut Inbound) -> CustomMessageFrame {
    within(async {
        loop {
            if let Some(Frame::Custom(custom)) = inbound.recv().await {
                return custom;
            }
        }
    })
    .await
}

fn declare_sessions(runtime: &Registered, sessions: Vec<Session>) {
    runtime
        .connection
        .send(&Frame::SessionList(SessionListFrame {
            client_id: runtime.id,
            sessions,
            sender: runtime.id,
        }))
        .unwrap();
}

#[tokio::test]
async fn test_usb_disconnect_clears_frontend_sessions_and_selection() {
    let relay = start_relay().await;

    let runtime = connect_usb(&relay).await;
    declare_sessions(&runtime, vec![Session::new(1, "https://example.com/card")]);

    let mut web = connect_web(&relay, "local").await;
    let mut view = FrontendView::new(SelectionOptions::default());
    let usb_id = runtime.id;
    pump_until(&mut view, &mut web.inbound, |v| {
        !v.registry().sessions(usb_id).is_empty() && v.selection().session().is_some()
    })
    .await;

    let client = view.registry().client(usb_id).unwrap();
    assert_eq!(client.descriptor.transport, TransportKind::Usb);
    assert_eq!(view.selection().client(), Some(usb_id));
    assert_eq!(view.selection().session(), Some(1));

    runtime.connection.close();
    pump_until(&mut view, &mut web.inbound, |v| v.registry().client(usb_id).is_none()).await;

    assert!(view.registry().sessions(usb_id).is_empty());
    assert_eq!(view.selection().session(), None);
    assert_eq!(view.selection().client(), None);
}

#[tokio::test]
async fn test_attached_frontend_reaches_usb_runtime() {
    let relay = start_relay().await;
    let mut runtime = connect_usb(&relay).await;
    let mut web = connect_web(&relay, "local").await;

    let notice = next_custom(&mut web.inbound).await;
    assert_eq!(notice.kind, message_type::SYNC_ATTACHED);

    let request = CustomMessageFrame::new(
        message_type::CDP,
        runtime.id,
        1,
        json!(r#"{"id":1,"method":"DOM.enable"}"#),
        web.id,
    );
    web.connection.send(&Frame::Custom(request)).unwrap();

    let delivered = next_custom(&mut runtime.inbound).await;
    assert_eq!(delivered.kind, message_type::CDP);
    assert_eq!(delivered.sender, web.id);
    assert_eq!(delivered.method().as_deref(), Some("DOM.enable"));
}

#[tokio::test]
async fn test_second_frontend_must_take_over() {
    let relay = start_relay().await;
    let mut first = connect_web(&relay, "local").await;
    let mut second = connect_web(&relay, "local").await;

    assert_eq!(next_custom(&mut first.inbound).await.kind, message_type::SYNC_ATTACHED);
    assert_eq!(next_custom(&mut second.inbound).await.kind, message_type::SYNC_UNATTACHED);

    second.connection.send(&Frame::Attach).unwrap();

    assert_eq!(next_custom(&mut first.inbound).await.kind, message_type::SYNC_UNATTACHED);
    assert_eq!(next_custom(&mut second.inbound).await.kind, message_type::SYNC_ATTACHED);
}

#[tokio::test]
async fn test_reconnect_command_requests_session_lists() {
    let relay = start_relay().await;
    let mut runtime = connect_usb(&relay).await;

    relay.handle.reconnect().unwrap();

    let request = next_custom(&mut runtime.inbound).await;
    assert_eq!(request.kind, message_type::LIST_SESSION);
}

#[tokio::test]
async fn test_restart_server_keeps_running_listener() {
    let relay = start_relay().await;
    relay.handle.restart_server().unwrap();

    let web = connect_web(&relay, "local").await;
    assert!(web.id.0 > 0);
}

#[tokio::test]
async fn test_ping_is_answered() {
    let relay = start_relay().await;
    let mut web = connect_web(&relay, "local").await;

    web.connection.send(&Frame::Ping { ts: 42 }).unwrap();
    let pong = within(async {
        loop {
            if let Some(Frame::Pong { ts }) = web.inbound.recv().await {
                return ts;
            }
        }
    })
    .await;
    assert_eq!(pong, 42);
}

#[tokio::test]
async fn test_silent_peer_is_closed_after_handshake_timeout() {
    let relay = start_relay().await;
    let (_writer, mut reader) = usb::connect(&relay.usb_addr).await.unwrap();

    let end = within(reader.recv_text()).await;
    assert!(!matches!(end, Some(Ok(_))), "expected close, got {end:?}");
}

#[tokio::test]
async fn test_invalid_room_is_refused() {
    let relay = start_relay().await;
    let url = format!("{}?room=bad%20room", relay.ws_endpoint);
    assert!(ws::connect(&url, &[]).await.is_err());
}

#[tokio::test]
async fn test_rooms_are_isolated() {
    let relay = start_relay().await;
    let runtime = connect_usb(&relay).await;
    let mut elsewhere = connect_web(&relay, "other").await;

    declare_sessions(&runtime, vec![Session::new(7, "a")]);

    let mut seen = Vec::new();
    let window = tokio::time::sleep(Duration::from_millis(300));
    tokio::pin!(window);
    loop {
        tokio::select! {
            () = &mut window => break,
            frame = elsewhere.inbound.recv() => match frame {
                Some(frame) => seen.push(frame),
                None => break,
            },
        }
    }

    assert!(!seen.iter().any(|f| matches!(f, Frame::SessionList(_))));
    assert!(seen
        .iter()
        .all(|f| !matches!(f, Frame::ClientList(list) if !list.is_empty())));
}

#[tokio::test]
async fn test_frontend_driver_follows_newest_session() {
    let relay = start_relay().await;
    let shutdown = CancellationToken::new();
    let (_handle, mut events, _task) = spawn_frontend(
        FrontendConfig {
            target: Target::new(relay.ws_endpoint.clone(), "local"),
            options: SelectionOptions {
                auto_focus_latest: true,
                card_filter: None,
            },
            info: ClientInfo::default(),
        },
        shutdown.clone(),
    );

    let connected = within(events.recv()).await;
    assert!(matches!(connected, Some(FrontendEvent::Connected(_))));

    let runtime = connect_usb(&relay).await;
    declare_sessions(&runtime, vec![Session::new(3, "b")]);
    declare_sessions(&runtime, vec![Session::new(3, "b"), Session::new(5, "a")]);

    let expected = SelectionChange::Selected {
        client: runtime.id,
        session: 5,
    };
    within(async {
        loop {
            match events.recv().await {
                Some(FrontendEvent::View(ViewUpdate::Selection(change))) if change == expected => {
                    break
                }
                Some(_) => {}
                None => panic!("front-end stopped"),
            }
        }
    })
    .await;

    shutdown.cancel();
}

#[tokio::test]
async fn test_client_ids_are_unique() {
    let relay = start_relay().await;
    let a = connect_usb(&relay).await;
    let b = connect_usb(&relay).await;
    let c = connect_web(&relay, "local").await;
    assert_ne!(a.id, b.id);
    assert_ne!(b.id, c.id);
    assert_ne!(a.id, ClientId::UNADDRESSED);
}
