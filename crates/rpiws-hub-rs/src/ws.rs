//! WebSocket routing and the per-connection socket pump.

use crate::hub::{HubEvent, HubHandle};
use crate::link::{Link, LinkRx};
use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tracing::{info, warn};

#[derive(Clone, Debug)]
pub struct WsState {
    pub hub: HubHandle,
    pub agent_user_agent: Arc<str>,
    pub queue_capacity: usize,
    pub write_timeout: Duration,
    pub max_message_bytes: usize,
}

#[derive(Debug)]
enum Role {
    Agent { ip: String },
    Viewer,
}

pub fn router(state: WsState) -> Router {
    Router::new()
        .route("/", get(viewer_handler))
        .route("/rpi", get(agent_handler))
        .route("/rpi/", get(agent_handler))
        .with_state(state)
}

async fn viewer_handler(ws: WebSocketUpgrade, State(state): State<WsState>) -> Response {
    ws.max_message_size(state.max_message_bytes)
        .on_upgrade(move |socket| handle_socket(socket, state, Role::Viewer))
}

async fn agent_handler(
    ws: Option<WebSocketUpgrade>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    State(state): State<WsState>,
) -> Response {
    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    if !agent_allowed(user_agent, &state.agent_user_agent) {
        warn!(event = "agent_forbidden", remote = %remote, user_agent = %user_agent);
        return (StatusCode::FORBIDDEN, "forbidden").into_response();
    }
    let Some(ws) = ws else {
        return (StatusCode::BAD_REQUEST, "websocket upgrade required").into_response();
    };
    let ip = remote.ip().to_string();
    ws.max_message_size(state.max_message_bytes)
        .on_upgrade(move |socket| handle_socket(socket, state, Role::Agent { ip }))
}

fn agent_allowed(user_agent: &str, expected: &str) -> bool {
    !user_agent.is_empty() && user_agent == expected
}

async fn handle_socket(socket: WebSocket, state: WsState, role: Role) {
    let conn_id = state.hub.next_conn_id();
    let (link, LinkRx { mut frames, mut close }) = Link::new(conn_id.clone(), state.queue_capacity);
    let kind = match &role {
        Role::Agent { .. } => "agent",
        Role::Viewer => "viewer",
    };
    let event = match role {
        Role::Agent { ip } => HubEvent::AgentConnected {
            conn_id: conn_id.clone(),
            link,
            ip,
        },
        Role::Viewer => HubEvent::ViewerConnected {
            conn_id: conn_id.clone(),
            link,
        },
    };
    if !state.hub.send(event) {
        return;
    }
    info!(event = "socket_open", conn_id = %conn_id, kind = kind);

    let (mut ws_sender, mut ws_receiver) = socket.split();
    let write_timeout = state.write_timeout;
    let writer_conn_id = conn_id.clone();
    let mut write_task = tokio::spawn(async move {
        loop {
            let msg = tokio::select! {
                biased;
                frame = frames.recv() => match frame {
                    Some(text) => Message::Text(text),
                    None => break,
                },
                changed = close.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let request = close.borrow().clone();
                    match request {
                        Some(request) => Message::Close(Some(CloseFrame {
                            code: request.code,
                            reason: request.reason.into(),
                        })),
                        None => continue,
                    }
                }
            };
            let closing = matches!(msg, Message::Close(_));
            let send = ws_sender.send(msg);
            if tokio::time::timeout(write_timeout, send).await.is_err() {
                warn!(event = "write_timeout", conn_id = %writer_conn_id);
                break;
            }
            if closing {
                break;
            }
        }
    });

    let mut writer_done = false;
    loop {
        let next = tokio::select! {
            _ = &mut write_task => {
                writer_done = true;
                break;
            }
            next = ws_receiver.next() => next,
        };
        let msg = match next {
            Some(Ok(msg)) => msg,
            Some(Err(err)) => {
                warn!(event = "read_error", conn_id = %conn_id, error = %err);
                break;
            }
            None => break,
        };
        let raw = match msg {
            Message::Text(text) => text,
            Message::Binary(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Message::Close(_) => {
                info!(event = "client_close", conn_id = %conn_id);
                break;
            }
            Message::Ping(_) | Message::Pong(_) => continue,
        };
        if !state.hub.send(HubEvent::Inbound {
            conn_id: conn_id.clone(),
            raw,
        }) {
            break;
        }
    }

    state.hub.send(HubEvent::Disconnected {
        conn_id: conn_id.clone(),
    });
    if !writer_done {
        let _ = write_task.await;
    }
    info!(event = "socket_closed", conn_id = %conn_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_session::tests::{auth_reply, register_request, settings};
    use crate::hub::Hub;
    use futures_util::{SinkExt, StreamExt};
    use rpiws_core::protocol::{AgentPresence, BrokerToAgent, BrokerToViewer};
    use tokio::sync::watch;
    use tokio_tungstenite::tungstenite::{client::IntoClientRequest, Message as WsMessage};

    const MAC: &str = "AA:BB:CC:DD:EE:FF";

    #[test]
    fn agents_must_present_the_configured_user_agent() {
        assert!(agent_allowed("rpiws-agent", "rpiws-agent"));
        assert!(!agent_allowed("curl/8.0", "rpiws-agent"));
        assert!(!agent_allowed("", ""));
    }

    async fn serve() -> (SocketAddr, watch::Sender<bool>) {
        let (hub, handle) = Hub::new(settings(), None);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(hub.run(shutdown_rx));
        let state = WsState {
            hub: handle,
            agent_user_agent: Arc::from("rpiws-agent"),
            queue_capacity: 64,
            write_timeout: Duration::from_secs(2),
            max_message_bytes: 64 * 1024,
        };
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let app = router(state).into_make_service_with_connect_info::<SocketAddr>();
            let _ = axum::serve(listener, app).await;
        });
        (addr, shutdown_tx)
    }

    async fn recv_json<S, T>(stream: &mut S) -> T
    where
        S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
            + Unpin,
        T: serde::de::DeserializeOwned,
    {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(2), stream.next())
                .await
                .expect("message in time")
                .expect("stream open")
                .expect("read");
            if let WsMessage::Text(text) = msg {
                return serde_json::from_str(&text).expect("decode");
            }
        }
    }

    #[tokio::test]
    async fn agent_without_user_agent_is_forbidden() {
        let (addr, _shutdown) = serve().await;
        let response = reqwest::get(format!("http://{addr}/rpi/"))
            .await
            .expect("request");
        assert_eq!(response.status(), reqwest::StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn agent_and_viewer_meet_over_websockets() {
        let (addr, _shutdown) = serve().await;

        let (mut viewer, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/"))
            .await
            .expect("viewer connect");

        let mut request = format!("ws://{addr}/rpi/")
            .into_client_request()
            .expect("request");
        request
            .headers_mut()
            .insert("User-Agent", "rpiws-agent".parse().expect("header"));
        let (mut agent, _) = tokio_tungstenite::connect_async(request)
            .await
            .expect("agent connect");

        agent
            .send(WsMessage::Text(register_request(MAC)))
            .await
            .expect("send register");
        let token = match recv_json::<_, BrokerToAgent>(&mut agent).await {
            BrokerToAgent::Auth { payload } => payload.token,
            other => panic!("expected AUTH, got {other:?}"),
        };
        agent
            .send(WsMessage::Text(auth_reply(MAC, &token)))
            .await
            .expect("send auth");
        assert_eq!(recv_json::<_, BrokerToAgent>(&mut agent).await, BrokerToAgent::Ack);
        assert_eq!(
            recv_json::<_, BrokerToViewer>(&mut viewer).await,
            BrokerToViewer::RpiStateChange {
                rpi_mac: MAC.to_string(),
                rpi_state: AgentPresence::Online,
            }
        );
    }

    #[tokio::test]
    async fn garbage_closes_with_policy_violation() {
        let (addr, _shutdown) = serve().await;
        let (mut viewer, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/"))
            .await
            .expect("viewer connect");
        viewer
            .send(WsMessage::Text("{not json".to_string()))
            .await
            .expect("send");
        let closed = loop {
            match tokio::time::timeout(Duration::from_secs(2), viewer.next())
                .await
                .expect("close in time")
            {
                Some(Ok(WsMessage::Close(frame))) => break frame,
                Some(Ok(_)) => continue,
                other => panic!("expected close frame, got {other:?}"),
            }
        };
        let frame = closed.expect("close frame");
        assert_eq!(u16::from(frame.code), 1008);
        assert_eq!(frame.reason, "protocol_violation");
    }
}
