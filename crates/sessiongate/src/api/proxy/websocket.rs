//! WebSocket relay between a client and a session backend.
//!
//! The upstream connection is opened before the client upgrade completes,
//! so an unreachable backend still gets a 502 instead of an upgraded socket
//! that closes immediately.

use std::time::Duration;

use axum::{
    extract::ws::{Message as AxumMessage, WebSocket, WebSocketUpgrade},
    http::{HeaderMap, HeaderValue, header},
    response::Response,
};
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use sessiongate_protocol::RouteTarget;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UnixStream;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, client_async, connect_async,
    tungstenite::{Message as TungsteniteMessage, client::IntoClientRequest},
};
use tokio_util::sync::CancellationToken;

use super::builder::{RouteClass, backend_path_and_query};
use crate::api::error::ProxyError;
use crate::api::state::AppState;
use crate::auth::redact;

/// Connected upstream socket.
pub enum UpstreamSocket {
    Tcp(WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>),
    Unix(WebSocketStream<UnixStream>),
}

/// True when the request asks for a WebSocket upgrade.
pub fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
}

/// Dial the backend WebSocket with the token reinjected.
pub async fn connect_upstream(
    target: &RouteTarget,
    path_and_query: &str,
    token: &str,
    client_headers: &HeaderMap,
    timeout: Duration,
) -> Result<(UpstreamSocket, Option<String>), ProxyError> {
    let url = match target {
        RouteTarget::Tcp { host, port } if host.contains(':') && !host.starts_with('[') => {
            format!("ws://[{}]:{}{}", host, port, path_and_query)
        }
        RouteTarget::Tcp { host, port } => format!("ws://{}:{}{}", host, port, path_and_query),
        RouteTarget::Unix { .. } => format!("ws://localhost{}", path_and_query),
    };

    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|e| ProxyError::Internal(format!("invalid upstream WebSocket URL {}: {}", url, e)))?;

    let headers = request.headers_mut();
    headers.insert(
        header::AUTHORIZATION,
        HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|e| ProxyError::Internal(format!("invalid token header: {}", e)))?,
    );
    for name in [header::SEC_WEBSOCKET_PROTOCOL, header::COOKIE] {
        if let Some(value) = client_headers.get(&name) {
            headers.insert(name, value.clone());
        }
    }

    let connect = async {
        match target {
            RouteTarget::Tcp { .. } => connect_async(request)
                .await
                .map(|(socket, response)| (UpstreamSocket::Tcp(socket), response)),
            RouteTarget::Unix { socket_path } => {
                let stream = UnixStream::connect(socket_path)
                    .await
                    .map_err(tokio_tungstenite::tungstenite::Error::Io)?;
                client_async(request, stream)
                    .await
                    .map(|(socket, response)| (UpstreamSocket::Unix(socket), response))
            }
        }
    };

    let (socket, response) = tokio::time::timeout(timeout, connect)
        .await
        .map_err(|_| ProxyError::Timeout)?
        .map_err(|e| ProxyError::Unreachable(format!("WebSocket to {:?}: {}", target, e)))?;

    let protocol = response
        .headers()
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    Ok((socket, protocol))
}

/// Complete the client upgrade and relay until either side closes.
///
/// The relay is exempt from the request timeout. It ends on close, on error,
/// after `ws_idle_timeout` without traffic, or at shutdown.
pub async fn proxy_websocket(
    state: &AppState,
    ws: WebSocketUpgrade,
    target: &RouteTarget,
    token: &str,
    uri: &axum::http::Uri,
    client_headers: &HeaderMap,
) -> Result<Response, ProxyError> {
    let settings = &state.settings;
    let path_and_query = backend_path_and_query(uri, &settings.prefix, token, RouteClass::Default);

    let (upstream, protocol) = connect_upstream(
        target,
        &path_and_query,
        token,
        client_headers,
        settings.request_timeout,
    )
    .await?;

    info!(
        "WebSocket relay opened for token {} to {:?}",
        redact(token),
        target
    );

    let ws = match protocol {
        Some(protocol) => ws.protocols([protocol]),
        None => ws,
    };

    let idle = settings.ws_idle_timeout;
    let cancel = state.websockets.cancelled();
    let tracker = state.websockets.tracker().clone();
    let label = redact(token);

    Ok(ws.on_upgrade(move |client| {
        tracker.track_future(async move {
            let result = match upstream {
                UpstreamSocket::Tcp(server) => relay(client, server, idle, cancel).await,
                UpstreamSocket::Unix(server) => relay(client, server, idle, cancel).await,
            };
            match result {
                Ok(reason) => info!("WebSocket relay for token {} closed: {}", label, reason),
                Err(e) => warn!("WebSocket relay for token {} failed: {:?}", label, e),
            }
        })
    }))
}

fn to_upstream(msg: AxumMessage) -> TungsteniteMessage {
    match msg {
        AxumMessage::Text(text) => TungsteniteMessage::Text(text.to_string().into()),
        AxumMessage::Binary(data) => TungsteniteMessage::Binary(data),
        AxumMessage::Ping(data) => TungsteniteMessage::Ping(data),
        AxumMessage::Pong(data) => TungsteniteMessage::Pong(data),
        AxumMessage::Close(_) => TungsteniteMessage::Close(None),
    }
}

fn to_client(msg: TungsteniteMessage) -> Option<AxumMessage> {
    Some(match msg {
        TungsteniteMessage::Text(text) => AxumMessage::Text(text.to_string().into()),
        TungsteniteMessage::Binary(data) => AxumMessage::Binary(data),
        TungsteniteMessage::Ping(data) => AxumMessage::Ping(data),
        TungsteniteMessage::Pong(data) => AxumMessage::Pong(data),
        TungsteniteMessage::Close(_) => AxumMessage::Close(None),
        TungsteniteMessage::Frame(_) => return None,
    })
}

/// Bidirectional relay. Returns why it stopped.
pub async fn relay<S>(
    client_socket: WebSocket,
    server_socket: WebSocketStream<S>,
    idle_timeout: Duration,
    cancel: CancellationToken,
) -> anyhow::Result<&'static str>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_tx, mut client_rx) = client_socket.split();
    let (mut server_tx, mut server_rx) = server_socket.split();

    let idle = tokio::time::sleep(idle_timeout);
    tokio::pin!(idle);

    let reason = loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = client_tx.send(AxumMessage::Close(None)).await;
                let _ = server_tx.send(TungsteniteMessage::Close(None)).await;
                break "shutdown";
            }
            _ = &mut idle => {
                let _ = client_tx.send(AxumMessage::Close(None)).await;
                let _ = server_tx.send(TungsteniteMessage::Close(None)).await;
                break "idle timeout";
            }
            msg = client_rx.next() => {
                let Some(msg) = msg else { break "client disconnected" };
                let msg = msg?;
                let closing = matches!(msg, AxumMessage::Close(_));
                server_tx.send(to_upstream(msg)).await?;
                if closing {
                    break "client closed";
                }
            }
            msg = server_rx.next() => {
                let Some(msg) = msg else { break "backend disconnected" };
                let msg = msg?;
                let closing = matches!(msg, TungsteniteMessage::Close(_));
                if let Some(forward) = to_client(msg) {
                    client_tx.send(forward).await?;
                }
                if closing {
                    break "backend closed";
                }
            }
        }
        idle.as_mut()
            .reset(tokio::time::Instant::now() + idle_timeout);
    };

    debug!("WebSocket relay loop ended: {}", reason);
    Ok(reason)
}
