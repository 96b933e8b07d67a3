//! Listener and dialer, the HTTP front door of every kite.
//!
//! The listener is a small axum app. A `CONNECT` to one of the RPC paths
//! takes the raw socket over for the rest of its life, a websocket upgrade
//! on [`WEBSOCKET_PATH`] becomes a browser client, anything else is turned
//! away with a 405.
//!
//! [`dial`] is the mirror image used when calling another kite.

use crate::client::RpcClient;
use crate::clients::{ClientPool, RegisteredClient};
use crate::codec::ServerCodec;
use crate::error::WireError;
use crate::message::Origin;
use crate::server::RpcServer;

use axum::body::Body;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{Method, StatusCode, Version};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use hyper::ext::ReasonPhrase;
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Path kites `CONNECT` to for the binary codec.
pub const RPC_PATH: &str = "/_kiteRPC_";

/// Path generic RPC clients `CONNECT` to for the JSON codec.
pub const DEBUG_RPC_PATH: &str = "/_kiteRPC_/debug";

/// Path browsers upgrade to a websocket on.
pub const WEBSOCKET_PATH: &str = "/_kite_/ws";

/// Reason phrase of the `200` a successful `CONNECT` is answered with.
pub const CONNECTED: &str = "Connected to Kite RPC";

#[derive(Clone)]
struct ListenerState {
    server: Arc<RpcServer>,
    clients: ClientPool,
}

/// The accept side: binds the RPC port and serves every connection.
pub struct Listener;

impl Listener {
    /// Bind `addr` and start accepting. Port `0` picks a free port; the
    /// resolved address is returned along with the serve task.
    pub async fn start(
        addr: &str,
        server: Arc<RpcServer>,
        clients: ClientPool,
    ) -> Result<(SocketAddr, JoinHandle<()>), WireError> {
        let listener = TcpListener::bind(addr).await.map_err(|e| WireError::Bind {
            addr: addr.to_string(),
            source: e,
        })?;
        let local_addr = listener.local_addr()?;

        let app = Self::router(ListenerState { server, clients });

        info!("Kite RPC: listening on {}", local_addr);

        let serve_handle = tokio::spawn(async move {
            let app = app.into_make_service_with_connect_info::<SocketAddr>();
            if let Err(e) = axum::serve(listener, app).await {
                error!("Kite RPC: listener stopped: {}", e);
            }
        });
        Ok((local_addr, serve_handle))
    }

    fn router(state: ListenerState) -> Router {
        Router::new()
            .route(
                WEBSOCKET_PATH,
                get(Self::websocket_handler).fallback(Self::connect_handler),
            )
            .fallback(Self::connect_handler)
            .with_state(state)
    }

    /// Everything that is not a websocket upgrade. Only `CONNECT` to one of
    /// the RPC paths is served; the socket is taken over once the `200` is
    /// on the wire.
    async fn connect_handler(
        State(state): State<ListenerState>,
        ConnectInfo(peer): ConnectInfo<SocketAddr>,
        req: Request,
    ) -> Response {
        if req.method() != Method::CONNECT {
            return (StatusCode::METHOD_NOT_ALLOWED, "405 must CONNECT\n").into_response();
        }

        let origin = match req.uri().path() {
            RPC_PATH => Origin::Binary,
            DEBUG_RPC_PATH => Origin::Json,
            _ => return (StatusCode::NOT_FOUND, "unknown RPC path\n").into_response(),
        };

        tokio::spawn(async move {
            let upgraded = match hyper::upgrade::on(req).await {
                Ok(upgraded) => upgraded,
                Err(e) => {
                    debug!("Kite RPC: CONNECT from {} not upgraded: {}", peer, e);
                    return;
                }
            };
            let io = TokioIo::new(upgraded);
            let codec = match origin {
                Origin::Json => ServerCodec::json(io),
                _ => ServerCodec::binary(io),
            };
            if let Err(e) = state.server.serve_codec(codec, &peer.to_string()).await {
                debug!("Kite RPC: connection from {} ended: {}", peer, e);
            }
        });

        let mut response = StatusCode::OK.into_response();
        response
            .extensions_mut()
            .insert(ReasonPhrase::from_static(CONNECTED.as_bytes()));
        response
    }

    async fn websocket_handler(
        State(state): State<ListenerState>,
        ConnectInfo(peer): ConnectInfo<SocketAddr>,
        ws: WebSocketUpgrade,
    ) -> Response {
        ws.on_upgrade(move |socket| Self::serve_websocket(socket, peer, state))
    }

    async fn serve_websocket(socket: WebSocket, addr: SocketAddr, state: ListenerState) {
        let (mut sink, incoming) = socket.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if sink.send(msg).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        info!("[{}] client connected", addr);
        state.clients.add(RegisteredClient::new(addr, tx.clone()));

        let result = state
            .server
            .serve_codec(ServerCodec::websocket(incoming, tx), &addr.to_string())
            .await;

        // Dropping the pool entry releases the last sender, which lets the
        // writer task drain and close the socket.
        state.clients.remove(&addr);
        info!("[{}] client disconnected", addr);
        if let Err(e) = result {
            debug!("[{}] websocket ended: {}", addr, e);
        }
    }
}

/// Connect to a kite's RPC port with the binary codec.
///
/// Sends `CONNECT /_kiteRPC_ HTTP/1.0` and requires `200` with the exact
/// [`CONNECTED`] reason back. Any other answer closes the socket and fails;
/// there is no retry here.
pub async fn dial(addr: &str) -> Result<RpcClient, WireError> {
    debug!("Kite RPC: dialing {}", addr);
    let stream = TcpStream::connect(addr).await?;

    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .map_err(|e| WireError::HandshakeFailed(format!("{addr}: {e}")))?;
    tokio::spawn(async move {
        if let Err(e) = conn.with_upgrades().await {
            debug!("Kite RPC: handshake connection error: {}", e);
        }
    });

    let request = hyper::Request::builder()
        .method(Method::CONNECT)
        .uri(RPC_PATH)
        .version(Version::HTTP_10)
        .body(Body::empty())
        .map_err(|e| WireError::HandshakeFailed(e.to_string()))?;
    let response = sender
        .send_request(request)
        .await
        .map_err(|e| WireError::HandshakeFailed(format!("no valid response from {addr}: {e}")))?;

    let reason = response
        .extensions()
        .get::<ReasonPhrase>()
        .map(|r| String::from_utf8_lossy(r.as_bytes()).into_owned());
    if response.status() != StatusCode::OK || reason.as_deref() != Some(CONNECTED) {
        return Err(WireError::HandshakeFailed(format!(
            "unexpected HTTP response from {addr}: {} {}",
            response.status().as_u16(),
            reason.unwrap_or_default()
        )));
    }

    let upgraded = hyper::upgrade::on(response)
        .await
        .map_err(|e| WireError::HandshakeFailed(format!("{addr}: {e}")))?;
    Ok(RpcClient::new(addr, TokioIo::new(upgraded)))
}
