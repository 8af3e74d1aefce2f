use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::{HeaderValue, Method},
    response::IntoResponse,
    routing::get,
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink};
use serde_json::{Value, json};
use tokio::{net::TcpListener, select, sync::mpsc, time::timeout};
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, info, warn};

use crate::{
    broker::{Broker, BrokerConfig, Connection, ConnectionId},
    message::{ClientEvent, ServerEvent, encode},
};

/// Path the browser client upgrades to a chat socket on.
pub const SOCKET_PATH: &str = "/ws";

/// How long a closing connection's writer may keep flushing before it is cut off.
pub const CLOSE_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
    pub broker: BrokerConfig,
    /// Origins allowed by CORS. Empty means any origin.
    pub allowed_origins: Vec<String>,
}

pub struct Server {
    listener: TcpListener,
    broker: Arc<Broker>,
    cors: CorsLayer,
}

impl Server {
    pub fn new(listener: TcpListener, config: ServerConfig) -> Result<Self> {
        let cors = cors_layer(&config.allowed_origins)?;
        Ok(Self {
            listener,
            broker: Arc::new(Broker::new(config.broker)),
            cors,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn broker(&self) -> Arc<Broker> {
        Arc::clone(&self.broker)
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Server {
            listener,
            broker,
            cors,
        } = self;

        let app = router(Arc::clone(&broker), cors);
        let shutdown = async move {
            shutdown.await;
            handle_shutdown(&broker);
        };

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
            .context("http server failed")
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

/// Builds the HTTP routes around an existing broker.
pub fn router(broker: Arc<Broker>, cors: CorsLayer) -> Router {
    Router::new()
        .route("/", get(health))
        .route(SOCKET_PATH, get(upgrade))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(broker)
}

fn cors_layer(origins: &[String]) -> Result<CorsLayer> {
    let layer = CorsLayer::new().allow_methods([Method::GET, Method::POST]);
    if origins.is_empty() {
        return Ok(layer.allow_origin(Any));
    }

    let origins = origins
        .iter()
        .map(|origin| {
            HeaderValue::from_str(origin)
                .with_context(|| format!("invalid allowed origin '{origin}'"))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(layer.allow_origin(AllowOrigin::list(origins)))
}

fn handle_shutdown(broker: &Broker) {
    let closed = broker.close_all();
    info!(connections = closed, "server shutting down");
}

async fn health() -> Json<Value> {
    Json(json!({ "message": "LearnSphere chat is running" }))
}

async fn upgrade(ws: WebSocketUpgrade, State(broker): State<Arc<Broker>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, broker))
}

async fn handle_connection(socket: WebSocket, broker: Arc<Broker>) {
    let Connection {
        id,
        outbound,
        closed,
    } = broker.connect();
    info!(connection = id, "client connected");

    let (sink, mut stream) = socket.split();
    let mut writer = tokio::spawn(forward_outbound(id, outbound, sink));
    let mut writer_done = false;

    loop {
        select! {
            frame = stream.next() => {
                if !handle_frame(frame, id, &broker) {
                    break;
                }
            }
            _ = &mut writer => {
                debug!(connection = id, "outbound queue closed");
                writer_done = true;
                break;
            }
            () = closed.cancelled() => {
                debug!(connection = id, "connection closed by broker");
                break;
            }
        }
    }

    broker.disconnect(id);
    // The writer may be parked on a peer that stopped reading.
    if !writer_done && timeout(CLOSE_GRACE, &mut writer).await.is_err() {
        debug!(connection = id, "writer did not finish in time; aborting");
        writer.abort();
    }
    info!(connection = id, "client disconnected");
}

async fn forward_outbound(
    id: ConnectionId,
    mut outbound: mpsc::Receiver<ServerEvent>,
    mut sink: SplitSink<WebSocket, Message>,
) {
    while let Some(event) = outbound.recv().await {
        let text = match encode(&event) {
            Ok(text) => text,
            Err(err) => {
                warn!(connection = id, ?err, "failed to encode event");
                continue;
            }
        };
        if let Err(err) = sink.send(Message::Text(text)).await {
            debug!(connection = id, ?err, "failed to deliver frame to client");
            return;
        }
    }

    // The broker dropped this connection; tell the peer before going away.
    let _ = sink.send(Message::Close(None)).await;
}

fn handle_frame(
    frame: Option<Result<Message, axum::Error>>,
    id: ConnectionId,
    broker: &Broker,
) -> bool {
    match frame {
        Some(Ok(Message::Text(text))) => {
            handle_text(&text, id, broker);
            true
        }
        Some(Ok(Message::Binary(_))) => {
            debug!(connection = id, "ignoring binary frame");
            true
        }
        Some(Ok(Message::Ping(_) | Message::Pong(_))) => true,
        Some(Ok(Message::Close(_))) | None => false,
        Some(Err(err)) => {
            debug!(connection = id, ?err, "websocket read failed");
            false
        }
    }
}

fn handle_text(text: &str, id: ConnectionId, broker: &Broker) {
    let event = match ClientEvent::parse(text) {
        Ok(event) => event,
        Err(err) => {
            warn!(connection = id, error = %err, "discarding client event");
            return;
        }
    };

    match event {
        ClientEvent::JoinRoom(room) => {
            broker.join(id, &room);
        }
        ClientEvent::LeaveRoom(room) => {
            broker.leave(id, &room);
        }
        ClientEvent::SendMessage(payload) => {
            let room = payload.room_id().to_string();
            let report = broker.publish(id, payload);
            debug!(connection = id, %room, ?report, "message published");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::{Body, to_bytes},
        http::{Request, StatusCode},
    };
    use tower::ServiceExt;

    fn app() -> Router {
        router(Arc::new(Broker::default()), cors_layer(&[]).expect("cors layer"))
    }

    #[tokio::test]
    async fn health_route_reports_running() {
        let response = app()
            .oneshot(Request::builder().uri("/").body(Body::empty()).expect("request"))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        let value: Value = serde_json::from_slice(&body).expect("json body");
        assert_eq!(value, json!({ "message": "LearnSphere chat is running" }));
    }

    #[tokio::test]
    async fn socket_route_requires_upgrade() {
        let response = app()
            .oneshot(
                Request::builder()
                    .uri(SOCKET_PATH)
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");

        assert!(response.status().is_client_error());
    }

    #[test]
    fn cors_accepts_configured_origins() {
        let origins = vec![
            "http://localhost:5173".to_string(),
            "http://localhost:3000".to_string(),
        ];
        assert!(cors_layer(&origins).is_ok());
        assert!(cors_layer(&[]).is_ok());
    }

    #[test]
    fn cors_rejects_invalid_origin() {
        let origins = vec!["http://bad\norigin".to_string()];
        assert!(cors_layer(&origins).is_err());
    }

    #[test]
    fn malformed_text_keeps_connection_open() {
        let broker = Broker::default();
        let connection = broker.connect();

        assert!(handle_frame(
            Some(Ok(Message::Text("{not json".into()))),
            connection.id,
            &broker
        ));
        assert!(handle_frame(
            Some(Ok(Message::Text(r#"{"event":"joinRoom","data":""}"#.into()))),
            connection.id,
            &broker
        ));
        assert_eq!(broker.room_count(), 0);
    }

    #[test]
    fn text_frames_drive_the_broker() {
        let broker = Broker::default();
        let mut connection = broker.connect();

        let join = r#"{"event":"joinRoom","data":"course-42"}"#;
        handle_text(join, connection.id, &broker);
        assert_eq!(broker.members("course-42"), vec![connection.id]);

        let send = json!({
            "event": "sendMessage",
            "data": {
                "roomId": "course-42",
                "message": "hi",
                "sender": { "id": "A", "name": "Alice", "avatar": "" }
            }
        })
        .to_string();
        handle_text(&send, connection.id, &broker);
        assert!(connection.outbound.try_recv().is_ok());

        let leave = r#"{"event":"leaveRoom","data":"course-42"}"#;
        handle_text(leave, connection.id, &broker);
        assert_eq!(broker.room_count(), 0);
    }

    #[test]
    fn close_frame_ends_session() {
        let broker = Broker::default();
        let connection = broker.connect();

        assert!(!handle_frame(Some(Ok(Message::Close(None))), connection.id, &broker));
        assert!(!handle_frame(None, connection.id, &broker));
    }
}
