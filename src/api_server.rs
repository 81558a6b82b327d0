use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tower::ServiceBuilder;

use crate::gossip::ClientRequest;
use crate::hash::HashValue;
use crate::network::PeerAddress;
use crate::node::{NodeError, NodeRegistry, NodeState};

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("missing field: {0}")]
    MissingField(&'static str),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("unknown node {0}")]
    UnknownNode(String),
    #[error(transparent)]
    Node(#[from] NodeError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::MissingField(_) | ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::UnknownNode(_) | ApiError::Node(NodeError::UnknownNode(_)) => {
                StatusCode::NOT_FOUND
            }
            ApiError::Node(NodeError::Stopped(_)) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Node(NodeError::Transport(_)) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        warn!("request failed: {}", self);
        let body = ApiResponse::<()> {
            success: false,
            data: None,
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub message: String,
}

impl<T> ApiResponse<T> {
    fn ok(data: T, message: impl Into<String>) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            message: message.into(),
        })
    }
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub nodes: usize,
    pub timestamp: u64,
}

#[derive(Debug, Default, Deserialize)]
pub struct StartNodeRequest {
    pub name: Option<String>,
    pub address: Option<String>,
    /// Comma separated `ip:port` list
    pub peers: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct NodeInfo {
    pub name: String,
    pub address: PeerAddress,
    pub miner: HashValue,
}

/// Without `destination` the text is rumored; `broadcast` floods it as a simple message
#[derive(Debug, Default, Deserialize)]
pub struct MessageRequest {
    pub text: Option<String>,
    pub destination: Option<String>,
    #[serde(default)]
    pub broadcast: bool,
}

/// `input`/`output` are hex hashes; any other string is hashed first
#[derive(Debug, Default, Deserialize)]
pub struct TransactionRequest {
    pub input: Option<String>,
    pub output: Option<String>,
    pub amount: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PeerRequest {
    pub peers: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BalanceResponse {
    pub hash: HashValue,
    pub balance: i64,
}

/// HTTP control surface over the nodes of one process
#[derive(Clone)]
pub struct ControlApiServer {
    host: String,
    port: u16,
    registry: NodeRegistry,
}

impl ControlApiServer {
    pub fn new(host: String, port: u16, registry: NodeRegistry) -> Self {
        Self {
            host,
            port,
            registry,
        }
    }

    pub async fn start(&self) -> Result<(), Box<dyn std::error::Error>> {
        let app = self.create_routes();

        let bind_addr = format!("{}:{}", self.host, self.port);
        let listener = TcpListener::bind(&bind_addr).await?;

        info!("🌐 control API listening on {}", bind_addr);

        axum::serve(listener, app).await?;

        Ok(())
    }

    pub fn create_routes(&self) -> Router {
        Router::new()
            .route("/health", get(health_check))
            .route("/api/v1/nodes", get(list_nodes).post(start_node))
            .route("/api/v1/nodes/:name", get(node_state).delete(stop_node))
            .route("/api/v1/nodes/:name/messages", post(post_message))
            .route("/api/v1/nodes/:name/transactions", post(post_transaction))
            .route("/api/v1/nodes/:name/peers", post(post_peers))
            .route("/api/v1/nodes/:name/balance/:hash", get(get_balance))
            .with_state(self.registry.clone())
            .layer(ServiceBuilder::new())
    }
}

async fn health_check(State(registry): State<NodeRegistry>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        nodes: registry.len().await,
        timestamp: chrono::Utc::now().timestamp() as u64,
    })
}

async fn list_nodes(State(registry): State<NodeRegistry>) -> Json<ApiResponse<Vec<String>>> {
    let names = registry.names().await;
    let message = format!("{} nodes running", names.len());
    ApiResponse::ok(names, message)
}

async fn start_node(
    State(registry): State<NodeRegistry>,
    Json(request): Json<StartNodeRequest>,
) -> Result<Json<ApiResponse<NodeInfo>>, ApiError> {
    let name = request.name.ok_or(ApiError::MissingField("name"))?;
    let address = request
        .address
        .ok_or(ApiError::MissingField("address"))?
        .parse::<PeerAddress>()
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let peers = PeerAddress::parse_list(request.peers.as_deref().unwrap_or(""))
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let node = registry.start_node(&name, address, peers).await?;
    let info = NodeInfo {
        name: node.name().to_string(),
        address: node.address(),
        miner: node.miner_hash(),
    };
    Ok(ApiResponse::ok(info, "node running"))
}

async fn stop_node(
    State(registry): State<NodeRegistry>,
    Path(name): Path<String>,
) -> Result<Json<ApiResponse<String>>, ApiError> {
    registry.stop_node(&name).await?;
    Ok(ApiResponse::ok(name, "node stopped"))
}

async fn node_state(
    State(registry): State<NodeRegistry>,
    Path(name): Path<String>,
) -> Result<Json<ApiResponse<NodeState>>, ApiError> {
    let node = registry
        .get(&name)
        .await
        .ok_or(ApiError::UnknownNode(name))?;
    Ok(ApiResponse::ok(node.state().await, "ok"))
}

async fn post_message(
    State(registry): State<NodeRegistry>,
    Path(name): Path<String>,
    Json(request): Json<MessageRequest>,
) -> Result<Json<ApiResponse<String>>, ApiError> {
    let node = registry
        .get(&name)
        .await
        .ok_or(ApiError::UnknownNode(name))?;
    let text = request.text.ok_or(ApiError::MissingField("text"))?;

    let client_request = match request.destination {
        Some(destination) => ClientRequest::Private { destination, text },
        None if request.broadcast => ClientRequest::Broadcast { text },
        None => ClientRequest::Rumor { text },
    };
    node.inject(client_request).await?;
    Ok(ApiResponse::ok(node.name().to_string(), "message queued"))
}

async fn post_transaction(
    State(registry): State<NodeRegistry>,
    Path(name): Path<String>,
    Json(request): Json<TransactionRequest>,
) -> Result<Json<ApiResponse<String>>, ApiError> {
    let node = registry
        .get(&name)
        .await
        .ok_or(ApiError::UnknownNode(name))?;
    let input = account(request.input.ok_or(ApiError::MissingField("input"))?);
    let output = account(request.output.ok_or(ApiError::MissingField("output"))?);
    let amount = request.amount.ok_or(ApiError::MissingField("amount"))?;

    node.inject(ClientRequest::Transaction {
        input,
        output,
        amount,
    })
    .await?;
    Ok(ApiResponse::ok(node.name().to_string(), "transaction queued"))
}

async fn post_peers(
    State(registry): State<NodeRegistry>,
    Path(name): Path<String>,
    Json(request): Json<PeerRequest>,
) -> Result<Json<ApiResponse<Vec<PeerAddress>>>, ApiError> {
    let node = registry
        .get(&name)
        .await
        .ok_or(ApiError::UnknownNode(name))?;
    let peers = PeerAddress::parse_list(&request.peers.ok_or(ApiError::MissingField("peers"))?)
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    node.add_peers(peers.clone()).await?;
    Ok(ApiResponse::ok(peers, "peers added"))
}

async fn get_balance(
    State(registry): State<NodeRegistry>,
    Path((name, hash)): Path<(String, String)>,
) -> Result<Json<ApiResponse<BalanceResponse>>, ApiError> {
    let node = registry
        .get(&name)
        .await
        .ok_or(ApiError::UnknownNode(name))?;
    let hash = account(hash);
    let balance = node.balance(&hash).await;
    Ok(ApiResponse::ok(BalanceResponse { hash, balance }, "ok"))
}

/// Accounts are hashes; a label that is not hex is hashed so clients can use plain names
fn account(label: String) -> HashValue {
    label
        .parse::<HashValue>()
        .unwrap_or_else(|_| HashValue::digest(label.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn server() -> (ControlApiServer, NodeRegistry) {
        let registry = NodeRegistry::new(Config::default());
        let server = ControlApiServer::new("127.0.0.1".to_string(), 0, registry.clone());
        (server, registry)
    }

    async fn call(app: Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json");
        let body = match body {
            Some(body) => Body::from(body.to_string()),
            None => Body::empty(),
        };
        let response = app.oneshot(request.body(body).unwrap()).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn test_health_check() {
        let (server, _) = server();
        let (status, body) = call(server.create_routes(), "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["nodes"], 0);
    }

    #[tokio::test]
    async fn test_missing_fields_are_bad_requests() {
        let (server, registry) = server();

        let (status, body) = call(
            server.create_routes(),
            "POST",
            "/api/v1/nodes",
            Some(json!({ "address": "127.0.0.1:0" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);

        let (status, _) = call(
            server.create_routes(),
            "POST",
            "/api/v1/nodes",
            Some(json!({ "name": "a", "address": "not an address" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(registry.names().await.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_node_is_not_found() {
        let (server, _) = server();
        let (status, _) = call(server.create_routes(), "GET", "/api/v1/nodes/ghost", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(
            server.create_routes(),
            "POST",
            "/api/v1/nodes/ghost/messages",
            Some(json!({ "text": "hi" })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_node_lifecycle() {
        let (server, registry) = server();

        let (status, body) = call(
            server.create_routes(),
            "POST",
            "/api/v1/nodes",
            Some(json!({ "name": "a", "address": "127.0.0.1:0" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["name"], "a");

        let (status, _) = call(
            server.create_routes(),
            "POST",
            "/api/v1/nodes/a/messages",
            Some(json!({ "text": "hi" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = call(
            server.create_routes(),
            "POST",
            "/api/v1/nodes/a/messages",
            Some(json!({ "destination": "b" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let mut stored = Value::Null;
        for _ in 0..100 {
            let (status, body) = call(server.create_routes(), "GET", "/api/v1/nodes/a", None).await;
            assert_eq!(status, StatusCode::OK);
            if body["data"]["messages"].as_array().is_some_and(|m| !m.is_empty()) {
                stored = body;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert_eq!(stored["data"]["messages"][0]["text"], "hi");
        assert_eq!(stored["data"]["messages"][0]["origin"], "a");

        let (status, body) = call(
            server.create_routes(),
            "GET",
            "/api/v1/nodes/a/balance/alice",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["balance"], 0);

        let (status, _) = call(server.create_routes(), "DELETE", "/api/v1/nodes/a", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(registry.names().await.is_empty());
    }

    #[test]
    fn test_account_labels() {
        let hash = HashValue::digest("alice");
        assert_eq!(account(hash.to_string()), hash);
        assert_eq!(account("alice".to_string()), hash);
    }
}
