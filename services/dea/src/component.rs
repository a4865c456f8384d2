//! Component registration and the varz/healthz endpoint.
//!
//! Every platform component announces itself on the bus with a small
//! discovery document and answers `vcap.component.discover` with it. The
//! same document, extended with live counters, is served on `/varz`; both
//! HTTP endpoints require basic auth with credentials generated at boot.

use std::sync::{Arc, RwLock};

use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use dea_id::ComponentUuid;
use dea_messages::subjects;
use rand::Rng;
use serde_json::{json, Map, Value};
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use crate::publisher::{publish_json, Publisher};

/// Registered identity of this process on the platform.
pub struct Component {
    kind: String,
    uuid: ComponentUuid,
    /// `ip:port` of the varz endpoint.
    host: String,
    credentials: (String, String),
    start: DateTime<Utc>,
    num_cores: usize,
    varz: RwLock<Map<String, Value>>,
}

/// Formats a duration in seconds as `{d}d:{h}h:{m}m:{s}s`.
pub fn format_uptime(seconds: i64) -> String {
    let seconds = seconds.max(0);
    let days = seconds / 86_400;
    let hours = seconds % 86_400 / 3_600;
    let minutes = seconds % 3_600 / 60;
    let secs = seconds % 60;
    format!("{days}d:{hours}h:{minutes}m:{secs}s")
}

fn random_secret() -> String {
    let bytes: [u8; 16] = rand::rng().random();
    hex::encode(bytes)
}

impl Component {
    pub fn new(kind: &str, index: Option<u32>, host: String, num_cores: usize) -> Self {
        Self {
            kind: kind.to_string(),
            uuid: ComponentUuid::generate(index),
            host,
            credentials: (random_secret(), random_secret()),
            start: Utc::now(),
            num_cores,
            varz: RwLock::new(Map::new()),
        }
    }

    pub fn uuid(&self) -> &ComponentUuid {
        &self.uuid
    }

    pub fn credentials(&self) -> (&str, &str) {
        (&self.credentials.0, &self.credentials.1)
    }

    pub fn uptime(&self) -> String {
        format_uptime((Utc::now() - self.start).num_seconds())
    }

    /// The document announced on the bus.
    pub fn discover_document(&self) -> Value {
        json!({
            "type": self.kind,
            "index": self.uuid.index(),
            "uuid": self.uuid.to_string(),
            "host": self.host,
            "credentials": [self.credentials.0, self.credentials.1],
            "start": self.start,
        })
    }

    /// Sets one varz entry. Last write wins.
    pub fn set_varz(&self, key: &str, value: Value) {
        if let Ok(mut varz) = self.varz.write() {
            varz.insert(key.to_string(), value);
        }
    }

    pub fn varz(&self) -> Value {
        let mut document = self.discover_document();
        if let Some(fields) = document.as_object_mut() {
            fields.insert("uptime".to_string(), json!(self.uptime()));
            fields.insert("num_cores".to_string(), json!(self.num_cores));
            if let Ok(varz) = self.varz.read() {
                fields.extend(varz.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
        }
        document
    }

    /// Replies to a discovery probe.
    pub fn answer_discover(&self, publisher: &dyn Publisher, reply: &str) {
        let mut document = self.discover_document();
        if let Some(fields) = document.as_object_mut() {
            fields.insert("uptime".to_string(), json!(self.uptime()));
        }
        publish_json(publisher, reply, &document);
    }

    pub fn announce(&self, publisher: &dyn Publisher) {
        publish_json(publisher, subjects::COMPONENT_ANNOUNCE, &self.discover_document());
        info!(uuid = %self.uuid, host = %self.host, "Component announced");
    }

    /// Answers discovery probes on the bus and announces this component.
    pub fn register(self: &Arc<Self>, client: &dea_bus::Client) {
        let component = Arc::clone(self);
        let replier = client.clone();
        client.subscribe(subjects::COMPONENT_DISCOVER, Default::default(), move |msg| {
            if let Some(reply) = msg.reply.as_deref() {
                debug!(reply, "Answering component discovery");
                component.answer_discover(&replier, reply);
            }
        });
        self.announce(client);
    }

    fn authorized(&self, headers: &HeaderMap) -> bool {
        let expected = format!(
            "Basic {}",
            STANDARD.encode(format!("{}:{}", self.credentials.0, self.credentials.1))
        );
        headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value == expected)
    }

    /// Router serving `/varz` and `/healthz`.
    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route("/varz", get(varz))
            .route("/healthz", get(healthz))
            .layer(TraceLayer::new_for_http())
            .with_state(Arc::clone(self))
    }

    /// Serves the router until the listener fails.
    pub async fn serve(self: Arc<Self>, listener: tokio::net::TcpListener) -> std::io::Result<()> {
        axum::serve(listener, self.router()).await
    }
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, "Basic realm=\"varz\"")],
    )
        .into_response()
}

async fn varz(State(component): State<Arc<Component>>, headers: HeaderMap) -> Response {
    if !component.authorized(&headers) {
        return unauthorized();
    }
    Json(component.varz()).into_response()
}

async fn healthz(State(component): State<Arc<Component>>, headers: HeaderMap) -> Response {
    if !component.authorized(&headers) {
        return unauthorized();
    }
    "ok\n".into_response()
}
