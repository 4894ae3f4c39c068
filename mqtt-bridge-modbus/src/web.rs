//! Configuration web form.
//!
//! `GET /` shows the broker settings and the topics for DI1..DI8, `POST /`
//! stores them and asks the bridge to reconnect.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::io;
use std::net::SocketAddr;

use axum::Router;
use axum::extract::{Form, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::routing::get;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::bridge::ReconnectHandle;
use crate::store::{ConfigProvider, ConfigStore, DeviceConfig};

/// Number of topic rows offered by the form.
pub const FORM_TOPICS: u16 = 8;

/// Application state shared across handlers.
#[derive(Clone)]
struct AppState {
    store: ConfigStore,
    reconnect: ReconnectHandle,
}

/// Create the HTTP router.
fn create_router(store: ConfigStore, reconnect: ReconnectHandle) -> Router {
    let state = AppState { store, reconnect };

    Router::new()
        .route("/", get(show_form).post(save_form))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Handler for `GET /`.
async fn show_form(State(state): State<AppState>) -> Response {
    let store = state.store.clone();
    let config = match tokio::task::spawn_blocking(move || store.load()).await {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    let topics: Vec<&str> = (0..FORM_TOPICS)
        .map(|index| config.topic_at(index).unwrap_or(""))
        .collect();

    Html(render_form(
        &config.broker_address,
        &config.user,
        &config.password,
        &topics,
    ))
    .into_response()
}

/// Handler for `POST /`.
async fn save_form(
    State(state): State<AppState>,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    let store = state.store.clone();
    let form_config = tokio::task::spawn_blocking(move || {
        let config = apply_form(store.load(), &form);
        store.save(&config).map(|()| config)
    })
    .await;

    let config = match form_config {
        Ok(Ok(config)) => config,
        Ok(Err(e)) => {
            error!(error = %e, "Failed to save configuration");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to save configuration: {}\n", e),
            )
                .into_response();
        }
        Err(e) => {
            error!(error = %e, "Configuration save task failed");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    info!(
        broker = %config.broker_address,
        topics = config.topic_map.len(),
        "Configuration saved, restarting MQTT session"
    );
    if !state.reconnect.force_reconnect() {
        warn!("MQTT bridge is not running; new settings apply on next start");
    }

    Redirect::to("/").into_response()
}

/// Merge submitted form fields into `config`. The broker port is kept.
fn apply_form(mut config: DeviceConfig, form: &HashMap<String, String>) -> DeviceConfig {
    let field = |name: &str| form.get(name).cloned().unwrap_or_default();

    config.broker_address = field("broker").trim().to_string();
    config.user = field("user");
    config.password = field("pass");

    let mut topic_map = BTreeMap::new();
    for index in 0..FORM_TOPICS {
        let topic = field(&format!("topic_{}", index));
        let topic = topic.trim();
        if !topic.is_empty() {
            topic_map.insert(topic.to_string(), index);
        }
    }
    config.topic_map = topic_map;
    config
}

/// Handler for `GET /health`.
async fn health_handler() -> Response {
    (StatusCode::OK, "healthy\n").into_response()
}

fn render_form(broker: &str, user: &str, password: &str, topics: &[&str]) -> String {
    let mut rows = String::new();
    for (index, topic) in topics.iter().enumerate() {
        let _ = write!(
            rows,
            r#"            <label>DI{n} topic:</label><input type="text" name="topic_{index}" value="{topic}">
"#,
            n = index + 1,
            topic = escape_html(topic),
        );
    }

    format!(
        r#"<!DOCTYPE html>
<html>
<head><title>openWB Dimm- und Control-Kit Simulator</title>
<style>
    body {{ font-family: sans-serif; margin: 40px; background: #f4f4f4; }}
    .card {{ background: white; padding: 20px; border-radius: 8px; box-shadow: 0 2px 4px rgba(0,0,0,0.1); }}
    input {{ width: 100%; padding: 8px; margin: 10px 0; box-sizing: border-box; }}
    button {{ background: #007bff; color: white; border: none; padding: 10px 20px; border-radius: 4px; cursor: pointer; }}
    label {{ font-weight: bold; }}
</style>
</head>
<body>
    <div class="card">
        <h1>openWB Dimm- und Control-Kit Simulator</h1>
        <form method="POST">
            <h3>MQTT broker</h3>
            <label>Address:</label><input type="text" name="broker" value="{broker}">
            <label>User:</label><input type="text" name="user" value="{user}">
            <label>Password:</label><input type="password" name="pass" value="{password}">

            <h3>Topic mapping (DI1 - DI{count})</h3>
{rows}
            <button type="submit">Save &amp; reconnect</button>
        </form>
    </div>
</body>
</html>
"#,
        broker = escape_html(broker),
        user = escape_html(user),
        password = escape_html(password),
        count = topics.len(),
        rows = rows,
    )
}

fn escape_html(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            c => escaped.push(c),
        }
    }
    escaped
}

/// Configuration web server.
pub struct WebServer {
    listener: TcpListener,
    router: Router,
}

impl WebServer {
    pub async fn bind(
        addr: &str,
        store: ConfigStore,
        reconnect: ReconnectHandle,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            router: create_router(store, reconnect),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self) -> io::Result<()> {
        info!(addr = %self.local_addr()?, "Configuration web server listening");
        axum::serve(self.listener, self.router).await
    }
}
