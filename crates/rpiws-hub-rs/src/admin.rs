//! Plain HTTP endpoint for administrators: list connected agents and push
//! binding configurations.

use crate::hub::HubHandle;
use crate::registry::AgentSummary;
use axum::{
    extract::{Form, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use rpiws_core::binding::BindingRequest;
use serde::Deserialize;
use std::collections::HashMap;
use tracing::{info, warn};

/// One agent's requested bindings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ConfigRequest {
    pub mac: String,
    #[serde(default)]
    pub read: Vec<BindingRequest>,
    #[serde(default)]
    pub write: Vec<BindingRequest>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ConfigBatch {
    One(ConfigRequest),
    Many(Vec<ConfigRequest>),
}

/// The `json` form field holds a single request or an array of them.
pub fn parse_batch(raw: &str) -> Result<Vec<ConfigRequest>, serde_json::Error> {
    Ok(match serde_json::from_str(raw)? {
        ConfigBatch::One(request) => vec![request],
        ConfigBatch::Many(requests) => requests,
    })
}

pub fn router(hub: HubHandle) -> Router {
    Router::new()
        .route("/", get(list_agents).post(push_config))
        .with_state(hub)
}

async fn list_agents(State(hub): State<HubHandle>) -> Json<Vec<AgentSummary>> {
    Json(hub.list_agents().await)
}

async fn push_config(
    State(hub): State<HubHandle>,
    Form(form): Form<HashMap<String, String>>,
) -> (StatusCode, &'static str) {
    let Some(raw) = form.get("json") else {
        warn!(event = "admin_config_invalid", error = "missing json field");
        return (StatusCode::BAD_REQUEST, "error");
    };
    let batch = match parse_batch(raw) {
        Ok(batch) => batch,
        Err(err) => {
            warn!(event = "admin_config_invalid", error = %err);
            return (StatusCode::BAD_REQUEST, "error");
        }
    };
    for request in batch {
        let mac = request.mac.clone();
        match hub.configure(request).await {
            Some(true) => info!(event = "admin_config_applied", mac = %mac),
            Some(false) => info!(event = "admin_config_not_found", mac = %mac),
            None => warn!(event = "admin_config_dropped", mac = %mac),
        }
    }
    (StatusCode::OK, "ok")
}
