//! Mirrors agent presence to the administrative site. Fire and forget:
//! failures are logged and never reach a session.

use anyhow::Context;
use rpiws_core::protocol::InterfaceDescriptor;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Clone, Debug)]
pub struct SiteComm {
    client: reqwest::Client,
    base: String,
}

impl SiteComm {
    pub fn new(site_addr: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("build site http client")?;
        Ok(Self {
            client,
            base: site_base(site_addr),
        })
    }

    pub fn url(&self, action: &str) -> String {
        format!("{}/ws_comm/{action}/", self.base)
    }

    pub async fn register(&self, mac: &str, ip: &str, inter_face: &InterfaceDescriptor) {
        let body = json!({ "mac": mac, "ip": ip, "inter_face": inter_face });
        self.post("register", body).await;
    }

    pub async fn disconnect(&self, mac: &str) {
        self.post("disconnect", json!({ "mac": mac })).await;
    }

    async fn post(&self, action: &str, body: Value) {
        let url = self.url(action);
        let result = self
            .client
            .post(&url)
            .form(&[("json", body.to_string())])
            .send()
            .await
            .and_then(reqwest::Response::error_for_status);
        match result {
            Ok(_) => debug!(event = "site_comm_ok", action = action, url = %url),
            Err(err) => warn!(event = "site_comm_error", action = action, url = %url, error = %err),
        }
    }
}

fn site_base(site_addr: &str) -> String {
    let trimmed = site_addr.trim().trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    }
}
