//! Backup state query over the vMix HTTP web API.
//!
//! The persistent TCP channel can miss or mangle a push. Every 30 seconds the
//! client independently fetches the same XML document over a separate,
//! short-lived HTTP request and runs it through the normal inputs dedup.

use anyhow::{Context, Result};
use chrono::Utc;
use reqwest::Client;

use super::document::VmixDocument;
use super::types::InputSetSnapshot;
use crate::constants::{HTTP_BACKUP_TIMEOUT, VMIX_HTTP_XML_PATH};

/// HTTP client for the vMix web API.
#[derive(Debug, Clone)]
pub struct BackupQuery {
    client: Client,
    url: String,
}

impl BackupQuery {
    /// Create a query against `http://{host}:{port}/api/?Function=XML`.
    pub fn new(host: &str, port: u16) -> Result<Self> {
        let client = Client::builder()
            .timeout(HTTP_BACKUP_TIMEOUT)
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            client,
            url: format!("http://{host}:{port}{VMIX_HTTP_XML_PATH}"),
        })
    }

    /// Request URL.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Fetch the document and extract its inputs.
    ///
    /// Returns `Ok(None)` when the document has no inputs section.
    pub async fn fetch_inputs(&self) -> Result<Option<InputSetSnapshot>> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .with_context(|| format!("GET {} failed", self.url))?;

        if !response.status().is_success() {
            anyhow::bail!("GET {} returned {}", self.url, response.status());
        }

        let body = response.text().await.context("failed to read response body")?;
        let document = VmixDocument::parse(&body).context("invalid vMix XML from HTTP API")?;
        Ok(document.input_set(Utc::now()))
    }
}
