//! HTTP client for a remote gateway's control plane.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use sessiongate_protocol::{
    BackendDescriptor, CreateSessionRequest, CreateSessionResponse, DiscoverServerResponse,
    HealthResponse, Metadata, RegisterServerRequest, RegisterServerResponse, RemoveServerResponse,
    RevokeSessionRequest, RevokeSessionResponse,
};

#[derive(Debug, Clone)]
pub struct GatewayClient {
    base_url: String,
    client: reqwest::Client,
}

impl GatewayClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building gateway HTTP client")?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn get(&self, path: &str) -> Result<reqwest::Response> {
        let url = format!("{}{}", self.base_url, path);
        self.client
            .get(&url)
            .send()
            .await
            .context("sending request to gateway")
    }

    async fn delete(&self, path: &str) -> Result<reqwest::Response> {
        let url = format!("{}{}", self.base_url, path);
        self.client
            .delete(&url)
            .send()
            .await
            .context("sending request to gateway")
    }

    async fn post_json<T: serde::Serialize>(
        &self,
        path: &str,
        body: &T,
    ) -> Result<reqwest::Response> {
        let url = format!("{}{}", self.base_url, path);
        self.client
            .post(&url)
            .json(body)
            .send()
            .await
            .context("sending request to gateway")
    }

    /// `None` when the gateway has no registration under this name.
    pub async fn discover_server(&self, server_name: &str) -> Result<Option<DiscoverServerResponse>> {
        let path = format!("/discover-server/{}", urlencoding::encode(server_name));
        let response = self.get(&path).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(read_json(response, "discover-server").await?))
    }

    pub async fn register_server(
        &self,
        server_name: &str,
        backend: BackendDescriptor,
        metadata: Option<Metadata>,
    ) -> Result<RegisterServerResponse> {
        let body = RegisterServerRequest {
            server_name: server_name.to_string(),
            backend,
            metadata,
        };
        let response = self.post_json("/register-server", &body).await?;
        read_json(response, "register-server").await
    }

    pub async fn unregister_server(&self, server_name: &str) -> Result<bool> {
        let path = format!("/register-server/{}", urlencoding::encode(server_name));
        let response = self.delete(&path).await?;
        let body: RemoveServerResponse = read_json(response, "unregister-server").await?;
        Ok(body.removed)
    }

    pub async fn create_session(&self, request: &CreateSessionRequest) -> Result<CreateSessionResponse> {
        let response = self.post_json("/create-session", request).await?;
        read_json(response, "create-session").await
    }

    pub async fn revoke_session(&self, token: &str) -> Result<bool> {
        let body = RevokeSessionRequest {
            token: token.to_string(),
        };
        let response = self.post_json("/revoke-session", &body).await?;
        let body: RevokeSessionResponse = read_json(response, "revoke-session").await?;
        Ok(body.revoked)
    }

    pub async fn health(&self) -> Result<HealthResponse> {
        let response = self.get("/health").await?;
        read_json(response, "health").await
    }
}

async fn read_json<T: DeserializeOwned>(response: reqwest::Response, what: &str) -> Result<T> {
    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        bail!("gateway {} failed ({}): {}", what, status, text);
    }
    response
        .json()
        .await
        .with_context(|| format!("parsing gateway {} response", what))
}
