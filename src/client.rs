use anyhow::{Context, Result};
use reqwest::{Response, StatusCode};
use std::collections::HashMap;

use crate::models::{Container, ContainerSpec, ExecutorResources, Tags};
use crate::server::rest::error::ErrorResponse;
use crate::server::rest::handlers::containers::AllocationResponse;

/// Thin client for a running executor's REST API.
pub struct ExecutorClient {
    http: reqwest::Client,
    base_url: String,
}

impl ExecutorClient {
    /// `base_url` is the server root, e.g. `http://127.0.0.1:1700`.
    pub fn new(base_url: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: format!("{}/api/v0", base_url.trim_end_matches('/')),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn check(response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let message = match response.json::<ErrorResponse>().await {
            Ok(body) => body.error.message,
            Err(_) => status.canonical_reason().unwrap_or("unknown error").to_string(),
        };
        anyhow::bail!("executor returned {}: {}", status.as_u16(), message)
    }

    pub async fn ping(&self) -> Result<()> {
        let response = self
            .http
            .get(self.url("/ping"))
            .send()
            .await
            .context("Failed to reach executor")?;
        Self::check(response).await?;
        Ok(())
    }

    pub async fn total_resources(&self) -> Result<ExecutorResources> {
        self.get_json("/resources/total").await
    }

    pub async fn remaining_resources(&self) -> Result<ExecutorResources> {
        self.get_json("/resources/remaining").await
    }

    pub async fn list_containers(&self, tags: &Tags) -> Result<Vec<Container>> {
        let response = self
            .http
            .get(self.url("/containers"))
            .query(tags)
            .send()
            .await
            .context("Failed to reach executor")?;
        Ok(Self::check(response).await?.json().await?)
    }

    pub async fn get_container(&self, guid: &str) -> Result<Option<Container>> {
        let response = self
            .http
            .get(self.url(&format!("/containers/{}", guid)))
            .send()
            .await
            .context("Failed to reach executor")?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(Self::check(response).await?.json().await?))
    }

    pub async fn allocate_containers(&self, specs: &[ContainerSpec]) -> Result<HashMap<String, String>> {
        let response = self
            .http
            .post(self.url("/containers"))
            .json(specs)
            .send()
            .await
            .context("Failed to reach executor")?;
        let body: AllocationResponse = Self::check(response).await?.json().await?;
        Ok(body.failed)
    }

    pub async fn run_container(&self, guid: &str) -> Result<()> {
        self.post_empty(&format!("/containers/{}/run", guid)).await
    }

    pub async fn stop_container(&self, guid: &str) -> Result<()> {
        self.post_empty(&format!("/containers/{}/stop", guid)).await
    }

    pub async fn delete_container(&self, guid: &str) -> Result<()> {
        let response = self
            .http
            .delete(self.url(&format!("/containers/{}", guid)))
            .send()
            .await
            .context("Failed to reach executor")?;
        Self::check(response).await?;
        Ok(())
    }

    async fn post_empty(&self, path: &str) -> Result<()> {
        let response = self
            .http
            .post(self.url(path))
            .send()
            .await
            .context("Failed to reach executor")?;
        Self::check(response).await?;
        Ok(())
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self
            .http
            .get(self.url(path))
            .send()
            .await
            .context("Failed to reach executor")?;
        Ok(Self::check(response).await?.json().await?)
    }
}
