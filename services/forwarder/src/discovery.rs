//! Service-registry endpoint resolution.
//!
//! The registry is an external collaborator: a function from
//! (service, namespace) to a list of "host:port" endpoints. It sits
//! behind the [`Resolver`] trait so listeners can be exercised against
//! a fake in tests. Lookup failures are never fatal; callers log them
//! and keep the previously resolved set.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde::Deserialize;

use crate::error::DiscoveryError;

/// Resolves backend endpoints for a service.
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Current "host:port" endpoints for `service` in `namespace`.
    async fn endpoints(
        &self,
        service: &str,
        namespace: &str,
    ) -> Result<Vec<String>, DiscoveryError>;
}

#[derive(Debug, Deserialize)]
struct EndpointsResponse {
    endpoints: Vec<String>,
}

/// HTTP client for the service registry.
pub struct RegistryClient {
    client: reqwest::Client,
    base_url: String,
}

impl RegistryClient {
    /// Build a client for the registry at `base_url`, with an optional
    /// bearer token.
    pub fn new(base_url: &str, token: Option<&str>) -> Result<Self, DiscoveryError> {
        let mut headers = HeaderMap::new();
        if let Some(token) = token {
            let raw = token.trim();
            let bearer = if raw.starts_with("Bearer ") || raw.starts_with("bearer ") {
                raw.to_string()
            } else {
                format!("Bearer {raw}")
            };

            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&bearer)
                    .map_err(|e| DiscoveryError::InvalidToken(e.to_string()))?,
            );
        }

        let client = reqwest::Client::builder()
            .user_agent("flowgate-forwarder/0.1.0")
            .default_headers(headers)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl Resolver for RegistryClient {
    async fn endpoints(
        &self,
        service: &str,
        namespace: &str,
    ) -> Result<Vec<String>, DiscoveryError> {
        let url = format!(
            "{}/v1/namespaces/{namespace}/services/{service}/endpoints",
            self.base_url
        );

        let resp = self.client.get(url).send().await?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(DiscoveryError::Status { status, body });
        }

        let decoded = resp.json::<EndpointsResponse>().await?;
        Ok(decoded.endpoints)
    }
}

/// In-memory resolver for tests and registry-less deployments.
#[derive(Default)]
pub struct StaticResolver {
    entries: Mutex<HashMap<(String, String), Vec<String>>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the endpoints returned for (service, namespace).
    pub fn insert(&self, service: &str, namespace: &str, endpoints: Vec<String>) {
        self.entries
            .lock()
            .expect("static resolver lock poisoned")
            .insert((service.to_string(), namespace.to_string()), endpoints);
    }

    /// Drop the entry for (service, namespace); later lookups fail.
    pub fn remove(&self, service: &str, namespace: &str) {
        self.entries
            .lock()
            .expect("static resolver lock poisoned")
            .remove(&(service.to_string(), namespace.to_string()));
    }
}

#[async_trait]
impl Resolver for StaticResolver {
    async fn endpoints(
        &self,
        service: &str,
        namespace: &str,
    ) -> Result<Vec<String>, DiscoveryError> {
        self.entries
            .lock()
            .expect("static resolver lock poisoned")
            .get(&(service.to_string(), namespace.to_string()))
            .cloned()
            .ok_or_else(|| DiscoveryError::UnknownService {
                service: service.to_string(),
                namespace: namespace.to_string(),
            })
    }
}
