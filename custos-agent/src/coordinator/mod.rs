//! The only component that talks to the outside world.
//!
//! One pooled HTTPS client, optional mTLS, a host allowlist enforced
//! before every request, and exponential backoff on transient failures.
//! Signature verification of fetched orders is not done here; that is the
//! verifier's job.

use std::fs;
use std::path::Path;
use std::time::Duration;

use reqwest::{Client, StatusCode, Url};
use thiserror::Error;
use tracing::{debug, warn};

use custos_shared::identity::{DeploymentMode, SiteIdentity};
use custos_shared::order::{Order, PendingOrdersResponse};

use crate::config::AgentConfig;

const HEADER_SITE: &str = "x-custos-site-id";
const HEADER_HOST: &str = "x-custos-host-id";
const HEADER_MODE: &str = "x-custos-deployment-mode";
const HEADER_RESELLER: &str = "x-custos-reseller-id";

#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// 401/403: never retried, operator attention required.
    #[error("authentication rejected by coordinator (status {status})")]
    Auth { status: u16 },
    /// Connection refused, DNS failure, timeout, 5xx after retries.
    #[error("coordinator unreachable: {0}")]
    Transport(String),
    /// Non-auth 4xx and other unexpected statuses; not retryable.
    #[error("coordinator returned status {status}: {body}")]
    Status { status: u16, body: String },
    /// The request targeted a host outside the allowlist; failed closed.
    #[error("host {host:?} is not in the coordinator allowlist")]
    Disallowed { host: String },
    #[error("bad response payload: {0}")]
    Payload(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CoordinatorError {
    pub fn is_auth(&self) -> bool {
        matches!(self, CoordinatorError::Auth { .. })
    }
}

pub struct CoordinatorClient {
    http: Client,
    base_url: Url,
    allowed_hosts: Vec<String>,
    identity: SiteIdentity,
    bearer_token: Option<String>,
    max_attempts: u32,
}

impl CoordinatorClient {
    pub fn new(config: &AgentConfig) -> anyhow::Result<Self> {
        use anyhow::Context;

        let base_url: Url = config
            .coordinator_url
            .parse()
            .context("invalid coordinator_url")?;

        let mut builder = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .use_rustls_tls();

        if let Some(ca_path) = &config.trusted_ca_path {
            let pem = fs::read(ca_path)
                .with_context(|| format!("failed to read trusted CA {}", ca_path.display()))?;
            let cert = reqwest::Certificate::from_pem(&pem).context("invalid trusted CA PEM")?;
            builder = builder.add_root_certificate(cert);
        }

        if let (Some(cert_path), Some(key_path)) =
            (&config.client_cert_path, &config.client_key_path)
        {
            crate::util::fs::ensure_owner_only(key_path)?;
            let mut pem = fs::read(cert_path)
                .with_context(|| format!("failed to read client cert {}", cert_path.display()))?;
            let key = fs::read(key_path)
                .with_context(|| format!("failed to read client key {}", key_path.display()))?;
            pem.extend_from_slice(&key);
            let identity =
                reqwest::Identity::from_pem(&pem).context("invalid client identity PEM")?;
            builder = builder.identity(identity);
        }

        let bearer_token = match &config.bearer_token_path {
            Some(path) => {
                crate::util::fs::ensure_owner_only(path)?;
                let token = fs::read_to_string(path)
                    .with_context(|| format!("failed to read bearer token {}", path.display()))?;
                Some(token.trim().to_string())
            }
            None => None,
        };

        Ok(CoordinatorClient {
            http: builder.build().context("failed to build HTTP client")?,
            base_url,
            allowed_hosts: config.coordinator_allowed_hosts.clone(),
            identity: config.site_identity(),
            bearer_token,
            max_attempts: config.max_retry_attempts.max(1),
        })
    }

    fn ensure_allowed(&self, url: &Url) -> Result<(), CoordinatorError> {
        let host = url.host_str().unwrap_or_default();
        if self
            .allowed_hosts
            .iter()
            .any(|h| h.eq_ignore_ascii_case(host))
        {
            Ok(())
        } else {
            Err(CoordinatorError::Disallowed {
                host: host.to_string(),
            })
        }
    }

    fn endpoint(&self, path: &str) -> Result<Url, CoordinatorError> {
        let url = self
            .base_url
            .join(path)
            .map_err(|e| CoordinatorError::Payload(e.to_string()))?;
        self.ensure_allowed(&url)?;
        Ok(url)
    }

    fn decorate(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let mut req = req
            .header(HEADER_SITE, &self.identity.site_id)
            .header(HEADER_HOST, &self.identity.host_id)
            .header(HEADER_MODE, self.identity.deployment_mode.as_str());
        if self.identity.deployment_mode == DeploymentMode::Reseller {
            if let Some(reseller) = &self.identity.reseller_id {
                req = req.header(HEADER_RESELLER, reseller);
            }
        }
        if let Some(token) = &self.bearer_token {
            req = req.bearer_auth(token);
        }
        req
    }

    /// Retry policy: attempt N waits 2^(N-1) seconds, on transport errors
    /// and 5xx only. Auth errors and other 4xx short-circuit.
    async fn send_with_retry<F>(&self, mut build: F) -> Result<reqwest::Response, CoordinatorError>
    where
        F: FnMut() -> reqwest::RequestBuilder,
    {
        let mut last_error = String::new();
        for attempt in 1..=self.max_attempts {
            if attempt > 1 {
                let backoff = Duration::from_secs(1u64 << (attempt - 2).min(6));
                debug!(attempt, ?backoff, "retrying coordinator request");
                tokio::time::sleep(backoff).await;
            }
            match self.decorate(build()).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return Ok(resp);
                    }
                    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                        return Err(CoordinatorError::Auth {
                            status: status.as_u16(),
                        });
                    }
                    let body = resp.text().await.unwrap_or_default();
                    if status.is_server_error() {
                        last_error = format!("status {status}: {body}");
                        continue;
                    }
                    return Err(CoordinatorError::Status {
                        status: status.as_u16(),
                        body,
                    });
                }
                Err(err) => {
                    last_error = err.to_string();
                    continue;
                }
            }
        }
        Err(CoordinatorError::Transport(last_error))
    }

    /// Fetch pending orders for this site. Transport failure is reported
    /// as an error so the cycle can note the coordinator as unreachable
    /// and keep working from the queue.
    pub async fn fetch_pending_orders(&self, limit: usize) -> Result<Vec<Order>, CoordinatorError> {
        let mut url = self.endpoint("/api/orders/pending")?;
        url.query_pairs_mut()
            .append_pair("site_id", &self.identity.site_id)
            .append_pair("limit", &limit.to_string());

        let resp = self.send_with_retry(|| self.http.get(url.clone())).await?;
        let body: PendingOrdersResponse = resp
            .json()
            .await
            .map_err(|e| CoordinatorError::Payload(e.to_string()))?;
        debug!(count = body.orders.len(), "fetched pending orders");
        Ok(body.orders)
    }

    /// Upload one bundle + detached signature as multipart. Failure is not
    /// fatal; the bundle stays queued.
    pub async fn upload_bundle(
        &self,
        bundle_path: &Path,
        signature_path: &Path,
    ) -> Result<(), CoordinatorError> {
        let url = self.endpoint("/api/evidence")?;
        let bundle = tokio::fs::read(bundle_path).await?;
        let signature = tokio::fs::read(signature_path).await?;

        let resp = self
            .send_with_retry(|| {
                let bundle_part =
                    reqwest::multipart::Part::bytes(bundle.clone()).file_name("bundle.json");
                let sig_part =
                    reqwest::multipart::Part::bytes(signature.clone()).file_name("bundle.sig");
                let form = reqwest::multipart::Form::new()
                    .part("bundle", bundle_part)
                    .part("signature", sig_part);
                self.http.post(url.clone()).multipart(form)
            })
            .await?;

        match resp.status() {
            StatusCode::OK | StatusCode::CREATED => Ok(()),
            status => Err(CoordinatorError::Status {
                status: status.as_u16(),
                body: resp.text().await.unwrap_or_default(),
            }),
        }
    }

    pub async fn health_check(&self) -> bool {
        let url = match self.endpoint("/health") {
            Ok(url) => url,
            Err(err) => {
                warn!(%err, "health check refused");
                return false;
            }
        };
        match self.decorate(self.http.get(url)).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    /// Operator tooling: status of one order.
    pub async fn order_status(
        &self,
        order_id: &str,
    ) -> Result<serde_json::Value, CoordinatorError> {
        let url = self.endpoint(&format!("/api/orders/{order_id}/status"))?;
        let resp = self.send_with_retry(|| self.http.get(url.clone())).await?;
        resp.json()
            .await
            .map_err(|e| CoordinatorError::Payload(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests_support::minimal_config;
    use tempfile::TempDir;

    fn client(dir: &TempDir) -> CoordinatorClient {
        let mut config = minimal_config(dir.path());
        config.max_retry_attempts = 1;
        config.request_timeout_seconds = 1;
        CoordinatorClient::new(&config).unwrap()
    }

    #[test]
    fn test_disallowed_host_fails_closed() {
        let dir = TempDir::new().unwrap();
        let c = client(&dir);
        let url: Url = "https://evil.example.net/api/evidence".parse().unwrap();
        assert!(matches!(
            c.ensure_allowed(&url),
            Err(CoordinatorError::Disallowed { .. })
        ));
    }

    #[test]
    fn test_allowlist_is_case_insensitive() {
        let dir = TempDir::new().unwrap();
        let c = client(&dir);
        let url: Url = "https://Coordinator.Example.Com/health".parse().unwrap();
        assert!(c.ensure_allowed(&url).is_ok());
    }

    #[tokio::test]
    async fn test_unreachable_coordinator_is_transport_error() {
        let dir = TempDir::new().unwrap();
        let mut config = minimal_config(dir.path());
        // nothing listens on this port
        config.coordinator_url = "http://127.0.0.1:9".to_string();
        config.coordinator_allowed_hosts = vec!["127.0.0.1".to_string()];
        config.max_retry_attempts = 1;
        config.request_timeout_seconds = 1;
        let c = CoordinatorClient::new(&config).unwrap();
        match c.fetch_pending_orders(10).await {
            Err(CoordinatorError::Transport(_)) => {}
            other => panic!("expected transport error, got {other:?}"),
        }
        assert!(!c.health_check().await);
    }
}
