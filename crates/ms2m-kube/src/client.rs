//! ---
//! ms2m_section: "08-control-plane"
//! ms2m_subsection: "module"
//! ms2m_type: "source"
//! ms2m_scope: "code"
//! ms2m_description: "Minimal JSON client for the cluster API server."
//! ms2m_version: "v0.0.0-prealpha"
//! ms2m_owner: "tbd"
//! ---
//! Just enough of the API server protocol for the controller: typed GET,
//! POST, PUT, merge PATCH and DELETE, plus a raw response for watches.

use std::path::{Path, PathBuf};
use std::time::Duration;

use ms2m_common::KubeConfig;
use reqwest::{Certificate, Client, Method, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::error::{KubeError, Result};

const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";
const MERGE_PATCH: &str = "application/merge-patch+json";

#[derive(Clone)]
pub struct ApiServerClient {
    client: Client,
    base: Url,
    token: Option<String>,
    timeout: Duration,
}

impl std::fmt::Debug for ApiServerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiServerClient")
            .field("base", &self.base.as_str())
            .field("authenticated", &self.token.is_some())
            .finish()
    }
}

/// Body of a non-2xx API server response.
#[derive(Debug, Deserialize)]
struct StatusBody {
    #[serde(default)]
    message: String,
}

impl ApiServerClient {
    pub fn new(client: Client, base: Url, token: Option<String>, timeout: Duration) -> Self {
        Self {
            client,
            base,
            token,
            timeout,
        }
    }

    /// Build from `[kube]`. Without an explicit `api_server` the in-cluster
    /// service account is used.
    pub fn from_config(config: &KubeConfig) -> Result<Self> {
        let sa = Path::new(SERVICE_ACCOUNT_DIR);
        let (server, default_token, default_ca) = match &config.api_server {
            Some(server) => (server.clone(), None, None),
            None => {
                let host = std::env::var("KUBERNETES_SERVICE_HOST").map_err(|_| {
                    KubeError::Config(
                        "kube.api_server unset and KUBERNETES_SERVICE_HOST missing".into(),
                    )
                })?;
                let port =
                    std::env::var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|_| "443".into());
                let host = if host.contains(':') {
                    format!("[{host}]")
                } else {
                    host
                };
                (
                    format!("https://{host}:{port}"),
                    Some(sa.join("token")),
                    Some(sa.join("ca.crt")),
                )
            }
        };
        let base = Url::parse(&server)
            .map_err(|err| KubeError::Config(format!("api server {server:?}: {err}")))?;

        let token_path: Option<PathBuf> = config.token_path.clone().or(default_token);
        let token = match token_path {
            Some(path) => Some(
                std::fs::read_to_string(&path)
                    .map_err(|err| {
                        KubeError::Config(format!("reading token {}: {err}", path.display()))
                    })?
                    .trim()
                    .to_owned(),
            ),
            None => None,
        };

        let mut builder = Client::builder().danger_accept_invalid_certs(config.insecure_skip_tls_verify);
        if let Some(ca_path) = config.ca_path.clone().or(default_ca) {
            let pem = std::fs::read(&ca_path).map_err(|err| {
                KubeError::Config(format!("reading CA {}: {err}", ca_path.display()))
            })?;
            let certificate = Certificate::from_pem(&pem)
                .map_err(|err| KubeError::Config(format!("parsing CA: {err}")))?;
            builder = builder.add_root_certificate(certificate);
        }
        let client = builder
            .build()
            .map_err(|err| KubeError::Config(err.to_string()))?;
        debug!(server = %base, "api server client configured");
        Ok(Self::new(client, base, token, config.request_timeout))
    }

    pub fn url(&self, path: &str, query: &[(&str, &str)]) -> Result<Url> {
        let mut url = self
            .base
            .join(path)
            .map_err(|err| KubeError::Config(format!("path {path:?}: {err}")))?;
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> reqwest::RequestBuilder {
        let builder = self.client.request(method, url);
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send(
        &self,
        method: Method,
        url: Url,
        body: Option<(&'static str, Vec<u8>)>,
        timeout: Option<Duration>,
    ) -> Result<Response> {
        let mut builder = self.request(method, url.clone());
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        if let Some((content_type, bytes)) = body {
            builder = builder
                .header(reqwest::header::CONTENT_TYPE, content_type)
                .body(bytes);
        }
        let response = builder.send().await.map_err(|err| KubeError::Transport {
            url: url.to_string(),
            reason: err.to_string(),
        })?;
        ensure_success(response).await
    }

    async fn decode<T: DeserializeOwned>(response: Response) -> Result<T> {
        let url = response.url().to_string();
        let bytes = response.bytes().await.map_err(|err| KubeError::Transport {
            url: url.clone(),
            reason: err.to_string(),
        })?;
        serde_json::from_slice(&bytes).map_err(|err| KubeError::Decode {
            what: url,
            reason: err.to_string(),
        })
    }

    fn encode<B: Serialize>(body: &B) -> Result<Vec<u8>> {
        serde_json::to_vec(body).map_err(|err| KubeError::Decode {
            what: "request body".into(),
            reason: err.to_string(),
        })
    }

    /// `None` on 404.
    pub async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<Option<T>> {
        let url = self.url(path, query)?;
        match self.send(Method::GET, url, None, Some(self.timeout)).await {
            Ok(response) => Self::decode(response).await.map(Some),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub async fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        let url = self.url(path, &[])?;
        let body = Some(("application/json", Self::encode(body)?));
        let response = self.send(Method::POST, url, body, Some(self.timeout)).await?;
        Self::decode(response).await
    }

    /// POST without a body, returning the raw bytes.
    pub async fn post_empty(&self, path: &str) -> Result<bytes::Bytes> {
        let url = self.url(path, &[])?;
        let response = self.send(Method::POST, url.clone(), None, Some(self.timeout)).await?;
        response.bytes().await.map_err(|err| KubeError::Transport {
            url: url.to_string(),
            reason: err.to_string(),
        })
    }

    pub async fn put<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        let url = self.url(path, &[])?;
        let body = Some(("application/json", Self::encode(body)?));
        let response = self.send(Method::PUT, url, body, Some(self.timeout)).await?;
        Self::decode(response).await
    }

    pub async fn merge_patch<B: Serialize>(&self, path: &str, body: &B) -> Result<()> {
        let url = self.url(path, &[])?;
        let body = Some((MERGE_PATCH, Self::encode(body)?));
        self.send(Method::PATCH, url, body, Some(self.timeout))
            .await
            .map(drop)
    }

    /// `false` when the object was already gone.
    pub async fn delete(&self, path: &str) -> Result<bool> {
        let url = self.url(path, &[])?;
        match self.send(Method::DELETE, url, None, Some(self.timeout)).await {
            Ok(_) => Ok(true),
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Long-lived GET for watch streams; no per-request timeout.
    pub async fn stream(&self, path: &str, query: &[(&str, &str)]) -> Result<Response> {
        let url = self.url(path, query)?;
        self.send(Method::GET, url, None, None).await
    }
}

async fn ensure_success(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let url = response.url().to_string();
    let text = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<StatusBody>(&text)
        .ok()
        .map(|body| body.message)
        .filter(|message| !message.is_empty())
        .unwrap_or_else(|| text.trim().to_owned());
    Err(KubeError::Status {
        status: status.as_u16(),
        url,
        message,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_joins_absolute_paths_and_encodes_query() {
        let client = ApiServerClient::new(
            Client::new(),
            Url::parse("https://10.96.0.1:443").unwrap(),
            None,
            Duration::from_secs(5),
        );
        let url = client
            .url(
                "/api/v1/pods",
                &[("fieldSelector", "spec.nodeName=worker-2,status.phase=Running")],
            )
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://10.96.0.1/api/v1/pods?fieldSelector=spec.nodeName%3Dworker-2%2Cstatus.phase%3DRunning"
        );
    }

    #[test]
    fn explicit_server_without_token_is_accepted() {
        let config = KubeConfig {
            api_server: Some("http://127.0.0.1:6443".into()),
            ..KubeConfig::default()
        };
        let client = ApiServerClient::from_config(&config).unwrap();
        assert!(format!("{client:?}").contains("authenticated: false"));
    }
}
