//! ---
//! ms2m_section: "04-artifact-transfer"
//! ms2m_subsection: "module"
//! ms2m_type: "source"
//! ms2m_scope: "code"
//! ms2m_description: "OCI distribution push client."
//! ms2m_version: "v0.0.0-prealpha"
//! ms2m_owner: "tbd"
//! ---
//! Minimal OCI distribution client: ping, token auth, monolithic blob upload
//! and manifest put. Enough to publish one checkpoint image.

use std::collections::HashMap;
use std::io::{self, Read};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use ms2m_checkpoint::ImageArtifact;
use reqwest::header::{HeaderValue, AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, LOCATION, WWW_AUTHENTICATE};
use reqwest::{Body, Client, Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info};
use url::Url;

use crate::credentials::{Credential, CredentialProvider};
use crate::destination::ImageReference;
use crate::error::{Result, TransferError};
use crate::http_client;

const CHUNK_SIZE: usize = 64 * 1024;
const CHUNK_QUEUE: usize = 4;

/// Pushes checkpoint artifacts to an image registry.
#[derive(Clone)]
pub struct RegistryPusher {
    client: Client,
    credentials: Arc<dyn CredentialProvider>,
    insecure: bool,
}

impl std::fmt::Debug for RegistryPusher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryPusher")
            .field("insecure", &self.insecure)
            .finish_non_exhaustive()
    }
}

impl RegistryPusher {
    /// `insecure` accepts untrusted certificates and falls back to plain
    /// HTTP when TLS is not offered.
    pub fn new(credentials: Arc<dyn CredentialProvider>, insecure: bool) -> Result<Self> {
        let client = http_client(insecure)?;
        Ok(Self::with_client(client, credentials, insecure))
    }

    pub fn with_client(client: Client, credentials: Arc<dyn CredentialProvider>, insecure: bool) -> Self {
        Self {
            client,
            credentials,
            insecure,
        }
    }

    /// Upload every blob of `artifact` and tag its manifest as `reference`.
    /// Returns the manifest digest.
    pub async fn push(&self, artifact: &ImageArtifact, reference: &ImageReference) -> Result<String> {
        let target = reference.to_string();
        let fail = |reason: String| TransferError::PushFailed {
            reference: target.clone(),
            reason,
        };

        let session = self.open_session(reference).await.map_err(&fail)?;

        let layer = artifact.layer();
        if session.blob_exists(&layer.digest).await.map_err(&fail)? {
            debug!(digest = %layer.digest, "layer already present");
        } else {
            let body = layer_body(artifact)?;
            session
                .upload_blob(&layer.digest, layer.size, body)
                .await
                .map_err(&fail)?;
            info!(digest = %layer.digest, size = layer.size, "layer uploaded");
        }

        let config = artifact.config_descriptor();
        if !session.blob_exists(&config.digest).await.map_err(&fail)? {
            session
                .upload_blob(
                    &config.digest,
                    config.size,
                    Body::from(artifact.config_bytes().to_vec()),
                )
                .await
                .map_err(&fail)?;
        }

        session
            .put_manifest(
                &reference.reference,
                &artifact.manifest().media_type,
                artifact.manifest_bytes().to_vec(),
            )
            .await
            .map_err(&fail)?;

        let digest = artifact.manifest_digest();
        info!(reference = %target, %digest, "checkpoint image pushed");
        Ok(digest)
    }

    async fn open_session(&self, reference: &ImageReference) -> std::result::Result<Session, String> {
        let schemes: &[&str] = if self.insecure {
            &["https", "http"]
        } else {
            &["https"]
        };
        let mut last_error = String::from("no scheme attempted");
        for scheme in schemes {
            let base = Url::parse(&format!("{scheme}://{}/", reference.registry))
                .map_err(|err| err.to_string())?;
            let ping = base.join("v2/").map_err(|err| err.to_string())?;
            match self.client.get(ping).send().await {
                Ok(response) => return self.authenticate(base, response, reference).await,
                Err(err) => {
                    debug!(%scheme, registry = %reference.registry, error = %err, "registry ping failed");
                    last_error = err.to_string();
                }
            }
        }
        Err(last_error)
    }

    async fn authenticate(
        &self,
        base: Url,
        ping: Response,
        reference: &ImageReference,
    ) -> std::result::Result<Session, String> {
        let mut session = Session {
            client: self.client.clone(),
            base,
            repository: reference.repository.clone(),
            authorization: None,
        };
        if ping.status().is_success() {
            return Ok(session);
        }
        if ping.status() != StatusCode::UNAUTHORIZED {
            return Err(format!("registry ping returned {}", ping.status()));
        }

        let challenge = ping
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|value| value.to_str().ok())
            .map(Challenge::parse)
            .ok_or_else(|| "registry requires auth but sent no challenge".to_owned())?;
        let credential = self
            .credentials
            .resolve(&reference.registry)
            .map_err(|err| err.to_string())?;

        let header = match challenge.scheme.as_str() {
            "basic" => match credential {
                Some(Credential::Basic { username, password }) => {
                    format!("Basic {}", STANDARD.encode(format!("{username}:{password}")))
                }
                _ => return Err("registry requires basic auth but no credentials found".into()),
            },
            "bearer" => {
                let token = self
                    .fetch_token(&challenge, &reference.repository, credential)
                    .await?;
                format!("Bearer {token}")
            }
            other => return Err(format!("unsupported auth scheme {other:?}")),
        };
        session.authorization =
            Some(HeaderValue::from_str(&header).map_err(|err| err.to_string())?);
        Ok(session)
    }

    async fn fetch_token(
        &self,
        challenge: &Challenge,
        repository: &str,
        credential: Option<Credential>,
    ) -> std::result::Result<String, String> {
        let realm = challenge
            .params
            .get("realm")
            .ok_or_else(|| "bearer challenge without realm".to_owned())?;
        let scope = format!("repository:{repository}:pull,push");
        let service = challenge.params.get("service").cloned().unwrap_or_default();

        let request = match credential {
            Some(Credential::IdentityToken(token)) => self.client.post(realm.as_str()).form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", token.as_str()),
                ("service", service.as_str()),
                ("scope", scope.as_str()),
            ]),
            Some(Credential::Basic { username, password }) => self
                .client
                .get(realm.as_str())
                .query(&[("service", &service), ("scope", &scope)])
                .basic_auth(username, Some(password)),
            None => self
                .client
                .get(realm.as_str())
                .query(&[("service", &service), ("scope", &scope)]),
        };
        let response = expect(request.send().await, &[StatusCode::OK], "token request").await?;
        let token: TokenResponse = response.json().await.map_err(|err| err.to_string())?;
        token
            .token
            .or(token.access_token)
            .ok_or_else(|| "token endpoint returned no token".to_owned())
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Challenge {
    scheme: String,
    params: HashMap<String, String>,
}

impl Challenge {
    /// Parse `Bearer realm="...",service="..."`.
    fn parse(header: &str) -> Self {
        let header = header.trim();
        let (scheme, rest) = header.split_once(' ').unwrap_or((header, ""));
        let mut params = HashMap::new();
        let mut remaining = rest.trim();
        while !remaining.is_empty() {
            let Some((key, after)) = remaining.split_once('=') else {
                break;
            };
            let key = key.trim().trim_start_matches(',').trim().to_ascii_lowercase();
            let after = after.trim_start();
            let (value, tail) = if let Some(quoted) = after.strip_prefix('"') {
                match quoted.find('"') {
                    Some(end) => (&quoted[..end], &quoted[end + 1..]),
                    None => (quoted, ""),
                }
            } else {
                match after.find(',') {
                    Some(end) => (&after[..end], &after[end..]),
                    None => (after, ""),
                }
            };
            params.insert(key, value.to_owned());
            remaining = tail.trim_start_matches(|c: char| c == ',' || c.is_whitespace());
        }
        Self {
            scheme: scheme.to_ascii_lowercase(),
            params,
        }
    }
}

struct Session {
    client: Client,
    base: Url,
    repository: String,
    authorization: Option<HeaderValue>,
}

impl Session {
    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let builder = self.client.request(method, url);
        match &self.authorization {
            Some(value) => builder.header(AUTHORIZATION, value.clone()),
            None => builder,
        }
    }

    fn endpoint(&self, path: &str) -> std::result::Result<Url, String> {
        self.base
            .join(&format!("v2/{}/{path}", self.repository))
            .map_err(|err| err.to_string())
    }

    async fn blob_exists(&self, digest: &str) -> std::result::Result<bool, String> {
        let url = self.endpoint(&format!("blobs/{digest}"))?;
        let response = self
            .request(Method::HEAD, url)
            .send()
            .await
            .map_err(|err| err.to_string())?;
        match response.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(format!("blob check for {digest} returned {status}")),
        }
    }

    async fn upload_blob(&self, digest: &str, size: u64, body: Body) -> std::result::Result<(), String> {
        let start = self.endpoint("blobs/uploads/")?;
        let response = expect(
            self.request(Method::POST, start).send().await,
            &[StatusCode::ACCEPTED],
            "upload start",
        )
        .await?;
        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| "upload start returned no location".to_owned())?;
        let mut upload = self.base.join(location).map_err(|err| err.to_string())?;
        upload.query_pairs_mut().append_pair("digest", digest);

        expect(
            self.request(Method::PUT, upload)
                .header(CONTENT_TYPE, "application/octet-stream")
                .header(CONTENT_LENGTH, size)
                .body(body)
                .send()
                .await,
            &[StatusCode::CREATED],
            "blob upload",
        )
        .await?;
        Ok(())
    }

    async fn put_manifest(
        &self,
        reference: &str,
        media_type: &str,
        manifest: Vec<u8>,
    ) -> std::result::Result<(), String> {
        let url = self.endpoint(&format!("manifests/{reference}"))?;
        expect(
            self.request(Method::PUT, url)
                .header(CONTENT_TYPE, media_type)
                .body(manifest)
                .send()
                .await,
            &[StatusCode::CREATED, StatusCode::OK],
            "manifest put",
        )
        .await?;
        Ok(())
    }
}

async fn expect(
    sent: reqwest::Result<Response>,
    accepted: &[StatusCode],
    what: &str,
) -> std::result::Result<Response, String> {
    let response = sent.map_err(|err| format!("{what}: {err}"))?;
    let status = response.status();
    if accepted.contains(&status) {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(format!("{what} returned {status}: {}", body.trim()))
}

/// Stream the layer blob off a blocking reader without holding it in memory.
fn layer_body(artifact: &ImageArtifact) -> Result<Body> {
    let mut reader = artifact.open_layer()?;
    let (tx, rx) = mpsc::channel::<io::Result<Bytes>>(CHUNK_QUEUE);
    tokio::task::spawn_blocking(move || {
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.blocking_send(Ok(Bytes::copy_from_slice(&buf[..n]))).is_err() {
                        break;
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    let _ = tx.blocking_send(Err(err));
                    break;
                }
            }
        }
    });
    let stream = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|chunk| (chunk, rx))
    });
    Ok(Body::wrap_stream(stream))
}
