//! ---
//! ms2m_section: "04-artifact-transfer"
//! ms2m_subsection: "module"
//! ms2m_type: "source"
//! ms2m_scope: "code"
//! ms2m_description: "Registry credential providers."
//! ms2m_version: "v0.0.0-prealpha"
//! ms2m_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Deserialize;
use tracing::debug;

use crate::error::{Result, TransferError};

#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    Basic { username: String, password: String },
    /// OAuth2 refresh token exchanged at the token endpoint.
    IdentityToken(String),
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credential::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
            Credential::IdentityToken(_) => f.write_str("IdentityToken(<redacted>)"),
        }
    }
}

/// Source of registry credentials, passed explicitly to the pusher.
pub trait CredentialProvider: Send + Sync {
    fn resolve(&self, registry: &str) -> Result<Option<Credential>>;
}

/// Never supplies credentials.
#[derive(Debug, Default, Clone, Copy)]
pub struct Anonymous;

impl CredentialProvider for Anonymous {
    fn resolve(&self, _registry: &str) -> Result<Option<Credential>> {
        Ok(None)
    }
}

/// Same credential for every registry.
#[derive(Debug, Clone)]
pub struct StaticCredentials(pub Credential);

impl CredentialProvider for StaticCredentials {
    fn resolve(&self, _registry: &str) -> Result<Option<Credential>> {
        Ok(Some(self.0.clone()))
    }
}

/// Reads a Docker-style `config.json`.
#[derive(Debug, Clone)]
pub struct DockerConfigKeychain {
    path: PathBuf,
}

#[derive(Debug, Default, Deserialize)]
struct DockerConfigFile {
    #[serde(default)]
    auths: HashMap<String, DockerAuthEntry>,
}

#[derive(Debug, Default, Deserialize)]
struct DockerAuthEntry {
    #[serde(default)]
    auth: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
    #[serde(default, rename = "identitytoken")]
    identity_token: Option<String>,
}

impl DockerConfigKeychain {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `$DOCKER_CONFIG/config.json`, falling back to `~/.docker/config.json`.
    pub fn from_env() -> Self {
        let dir = std::env::var_os("DOCKER_CONFIG")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|home| Path::new(&home).join(".docker")))
            .unwrap_or_else(|| PathBuf::from(".docker"));
        Self::new(dir.join("config.json"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<Option<DockerConfigFile>> {
        match std::fs::read(&self.path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map(Some).map_err(|err| {
                TransferError::Credentials(format!("{}: {err}", self.path.display()))
            }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(TransferError::Credentials(format!(
                "{}: {err}",
                self.path.display()
            ))),
        }
    }
}

impl CredentialProvider for DockerConfigKeychain {
    fn resolve(&self, registry: &str) -> Result<Option<Credential>> {
        let Some(config) = self.load()? else {
            debug!(path = %self.path.display(), "no docker config, using anonymous access");
            return Ok(None);
        };
        let entry = candidate_keys(registry)
            .iter()
            .find_map(|key| config.auths.get(key));
        let Some(entry) = entry else {
            return Ok(None);
        };

        if let Some(token) = entry.identity_token.as_deref().filter(|t| !t.is_empty()) {
            return Ok(Some(Credential::IdentityToken(token.to_owned())));
        }
        if let (Some(username), Some(password)) = (&entry.username, &entry.password) {
            return Ok(Some(Credential::Basic {
                username: username.clone(),
                password: password.clone(),
            }));
        }
        match entry.auth.as_deref() {
            Some(encoded) if !encoded.is_empty() => decode_auth(encoded).map(Some),
            _ => Ok(None),
        }
    }
}

fn candidate_keys(registry: &str) -> Vec<String> {
    let mut keys = vec![
        registry.to_owned(),
        format!("https://{registry}"),
        format!("http://{registry}"),
    ];
    if registry == "index.docker.io" || registry == "docker.io" {
        keys.push("https://index.docker.io/v1/".to_owned());
    }
    keys
}

fn decode_auth(encoded: &str) -> Result<Credential> {
    let decoded = STANDARD
        .decode(encoded.trim())
        .map_err(|err| TransferError::Credentials(format!("invalid auth entry: {err}")))?;
    let decoded = String::from_utf8(decoded)
        .map_err(|err| TransferError::Credentials(format!("invalid auth entry: {err}")))?;
    let (username, password) = decoded
        .split_once(':')
        .ok_or_else(|| TransferError::Credentials("auth entry lacks ':'".into()))?;
    Ok(Credential::Basic {
        username: username.to_owned(),
        password: password.to_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keychain_decodes_auth_field() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let auth = STANDARD.encode("robot:s3cret");
        std::fs::write(
            &path,
            format!(r#"{{"auths":{{"registry.local:5000":{{"auth":"{auth}"}}}}}}"#),
        )
        .unwrap();

        let keychain = DockerConfigKeychain::new(&path);
        let credential = keychain.resolve("registry.local:5000").unwrap();
        assert_eq!(
            credential,
            Some(Credential::Basic {
                username: "robot".into(),
                password: "s3cret".into()
            })
        );
        assert_eq!(keychain.resolve("other.registry").unwrap(), None);
    }

    #[test]
    fn keychain_matches_scheme_prefixed_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"auths":{"https://ghcr.io":{"identitytoken":"tok"}}}"#,
        )
        .unwrap();
        let credential = DockerConfigKeychain::new(&path).resolve("ghcr.io").unwrap();
        assert_eq!(credential, Some(Credential::IdentityToken("tok".into())));
    }

    #[test]
    fn missing_config_means_anonymous() {
        let dir = tempfile::tempdir().unwrap();
        let keychain = DockerConfigKeychain::new(dir.path().join("absent.json"));
        assert_eq!(keychain.resolve("registry.local").unwrap(), None);
    }

    #[test]
    fn corrupt_config_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{not json").unwrap();
        let err = DockerConfigKeychain::new(&path).resolve("x").unwrap_err();
        assert!(matches!(err, TransferError::Credentials(_)));
    }

    #[test]
    fn debug_output_redacts_secrets() {
        let credential = Credential::Basic {
            username: "u".into(),
            password: "hunter2".into(),
        };
        assert!(!format!("{credential:?}").contains("hunter2"));
    }
}
