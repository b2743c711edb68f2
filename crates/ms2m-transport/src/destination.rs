//! ---
//! ms2m_section: "04-artifact-transfer"
//! ms2m_subsection: "module"
//! ms2m_type: "source"
//! ms2m_scope: "code"
//! ms2m_description: "Destination and image reference parsing."
//! ms2m_version: "v0.0.0-prealpha"
//! ms2m_owner: "tbd"
//! ---
use std::fmt;

use url::Url;

use crate::error::{Result, TransferError};

const DEFAULT_REGISTRY: &str = "index.docker.io";
const DEFAULT_TAG: &str = "latest";

/// Where a checkpoint artifact should go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    /// Streaming upload straight to a node agent.
    Direct(Url),
    /// Push to an image registry.
    Registry(ImageReference),
}

impl Destination {
    /// Anything starting with `http` is a direct upload URL; everything else
    /// is an image reference.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.starts_with("http") {
            let url = Url::parse(raw)
                .map_err(|err| TransferError::InvalidDestination(format!("{raw}: {err}")))?;
            return Ok(Destination::Direct(url));
        }
        ImageReference::parse(raw).map(Destination::Registry)
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Direct(url) => write!(f, "{url}"),
            Destination::Registry(reference) => write!(f, "{reference}"),
        }
    }
}

/// `registry/repository:tag` or `registry/repository@digest`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    pub registry: String,
    pub repository: String,
    pub reference: String,
}

impl ImageReference {
    pub fn parse(raw: &str) -> Result<Self> {
        let invalid = || TransferError::InvalidDestination(raw.to_owned());
        if raw.is_empty() || raw.chars().any(char::is_whitespace) {
            return Err(invalid());
        }

        let (name, reference) = match raw.split_once('@') {
            Some((name, digest)) => (name, digest.to_owned()),
            None => {
                let last_slash = raw.rfind('/').map(|i| i + 1).unwrap_or(0);
                match raw[last_slash..].rfind(':') {
                    Some(colon) => {
                        let split = last_slash + colon;
                        (&raw[..split], raw[split + 1..].to_owned())
                    }
                    None => (raw, DEFAULT_TAG.to_owned()),
                }
            }
        };
        if reference.is_empty() {
            return Err(invalid());
        }

        let (registry, repository) = match name.split_once('/') {
            Some((host, rest))
                if host.contains('.') || host.contains(':') || host == "localhost" =>
            {
                (host.to_owned(), rest.to_owned())
            }
            Some(_) => (DEFAULT_REGISTRY.to_owned(), name.to_owned()),
            None => (DEFAULT_REGISTRY.to_owned(), format!("library/{name}")),
        };
        if repository.is_empty() || repository.split('/').any(str::is_empty) {
            return Err(invalid());
        }

        Ok(Self {
            registry,
            repository,
            reference,
        })
    }

    pub fn is_digest(&self) -> bool {
        self.reference.contains(':')
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sep = if self.is_digest() { '@' } else { ':' };
        write!(f, "{}/{}{}{}", self.registry, self.repository, sep, self.reference)
    }
}
