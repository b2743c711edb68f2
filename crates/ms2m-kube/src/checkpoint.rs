//! ---
//! ms2m_section: "08-control-plane"
//! ms2m_subsection: "module"
//! ms2m_type: "source"
//! ms2m_scope: "code"
//! ms2m_description: "Kubelet checkpoint trigger proxied through the API server."
//! ms2m_version: "v0.0.0-prealpha"
//! ms2m_owner: "tbd"
//! ---
use async_trait::async_trait;
use ms2m_core::{CheckpointApi, CheckpointError};
use serde::Deserialize;
use tracing::{debug, info};

use crate::client::ApiServerClient;

#[derive(Debug, Deserialize)]
struct CheckpointResponse {
    items: Vec<String>,
}

/// `/api/v1/nodes/{node}/proxy/checkpoint/{namespace}/{pod}/{container}`.
pub fn build_checkpoint_path(node: &str, namespace: &str, pod: &str, container: &str) -> String {
    format!("/api/v1/nodes/{node}/proxy/checkpoint/{namespace}/{pod}/{container}")
}

/// Archive locations in the order the kubelet reported them.
pub fn parse_checkpoint_response(body: &[u8]) -> Result<Vec<String>, CheckpointError> {
    serde_json::from_slice::<CheckpointResponse>(body)
        .map(|response| response.items)
        .map_err(|err| CheckpointError::CheckpointResponseInvalid(err.to_string()))
}

#[derive(Debug, Clone)]
pub struct KubeletCheckpointClient {
    api: ApiServerClient,
}

impl KubeletCheckpointClient {
    pub fn new(api: ApiServerClient) -> Self {
        Self { api }
    }
}

#[async_trait]
impl CheckpointApi for KubeletCheckpointClient {
    async fn checkpoint(
        &self,
        node: &str,
        namespace: &str,
        pod: &str,
        container: &str,
    ) -> Result<Vec<String>, CheckpointError> {
        let path = build_checkpoint_path(node, namespace, pod, container);
        debug!(%path, "requesting checkpoint");
        let body = self
            .api
            .post_empty(&path)
            .await
            .map_err(CheckpointError::from)?;
        let items = parse_checkpoint_response(&body)?;
        info!(%node, %namespace, %pod, %container, archives = items.len(), "kubelet checkpoint finished");
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_is_built_from_identifiers() {
        assert_eq!(
            build_checkpoint_path("worker-1", "default", "myapp-pod", "myapp"),
            "/api/v1/nodes/worker-1/proxy/checkpoint/default/myapp-pod/myapp"
        );
        assert_eq!(
            build_checkpoint_path("node-01", "team-a2", "consumer-7d9f4-x2x9z", "app-v2"),
            "/api/v1/nodes/node-01/proxy/checkpoint/team-a2/consumer-7d9f4-x2x9z/app-v2"
        );
    }

    #[test]
    fn empty_item_list_parses_to_nothing() {
        assert!(parse_checkpoint_response(br#"{"items":[]}"#).unwrap().is_empty());
    }

    #[test]
    fn items_keep_their_order() {
        let items = parse_checkpoint_response(
            br#"{"items":["/var/lib/kubelet/checkpoints/a.tar","/var/lib/kubelet/checkpoints/b.tar"]}"#,
        )
        .unwrap();
        assert_eq!(
            items,
            vec![
                "/var/lib/kubelet/checkpoints/a.tar".to_owned(),
                "/var/lib/kubelet/checkpoints/b.tar".to_owned(),
            ]
        );
    }

    #[test]
    fn malformed_body_is_a_parse_error() {
        let err = parse_checkpoint_response(b"{\"items\": [").unwrap_err();
        assert!(matches!(err, CheckpointError::CheckpointResponseInvalid(_)));
        let err = parse_checkpoint_response(b"<html>bad gateway</html>").unwrap_err();
        assert!(matches!(err, CheckpointError::CheckpointResponseInvalid(_)));
    }
}
