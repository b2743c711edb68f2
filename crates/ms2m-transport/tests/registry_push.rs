//! ---
//! ms2m_section: "04-artifact-transfer"
//! ms2m_subsection: "tests"
//! ms2m_type: "source"
//! ms2m_scope: "test"
//! ms2m_description: "Registry push against a mocked distribution API."
//! ms2m_version: "v0.0.0-prealpha"
//! ms2m_owner: "tbd"
//! ---
use std::io::Read;
use std::sync::Arc;

use ms2m_checkpoint::build_artifact;
use ms2m_transport::{
    Anonymous, Credential, Destination, ImageReference, RegistryPusher, StaticCredentials,
    TransferError,
};
use wiremock::matchers::{header, method, path, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

const REPO: &str = "checkpoints/counter";

async fn mount_upload_endpoints(server: &MockServer) {
    Mock::given(method("HEAD"))
        .and(path_regex(format!("^/v2/{REPO}/blobs/sha256:[0-9a-f]+$")))
        .respond_with(ResponseTemplate::new(404))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path(format!("/v2/{REPO}/blobs/uploads/")))
        .respond_with(
            ResponseTemplate::new(202)
                .insert_header("Location", format!("/v2/{REPO}/blobs/uploads/session-1").as_str()),
        )
        .mount(server)
        .await;
    Mock::given(method("PUT"))
        .and(path(format!("/v2/{REPO}/blobs/uploads/session-1")))
        .respond_with(ResponseTemplate::new(201))
        .mount(server)
        .await;
    Mock::given(method("PUT"))
        .and(path(format!("/v2/{REPO}/manifests/mig-1")))
        .respond_with(ResponseTemplate::new(201))
        .mount(server)
        .await;
}

fn reference_for(server: &MockServer) -> ImageReference {
    let host = server.address().to_string();
    ImageReference::parse(&format!("{host}/{REPO}:mig-1")).unwrap()
}

#[tokio::test]
async fn pushes_layer_config_and_manifest() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v2/"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    mount_upload_endpoints(&server).await;

    let dir = tempfile::tempdir().unwrap();
    let archive = dir.path().join("checkpoint.tar");
    std::fs::write(&archive, vec![42u8; 150_000]).unwrap();
    let artifact = build_artifact(&archive, Some("counter")).unwrap();

    let pusher = RegistryPusher::new(Arc::new(Anonymous), true).unwrap();
    let digest = pusher.push(&artifact, &reference_for(&server)).await.unwrap();
    assert_eq!(digest, artifact.manifest_digest());

    let requests = server.received_requests().await.unwrap();
    let blob_puts: Vec<_> = requests
        .iter()
        .filter(|req| req.method.as_str() == "PUT" && req.url.path().contains("/blobs/uploads/"))
        .collect();
    assert_eq!(blob_puts.len(), 2, "layer and config");

    let mut expected_layer = Vec::new();
    artifact
        .open_layer()
        .unwrap()
        .read_to_end(&mut expected_layer)
        .unwrap();
    let layer_put = blob_puts
        .iter()
        .find(|req| {
            req.url
                .query_pairs()
                .any(|(k, v)| k == "digest" && v == artifact.layer().digest.as_str())
        })
        .expect("layer upload carries its digest");
    assert_eq!(layer_put.body, expected_layer);

    let manifest_put = requests
        .iter()
        .find(|req| req.url.path().ends_with("/manifests/mig-1"))
        .unwrap();
    assert_eq!(manifest_put.body, artifact.manifest_bytes());
    assert_eq!(
        manifest_put.headers.get("content-type").unwrap(),
        "application/vnd.oci.image.manifest.v1+json"
    );
}

#[tokio::test]
async fn answers_bearer_challenge_with_credentials() {
    let server = MockServer::start().await;
    let realm = format!("{}/token", server.uri());
    Mock::given(method("GET"))
        .and(path("/v2/"))
        .respond_with(ResponseTemplate::new(401).insert_header(
            "WWW-Authenticate",
            format!(r#"Bearer realm="{realm}",service="test-registry""#).as_str(),
        ))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/token"))
        .and(header("authorization", "Basic cm9ib3Q6czNjcmV0"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"token": "abc"})))
        .mount(&server)
        .await;
    mount_upload_endpoints(&server).await;

    let dir = tempfile::tempdir().unwrap();
    let archive = dir.path().join("checkpoint.tar");
    std::fs::write(&archive, b"tiny").unwrap();
    let artifact = build_artifact(&archive, None).unwrap();

    let credentials = StaticCredentials(Credential::Basic {
        username: "robot".into(),
        password: "s3cret".into(),
    });
    let pusher = RegistryPusher::new(Arc::new(credentials), true).unwrap();
    pusher.push(&artifact, &reference_for(&server)).await.unwrap();

    let requests = server.received_requests().await.unwrap();
    let manifest_put = requests
        .iter()
        .find(|req| req.url.path().ends_with("/manifests/mig-1"))
        .unwrap();
    assert_eq!(manifest_put.headers.get("authorization").unwrap(), "Bearer abc");
}

#[tokio::test]
async fn rejected_manifest_is_a_retryable_push_failure() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v2/"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    Mock::given(method("HEAD"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .respond_with(ResponseTemplate::new(503).set_body_string("registry read-only"))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let archive = dir.path().join("checkpoint.tar");
    std::fs::write(&archive, b"tiny").unwrap();
    let artifact = build_artifact(&archive, Some("c")).unwrap();

    let pusher = RegistryPusher::new(Arc::new(Anonymous), true).unwrap();
    let err = pusher
        .push(&artifact, &reference_for(&server))
        .await
        .unwrap_err();
    assert!(matches!(err, TransferError::PushFailed { .. }), "{err:?}");
    assert!(err.is_retryable());
    assert!(err.to_string().contains("registry read-only"));
}

#[test]
fn destination_parsing_selects_registry_for_references() {
    let dest = Destination::parse("registry.local:5000/checkpoints/counter:mig-1").unwrap();
    assert!(matches!(dest, Destination::Registry(_)));
}
