//! ---
//! ms2m_section: "01-core-functionality"
//! ms2m_subsection: "module"
//! ms2m_type: "source"
//! ms2m_scope: "code"
//! ms2m_description: "In-process artifact shipper for co-located controllers."
//! ms2m_version: "v0.0.0-prealpha"
//! ms2m_owner: "tbd"
//! ---
use std::path::Path;

use async_trait::async_trait;
use ms2m_transport::ArtifactTransfer;
use tracing::info;

use crate::collaborators::{ArtifactShipper, ShipmentRequest, ShipmentState};
use crate::error::MigrationError;

/// Builds and sends the archive from this process. Only usable when the
/// checkpoint path is readable locally, e.g. single-node clusters and tests.
#[derive(Debug, Clone)]
pub struct LocalShipper {
    transfer: ArtifactTransfer,
}

impl LocalShipper {
    pub fn new(transfer: ArtifactTransfer) -> Self {
        Self { transfer }
    }
}

#[async_trait]
impl ArtifactShipper for LocalShipper {
    async fn ship(&self, request: &ShipmentRequest) -> Result<ShipmentState, MigrationError> {
        let label = Some(request.container.as_str()).filter(|label| !label.is_empty());
        let report = self
            .transfer
            .send(Path::new(&request.archive), &request.destination, label)
            .await?;
        info!(
            migration = %request.migration,
            destination = %report.destination,
            bytes = report.bytes,
            digest = report.digest.as_deref().unwrap_or(""),
            build_ms = report.build_time.as_millis() as u64,
            send_ms = report.send_time.as_millis() as u64,
            "checkpoint shipped"
        );
        Ok(ShipmentState::Done)
    }
}
