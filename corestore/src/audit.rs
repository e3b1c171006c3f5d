//! Audit adaptor - sweep persisted cores through the engine's audit

use crate::error::StoreError;
use crate::session::GetOptions;
use crate::store::Corestore;
use corestore_model::{AuditOptions, AuditStats, CoreKey, DiscoveryKey};
use futures_util::StreamExt;
use tracing::debug;

/// Outcome of auditing one persisted core. Failures are carried per core;
/// the sweep itself never aborts on one bad core.
#[derive(Debug, Clone)]
pub struct CoreAuditReport {
    pub discovery_key: DiscoveryKey,
    pub key: Option<CoreKey>,
    pub result: Result<AuditStats, StoreError>,
}

impl Corestore {
    /// Audit every persisted core. With `dry_run` the engine reports
    /// corrections without applying them.
    pub async fn audit(&self, opts: AuditOptions) -> Result<Vec<CoreAuditReport>, StoreError> {
        if self.is_closed() {
            return Err(StoreError::StoreClosed);
        }
        self.ready().await?;

        let mut cores = self.shared.storage.create_core_stream();
        let mut reports = Vec::new();
        while let Some(info) = cores.next().await {
            let open = self
                .get(
                    GetOptions::discovery_key(info.discovery_key)
                        .active(false)
                        .create_if_missing(false),
                )
                .await;
            match open {
                Ok(session) => {
                    let key = Some(session.key());
                    let result = session.audit(opts.clone()).await;
                    session.close().await;
                    reports.push(CoreAuditReport {
                        discovery_key: info.discovery_key,
                        key,
                        result,
                    });
                }
                Err(err) => {
                    debug!(core = %info.discovery_key, error = %err, "audit could not open core");
                    // The stored auth record may still name the key.
                    let key = self
                        .shared
                        .storage
                        .get_auth(&info.discovery_key)
                        .await
                        .ok()
                        .flatten()
                        .and_then(|auth| auth.key);
                    reports.push(CoreAuditReport {
                        discovery_key: info.discovery_key,
                        key,
                        result: Err(err),
                    });
                }
            }
        }
        Ok(reports)
    }
}
