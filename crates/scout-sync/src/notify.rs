//! Outbound notification contract for newly archived findings.

use async_trait::async_trait;
use scout_core::Finding;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification delivery failed: {0}")]
    Delivery(String),
}

/// Receives the new findings of a finished sweep. Called at most once per
/// sweep and never with an empty list.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, sweep_id: Uuid, findings: &[Finding]) -> Result<(), NotifyError>;
}

/// Writes the digest into the log instead of delivering it anywhere.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, sweep_id: Uuid, findings: &[Finding]) -> Result<(), NotifyError> {
        info!(%sweep_id, count = findings.len(), "new findings digest\n{}", render_digest(findings));
        Ok(())
    }
}

pub fn render_digest(findings: &[Finding]) -> String {
    findings
        .iter()
        .map(|f| format!("Item: {}\nPrice: {}\nLink: {}\n", f.title, f.price, f.url))
        .collect::<Vec<_>>()
        .join("\n")
}
