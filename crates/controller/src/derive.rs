//! Typed requests from reconcilers to the rule service task.

use keel_core::{KeelError, KeelResult, ResourceRef};
use keel_rules::ExecutionReport;
use tokio::sync::{mpsc, oneshot};

#[derive(Debug)]
pub struct DeriveRequest {
    /// Output types to produce; empty runs the whole graph.
    pub outputs: Vec<String>,
    pub requested_by: Option<ResourceRef>,
    pub reply: oneshot::Sender<KeelResult<ExecutionReport>>,
}

/// Handle to the rule service. Cheap to clone.
#[derive(Debug, Clone)]
pub struct RuleClient {
    tx: mpsc::Sender<DeriveRequest>,
}

impl RuleClient {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<DeriveRequest>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    pub async fn derive(&self, outputs: Vec<String>, requested_by: Option<ResourceRef>) -> KeelResult<ExecutionReport> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(DeriveRequest { outputs, requested_by, reply }).await.map_err(|_| KeelError::Shutdown)?;
        rx.await.map_err(|_| KeelError::Shutdown)?
    }

    pub fn is_closed(&self) -> bool { self.tx.is_closed() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn request_and_reply_round_trip() {
        let (client, mut rx) = RuleClient::channel(4);
        let server = tokio::spawn(async move {
            let req = rx.recv().await.unwrap();
            assert_eq!(req.outputs, vec!["Doubled".to_string()]);
            let _ = req.reply.send(Ok(ExecutionReport::default()));
        });
        let report = client.derive(vec!["Doubled".into()], None).await.unwrap();
        assert!(report.is_empty());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn closed_service_is_shutdown() {
        let (client, rx) = RuleClient::channel(1);
        drop(rx);
        assert_eq!(client.derive(Vec::new(), None).await.unwrap_err(), KeelError::Shutdown);
        assert!(client.is_closed());
    }
}
