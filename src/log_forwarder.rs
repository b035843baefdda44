//! Log-Server Forwarder (C9): a fire-and-forget mirror of mutations to an
//! external log-server endpoint (spec §4.9). The network driver itself is an
//! out-of-scope collaborator (spec §1); this module only decides what gets
//! sent and guarantees failures never block or fail the originating mutation.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::bundle::parser::RawRecord;
use crate::docid::ContentHash;
use crate::error::Result;

/// One unit of work handed to the log-server client.
#[derive(Debug, Clone, PartialEq)]
pub enum LogEntry {
    Mutation { hash: ContentHash, bundle_text: String },
    Delete { hash: ContentHash },
}

/// Out-of-scope log-server network client (spec §1: "Network servers (the
/// log-forwarding driver server) ... out of scope").
#[async_trait]
pub trait LogServerClient: Send + Sync {
    async fn send(&self, entry: LogEntry) -> Result<()>;
}

/// Reassembles a parsed record back into `<PROPNAME>value` bundle text, the
/// wire format the log-server mirror expects (spec §4.9).
pub fn reassemble_record(record: &RawRecord) -> String {
    let mut text = String::new();
    for (name, value) in &record.properties {
        text.push('<');
        text.push_str(name);
        text.push('>');
        text.push_str(value);
        text.push('\n');
    }
    text
}

/// Submits mutations to a [`LogServerClient`] without ever blocking or failing
/// the caller; each submission runs as a detached task (spec §4.9, §5 "async
/// log-server sends").
pub struct LogForwarder {
    client: Arc<dyn LogServerClient>,
    enabled: bool,
}

impl LogForwarder {
    pub fn new(client: Arc<dyn LogServerClient>, enabled: bool) -> Self {
        Self { client, enabled }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn forward_mutation(&self, hash: ContentHash, bundle_text: String) {
        if !self.enabled {
            return;
        }
        let client = self.client.clone();
        tokio::spawn(async move {
            if let Err(e) = client.send(LogEntry::Mutation { hash, bundle_text }).await {
                warn!(error = %e, "log-server forward of mutation failed");
            }
        });
    }

    pub fn forward_delete(&self, hash: ContentHash) {
        if !self.enabled {
            return;
        }
        let client = self.client.clone();
        tokio::spawn(async move {
            if let Err(e) = client.send(LogEntry::Delete { hash }).await {
                warn!(error = %e, "log-server forward of delete failed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::sync::Notify;

    #[derive(Default)]
    struct RecordingClient {
        received: Mutex<Vec<LogEntry>>,
        notify: Notify,
    }

    #[async_trait]
    impl LogServerClient for RecordingClient {
        async fn send(&self, entry: LogEntry) -> Result<()> {
            self.received.lock().unwrap().push(entry);
            self.notify.notify_one();
            Ok(())
        }
    }

    #[tokio::test]
    async fn disabled_forwarder_never_spawns_a_send() {
        let client = Arc::new(RecordingClient::default());
        let forwarder = LogForwarder::new(client.clone(), false);
        forwarder.forward_mutation(ContentHash(1), "x".to_string());
        tokio::task::yield_now().await;
        assert!(client.received.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn enabled_forwarder_submits_mutation_and_delete() {
        let client = Arc::new(RecordingClient::default());
        let forwarder = LogForwarder::new(client.clone(), true);

        forwarder.forward_mutation(ContentHash(1), "<DOCID>A\n".to_string());
        client.notify.notified().await;
        forwarder.forward_delete(ContentHash(2));
        client.notify.notified().await;

        let received = client.received.lock().unwrap();
        assert_eq!(received.len(), 2);
        assert!(matches!(received[0], LogEntry::Mutation { .. }));
        assert!(matches!(received[1], LogEntry::Delete { .. }));
    }

    #[test]
    fn reassembles_record_into_bundle_text() {
        let record = RawRecord {
            id: "A".to_string(),
            properties: vec![("DOCID".to_string(), "A".to_string()), ("title".to_string(), "x".to_string())],
        };
        assert_eq!(reassemble_record(&record), "<DOCID>A\n<title>x\n");
    }
}
