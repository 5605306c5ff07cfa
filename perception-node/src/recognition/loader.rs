//! Loading registered embeddings from the registration service.

use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::identity::{IdentityEntry, IdentityMatcher, IdentitySnapshot};
use crate::camera::registry::redact_url;
use crate::error::{PerceptionError, Result};

#[async_trait]
pub trait IdentitySource: Send + Sync {
    async fn load(&self) -> Result<IdentitySnapshot>;
}

/// `GET <url>` with a bearer token, answering
/// `{ "success": true, "data": [{ "id", "name", "meanEmbedding": [f32] }] }`.
pub struct HttpIdentitySource {
    client: reqwest::Client,
    url: String,
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    data: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RemoteIdentity {
    id: serde_json::Value,
    #[serde(default)]
    name: String,
    #[serde(default)]
    mean_embedding: Vec<f32>,
}

impl RemoteIdentity {
    fn into_entry(self) -> IdentityEntry {
        let id = match self.id {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        };
        IdentityEntry {
            id,
            name: self.name,
            embedding: self.mean_embedding,
        }
    }
}

impl HttpIdentitySource {
    pub fn new(url: impl Into<String>, token: Option<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
            token,
        })
    }
}

#[async_trait]
impl IdentitySource for HttpIdentitySource {
    async fn load(&self) -> Result<IdentitySnapshot> {
        info!("Loading identity embeddings from {}", redact_url(&self.url));

        let mut request = self.client.get(&self.url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let envelope: Envelope = request.send().await?.error_for_status()?.json().await?;

        if !envelope.success {
            return Err(PerceptionError::RegistryError(
                "embedding endpoint returned success=false".to_string(),
            ));
        }

        let received = envelope.data.len();
        let entries: Vec<IdentityEntry> = envelope
            .data
            .into_iter()
            .enumerate()
            .filter_map(|(index, raw)| match serde_json::from_value::<RemoteIdentity>(raw) {
                Ok(remote) => Some(remote.into_entry()),
                Err(e) => {
                    warn!(index, "Skipping malformed identity entry: {}", e);
                    None
                }
            })
            .collect();
        let snapshot = IdentitySnapshot::from_entries(entries);
        info!("Loaded {} of {} identity embeddings", snapshot.len(), received);
        Ok(snapshot)
    }
}

/// Refresh the matcher every `interval`. A failed load keeps the current
/// snapshot.
pub async fn reload_loop(
    source: Arc<dyn IdentitySource>,
    matcher: Arc<IdentityMatcher>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    debug!("Identity reload loop stopped");
                    return;
                }
                continue;
            }
        }

        match source.load().await {
            Ok(snapshot) => matcher.reload(snapshot),
            Err(e) => warn!("Identity reload failed, keeping {} cached embeddings: {}", matcher.len(), e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_loads_with_bearer_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/employees/embeddings"))
            .and(header("authorization", "Bearer node-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "data": [
                    { "id": "E1", "name": "Ada", "meanEmbedding": [1.0, 0.0, 0.0] },
                    { "id": 42, "name": "Bo", "meanEmbedding": [0.0, 2.0, 0.0] },
                    { "id": "E3", "name": "Cy", "meanEmbedding": [0.0, 0.0, 0.0] }
                ]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let source = HttpIdentitySource::new(
            format!("{}/api/v1/employees/embeddings", server.uri()),
            Some("node-token".to_string()),
            Duration::from_secs(2),
        )
        .unwrap();
        let snapshot = source.load().await.unwrap();

        assert_eq!(snapshot.len(), 2);
        let hit = snapshot.find_match(&[0.0, 1.0, 0.0], 0.45).unwrap();
        assert_eq!(hit.employee_id, "42");
        assert_eq!(hit.name, "Bo");
    }

    #[tokio::test]
    async fn test_malformed_entry_is_skipped() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "data": [
                    { "id": "E1", "name": "Ada", "meanEmbedding": [1.0, 0.0] },
                    { "id": "E2", "name": "Bo", "meanEmbedding": null },
                    "not-an-object",
                    { "id": "E4", "name": "Di", "meanEmbedding": [0.0, 1.0] }
                ]
            })))
            .mount(&server)
            .await;

        let source = HttpIdentitySource::new(server.uri(), None, Duration::from_secs(2)).unwrap();
        let snapshot = source.load().await.unwrap();

        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.find_match(&[1.0, 0.0], 0.45).unwrap().employee_id, "E1");
        assert_eq!(snapshot.find_match(&[0.0, 1.0], 0.45).unwrap().employee_id, "E4");
    }

    #[tokio::test]
    async fn test_unsuccessful_payload_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "success": false, "data": [] })))
            .mount(&server)
            .await;

        let source = HttpIdentitySource::new(server.uri(), None, Duration::from_secs(2)).unwrap();
        assert!(matches!(source.load().await, Err(PerceptionError::RegistryError(_))));
    }

    struct FailingSource;

    #[async_trait]
    impl IdentitySource for FailingSource {
        async fn load(&self) -> Result<IdentitySnapshot> {
            Err(PerceptionError::Timeout("registry".to_string()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_reload_keeps_snapshot() {
        let matcher = Arc::new(IdentityMatcher::new(IdentitySnapshot::from_entries(vec![IdentityEntry {
            id: "E1".to_string(),
            name: "Ada".to_string(),
            embedding: vec![1.0, 0.0],
        }])));
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(reload_loop(
            Arc::new(FailingSource),
            matcher.clone(),
            Duration::from_secs(60),
            rx,
        ));

        tokio::time::sleep(Duration::from_secs(130)).await;
        assert_eq!(matcher.len(), 1);

        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
