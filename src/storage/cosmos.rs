//! Cosmos DB (SQL API) ingestion log over REST

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, StatusCode};
use serde_json::json;
use tokio::sync::Mutex;

use super::ingestion::{IngestionEntry, IngestionLog};
use super::signing;
use crate::config::CosmosConfig;
use crate::error::{Error, Result};

const COSMOS_API_VERSION: &str = "2018-12-31";

/// Ingestion log stored as Cosmos DB documents partitioned by patient
pub struct CosmosIngestionLog {
    client: Client,
    endpoint: String,
    key: Vec<u8>,
    database: String,
    container: String,
    provisioned: Mutex<bool>,
}

impl CosmosIngestionLog {
    pub fn new(config: &CosmosConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            key: signing::decode_key(&config.key)?,
            database: config.database.clone(),
            container: config.container.clone(),
            provisioned: Mutex::new(false),
        })
    }

    /// Create the database and container unless they already exist
    async fn provision(&self) -> Result<()> {
        let mut provisioned = self.provisioned.lock().await;
        if *provisioned {
            return Ok(());
        }

        self.post("dbs", "", "dbs", json!({ "id": self.database }), &[])
            .await
            .and_then(accept_conflict)?;

        let db_link = format!("dbs/{}", self.database);
        self.post(
            &format!("{}/colls", db_link),
            &db_link,
            "colls",
            json!({
                "id": self.container,
                "partitionKey": { "paths": ["/patient_id"], "kind": "Hash" }
            }),
            &[],
        )
        .await
        .and_then(accept_conflict)?;

        tracing::info!(
            "Cosmos container {}/{} ready",
            self.database,
            self.container
        );
        *provisioned = true;
        Ok(())
    }

    async fn post(
        &self,
        path: &str,
        resource_link: &str,
        resource_type: &str,
        body: serde_json::Value,
        extra_headers: &[(&str, String)],
    ) -> Result<(StatusCode, String)> {
        let date = signing::http_date(Utc::now());
        let token = auth_token(&self.key, "POST", resource_type, resource_link, &date)?;

        let mut request = self
            .client
            .post(format!("{}/{}", self.endpoint, path))
            .header("authorization", token)
            .header("x-ms-date", date)
            .header("x-ms-version", COSMOS_API_VERSION)
            .json(&body);
        for (name, value) in extra_headers {
            request = request.header(*name, value.as_str());
        }

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        Ok((status, text))
    }
}

#[async_trait]
impl IngestionLog for CosmosIngestionLog {
    async fn record(&self, entry: &IngestionEntry) -> Result<()> {
        self.provision().await?;

        let coll_link = format!("dbs/{}/colls/{}", self.database, self.container);
        let partition_key = serde_json::to_string(&[entry.patient_id.to_string()])?;
        let (status, body) = self
            .post(
                &format!("{}/docs", coll_link),
                &coll_link,
                "docs",
                serde_json::to_value(entry)?,
                &[
                    ("x-ms-documentdb-is-upsert", "True".to_string()),
                    ("x-ms-documentdb-partitionkey", partition_key),
                ],
            )
            .await?;

        if !status.is_success() {
            return Err(Error::storage(format!(
                "Cosmos upsert failed ({}): {}",
                status, body
            )));
        }
        tracing::debug!("Logged ingestion {} for patient {}", entry.id, entry.patient_id);
        Ok(())
    }
}

fn accept_conflict((status, body): (StatusCode, String)) -> Result<()> {
    if status.is_success() || status == StatusCode::CONFLICT {
        Ok(())
    } else {
        Err(Error::storage(format!(
            "Cosmos provisioning failed ({}): {}",
            status, body
        )))
    }
}

/// Master-key authorization header value
fn auth_token(
    key: &[u8],
    verb: &str,
    resource_type: &str,
    resource_link: &str,
    date: &str,
) -> Result<String> {
    let payload = format!(
        "{}\n{}\n{}\n{}\n\n",
        verb.to_lowercase(),
        resource_type.to_lowercase(),
        resource_link,
        date.to_lowercase()
    );
    let signature = signing::sign(key, &payload)?;
    let token = format!("type=master&ver=1.0&sig={}", signature);
    Ok(url::form_urlencoded::byte_serialize(token.as_bytes()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_server::TestServer;
    use uuid::Uuid;

    #[test]
    fn auth_token_is_url_encoded() {
        let date = "Thu, 01 Feb 2024 09:05:03 GMT";
        let token = auth_token(b"secret", "POST", "docs", "dbs/db/colls/c", date).unwrap();
        assert!(token.starts_with("type%3Dmaster%26ver%3D1.0%26sig%3D"));
        assert!(!token.contains('/'));
        assert!(!token.contains('+'));
    }

    #[test]
    fn auth_token_depends_on_resource() {
        let date = "Thu, 01 Feb 2024 09:05:03 GMT";
        let docs = auth_token(b"secret", "POST", "docs", "dbs/db/colls/c", date).unwrap();
        let colls = auth_token(b"secret", "POST", "colls", "dbs/db", date).unwrap();
        assert_ne!(docs, colls);
    }

    #[test]
    fn endpoint_trailing_slash_is_trimmed() {
        let log = CosmosIngestionLog::new(&CosmosConfig {
            endpoint: "https://acct.documents.azure.com:443/".to_string(),
            key: "c2VjcmV0".to_string(),
            database: "reinforce_db".to_string(),
            container: "ingestion_logs".to_string(),
        })
        .unwrap();
        assert_eq!(log.endpoint, "https://acct.documents.azure.com:443");
    }

    fn stub_log(server: &TestServer) -> CosmosIngestionLog {
        CosmosIngestionLog::new(&CosmosConfig {
            endpoint: server.url.clone(),
            key: "c2VjcmV0".to_string(),
            database: "reinforce_db".to_string(),
            container: "ingestion_logs".to_string(),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn provisions_once_and_upserts_by_patient() {
        let server = TestServer::start(vec![(409, "{}"), (409, "{}"), (201, "{}")]).await;
        let log = stub_log(&server);

        let patient_id = Uuid::new_v4();
        let first = IngestionEntry::new(patient_id, "patient-docs/p/a.txt", "a.txt");
        let second = IngestionEntry::new(patient_id, "patient-docs/p/b.txt", "b.txt");
        log.record(&first).await.unwrap();
        log.record(&second).await.unwrap();

        let received = server.received();
        let paths: Vec<_> = received.iter().map(|r| r.path.as_str()).collect();
        assert_eq!(
            paths,
            [
                "/dbs",
                "/dbs/reinforce_db/colls",
                "/dbs/reinforce_db/colls/ingestion_logs/docs",
                "/dbs/reinforce_db/colls/ingestion_logs/docs",
            ]
        );

        let doc = &received[2];
        assert_eq!(doc.header("x-ms-documentdb-is-upsert"), Some("True"));
        let partition_key = format!("[\"{}\"]", patient_id);
        assert_eq!(
            doc.header("x-ms-documentdb-partitionkey"),
            Some(partition_key.as_str())
        );
        assert_eq!(doc.header("x-ms-version"), Some(COSMOS_API_VERSION));
        assert!(doc
            .header("authorization")
            .is_some_and(|v| v.starts_with("type%3Dmaster")));

        let body: serde_json::Value = serde_json::from_slice(&doc.body).unwrap();
        assert_eq!(body["id"], first.id.to_string());
        assert_eq!(body["patient_id"], patient_id.to_string());
        assert_eq!(body["blob_path"], "patient-docs/p/a.txt");
    }

    #[tokio::test]
    async fn failed_provisioning_is_a_storage_error() {
        let server = TestServer::start(vec![(401, "unauthorized")]).await;
        let log = stub_log(&server);

        let entry = IngestionEntry::new(Uuid::new_v4(), "patient-docs/p/a.txt", "a.txt");
        let err = log.record(&entry).await.unwrap_err();
        assert!(matches!(err, Error::Storage(ref msg) if msg.contains("provisioning")));
        assert_eq!(server.received().len(), 1);
    }

    #[tokio::test]
    async fn failed_upsert_is_a_storage_error() {
        let server = TestServer::start(vec![(201, "{}"), (201, "{}"), (503, "busy")]).await;
        let log = stub_log(&server);

        let entry = IngestionEntry::new(Uuid::new_v4(), "patient-docs/p/a.txt", "a.txt");
        let err = log.record(&entry).await.unwrap_err();
        assert!(matches!(err, Error::Storage(ref msg) if msg.contains("upsert")));
    }
}
