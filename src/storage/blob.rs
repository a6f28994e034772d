//! Blob storage for uploaded documents and photos

use std::collections::{BTreeMap, HashSet};
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use reqwest::{Client, Method, StatusCode};
use tokio::sync::Mutex;
use url::Url;

use super::signing;
use crate::error::{Error, Result};

const STORAGE_API_VERSION: &str = "2021-08-06";

/// Somewhere uploaded bytes can be written
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Write `data` to `container/blob_name`, replacing any existing blob
    async fn put(
        &self,
        container: &str,
        blob_name: &str,
        data: Bytes,
        content_type: &str,
    ) -> Result<()>;
}

/// Replace every character outside `[A-Za-z0-9._-]` with `_`
pub fn safe_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "upload".to_string()
    } else {
        cleaned
    }
}

/// Filesystem-backed blob store rooted at a directory
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Path a blob would be written to
    pub fn blob_path(&self, container: &str, blob_name: &str) -> Result<PathBuf> {
        let relative = Path::new(container).join(blob_name);
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(Error::invalid_input(format!(
                "Invalid blob name: {}/{}",
                container, blob_name
            )));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn put(
        &self,
        container: &str,
        blob_name: &str,
        data: Bytes,
        _content_type: &str,
    ) -> Result<()> {
        let path = self.blob_path(container, blob_name)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, &data).await?;
        tracing::debug!("Wrote {} bytes to {:?}", data.len(), path);
        Ok(())
    }
}

/// Azure Blob Storage client using shared-key authorization
pub struct AzureBlobStore {
    client: Client,
    account: String,
    key: Vec<u8>,
    endpoint: String,
    ensured_containers: Mutex<HashSet<String>>,
}

impl AzureBlobStore {
    /// Build from a storage account connection string
    pub fn from_connection_string(conn: &str) -> Result<Self> {
        let parts: BTreeMap<&str, &str> = conn
            .split(';')
            .filter_map(|part| part.trim().split_once('='))
            .collect();

        let account = parts
            .get("AccountName")
            .ok_or_else(|| Error::config("Blob connection string has no AccountName"))?
            .to_string();
        let key = signing::decode_key(
            parts
                .get("AccountKey")
                .ok_or_else(|| Error::config("Blob connection string has no AccountKey"))?,
        )?;

        let endpoint = match parts.get("BlobEndpoint") {
            Some(endpoint) => endpoint.trim_end_matches('/').to_string(),
            None => {
                let protocol = parts.get("DefaultEndpointsProtocol").unwrap_or(&"https");
                let suffix = parts.get("EndpointSuffix").unwrap_or(&"core.windows.net");
                format!("{}://{}.blob.{}", protocol, account, suffix)
            }
        };

        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;

        Ok(Self {
            client,
            account,
            key,
            endpoint,
            ensured_containers: Mutex::new(HashSet::new()),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn ensure_container(&self, container: &str) -> Result<()> {
        let mut ensured = self.ensured_containers.lock().await;
        if ensured.contains(container) {
            return Ok(());
        }

        let url = self.url(container, None, &[("restype", "container")])?;
        let response = self
            .send(Method::PUT, url, Bytes::new(), None, &[])
            .await?;
        let status = response.status();
        if !(status.is_success() || status == StatusCode::CONFLICT) {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::blob(format!(
                "Creating container {} failed ({}): {}",
                container, status, body
            )));
        }

        tracing::info!("Blob container {} ready", container);
        ensured.insert(container.to_string());
        Ok(())
    }

    fn url(&self, container: &str, blob_name: Option<&str>, query: &[(&str, &str)]) -> Result<Url> {
        let raw = match blob_name {
            Some(name) => format!("{}/{}/{}", self.endpoint, container, name),
            None => format!("{}/{}", self.endpoint, container),
        };
        let mut url = Url::parse(&raw)
            .map_err(|e| Error::config(format!("Invalid blob URL {}: {}", raw, e)))?;
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }
        Ok(url)
    }

    async fn send(
        &self,
        method: Method,
        url: Url,
        body: Bytes,
        content_type: Option<&str>,
        extra_headers: &[(&str, &str)],
    ) -> Result<reqwest::Response> {
        let date = signing::http_date(Utc::now());

        let mut ms_headers = BTreeMap::new();
        ms_headers.insert("x-ms-date".to_string(), date);
        ms_headers.insert("x-ms-version".to_string(), STORAGE_API_VERSION.to_string());
        for (name, value) in extra_headers {
            ms_headers.insert(name.to_ascii_lowercase(), value.to_string());
        }

        let content_length = if body.is_empty() {
            String::new()
        } else {
            body.len().to_string()
        };
        let payload = string_to_sign(
            method.as_str(),
            &content_length,
            content_type.unwrap_or_default(),
            &ms_headers,
            &canonical_resource(&self.account, &url),
        );
        let signature = signing::sign(&self.key, &payload)?;

        let mut request = self
            .client
            .request(method, url)
            .header("Authorization", format!("SharedKey {}:{}", self.account, signature));
        for (name, value) in &ms_headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(content_type) = content_type {
            request = request.header("Content-Type", content_type);
        }

        Ok(request.body(body).send().await?)
    }
}

#[async_trait]
impl BlobStore for AzureBlobStore {
    async fn put(
        &self,
        container: &str,
        blob_name: &str,
        data: Bytes,
        content_type: &str,
    ) -> Result<()> {
        self.ensure_container(container).await?;

        let url = self.url(container, Some(blob_name), &[])?;
        let size = data.len();
        let response = self
            .send(
                Method::PUT,
                url,
                data,
                Some(content_type),
                &[("x-ms-blob-type", "BlockBlob")],
            )
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::blob(format!(
                "Uploading {}/{} failed ({}): {}",
                container, blob_name, status, body
            )));
        }

        tracing::info!("Uploaded {} bytes to {}/{}", size, container, blob_name);
        Ok(())
    }
}

/// Shared-key string to sign (Blob service, version 2015-02-21 or later)
fn string_to_sign(
    verb: &str,
    content_length: &str,
    content_type: &str,
    ms_headers: &BTreeMap<String, String>,
    resource: &str,
) -> String {
    let headers: String = ms_headers
        .iter()
        .map(|(name, value)| format!("{}:{}\n", name, value.trim()))
        .collect();
    format!(
        "{}\n\n\n{}\n\n{}\n\n\n\n\n\n\n{}{}",
        verb, content_length, content_type, headers, resource
    )
}

fn canonical_resource(account: &str, url: &Url) -> String {
    let mut resource = format!("/{}{}", account, url.path());
    let mut query: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, value) in url.query_pairs() {
        query
            .entry(name.to_ascii_lowercase())
            .or_default()
            .push(value.into_owned());
    }
    for (name, mut values) in query {
        values.sort();
        resource.push_str(&format!("\n{}:{}", name, values.join(",")));
    }
    resource
}
