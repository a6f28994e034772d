//! Shared fixtures for the HTTP tests

#![allow(dead_code)]

use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::Value;
use tempfile::TempDir;
use tower::ServiceExt;

use reinforce::api::{self, AppState};
use reinforce::llm::{GenerationRequest, QuestionGenerator};
use reinforce::quiz::{QuestionDraft, QuestionType};
use reinforce::storage::{JsonlIngestionLog, LocalBlobStore, SqliteStorage};
use reinforce::{CareStore, Config, ItemType, QuizEngine};

pub const API_KEY: &str = "test-key";

/// A router over an in-memory database and a temporary data directory
pub struct TestApp {
    pub router: Router,
    pub dir: TempDir,
}

/// Writes a recall question for the first knowledge item it is given
pub struct RecallGenerator;

#[async_trait]
impl QuestionGenerator for RecallGenerator {
    async fn generate(&self, request: &GenerationRequest) -> reinforce::Result<Vec<QuestionDraft>> {
        Ok(request
            .knowledge_items
            .iter()
            .take(1)
            .map(|item| QuestionDraft {
                question_type: QuestionType::Recall,
                prompt: format!("What is your {}?", item.label),
                options: None,
                correct_answer: Value::String(item.value.clone()),
                item_type: ItemType::Knowledge,
                item_id: item.id,
                difficulty: 1,
                acceptable_answers: Some(vec![item.value.clone()]),
            })
            .collect())
    }
}

pub fn test_app(api_key: Option<&str>, generator: Option<Arc<dyn QuestionGenerator>>) -> TestApp {
    let dir = TempDir::new().unwrap();
    build_app(Config::with_data_dir(dir.path()), dir, api_key, generator)
}

/// Like [`test_app`] with a small request body limit
pub fn test_app_with_upload_limit(max_upload_bytes: usize) -> TestApp {
    let dir = TempDir::new().unwrap();
    let config = Config {
        max_upload_bytes,
        ..Config::with_data_dir(dir.path())
    };
    build_app(config, dir, Some(API_KEY), None)
}

fn build_app(
    config: Config,
    dir: TempDir,
    api_key: Option<&str>,
    generator: Option<Arc<dyn QuestionGenerator>>,
) -> TestApp {
    let blobs = Arc::new(LocalBlobStore::new(config.blob_dir()));
    let log = Arc::new(JsonlIngestionLog::new(&config).unwrap());
    let sqlite = SqliteStorage::open_in_memory().unwrap();
    let store = CareStore::with_backends(config, sqlite, blobs, log);

    let state = Arc::new(AppState {
        store,
        engine: QuizEngine::new(generator),
        api_key: api_key.map(str::to_string),
    });

    TestApp {
        router: api::router(state),
        dir,
    }
}

impl TestApp {
    pub async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or_else(|_| {
                Value::String(String::from_utf8_lossy(&bytes).into_owned())
            })
        };
        (status, body)
    }

    pub async fn get(&self, uri: &str) -> (StatusCode, Value) {
        self.send(
            Request::get(uri)
                .header("x-api-key", API_KEY)
                .body(Body::empty())
                .unwrap(),
        )
        .await
    }

    pub async fn post_json(&self, uri: &str, body: Value) -> (StatusCode, Value) {
        self.send(
            Request::post(uri)
                .header("x-api-key", API_KEY)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
    }

    pub async fn post_empty(&self, uri: &str) -> (StatusCode, Value) {
        self.send(
            Request::post(uri)
                .header("x-api-key", API_KEY)
                .body(Body::empty())
                .unwrap(),
        )
        .await
    }

    /// Post a multipart body with a single field
    pub async fn post_file(
        &self,
        uri: &str,
        field: &str,
        filename: &str,
        data: &[u8],
    ) -> (StatusCode, Value) {
        let boundary = "reinforce-test-boundary";
        let mut body = Vec::new();
        body.extend_from_slice(
            format!(
                "--{boundary}\r\n\
                 Content-Disposition: form-data; name=\"{field}\"; filename=\"{filename}\"\r\n\
                 Content-Type: application/octet-stream\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(data);
        body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());

        self.send(
            Request::post(uri)
                .header("x-api-key", API_KEY)
                .header(
                    "content-type",
                    format!("multipart/form-data; boundary={boundary}"),
                )
                .body(Body::from(body))
                .unwrap(),
        )
        .await
    }

    /// Create a patient and return its id
    pub async fn create_patient(&self, name: &str) -> String {
        let (status, body) = self
            .post_json(
                "/patients",
                serde_json::json!({ "full_name": name, "dob": "1940-05-01" }),
            )
            .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        body["id"].as_str().unwrap().to_string()
    }
}
