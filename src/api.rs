//! HTTP API

use std::sync::Arc;

use axum::{
    async_trait,
    extract::{
        multipart::MultipartRejection,
        rejection::{JsonRejection, QueryRejection},
        DefaultBodyLimit, FromRequest, FromRequestParts, Multipart, Path, Query, Request, State,
    },
    http::{request::Parts, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::analytics::AnalyticsSummary;
use crate::error::{Error, Result};
use crate::quiz::{
    GenerateOptions, GeneratedQuiz, QuizEngine, QuizSession, SubmissionItem, SubmissionResult,
};
use crate::records::{FamilyMember, KnowledgeItem, Patient};
use crate::store::CareStore;

/// Header carrying the shared API key
pub const API_KEY_HEADER: &str = "x-api-key";

/// Application state shared across handlers
pub struct AppState {
    pub store: CareStore,
    pub engine: QuizEngine,

    /// Key every request except `/health` must present
    pub api_key: Option<String>,
}

pub type SharedState = Arc<AppState>;

/// Build the router with auth, CORS, tracing and upload limits applied
pub fn router(state: SharedState) -> Router {
    let upload_limit = state.store.config().max_upload_bytes;

    let protected = Router::new()
        // Patients
        .route("/patients", get(list_patients).post(create_patient))
        .route("/patients/:id", get(get_patient))
        // Family and knowledge
        .route(
            "/patients/:id/family",
            get(list_family).post(create_family_member),
        )
        .route(
            "/patients/:id/family/:family_id/photo",
            post(upload_family_photo),
        )
        .route(
            "/patients/:id/knowledge",
            get(list_knowledge).post(create_knowledge_item),
        )
        // Uploads
        .route("/patients/:id/uploads", post(upload_document))
        // Quizzes
        .route("/patients/:id/quiz/generate", post(generate_quiz))
        .route("/patients/:id/quiz/sessions", get(list_sessions))
        .route("/quiz/:session_id", get(get_session))
        .route("/quiz/:session_id/submit", post(submit_quiz))
        // Analytics
        .route("/patients/:id/analytics/summary", get(analytics_summary))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ));

    Router::new()
        .route("/health", get(health))
        .merge(protected)
        .layer(DefaultBodyLimit::max(upload_limit))
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn require_api_key(
    State(state): State<SharedState>,
    request: Request,
    next: Next,
) -> Response {
    let Some(expected) = state.api_key.as_deref() else {
        tracing::error!("APP_API_KEY is not configured; rejecting request");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "detail": "Server missing APP_API_KEY" })),
        )
            .into_response();
    };

    let presented = request
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok());
    if presented != Some(expected) {
        return Error::unauthorized("Invalid API key").into_response();
    }

    next.run(request).await
}

/// `Json` whose rejections use the `{"detail"}` error body
struct ApiJson<T>(T);

#[async_trait]
impl<T, S> FromRequest<S> for ApiJson<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = Error;

    async fn from_request(req: Request, state: &S) -> Result<Self> {
        let Json(value) = Json::<T>::from_request(req, state).await?;
        Ok(Self(value))
    }
}

/// `Query` whose rejections use the `{"detail"}` error body
struct ApiQuery<T>(T);

#[async_trait]
impl<T, S> FromRequestParts<S> for ApiQuery<T>
where
    Query<T>: FromRequestParts<S, Rejection = QueryRejection>,
    S: Send + Sync,
{
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self> {
        let Query(value) = Query::<T>::from_request_parts(parts, state).await?;
        Ok(Self(value))
    }
}

fn parse_id(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|_| Error::bad_request(format!("Invalid id: {}", raw)))
}

// === Handlers ===

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

// --- Patients ---

#[derive(Debug, Deserialize)]
struct CreatePatientRequest {
    full_name: String,
    dob: String,
    phone: Option<String>,
    address: Option<String>,
}

async fn create_patient(
    State(state): State<SharedState>,
    ApiJson(req): ApiJson<CreatePatientRequest>,
) -> Result<Json<Patient>> {
    let mut patient = Patient::new(req.full_name, req.dob);
    if let Some(phone) = req.phone {
        patient = patient.with_phone(phone);
    }
    if let Some(address) = req.address {
        patient = patient.with_address(address);
    }

    Ok(Json(state.store.create_patient(patient)?))
}

async fn list_patients(State(state): State<SharedState>) -> Result<Json<Vec<Patient>>> {
    Ok(Json(state.store.list_patients()?))
}

async fn get_patient(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<Patient>> {
    let id = parse_id(&id)?;
    Ok(Json(state.store.require_patient(id)?))
}

// --- Family members ---

#[derive(Debug, Deserialize)]
struct CreateFamilyMemberRequest {
    full_name: String,
    relationship: String,
}

async fn create_family_member(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    ApiJson(req): ApiJson<CreateFamilyMemberRequest>,
) -> Result<Json<FamilyMember>> {
    let patient_id = parse_id(&id)?;
    let member = FamilyMember::new(patient_id, req.full_name, req.relationship);
    Ok(Json(state.store.add_family_member(member)?))
}

async fn list_family(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<FamilyMember>>> {
    let patient_id = parse_id(&id)?;
    state.store.require_patient(patient_id)?;
    Ok(Json(state.store.list_family_members(patient_id)?))
}

#[derive(Debug, Serialize)]
struct BlobPathResponse {
    blob_path: String,
}

async fn upload_family_photo(
    State(state): State<SharedState>,
    Path((id, family_id)): Path<(String, String)>,
    multipart: std::result::Result<Multipart, MultipartRejection>,
) -> Result<Json<BlobPathResponse>> {
    let patient_id = parse_id(&id)?;
    let family_id = parse_id(&family_id)?;
    let file = read_file_field(multipart?).await?;

    let blob_path = state
        .store
        .upload_family_photo(patient_id, family_id, file.data)
        .await?;
    Ok(Json(BlobPathResponse { blob_path }))
}

// --- Knowledge items ---

#[derive(Debug, Deserialize)]
struct CreateKnowledgeRequest {
    category: String,
    label: String,
    value: String,
    #[serde(default)]
    sensitivity_level: u8,
    #[serde(default = "default_active")]
    is_active: bool,
}

fn default_active() -> bool {
    true
}

async fn create_knowledge_item(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    ApiJson(req): ApiJson<CreateKnowledgeRequest>,
) -> Result<Json<KnowledgeItem>> {
    let patient_id = parse_id(&id)?;
    let item = KnowledgeItem::new(patient_id, req.category, req.label, req.value)
        .with_sensitivity(req.sensitivity_level)
        .with_active(req.is_active);
    Ok(Json(state.store.add_knowledge_item(item)?))
}

#[derive(Debug, Deserialize)]
struct KnowledgeQuery {
    category: Option<String>,
}

async fn list_knowledge(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    ApiQuery(query): ApiQuery<KnowledgeQuery>,
) -> Result<Json<Vec<KnowledgeItem>>> {
    let patient_id = parse_id(&id)?;
    state.store.require_patient(patient_id)?;
    Ok(Json(
        state
            .store
            .list_knowledge_items(patient_id, query.category.as_deref())?,
    ))
}

// --- Uploads ---

struct UploadedFile {
    filename: Option<String>,
    content_type: Option<String>,
    data: Bytes,
}

/// Pull the `file` field out of a multipart body
async fn read_file_field(mut multipart: Multipart) -> Result<UploadedFile> {
    while let Some(field) = multipart.next_field().await? {
        if field.name() != Some("file") {
            continue;
        }
        let filename = field.file_name().map(str::to_string);
        let content_type = field.content_type().map(str::to_string);
        let data = field.bytes().await?;
        return Ok(UploadedFile {
            filename,
            content_type,
            data,
        });
    }

    Err(Error::invalid_input("Missing multipart field: file"))
}

async fn upload_document(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    multipart: std::result::Result<Multipart, MultipartRejection>,
) -> Result<Json<BlobPathResponse>> {
    let patient_id = parse_id(&id)?;
    let file = read_file_field(multipart?).await?;

    let blob_path = state
        .store
        .upload_patient_document(
            patient_id,
            file.filename.as_deref(),
            file.content_type.as_deref(),
            file.data,
        )
        .await?;
    Ok(Json(BlobPathResponse { blob_path }))
}

// --- Quizzes ---

#[derive(Debug, Deserialize)]
struct GenerateQuery {
    n: Option<usize>,
    include_sensitive: Option<bool>,
    reveal_answers: Option<bool>,
}

async fn generate_quiz(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    ApiQuery(query): ApiQuery<GenerateQuery>,
) -> Result<Json<GeneratedQuiz>> {
    let patient_id = parse_id(&id)?;
    let defaults = GenerateOptions::default();
    let options = GenerateOptions {
        n: query.n.unwrap_or(defaults.n),
        include_sensitive: query.include_sensitive.unwrap_or(defaults.include_sensitive),
        reveal_answers: query.reveal_answers.unwrap_or(defaults.reveal_answers),
    };

    let quiz = state
        .engine
        .generate(&state.store, patient_id, options)
        .await?;
    Ok(Json(quiz))
}

async fn list_sessions(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<QuizSession>>> {
    let patient_id = parse_id(&id)?;
    Ok(Json(state.engine.sessions(&state.store, patient_id)?))
}

async fn get_session(
    State(state): State<SharedState>,
    Path(session_id): Path<String>,
) -> Result<Json<QuizSession>> {
    let session_id = parse_id(&session_id)?;
    Ok(Json(state.engine.session(&state.store, session_id)?))
}

async fn submit_quiz(
    State(state): State<SharedState>,
    Path(session_id): Path<String>,
    ApiJson(submissions): ApiJson<Vec<SubmissionItem>>,
) -> Result<Json<SubmissionResult>> {
    let session_id = parse_id(&session_id)?;
    Ok(Json(
        state
            .engine
            .submit(&state.store, session_id, &submissions)?,
    ))
}

// --- Analytics ---

#[derive(Debug, Deserialize)]
struct AnalyticsQuery {
    days: Option<u32>,
}

async fn analytics_summary(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    ApiQuery(query): ApiQuery<AnalyticsQuery>,
) -> Result<Json<AnalyticsSummary>> {
    let patient_id = parse_id(&id)?;
    state.store.require_patient(patient_id)?;
    Ok(Json(
        state
            .store
            .analytics_summary(patient_id, query.days.unwrap_or(30))?,
    ))
}
