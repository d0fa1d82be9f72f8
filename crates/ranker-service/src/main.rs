use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{anyhow, Result};
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use http::header::{AUTHORIZATION, CONTENT_TYPE};
use ranker_api::{
    AddItemRequest, AddUserRequest, ApiError, LoginRequest, LoginResponse, Principal, RankerApi,
    UserView, VoteRequest, API_CONTRACT_VERSION,
};
use ranker_core::{ComparisonPair, GlobalScore, Item, RankerError, UserScore};
use serde::{Deserialize, Serialize};
use tower_http::cors::{AllowOrigin, CorsLayer};

mod logging;

use logging::{LogFormat, LoggingConfig};

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const OPENAPI_YAML: &str = include_str!("../../../openapi/openapi.yaml");

#[derive(Debug, Clone)]
struct ServiceState {
    api: RankerApi,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    #[serde(skip)]
    status: StatusCode,
    service_contract_version: &'static str,
    code: &'static str,
    error: String,
}

#[derive(Debug, Clone, Serialize)]
struct StatusResponse {
    status: &'static str,
}

#[derive(Debug, Clone, Serialize)]
struct Deleted {
    deleted: String,
}

#[derive(Debug, Clone, Deserialize)]
struct CompareQuery {
    user: Option<String>,
}

#[derive(Debug, Parser)]
#[command(name = "ranker-service")]
#[command(about = "HTTP service for pairwise item ranking")]
struct Args {
    #[arg(long, env = "RANKER_DB", default_value = "./ranker.sqlite3")]
    db: PathBuf,
    #[arg(long, env = "RANKER_BIND", default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
    /// Secret used to sign and verify bearer tokens.
    #[arg(long, env = "RANKER_JWT_SECRET", hide_env_values = true)]
    jwt_secret: String,
    /// Create or reset the `admin` account with this password at startup.
    #[arg(long, env = "RANKER_ADMIN_PASSWORD", hide_env_values = true)]
    admin_password: Option<String>,
    #[arg(long, env = "RANKER_LOG_LEVEL", default_value = "info")]
    log_level: String,
    #[arg(long, env = "RANKER_LOG_FORMAT", value_enum, default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

impl ServiceError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            service_contract_version: SERVICE_CONTRACT_VERSION,
            code,
            error: message.into(),
        }
    }
}

impl From<ApiError> for ServiceError {
    fn from(err: ApiError) -> Self {
        let status = match &err {
            ApiError::BadRequest(_) | ApiError::Ranker(RankerError::InvalidChoice(_)) => {
                StatusCode::BAD_REQUEST
            }
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) | ApiError::Ranker(RankerError::InsufficientItems { .. }) => {
                StatusCode::CONFLICT
            }
            ApiError::Ranker(RankerError::Store(_)) | ApiError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let message = format!("{err:#}");
        if status.is_server_error() {
            tracing::error!(code = err.code(), error = %message, "request failed");
        } else {
            tracing::warn!(
                code = err.code(),
                status = status.as_u16(),
                error = %message,
                "request rejected"
            );
        }
        Self::new(status, err.code(), message)
    }
}

impl From<JsonRejection> for ServiceError {
    fn from(rejection: JsonRejection) -> Self {
        tracing::warn!(error = %rejection.body_text(), "request body rejected");
        Self::new(StatusCode::BAD_REQUEST, "bad_request", rejection.body_text())
    }
}

fn envelope<T>(data: T) -> Json<ServiceEnvelope<T>>
where
    T: Serialize,
{
    Json(ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    })
}

type Reply<T> = Result<Json<ServiceEnvelope<T>>, ServiceError>;

impl ServiceState {
    fn caller(&self, headers: &HeaderMap) -> Result<Principal, ServiceError> {
        let authorization = headers.get(AUTHORIZATION).and_then(|value| value.to_str().ok());
        Ok(self.api.authenticate(authorization)?)
    }
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/openapi", get(openapi))
        .route("/v1/items", get(items_list).post(items_add))
        .route("/v1/items/:item", get(items_show).delete(items_delete))
        .route("/v1/users", get(users_list).post(users_register))
        .route("/v1/users/:name", get(users_show).delete(users_delete))
        .route("/v1/login", post(login))
        .route("/v1/compare", get(compare_next).post(compare_vote))
        .route("/v1/scores/:item", get(scores_global))
        .route("/v1/scores/:item/:user", get(scores_user))
        .route("/v1/rankings", get(rankings_global))
        .route("/v1/rankings/:user", get(rankings_user))
        .layer(cors())
        .with_state(state)
}

/// Browser clients on any origin may call the API with bearer tokens. The request origin
/// is echoed back because credentials cannot be combined with a `*` origin.
fn cors() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(AllowOrigin::mirror_request())
        .allow_credentials(true)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([AUTHORIZATION, CONTENT_TYPE])
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    LoggingConfig { level: args.log_level.clone(), format: args.log_format }.init()?;

    if args.jwt_secret.trim().is_empty() {
        return Err(anyhow!("--jwt-secret / RANKER_JWT_SECRET must not be empty"));
    }
    let api = RankerApi::new(args.db.clone(), args.jwt_secret.into_bytes());
    let migration = api.migrate(false)?;
    tracing::info!(
        db = %args.db.display(),
        schema_version = ?migration.after_version,
        applied = ?migration.would_apply_versions,
        "database ready"
    );
    if let Some(password) = args.admin_password.as_deref() {
        api.ensure_admin(password)?;
    }

    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!(bind = %args.bind, "ranker service listening");
    axum::serve(listener, app(ServiceState { api })).await?;
    Ok(())
}

async fn health() -> Json<ServiceEnvelope<StatusResponse>> {
    envelope(StatusResponse { status: "ok" })
}

async fn openapi() -> impl IntoResponse {
    (StatusCode::OK, [("content-type", "application/yaml; charset=utf-8")], OPENAPI_YAML)
}

async fn items_list(State(state): State<ServiceState>) -> Reply<Vec<Item>> {
    Ok(envelope(state.api.list_items()?))
}

async fn items_add(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    payload: Result<Json<AddItemRequest>, JsonRejection>,
) -> Reply<Item> {
    let caller = state.caller(&headers)?;
    let Json(request) = payload?;
    Ok(envelope(state.api.add_item(&caller, request)?))
}

async fn items_show(State(state): State<ServiceState>, Path(item): Path<String>) -> Reply<Item> {
    Ok(envelope(state.api.get_item(&item)?))
}

async fn items_delete(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(item): Path<String>,
) -> Reply<Deleted> {
    let caller = state.caller(&headers)?;
    state.api.delete_item(&caller, &item)?;
    Ok(envelope(Deleted { deleted: item }))
}

async fn users_list(State(state): State<ServiceState>, headers: HeaderMap) -> Reply<Vec<UserView>> {
    let caller = state.caller(&headers)?;
    Ok(envelope(state.api.list_users(&caller)?))
}

async fn users_register(
    State(state): State<ServiceState>,
    payload: Result<Json<AddUserRequest>, JsonRejection>,
) -> Reply<UserView> {
    let Json(request) = payload?;
    Ok(envelope(state.api.register_user(request)?))
}

async fn users_show(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> Reply<UserView> {
    let caller = state.caller(&headers)?;
    Ok(envelope(state.api.get_user(&caller, &name)?))
}

async fn users_delete(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> Reply<Deleted> {
    let caller = state.caller(&headers)?;
    state.api.delete_user(&caller, &name)?;
    Ok(envelope(Deleted { deleted: name }))
}

async fn login(
    State(state): State<ServiceState>,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> Reply<LoginResponse> {
    let Json(request) = payload?;
    Ok(envelope(state.api.login(&request)?))
}

async fn compare_next(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Query(query): Query<CompareQuery>,
) -> Reply<ComparisonPair> {
    let caller = state.caller(&headers)?;
    Ok(envelope(state.api.next_comparison(&caller, query.user.as_deref())?))
}

async fn compare_vote(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    payload: Result<Json<VoteRequest>, JsonRejection>,
) -> Reply<StatusResponse> {
    let caller = state.caller(&headers)?;
    let Json(request) = payload?;
    state.api.submit_vote(&caller, request)?;
    Ok(envelope(StatusResponse { status: "recorded" }))
}

async fn scores_global(
    State(state): State<ServiceState>,
    Path(item): Path<String>,
) -> Reply<GlobalScore> {
    Ok(envelope(state.api.global_score(&item)?))
}

async fn scores_user(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path((item, user)): Path<(String, String)>,
) -> Reply<UserScore> {
    let caller = state.caller(&headers)?;
    Ok(envelope(state.api.user_score(&caller, &item, &user)?))
}

async fn rankings_global(State(state): State<ServiceState>) -> Reply<Vec<GlobalScore>> {
    Ok(envelope(state.api.global_rankings()?))
}

async fn rankings_user(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(user): Path<String>,
) -> Reply<Vec<UserScore>> {
    let caller = state.caller(&headers)?;
    Ok(envelope(state.api.user_rankings(&caller, &user)?))
}
