use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use clap::Parser;
use permissions_core::{
    BootstrapReport, MembershipRecord, PermissionEngine, PermissionError, PrincipalId,
    PrincipalKind, Principals, SteamId, TribeId,
};
use permissions_store_sqlite::{PermissionsConfig, SqliteStore};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::info;
use tracing_subscriber::EnvFilter;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";

type Engine = PermissionEngine<SqliteStore>;

#[derive(Clone)]
struct ServiceState {
    engine: Arc<Engine>,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    service_contract_version: &'static str,
    code: &'static str,
    error: String,
    #[serde(skip)]
    status: StatusCode,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    groups: usize,
    players: usize,
    tribes: usize,
}

#[derive(Debug, Clone, Serialize)]
struct GroupView {
    name: String,
    permissions: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
struct DeleteGroupResponse {
    group: String,
    purged_principals: usize,
}

#[derive(Debug, Clone, Serialize)]
struct MembersResponse {
    group: String,
    kind: PrincipalKind,
    at: i64,
    members: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
struct PrincipalView<I: Serialize> {
    kind: PrincipalKind,
    id: I,
    at: i64,
    exists: bool,
    record: Option<MembershipRecord>,
    effective_groups: Vec<String>,
    permissions: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
struct GrantCheckResponse {
    group: String,
    permission: String,
    granted: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct CreateGroupRequest {
    name: String,
}

#[derive(Debug, Clone, Deserialize)]
struct GrantRequest {
    permission: String,
}

/// Permanent membership unless `duration_secs` is present.
#[derive(Debug, Clone, Deserialize)]
struct AddMembershipRequest {
    group: String,
    duration_secs: Option<i64>,
    #[serde(default)]
    delay_secs: i64,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
struct AtQuery {
    at: Option<i64>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
enum KindSegment {
    Players,
    Tribes,
}

#[derive(Debug, Parser)]
#[command(name = "permissions-service")]
#[command(about = "Local HTTP service for permission groups")]
struct Args {
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    db: Option<PathBuf>,
    #[arg(long, default_value = "127.0.0.1:4011")]
    bind: SocketAddr,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

impl From<PermissionError> for ServiceError {
    fn from(err: PermissionError) -> Self {
        let (status, code) = match &err {
            PermissionError::PrincipalNotFound { .. } => (StatusCode::NOT_FOUND, "principal_not_found"),
            PermissionError::GroupMissing(_) => (StatusCode::NOT_FOUND, "group_missing"),
            PermissionError::AlreadyMember { .. } => (StatusCode::CONFLICT, "already_member"),
            PermissionError::NotMember { .. } => (StatusCode::CONFLICT, "not_member"),
            PermissionError::AlreadyExists(_) => (StatusCode::CONFLICT, "already_exists"),
            PermissionError::AlreadyGranted { .. } => (StatusCode::CONFLICT, "already_granted"),
            PermissionError::NotGranted { .. } => (StatusCode::CONFLICT, "not_granted"),
            PermissionError::BuiltinGroup(_) => (StatusCode::CONFLICT, "builtin_group"),
            PermissionError::InvalidName(_) => (StatusCode::BAD_REQUEST, "invalid_name"),
            PermissionError::Store(_) => (StatusCode::INTERNAL_SERVER_ERROR, "store"),
        };
        ServiceState::error(status, code, err.to_string())
    }
}

impl ServiceState {
    fn error(status: StatusCode, code: &'static str, message: impl Into<String>) -> ServiceError {
        ServiceError {
            service_contract_version: SERVICE_CONTRACT_VERSION,
            code,
            error: message.into(),
            status,
        }
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope { service_contract_version: SERVICE_CONTRACT_VERSION, data }
}

/// Route-level access to the per-kind principal handle.
trait RoutedPrincipal: PrincipalId + Serialize + DeserializeOwned {
    fn principals(engine: &Engine) -> Principals<'_, SqliteStore, Self>;
}

impl RoutedPrincipal for SteamId {
    fn principals(engine: &Engine) -> Principals<'_, SqliteStore, Self> {
        engine.players()
    }
}

impl RoutedPrincipal for TribeId {
    fn principals(engine: &Engine) -> Principals<'_, SqliteStore, Self> {
        engine.tribes()
    }
}

fn principal_routes<I: RoutedPrincipal>(router: Router<ServiceState>, prefix: &str) -> Router<ServiceState> {
    router
        .route(&format!("{prefix}/:id"), get(principal_show::<I>))
        .route(&format!("{prefix}/:id/groups"), post(principal_add::<I>))
        .route(&format!("{prefix}/:id/groups/:group"), delete(principal_remove::<I>))
        .route(&format!("{prefix}/:id/timed-groups/:group"), delete(principal_remove_timed::<I>))
}

fn app(state: ServiceState) -> Router {
    let router = Router::new()
        .route("/v1/health", get(health))
        .route("/v1/reload", post(reload))
        .route("/v1/groups", get(groups_list).post(groups_create))
        .route("/v1/groups/:group", delete(group_delete))
        .route("/v1/groups/:group/permissions", get(group_permissions).post(group_grant))
        .route(
            "/v1/groups/:group/permissions/:permission",
            get(group_has_permission).delete(group_revoke),
        )
        .route("/v1/groups/:group/members/:kind", get(group_members));
    let router = principal_routes::<SteamId>(router, "/v1/players");
    let router = principal_routes::<TribeId>(router, "/v1/tribes");
    router.with_state(state)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    let mut config = match args.config.as_ref() {
        Some(path) => PermissionsConfig::from_file(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => PermissionsConfig::default(),
    };
    if let Some(db) = args.db {
        config.database = db;
    }

    let engine = PermissionEngine::new(config.open_store()?);
    engine.bootstrap().context("failed to load permission state")?;
    let state = ServiceState { engine: Arc::new(engine) };

    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    info!(bind = %args.bind, database = %config.database.display(), "permissions service listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health(State(state): State<ServiceState>) -> Json<ServiceEnvelope<HealthResponse>> {
    let engine = &state.engine;
    Json(envelope(HealthResponse {
        status: "ok",
        groups: engine.groups().list_all().len(),
        players: engine.players().len(),
        tribes: engine.tribes().len(),
    }))
}

async fn reload(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<BootstrapReport>>, ServiceError> {
    let report = state.engine.reload()?;
    Ok(Json(envelope(report)))
}

fn group_view(engine: &Engine, name: String) -> GroupView {
    let permissions = engine.groups().permissions_of(&name);
    GroupView { name, permissions }
}

async fn groups_list(State(state): State<ServiceState>) -> Json<ServiceEnvelope<Vec<GroupView>>> {
    let groups = state
        .engine
        .groups()
        .list_all()
        .into_iter()
        .map(|name| group_view(&state.engine, name))
        .collect();
    Json(envelope(groups))
}

async fn groups_create(
    State(state): State<ServiceState>,
    Json(request): Json<CreateGroupRequest>,
) -> Result<(StatusCode, Json<ServiceEnvelope<GroupView>>), ServiceError> {
    state.engine.groups().create(&request.name)?;
    Ok((StatusCode::CREATED, Json(envelope(group_view(&state.engine, request.name)))))
}

async fn group_delete(
    State(state): State<ServiceState>,
    Path(group): Path<String>,
) -> Result<Json<ServiceEnvelope<DeleteGroupResponse>>, ServiceError> {
    let purged_principals = state.engine.groups().delete(&group)?;
    Ok(Json(envelope(DeleteGroupResponse { group, purged_principals })))
}

async fn group_permissions(
    State(state): State<ServiceState>,
    Path(group): Path<String>,
) -> Result<Json<ServiceEnvelope<GroupView>>, ServiceError> {
    if !state.engine.groups().exists(&group) {
        return Err(PermissionError::GroupMissing(group).into());
    }
    Ok(Json(envelope(group_view(&state.engine, group))))
}

async fn group_grant(
    State(state): State<ServiceState>,
    Path(group): Path<String>,
    Json(request): Json<GrantRequest>,
) -> Result<Json<ServiceEnvelope<GroupView>>, ServiceError> {
    state.engine.groups().grant(&group, &request.permission)?;
    Ok(Json(envelope(group_view(&state.engine, group))))
}

async fn group_has_permission(
    State(state): State<ServiceState>,
    Path((group, permission)): Path<(String, String)>,
) -> Result<Json<ServiceEnvelope<GrantCheckResponse>>, ServiceError> {
    let groups = state.engine.groups();
    if !groups.exists(&group) {
        return Err(PermissionError::GroupMissing(group).into());
    }
    let granted = groups.has_permission(&group, &permission);
    Ok(Json(envelope(GrantCheckResponse { group, permission, granted })))
}

async fn group_revoke(
    State(state): State<ServiceState>,
    Path((group, permission)): Path<(String, String)>,
) -> Result<Json<ServiceEnvelope<GroupView>>, ServiceError> {
    state.engine.groups().revoke(&group, &permission)?;
    Ok(Json(envelope(group_view(&state.engine, group))))
}

async fn group_members(
    State(state): State<ServiceState>,
    Path((group, kind)): Path<(String, KindSegment)>,
    Query(query): Query<AtQuery>,
) -> Result<Json<ServiceEnvelope<MembersResponse>>, ServiceError> {
    let engine = &state.engine;
    let at = query.at.unwrap_or_else(|| engine.now());
    let (kind, members) = match kind {
        KindSegment::Players => {
            (PrincipalKind::Player, to_json(engine.players().list_members_at(&group, at))?)
        }
        KindSegment::Tribes => {
            (PrincipalKind::Tribe, to_json(engine.tribes().list_members_at(&group, at))?)
        }
    };
    Ok(Json(envelope(MembersResponse { group, kind, at, members })))
}

fn to_json<T: Serialize>(value: T) -> Result<serde_json::Value, ServiceError> {
    serde_json::to_value(value).map_err(|err| {
        ServiceState::error(StatusCode::INTERNAL_SERVER_ERROR, "encoding", err.to_string())
    })
}

fn principal_view<I: RoutedPrincipal>(engine: &Engine, id: I, at: i64) -> PrincipalView<I> {
    let principals = I::principals(engine);
    PrincipalView {
        kind: I::KIND,
        id,
        at,
        exists: principals.exists(id),
        record: principals.record(id),
        effective_groups: principals.effective_groups(id, at).into_iter().collect(),
        permissions: principals.permissions(id, at).into_iter().collect(),
    }
}

async fn principal_show<I: RoutedPrincipal>(
    State(state): State<ServiceState>,
    Path(id): Path<I>,
    Query(query): Query<AtQuery>,
) -> Json<ServiceEnvelope<PrincipalView<I>>> {
    let at = query.at.unwrap_or_else(|| state.engine.now());
    Json(envelope(principal_view(&state.engine, id, at)))
}

async fn principal_add<I: RoutedPrincipal>(
    State(state): State<ServiceState>,
    Path(id): Path<I>,
    Json(request): Json<AddMembershipRequest>,
) -> Result<Json<ServiceEnvelope<PrincipalView<I>>>, ServiceError> {
    let principals = I::principals(&state.engine);
    match request.duration_secs {
        Some(duration_secs) => principals.add_to_timed_group(
            id,
            &request.group,
            duration_secs,
            request.delay_secs,
        )?,
        None => principals.add_to_group(id, &request.group)?,
    }
    Ok(Json(envelope(principal_view(&state.engine, id, state.engine.now()))))
}

async fn principal_remove<I: RoutedPrincipal>(
    State(state): State<ServiceState>,
    Path((id, group)): Path<(I, String)>,
) -> Result<Json<ServiceEnvelope<PrincipalView<I>>>, ServiceError> {
    I::principals(&state.engine).remove_from_group(id, &group)?;
    Ok(Json(envelope(principal_view(&state.engine, id, state.engine.now()))))
}

async fn principal_remove_timed<I: RoutedPrincipal>(
    State(state): State<ServiceState>,
    Path((id, group)): Path<(I, String)>,
) -> Result<Json<ServiceEnvelope<PrincipalView<I>>>, ServiceError> {
    I::principals(&state.engine).remove_from_timed_group(id, &group)?;
    Ok(Json(envelope(principal_view(&state.engine, id, state.engine.now()))))
}
