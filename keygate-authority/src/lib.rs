//! HTTP API of the keygate reference authority.
//!
//! Every operation is `POST /api/v1/<op>` with a JSON [`Request`] body and
//! answers with an [`Envelope`]. Rejections are carried inside the envelope,
//! so the HTTP status is 200 unless the authority itself failed.

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::Json, routing::get, routing::post, Router};
use keygate_license::wire::{
    self, ops, BindBody, Envelope, LoginBody, NoBody, RebindBody, RechargeBody, RegisterBody,
    RemarkBody, Request, TokenBody, UnbindBody, VerifyBody, PROTOCOL_VERSION,
};
use keygate_license::{
    Authority, BindingSetView, ErrorCode, Handshake, LicenseResult, LoginGrant, MemoryAuthority,
    OnlineSessionRecord, PolicyFlags, RechargeTransaction, SignedEntitlement,
};
use serde::{Deserialize, Serialize};
use tracing::debug;
use tracing_subscriber::EnvFilter;

type AppState = Arc<MemoryAuthority>;
type Reply<T> = (StatusCode, Json<Envelope<T>>);

/// Public facts about the authority, served on `GET /api/v1/info`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct AuthorityInfo {
    pub software_id: String,
    pub protocol_version: u32,
    /// Hex Ed25519 key that verifies entitlement tokens.
    pub public_key: String,
}

impl AuthorityInfo {
    pub fn of(authority: &MemoryAuthority) -> Self {
        Self {
            software_id: authority.software_id().to_string(),
            protocol_version: PROTOCOL_VERSION,
            public_key: hex::encode(authority.verifying_key()),
        }
    }
}

fn reply<T>(op: &str, result: LicenseResult<T>) -> Reply<T> {
    let status = match &result {
        Err(e) if e.code() == ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::OK,
    };
    if let Err(e) = &result {
        debug!(op, code = %e.code(), "operation rejected");
    }
    (status, Json(Envelope::from_result(result)))
}

async fn info_handler(State(authority): State<AppState>) -> Json<AuthorityInfo> {
    Json(AuthorityInfo::of(&authority))
}

async fn handshake_handler(State(authority): State<AppState>) -> Reply<Handshake> {
    reply(ops::HANDSHAKE, authority.handshake().await)
}

async fn policy_handler(
    State(authority): State<AppState>,
    Json(req): Json<Request<NoBody>>,
) -> Reply<PolicyFlags> {
    reply(ops::POLICY, authority.policy(&req.conn).await)
}

async fn verify_handler(
    State(authority): State<AppState>,
    Json(req): Json<Request<VerifyBody>>,
) -> Reply<()> {
    reply(ops::VERIFY, authority.verify(&req.conn, &req.body.identity).await)
}

async fn login_handler(
    State(authority): State<AppState>,
    Json(req): Json<Request<LoginBody>>,
) -> Reply<LoginGrant> {
    let result = authority
        .login(&req.conn, &req.body.identity, &req.body.machine)
        .await;
    reply(ops::LOGIN, result)
}

async fn register_handler(
    State(authority): State<AppState>,
    Json(req): Json<Request<RegisterBody>>,
) -> Reply<()> {
    let body = req.body;
    let result = authority
        .register(&req.conn, &body.username, &body.password, &body.card_key)
        .await;
    reply(ops::REGISTER, result)
}

async fn logout_handler(
    State(authority): State<AppState>,
    Json(req): Json<Request<TokenBody>>,
) -> Reply<()> {
    reply(ops::LOGOUT, authority.logout(&req.conn, &req.body.token).await)
}

async fn entitlement_handler(
    State(authority): State<AppState>,
    Json(req): Json<Request<TokenBody>>,
) -> Reply<SignedEntitlement> {
    reply(
        ops::ENTITLEMENT,
        authority.entitlement(&req.conn, &req.body.token).await,
    )
}

async fn recharge_handler(
    State(authority): State<AppState>,
    Json(req): Json<Request<RechargeBody>>,
) -> Reply<RechargeTransaction> {
    let result = authority
        .recharge(&req.conn, &req.body.token, &req.body.codes)
        .await;
    reply(ops::RECHARGE, result)
}

async fn bindings_handler(
    State(authority): State<AppState>,
    Json(req): Json<Request<TokenBody>>,
) -> Reply<BindingSetView> {
    reply(ops::BINDINGS, authority.bindings(&req.conn, &req.body.token).await)
}

async fn bind_handler(
    State(authority): State<AppState>,
    Json(req): Json<Request<BindBody>>,
) -> Reply<BindingSetView> {
    let result = authority
        .bind(&req.conn, &req.body.token, &req.body.machine)
        .await;
    reply(ops::BIND, result)
}

async fn unbind_handler(
    State(authority): State<AppState>,
    Json(req): Json<Request<UnbindBody>>,
) -> Reply<BindingSetView> {
    let result = authority
        .unbind(&req.conn, &req.body.token, &req.body.fingerprint)
        .await;
    reply(ops::UNBIND, result)
}

async fn rebind_handler(
    State(authority): State<AppState>,
    Json(req): Json<Request<RebindBody>>,
) -> Reply<BindingSetView> {
    let body = req.body;
    let result = authority
        .rebind(&req.conn, &body.token, &body.old, &body.machine)
        .await;
    reply(ops::REBIND, result)
}

async fn remark_handler(
    State(authority): State<AppState>,
    Json(req): Json<Request<RemarkBody>>,
) -> Reply<BindingSetView> {
    let body = req.body;
    let result = authority
        .set_remark(&req.conn, &body.token, &body.fingerprint, &body.remark)
        .await;
    reply(ops::REMARK, result)
}

async fn online_handler(
    State(authority): State<AppState>,
    Json(req): Json<Request<TokenBody>>,
) -> Reply<Vec<OnlineSessionRecord>> {
    reply(ops::ONLINE, authority.online(&req.conn, &req.body.token).await)
}

/// Log filter for the server: `rust_log` when it parses, else `info`, with
/// debug output for the keygate crates when `verbose`.
pub fn log_filter(verbose: bool, rust_log: Option<&str>) -> EnvFilter {
    if let Some(filter) = rust_log.and_then(|directives| EnvFilter::try_new(directives).ok()) {
        return filter;
    }
    if verbose {
        EnvFilter::new("keygate_authority=debug,keygate_license=debug,info")
    } else {
        EnvFilter::new("info")
    }
}

/// Build the HTTP API router serving `authority`.
pub fn build_router(authority: Arc<MemoryAuthority>) -> Router {
    Router::new()
        .route("/api/v1/info", get(info_handler))
        .route(&wire::path(ops::HANDSHAKE), post(handshake_handler))
        .route(&wire::path(ops::POLICY), post(policy_handler))
        .route(&wire::path(ops::VERIFY), post(verify_handler))
        .route(&wire::path(ops::LOGIN), post(login_handler))
        .route(&wire::path(ops::REGISTER), post(register_handler))
        .route(&wire::path(ops::LOGOUT), post(logout_handler))
        .route(&wire::path(ops::ENTITLEMENT), post(entitlement_handler))
        .route(&wire::path(ops::RECHARGE), post(recharge_handler))
        .route(&wire::path(ops::BINDINGS), post(bindings_handler))
        .route(&wire::path(ops::BIND), post(bind_handler))
        .route(&wire::path(ops::UNBIND), post(unbind_handler))
        .route(&wire::path(ops::REBIND), post(rebind_handler))
        .route(&wire::path(ops::REMARK), post(remark_handler))
        .route(&wire::path(ops::ONLINE), post(online_handler))
        .with_state(authority)
}
