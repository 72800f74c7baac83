//! Axum HTTP handlers for the herald server.
//!
//! Four audiences: the public (health, hash verification), delivery
//! providers (webhooks), the accessor working through the gates of one
//! notice (bearer session token), and the issuing party's back office
//! (admin secret). Scheduled jobs can also be triggered with the job secret.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

use herald_core::{
    constant_time_eq, AccessContext, Channel, ContentHash, DocumentId, DocumentKind, DocumentRef,
    EmployeeProfile, IntegrityRecord, NoticeContent, NoticeId, SignatureBlock, Timestamp,
};
use herald_delivery::{
    DeliveryError, DispatchReport, InboundWebhook, IngestReport, SignatureHeaders, WebhookSource,
};
use herald_gate::{ChallengePrompt, ContingencyTicket, DeviceCapabilityReport, GatePass, IssuedCode};
use herald_ledger::VerificationResult;
use herald_lifecycle::{
    record_impugnment, record_physical_dispatch, resolve_impugnment, ImpugnmentResolution,
    IssuedNotice, NoticeStatus,
};

use crate::error::{RootError, RootResult};
use crate::jobs::{Job, JobOutcome};
use crate::HeraldApp;

pub const ADMIN_SECRET_HEADER: &str = "x-herald-admin";
pub const JOB_SECRET_HEADER: &str = "x-herald-job-secret";

type AppState = State<Arc<HeraldApp>>;

/// Build the Axum router with all endpoints.
pub fn build_router(app: Arc<HeraldApp>) -> Router {
    let mut router = Router::new()
        .route("/health", get(handle_health))
        .route("/verify", post(handle_verify));

    // Provider callbacks
    router = router
        .route("/webhooks/email", post(handle_email_webhook))
        .route("/webhooks/sms", post(handle_sms_webhook));

    // Accessor gates, bearer session token
    router = router
        .route("/notices/{id}/gate/credential", post(handle_credential))
        .route("/notices/{id}/gate/code", post(handle_request_code))
        .route("/notices/{id}/gate/code/verify", post(handle_verify_code))
        .route("/notices/{id}/gate/biometric/enroll", post(handle_biometric_enroll))
        .route("/notices/{id}/gate/biometric/verify", post(handle_biometric_verify))
        .route(
            "/notices/{id}/gate/biometric/contingency",
            post(handle_contingency),
        )
        .route(
            "/notices/{id}/gate/biometric/contingency/verify",
            post(handle_contingency_verify),
        )
        .route(
            "/notices/{id}/gate/comprehension",
            get(handle_comprehension).post(handle_comprehension_answer),
        )
        .route("/notices/{id}/gate/declaration", post(handle_declaration))
        .route("/notices/{id}/content", get(handle_content))
        .route("/notices/{id}/status", get(handle_status));

    // Issuing party, admin secret
    router = router
        .route("/admin/employees", post(handle_upsert_employee))
        .route("/admin/notices", post(handle_create_notice))
        .route("/admin/notices/{id}", get(handle_admin_notice))
        .route("/admin/notices/{id}/dispatch", post(handle_dispatch))
        .route("/admin/notices/{id}/access-token", post(handle_access_token))
        .route(
            "/admin/notices/{id}/physical-dispatch",
            post(handle_physical_dispatch),
        )
        .route("/admin/notices/{id}/impugnment", post(handle_impugnment))
        .route(
            "/admin/notices/{id}/impugnment/resolve",
            post(handle_impugnment_resolve),
        )
        .route(
            "/admin/notices/{id}/comprehension/reset",
            post(handle_comprehension_reset),
        )
        .route("/admin/documents", post(handle_register_document))
        .route("/admin/documents/{kind}/{id}/sign", post(handle_sign_document));

    router = router.route("/jobs/{job}", post(handle_job));

    router.with_state(app)
}

impl IntoResponse for RootError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        let mut body = json!({ "error": self.public_message() });
        if let RootError::Gate(
            herald_gate::GateError::CodeMismatch { remaining }
            | herald_gate::GateError::ChallengeMismatch { remaining },
        ) = &self
        {
            body["attempts_remaining"] = json!(remaining);
        }
        (status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Request context
// ---------------------------------------------------------------------------

fn header_value(headers: &HeaderMap, names: &[&str]) -> Option<String> {
    names
        .iter()
        .find_map(|name| headers.get(*name))
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

/// Caller address and agent, as recorded in every log entry.
fn access_context(headers: &HeaderMap) -> AccessContext {
    AccessContext {
        ip: header_value(headers, &["x-forwarded-for", "x-real-ip"])
            .and_then(|v| v.split(',').next().map(|s| s.trim().to_string()))
            .filter(|s| !s.is_empty()),
        user_agent: header_value(headers, &["user-agent"]),
    }
}

/// Extract a bearer token from the Authorization header.
fn extract_session_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|s| s.to_string())
}

/// Token check for the accessor routes, before any gate logic.
fn accessor(
    app: &HeraldApp,
    id: &str,
    headers: &HeaderMap,
) -> RootResult<(NoticeId, AccessContext, Timestamp)> {
    let now = Timestamp::now();
    let id = NoticeId::new(id);
    let token = extract_session_token(headers).ok_or(RootError::Unauthorized)?;
    app.authorize(&token, &id, now)?;
    Ok((id, access_context(headers), now))
}

fn require_secret(headers: &HeaderMap, name: &str, expected: &str) -> RootResult<()> {
    let supplied = header_value(headers, &[name]).ok_or(RootError::Unauthorized)?;
    if expected.is_empty() || !constant_time_eq(supplied.as_bytes(), expected.as_bytes()) {
        tracing::warn!(header = name, "shared secret mismatch");
        return Err(RootError::Forbidden);
    }
    Ok(())
}

fn require_admin(app: &HeraldApp, headers: &HeaderMap) -> RootResult<()> {
    require_secret(headers, ADMIN_SECRET_HEADER, &app.config.jobs.admin_secret)
}

// ---------------------------------------------------------------------------
// Public
// ---------------------------------------------------------------------------

/// GET /health -- liveness and version
async fn handle_health(State(app): AppState) -> Json<Value> {
    let mut health = json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "signer": app.ledger.signer().public_key_hex(),
        "audit_entries": app.audit.len(),
    });
    if let Ok(channels) = app.dispatcher.health() {
        health["channels"] = json!(channels);
    }
    Json(health)
}

#[derive(Deserialize)]
struct VerifyRequest {
    hash: String,
    #[serde(default)]
    document: Option<DocumentRef>,
}

#[derive(Serialize)]
struct VerifyResponse {
    #[serde(rename = "match")]
    matched: bool,
    proof_status: Option<herald_ledger::ProofStatus>,
}

impl From<VerificationResult> for VerifyResponse {
    fn from(result: VerificationResult) -> Self {
        Self {
            matched: result.matched,
            proof_status: result.proof_status,
        }
    }
}

/// POST /verify -- public hash verification. Every query is logged.
async fn handle_verify(
    State(app): AppState,
    headers: HeaderMap,
    Json(req): Json<VerifyRequest>,
) -> RootResult<Json<VerifyResponse>> {
    let now = Timestamp::now();
    let caller = access_context(&headers);
    let result = match (&req.document, ContentHash::from_hex(req.hash.trim())) {
        (Some(document), Some(candidate)) => {
            app.ledger
                .verify_document(document, &candidate, caller, now)?
        }
        _ => app.ledger.verify_hash(&req.hash, caller, now)?,
    };
    Ok(Json(result.into()))
}

// ---------------------------------------------------------------------------
// Webhooks
// ---------------------------------------------------------------------------

fn signature_headers(headers: &HeaderMap) -> SignatureHeaders {
    SignatureHeaders {
        id: header_value(headers, &["webhook-id", "svix-id"]),
        timestamp: header_value(
            headers,
            &[
                "webhook-timestamp",
                "svix-timestamp",
                "x-twilio-email-event-webhook-timestamp",
            ],
        ),
        signature: header_value(
            headers,
            &[
                "webhook-signature",
                "svix-signature",
                "x-twilio-email-event-webhook-signature",
                "x-twilio-signature",
            ],
        ),
    }
}

/// Providers retry anything but a 2xx, so only a strict signature rejection
/// is reported back.
fn ingest(
    app: &HeraldApp,
    source: WebhookSource,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<Option<IngestReport>, Response> {
    let webhook = InboundWebhook {
        source,
        body,
        headers: signature_headers(headers),
        origin: access_context(headers),
    };
    match app.ingestor.ingest(&webhook, Timestamp::now()) {
        Ok(report) => Ok(Some(report)),
        Err(DeliveryError::InvalidSignature) => {
            Err(RootError::Delivery(DeliveryError::InvalidSignature).into_response())
        }
        Err(e) => {
            tracing::warn!(source = source.as_str(), error = %e, "webhook not applied");
            Ok(None)
        }
    }
}

/// POST /webhooks/email
async fn handle_email_webhook(
    State(app): AppState,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    match ingest(&app, WebhookSource::Email, &headers, &body) {
        Ok(report) => (
            StatusCode::OK,
            Json(json!({
                "received": true,
                "events": report.map(|r| r.events).unwrap_or(0),
            })),
        )
            .into_response(),
        Err(rejection) => rejection,
    }
}

/// POST /webhooks/sms -- acknowledged with an empty TwiML document.
async fn handle_sms_webhook(
    State(app): AppState,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    match ingest(&app, WebhookSource::Sms, &headers, &body) {
        Ok(_) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/xml")],
            "<Response/>",
        )
            .into_response(),
        Err(rejection) => rejection,
    }
}

// ---------------------------------------------------------------------------
// Accessor gates
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct CredentialRequest {
    identifier: String,
}

/// POST /notices/{id}/gate/credential -- Gate A
async fn handle_credential(
    State(app): AppState,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<CredentialRequest>,
) -> RootResult<Json<GatePass>> {
    let (id, ctx, now) = accessor(&app, &id, &headers)?;
    let pass = app
        .gatekeeper
        .verify_credential(&id, &req.identifier, &ctx, now)?;
    Ok(Json(pass))
}

#[derive(Deserialize)]
struct CodeRequest {
    channel: Channel,
}

#[derive(Deserialize)]
struct CodeAnswer {
    code: String,
}

/// POST /notices/{id}/gate/code -- Gate B, issue
async fn handle_request_code(
    State(app): AppState,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<CodeRequest>,
) -> RootResult<Json<IssuedCode>> {
    let (id, ctx, now) = accessor(&app, &id, &headers)?;
    let issued = app
        .gatekeeper
        .request_code(&id, req.channel, &ctx, now)
        .await?;
    Ok(Json(issued))
}

/// POST /notices/{id}/gate/code/verify -- Gate B, verify
async fn handle_verify_code(
    State(app): AppState,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<CodeAnswer>,
) -> RootResult<Json<GatePass>> {
    let (id, ctx, now) = accessor(&app, &id, &headers)?;
    Ok(Json(app.gatekeeper.verify_code(&id, &req.code, &ctx, now)?))
}

#[derive(Deserialize)]
struct BiometricRequest {
    session_id: String,
}

/// POST /notices/{id}/gate/biometric/enroll -- Gate C, first access
async fn handle_biometric_enroll(
    State(app): AppState,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<BiometricRequest>,
) -> RootResult<Json<GatePass>> {
    let (id, ctx, now) = accessor(&app, &id, &headers)?;
    let pass = app
        .gatekeeper
        .enroll_biometric(&id, &req.session_id, &ctx, now)
        .await?;
    Ok(Json(pass))
}

/// POST /notices/{id}/gate/biometric/verify -- Gate C
async fn handle_biometric_verify(
    State(app): AppState,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<BiometricRequest>,
) -> RootResult<Json<GatePass>> {
    let (id, ctx, now) = accessor(&app, &id, &headers)?;
    let pass = app
        .gatekeeper
        .verify_biometric(&id, &req.session_id, &ctx, now)
        .await?;
    Ok(Json(pass))
}

#[derive(Deserialize)]
struct ContingencyRequest {
    #[serde(default)]
    device: DeviceCapabilityReport,
    channel: Channel,
}

/// POST /notices/{id}/gate/biometric/contingency
async fn handle_contingency(
    State(app): AppState,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<ContingencyRequest>,
) -> RootResult<Json<ContingencyTicket>> {
    let (id, ctx, now) = accessor(&app, &id, &headers)?;
    let ticket = app
        .gatekeeper
        .activate_contingency(&id, &req.device, req.channel, &ctx, now)
        .await?;
    Ok(Json(ticket))
}

/// POST /notices/{id}/gate/biometric/contingency/verify
async fn handle_contingency_verify(
    State(app): AppState,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<CodeAnswer>,
) -> RootResult<Json<GatePass>> {
    let (id, ctx, now) = accessor(&app, &id, &headers)?;
    Ok(Json(
        app.gatekeeper
            .verify_contingency(&id, &req.code, &ctx, now)?,
    ))
}

/// GET /notices/{id}/gate/comprehension -- Gate D prompt
async fn handle_comprehension(
    State(app): AppState,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> RootResult<Json<ChallengePrompt>> {
    let (id, ctx, now) = accessor(&app, &id, &headers)?;
    Ok(Json(app.gatekeeper.comprehension_challenge(&id, &ctx, now)?))
}

#[derive(Deserialize)]
struct ComprehensionAnswer {
    answer: String,
}

/// POST /notices/{id}/gate/comprehension -- Gate D answer
async fn handle_comprehension_answer(
    State(app): AppState,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<ComprehensionAnswer>,
) -> RootResult<Json<GatePass>> {
    let (id, ctx, now) = accessor(&app, &id, &headers)?;
    Ok(Json(
        app.gatekeeper
            .answer_comprehension(&id, &req.answer, &ctx, now)?,
    ))
}

#[derive(Deserialize)]
struct DeclarationRequest {
    accepted: bool,
}

/// POST /notices/{id}/gate/declaration -- Gate D, declaration variant
async fn handle_declaration(
    State(app): AppState,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<DeclarationRequest>,
) -> RootResult<Json<GatePass>> {
    let (id, ctx, now) = accessor(&app, &id, &headers)?;
    Ok(Json(
        app.gatekeeper
            .confirm_by_declaration(&id, req.accepted, &ctx, now)?,
    ))
}

/// GET /notices/{id}/content -- revealed once the identity gates pass
async fn handle_content(
    State(app): AppState,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> RootResult<Json<NoticeContent>> {
    let (id, _, _) = accessor(&app, &id, &headers)?;
    Ok(Json(app.gatekeeper.reveal_content(&id)?))
}

/// GET /notices/{id}/status -- semaphore recomputed per request
async fn handle_status(
    State(app): AppState,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> RootResult<Json<Value>> {
    let (id, _, now) = accessor(&app, &id, &headers)?;
    let status = app.status(&id, now)?;
    let progress = app.gatekeeper.progress(&id)?;
    Ok(Json(json!({ "status": status, "progress": progress })))
}

// ---------------------------------------------------------------------------
// Admin
// ---------------------------------------------------------------------------

/// POST /admin/employees
async fn handle_upsert_employee(
    State(app): AppState,
    headers: HeaderMap,
    Json(profile): Json<EmployeeProfile>,
) -> RootResult<StatusCode> {
    require_admin(&app, &headers)?;
    if profile.employee_id.as_str().trim().is_empty()
        || profile.primary_identifier.trim().is_empty()
    {
        return Err(RootError::BadRequest("employee id and identifier required".into()));
    }
    app.employees.upsert_employee(&profile)?;
    tracing::info!(employee_id = %profile.employee_id, "employee profile stored");
    Ok(StatusCode::NO_CONTENT)
}

/// POST /admin/notices -- issue a notice in draft
async fn handle_create_notice(
    State(app): AppState,
    headers: HeaderMap,
    Json(content): Json<NoticeContent>,
) -> RootResult<(StatusCode, Json<IssuedNotice>)> {
    require_admin(&app, &headers)?;
    let issued = app.issuer.create_notice(content, Timestamp::now()).await?;
    Ok((StatusCode::CREATED, Json(issued)))
}

/// GET /admin/notices/{id} -- status and gate log
async fn handle_admin_notice(
    State(app): AppState,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> RootResult<Json<Value>> {
    require_admin(&app, &headers)?;
    let id = NoticeId::new(id);
    let status: NoticeStatus = app.status(&id, Timestamp::now())?;
    let gate_log = app.gatekeeper.gate_log(&id)?;
    Ok(Json(json!({ "status": status, "gate_log": gate_log })))
}

#[derive(Deserialize)]
struct DispatchRequestBody {
    channels: Vec<Channel>,
}

/// POST /admin/notices/{id}/dispatch
async fn handle_dispatch(
    State(app): AppState,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<DispatchRequestBody>,
) -> RootResult<Json<DispatchReport>> {
    require_admin(&app, &headers)?;
    if req.channels.is_empty() {
        return Err(RootError::BadRequest("no channels requested".into()));
    }
    let report = app
        .dispatcher
        .dispatch(&NoticeId::new(id), &req.channels, Timestamp::now())
        .await?;
    Ok(Json(report))
}

/// POST /admin/notices/{id}/access-token
async fn handle_access_token(
    State(app): AppState,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> RootResult<Json<Value>> {
    require_admin(&app, &headers)?;
    let (token, expires_at) = app.issue_access_token(&NoticeId::new(id), Timestamp::now())?;
    Ok(Json(json!({ "token": token, "expires_at": expires_at })))
}

/// POST /admin/notices/{id}/physical-dispatch
async fn handle_physical_dispatch(
    State(app): AppState,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> RootResult<Json<NoticeStatus>> {
    require_admin(&app, &headers)?;
    let now = Timestamp::now();
    let notice = record_physical_dispatch(
        app.notices.as_ref(),
        app.audit.as_ref(),
        &NoticeId::new(id),
        now,
    )?;
    Ok(Json(herald_lifecycle::status_view(&notice, now)))
}

/// POST /admin/notices/{id}/impugnment
async fn handle_impugnment(
    State(app): AppState,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> RootResult<Json<NoticeStatus>> {
    require_admin(&app, &headers)?;
    let now = Timestamp::now();
    let notice = record_impugnment(
        app.notices.as_ref(),
        app.audit.as_ref(),
        &NoticeId::new(id),
        now,
    )?;
    Ok(Json(herald_lifecycle::status_view(&notice, now)))
}

#[derive(Deserialize)]
struct ResolutionRequest {
    resolution: ImpugnmentResolution,
}

/// POST /admin/notices/{id}/impugnment/resolve
async fn handle_impugnment_resolve(
    State(app): AppState,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<ResolutionRequest>,
) -> RootResult<Json<NoticeStatus>> {
    require_admin(&app, &headers)?;
    let now = Timestamp::now();
    let notice = resolve_impugnment(
        app.notices.as_ref(),
        app.audit.as_ref(),
        &NoticeId::new(id),
        req.resolution,
        now,
    )?;
    Ok(Json(herald_lifecycle::status_view(&notice, now)))
}

#[derive(Deserialize)]
struct ResetRequest {
    operator: String,
}

/// POST /admin/notices/{id}/comprehension/reset -- manual override
async fn handle_comprehension_reset(
    State(app): AppState,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<ResetRequest>,
) -> RootResult<Json<ChallengePrompt>> {
    require_admin(&app, &headers)?;
    if req.operator.trim().is_empty() {
        return Err(RootError::BadRequest("operator required".into()));
    }
    let prompt = app.gatekeeper.reset_comprehension(
        &NoticeId::new(id),
        req.operator.trim(),
        Timestamp::now(),
    )?;
    Ok(Json(prompt))
}

#[derive(Deserialize)]
struct RegisterDocumentRequest {
    kind: DocumentKind,
    #[serde(default)]
    id: Option<String>,
    fields: Value,
}

/// POST /admin/documents -- register an evidentiary document
async fn handle_register_document(
    State(app): AppState,
    headers: HeaderMap,
    Json(req): Json<RegisterDocumentRequest>,
) -> RootResult<(StatusCode, Json<IntegrityRecord>)> {
    require_admin(&app, &headers)?;
    let record = app
        .issuer
        .register_document(
            req.kind,
            req.id.map(DocumentId::new),
            &req.fields,
            Timestamp::now(),
        )
        .await?;
    Ok((StatusCode::CREATED, Json(record)))
}

/// POST /admin/documents/{kind}/{id}/sign -- detached signature
async fn handle_sign_document(
    State(app): AppState,
    Path((kind, id)): Path<(DocumentKind, String)>,
    headers: HeaderMap,
) -> RootResult<Json<SignatureBlock>> {
    require_admin(&app, &headers)?;
    let block = app
        .ledger
        .sign_document(&DocumentRef::new(kind, id), Timestamp::now())?;
    Ok(Json(block))
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

/// POST /jobs/{job} -- trigger a scheduled job
async fn handle_job(
    State(app): AppState,
    Path(job): Path<String>,
    headers: HeaderMap,
) -> RootResult<Json<JobOutcome>> {
    require_secret(&headers, JOB_SECRET_HEADER, &app.config.jobs.job_secret)?;
    let job: Job = job.parse()?;
    Ok(Json(app.run_job(job, Timestamp::now()).await?))
}
