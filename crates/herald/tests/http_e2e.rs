//! HTTP surface tests, driven through the router with `oneshot`.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

use herald::config::{RootConfig, SignatureScheme, StorageBackend, WebhookConfig};
use herald::http::{build_router, ADMIN_SECRET_HEADER, JOB_SECRET_HEADER};
use herald::providers::SandboxProviders;
use herald::{initialize_with, HeraldApp};
use herald_core::{MaskedFact, Timestamp};
use herald_delivery::{sign_timestamped, WebhookSecret};

const WEBHOOK_SECRET: &str = "http-webhook-secret";

struct TestServer {
    app: Arc<HeraldApp>,
    router: Router,
    providers: SandboxProviders,
}

impl TestServer {
    fn new(strict_signatures: bool) -> Self {
        let mut config = RootConfig::generated();
        config.database.backend = StorageBackend::Memory;
        config.delivery.strict_signatures = strict_signatures;
        config.delivery.email_webhook = WebhookConfig {
            scheme: SignatureScheme::HmacTimestamped,
            secret: Some(WEBHOOK_SECRET.into()),
            ..Default::default()
        };
        let providers = SandboxProviders::new();
        let app = Arc::new(initialize_with(config, providers.provider_set()).unwrap());
        let router = build_router(app.clone());
        Self {
            app,
            router,
            providers,
        }
    }

    fn admin_secret(&self) -> String {
        self.app.config.jobs.admin_secret.clone()
    }

    async fn send(&self, req: Request<Body>) -> (StatusCode, Value) {
        let resp = self.router.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let value = serde_json::from_slice(&body).unwrap_or(Value::Null);
        (status, value)
    }

    async fn admin_post(&self, uri: &str, body: Value) -> (StatusCode, Value) {
        let req = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .header(ADMIN_SECRET_HEADER, self.admin_secret())
            .body(Body::from(body.to_string()))
            .unwrap();
        self.send(req).await
    }

    async fn accessor(
        &self,
        method: &str,
        uri: &str,
        token: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("authorization", format!("Bearer {}", token))
            .header("x-forwarded-for", "203.0.113.7")
            .header("user-agent", "Mobile Safari");
        let req = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string())),
            None => builder.body(Body::empty()),
        }
        .unwrap();
        self.send(req).await
    }

    /// Employee, issued notice dispatched by email, and an access token.
    async fn dispatched_notice(&self) -> (String, String, String) {
        let (status, _) = self
            .admin_post(
                "/admin/employees",
                json!({
                    "employee_id": "e-9",
                    "company_id": "acme",
                    "primary_identifier": "12.345.678-K",
                    "secondary_identifier": null,
                    "email": "worker@example.com",
                    "phone": "+5491100000000",
                    "biometric_opt_in": false
                }),
            )
            .await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, issued) = self
            .admin_post(
                "/admin/notices",
                json!({
                    "employee_id": "e-9",
                    "company_id": "acme",
                    "sanction_type": "Amonestación",
                    "sanction_days": 0,
                    "incident_date": "2026-04-02",
                    "summary": "Late arrival",
                    "body": "Arrived ninety minutes late without justification."
                }),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(issued["notice"]["state"], "draft");
        assert_eq!(issued["tsa"], "confirmed");
        let id = issued["notice"]["id"].as_str().unwrap().to_string();
        let hash = issued["notice"]["content_hash"].as_str().unwrap().to_string();

        let (status, report) = self
            .admin_post(
                &format!("/admin/notices/{}/dispatch", id),
                json!({ "channels": ["email"] }),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(report["channels"]["email"]["status"], "sent");

        let (status, token) = self
            .admin_post(&format!("/admin/notices/{}/access-token", id), json!({}))
            .await;
        assert_eq!(status, StatusCode::OK);
        let token = token["token"].as_str().unwrap().to_string();
        (id, hash, token)
    }
}

#[tokio::test]
async fn test_health() {
    let server = TestServer::new(false);
    let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let (status, body) = server.send(req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(
        body["signer"].as_str().unwrap(),
        server.app.ledger.signer().public_key_hex()
    );
}

#[tokio::test]
async fn test_admin_routes_need_the_secret() {
    let server = TestServer::new(false);
    let req = Request::builder()
        .method("POST")
        .uri("/admin/notices")
        .header("content-type", "application/json")
        .body(Body::from("{}"))
        .unwrap();
    let (status, _) = server.send(req).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let req = Request::builder()
        .method("POST")
        .uri("/admin/notices/n-1/dispatch")
        .header("content-type", "application/json")
        .header(ADMIN_SECRET_HEADER, "not-the-secret")
        .body(Body::from(r#"{"channels":["email"]}"#))
        .unwrap();
    let (status, _) = server.send(req).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_gate_protocol_over_http() {
    let server = TestServer::new(false);
    let (id, hash, token) = server.dispatched_notice().await;

    // No token, wrong token.
    let req = Request::builder()
        .uri(format!("/notices/{}/status", id))
        .body(Body::empty())
        .unwrap();
    assert_eq!(server.send(req).await.0, StatusCode::UNAUTHORIZED);
    let (status, _) = server
        .accessor("GET", &format!("/notices/{}/status", id), "hrld1.bogus.token", None)
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, view) = server
        .accessor("GET", &format!("/notices/{}/status", id), &token, None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(view["status"]["state"], "dispatched");
    assert_eq!(view["progress"]["next_gate"], "credential");

    // Content stays sealed before the identity gates.
    let (status, _) = server
        .accessor("GET", &format!("/notices/{}/content", id), &token, None)
        .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let gate = |path: &str| format!("/notices/{}/gate/{}", id, path);
    let (status, _) = server
        .accessor(
            "POST",
            &gate("credential"),
            &token,
            Some(json!({ "identifier": "99999999" })),
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, pass) = server
        .accessor(
            "POST",
            &gate("credential"),
            &token,
            Some(json!({ "identifier": "12345678k" })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(pass["outcome"], "passed");

    let (status, issued) = server
        .accessor("POST", &gate("code"), &token, Some(json!({ "channel": "sms" })))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert!(issued.get("code").is_none());
    assert_eq!(issued["channel"], "sms");

    let code = server.providers.sms.last_code().unwrap().unwrap();
    let wrong = if code == "000000" { "000001" } else { "000000" };
    let (status, err) = server
        .accessor("POST", &gate("code/verify"), &token, Some(json!({ "code": wrong })))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(err["attempts_remaining"], 4);

    let (status, _) = server
        .accessor("POST", &gate("code/verify"), &token, Some(json!({ "code": code })))
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, content) = server
        .accessor("GET", &format!("/notices/{}/content", id), &token, None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(content["sanction_type"], "Amonestación");

    let (status, prompt) = server
        .accessor("GET", &gate("comprehension"), &token, None)
        .await;
    assert_eq!(status, StatusCode::OK);
    let fact: MaskedFact = serde_json::from_value(prompt["fact"].clone()).unwrap();
    let answer = match fact {
        MaskedFact::SanctionType => "amonestacion",
        MaskedFact::SanctionDuration => "0",
        MaskedFact::IncidentDate => "02/04/2026",
    };
    let (status, pass) = server
        .accessor(
            "POST",
            &gate("comprehension"),
            &token,
            Some(json!({ "answer": answer })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(pass["outcome"], "passed");

    let (_, view) = server
        .accessor("GET", &format!("/notices/{}/status", id), &token, None)
        .await;
    assert_eq!(view["status"]["state"], "read_confirmed");
    assert_eq!(view["status"]["semaphore"], "read");

    // Public verification of the issued hash.
    let req = Request::builder()
        .method("POST")
        .uri("/verify")
        .header("content-type", "application/json")
        .body(Body::from(json!({ "hash": hash }).to_string()))
        .unwrap();
    let (status, verdict) = server.send(req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(verdict["match"], true);
    assert_eq!(verdict["proof_status"]["tsa"], "confirmed");

    let req = Request::builder()
        .method("POST")
        .uri("/verify")
        .header("content-type", "application/json")
        .body(Body::from(json!({ "hash": "00".repeat(32) }).to_string()))
        .unwrap();
    let (status, verdict) = server.send(req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(verdict["match"], false);
}

#[tokio::test]
async fn test_token_is_bound_to_its_notice() {
    let server = TestServer::new(false);
    let (_, _, token) = server.dispatched_notice().await;
    let (other, _, _) = server.dispatched_notice().await;
    let (status, _) = server
        .accessor("GET", &format!("/notices/{}/status", other), &token, None)
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

fn email_webhook(body: &str, signature: Option<String>, id: &str, ts: &str) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/webhooks/email")
        .header("content-type", "application/json")
        .header("webhook-id", id)
        .header("webhook-timestamp", ts);
    if let Some(signature) = signature {
        builder = builder.header("webhook-signature", signature);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

#[tokio::test]
async fn test_email_webhook_records_open() {
    let server = TestServer::new(false);
    let (id, _, _) = server.dispatched_notice().await;
    let notice_id = herald_core::NoticeId::new(id.as_str());
    let message_id = server.providers.email.message_for(&notice_id).unwrap().unwrap();

    let now = Timestamp::now().seconds_since_epoch;
    let body = format!(
        r#"[{{"sg_message_id":"{}","event":"open","timestamp":{}}}]"#,
        message_id, now
    );
    let ts = now.to_string();
    let secret = WebhookSecret::new(WEBHOOK_SECRET.as_bytes()).unwrap();
    let signature = sign_timestamped(&secret, "wh-1", &ts, body.as_bytes()).unwrap();

    let (status, ack) = server
        .send(email_webhook(&body, Some(signature), "wh-1", &ts))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ack["received"], true);
    assert_eq!(ack["events"], 1);

    let notice = server.app.notice(&notice_id).unwrap();
    assert!(notice.has_open());
}

#[tokio::test]
async fn test_webhooks_acknowledge_unless_strict() {
    let lenient = TestServer::new(false);
    let ts = Timestamp::now().seconds_since_epoch.to_string();
    let body = r#"[{"sg_message_id":"unknown","event":"delivered"}]"#;
    let (status, _) = lenient
        .send(email_webhook(body, Some("v1,AAAA".into()), "wh-2", &ts))
        .await;
    assert_eq!(status, StatusCode::OK);

    // Garbage is still acknowledged, providers would retry it forever.
    let (status, _) = lenient.send(email_webhook("not json", None, "wh-3", &ts)).await;
    assert_eq!(status, StatusCode::OK);

    let strict = TestServer::new(true);
    let (status, err) = strict
        .send(email_webhook(body, Some("v1,AAAA".into()), "wh-4", &ts))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(err["error"].is_string());
}

#[tokio::test]
async fn test_sms_webhook_answers_twiml() {
    let server = TestServer::new(false);
    let req = Request::builder()
        .method("POST")
        .uri("/webhooks/sms")
        .header("content-type", "application/json")
        .body(Body::from(r#"{"MessageSid":"SM1","MessageStatus":"delivered"}"#))
        .unwrap();
    let resp = server.router.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()["content-type"], "text/xml");
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"<Response/>");
}

#[tokio::test]
async fn test_job_trigger_runs_once_per_window() {
    let server = TestServer::new(false);
    let job_request = |secret: Option<String>, job: &str| {
        let mut builder = Request::builder().method("POST").uri(format!("/jobs/{}", job));
        if let Some(secret) = secret {
            builder = builder.header(JOB_SECRET_HEADER, secret);
        }
        builder.body(Body::empty()).unwrap()
    };
    let secret = server.app.config.jobs.job_secret.clone();

    let (status, _) = server.send(job_request(None, "firmness")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, first) = server
        .send(job_request(Some(secret.clone()), "firmness"))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["status"], "ran");
    assert_eq!(first["job"], "firmness");

    let (status, second) = server
        .send(job_request(Some(secret.clone()), "firmness"))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(second["status"], "skipped");

    let (status, _) = server.send(job_request(Some(secret), "reindex")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_register_sign_and_verify_document() {
    let server = TestServer::new(false);
    let (status, record) = server
        .admin_post(
            "/admin/documents",
            json!({
                "kind": "witness_statement",
                "id": "ws-1",
                "fields": { "witness": "Supervisor", "statement": "Saw the late arrival." }
            }),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    let hash = record["content_hash"].as_str().unwrap().to_string();

    let (status, block) = server
        .admin_post("/admin/documents/witness_statement/ws-1/sign", json!({}))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(block["hash"], hash);

    let (status, _) = server
        .admin_post("/admin/documents/witness_statement/ws-1/sign", json!({}))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let req = Request::builder()
        .method("POST")
        .uri("/verify")
        .header("content-type", "application/json")
        .body(Body::from(
            json!({
                "hash": hash,
                "document": { "kind": "witness_statement", "id": "ws-1" }
            })
            .to_string(),
        ))
        .unwrap();
    let (status, verdict) = server.send(req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(verdict["match"], true);
    assert_eq!(verdict["proof_status"]["signed"], true);

    let (status, _) = server
        .admin_post(
            "/admin/documents",
            json!({ "kind": "notice", "fields": { "a": 1 } }),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
