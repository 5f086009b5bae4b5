// Copyright (C) 2025 OceanBase
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP surface tests against a served agent.

mod common;

use chrono::Utc;
use common::{TestContext, read};
use obshell_core::remote::TRACE_ID_HEADER;
use obshell_security::{BodyKeys, OCS_HEADER};
use reqwest::Method;
use serde_json::json;

#[tokio::test]
async fn test_secret_and_status_are_public() {
    let ctx = TestContext::start().await;

    let (status, body) = read(ctx.http.get(ctx.url("/api/v1/secret")).send().await.unwrap()).await;
    assert_eq!(status, 200);
    let pem = body.data.unwrap()["public_key"].as_str().unwrap().to_string();
    assert!(pem.contains("BEGIN PUBLIC KEY"));

    let (status, body) = read(ctx.http.get(ctx.url("/api/v1/status")).send().await.unwrap()).await;
    assert_eq!(status, 200);
    let data = body.data.unwrap();
    assert_eq!(data["state"], "RUNNING");
    assert_eq!(data["agent"]["port"], ctx.addr.port);
    assert!(!body.trace_id.is_empty());

    ctx.stop().await;
}

#[tokio::test]
async fn test_trace_id_is_echoed() {
    let ctx = TestContext::start().await;

    let resp = ctx
        .http
        .get(ctx.url("/api/v1/status"))
        .header(TRACE_ID_HEADER, "abc123")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.headers()[TRACE_ID_HEADER], "abc123");
    let (_, body) = read(resp).await;
    assert_eq!(body.trace_id, "abc123");

    ctx.stop().await;
}

#[tokio::test]
async fn test_missing_credentials_are_rejected() {
    let ctx = TestContext::start().await;

    let (status, body) =
        read(ctx.http.get(ctx.url("/api/v1/task/dag/maintain/agent")).send().await.unwrap()).await;
    assert_eq!(status, 401);
    assert!(!body.successful);
    assert_eq!(body.error.unwrap().code, "COMMON_UNAUTHORIZED");

    ctx.stop().await;
}

#[tokio::test]
async fn test_replayed_expired_header_is_rejected() {
    let ctx = TestContext::start().await;
    let uri = "/api/v1/task/dag/maintain/agent";

    let stale = ctx.db_header(uri, Utc::now().timestamp() - 100, None);
    let resp = ctx
        .http
        .get(ctx.url(uri))
        .header(OCS_HEADER, stale)
        .send()
        .await
        .unwrap();
    let (status, body) = read(resp).await;
    assert_eq!(status, 401);
    assert_eq!(body.error.unwrap().code, "SECURITY_AUTH_DB");

    ctx.stop().await;
}

#[tokio::test]
async fn test_header_minted_for_another_uri_is_rejected() {
    let ctx = TestContext::start().await;

    let header = ctx.db_header("/api/v1/security/credential", Utc::now().timestamp(), None);
    let resp = ctx
        .http
        .get(ctx.url("/api/v1/task/dag/maintain/agent"))
        .header(OCS_HEADER, header)
        .send()
        .await
        .unwrap();
    let (status, body) = read(resp).await;
    assert_eq!(status, 401);
    assert!(!body.successful);

    ctx.stop().await;
}

#[tokio::test]
async fn test_unknown_dag_is_not_found() {
    let ctx = TestContext::start().await;

    let (status, body) = ctx.get_as_db("/api/v1/task/dag/0999999").await;
    assert_eq!(status, 404);
    assert_eq!(body.error.unwrap().code, "TASK_NOT_FOUND");

    let (status, _) = ctx.get_as_db("/api/v1/task/dag/not-an-id").await;
    assert_eq!(status, 404);

    ctx.stop().await;
}

#[tokio::test]
async fn test_no_maintenance_dag_on_idle_agent() {
    let ctx = TestContext::start().await;

    let (status, body) = ctx.get_as_db("/api/v1/task/dag/maintain/agent").await;
    assert_eq!(status, 200);
    assert!(body.successful);
    assert!(body.data.is_none());

    ctx.stop().await;
}

#[tokio::test]
async fn test_login_session_and_logout() {
    let ctx = TestContext::start().await;
    let uri = "/api/v1/login";

    let keys = BodyKeys::generate();
    let resp = ctx
        .http
        .post(ctx.url(uri))
        .header(OCS_HEADER, ctx.db_header(uri, Utc::now().timestamp(), Some(&keys)))
        .send()
        .await
        .unwrap();
    let (status, body) = read(resp).await;
    assert_eq!(status, 200);
    let sealed = body.data.unwrap()["session_id"].as_str().unwrap().to_string();
    let session = String::from_utf8(keys.decrypt(sealed.as_bytes()).unwrap()).unwrap();

    let resp = ctx
        .http
        .get(ctx.url("/api/v1/task/dag/maintain/agent"))
        .header("X-OBSHELL-Session", &session)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);

    let resp = ctx
        .http
        .post(ctx.url("/api/v1/logout"))
        .header("X-OBSHELL-Session", &session)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);

    let resp = ctx
        .http
        .get(ctx.url("/api/v1/task/dag/maintain/agent"))
        .header("X-OBSHELL-Session", &session)
        .send()
        .await
        .unwrap();
    let (status, body) = read(resp).await;
    assert_eq!(status, 401);
    assert_eq!(body.error.unwrap().code, "SECURITY_SESSION_INVALID");

    ctx.stop().await;
}

#[tokio::test]
async fn test_rpc_rejects_database_callers() {
    let ctx = TestContext::start().await;

    let (status, body) = ctx.get_as_db("/rpc/v1/maintainer").await;
    assert_eq!(status, 401);
    assert_eq!(body.error.unwrap().code, "SECURITY_AUTH_AGENT");

    ctx.stop().await;
}

#[tokio::test]
async fn test_malformed_body_is_a_bad_request() {
    let ctx = TestContext::start().await;

    let (status, body) = ctx
        .send_as_db(Method::POST, "/api/v1/agent/join", &json!({"zone": 3}))
        .await;
    assert_eq!(status, 400);
    assert_eq!(body.error.unwrap().code, "COMMON_BAD_REQUEST");

    ctx.stop().await;
}

#[tokio::test]
async fn test_unknown_route_is_wrapped() {
    let ctx = TestContext::start().await;

    let (status, body) = read(ctx.http.get(ctx.url("/api/v1/nope")).send().await.unwrap()).await;
    assert_eq!(status, 404);
    assert_eq!(body.error.unwrap().code, "COMMON_NOT_FOUND");

    ctx.stop().await;
}

#[tokio::test]
async fn test_credential_lifecycle() {
    let ctx = TestContext::start().await;
    let base = "/api/v1/security/credential";

    let (status, body) = ctx
        .send_as_db(
            Method::POST,
            base,
            &json!({
                "target_type": "HOST",
                "name": "hosts-a",
                "targets": [{"ip": "10.0.0.1"}],
                "username": "admin",
                "passphrase": "p1",
            }),
        )
        .await;
    assert_eq!(status, 200, "{:?}", body.error);
    let created = body.data.unwrap();
    assert!(created.get("passphrase").is_none());
    let id = created["id"].as_i64().unwrap();

    let (status, body) = ctx
        .send_as_db(Method::PATCH, &format!("{}/{}", base, id), &json!({"description": "rack 4"}))
        .await;
    assert_eq!(status, 200);
    assert_eq!(body.data.unwrap()["description"], "rack 4");

    let (_, body) = ctx.get_as_db(&format!("{}?target_type=HOST", base)).await;
    assert_eq!(body.data.unwrap().as_array().unwrap().len(), 1);

    let (status, _) = ctx
        .send_as_db(
            Method::PUT,
            &format!("{}/encrypt-secret-key", base),
            &json!({"secret_key": "AAECAwQFBgcICQoLDA0ODxAREhMUFRYXGBkaGxwdHh8="}),
        )
        .await;
    assert_eq!(status, 200);
    assert_eq!(ctx.state.ctx.credentials.passphrase(id).await.unwrap(), "p1");

    let (status, body) = ctx
        .send_as_db(Method::DELETE, &format!("{}/batch", base), &json!({"ids": [id]}))
        .await;
    assert_eq!(status, 200);
    assert_eq!(body.data.unwrap()["deleted"], 1);

    let (status, _) = ctx.get_as_db(&format!("{}/{}", base, id)).await;
    assert_eq!(status, 404);

    ctx.stop().await;
}
