mod common;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use common::{chat_request, flow_path, harness, json_body, test_config, Reply};
use concierge_contracts::Language;
use concierge_kernel::emergency::templates;
use concierge_kernel::faq::responses;
use concierge_kernel::Localizer;
use concierge_server::build_app_with;
use serde_json::json;
use tower::ServiceExt;

const RAG_QUESTION: &str = "¿tienes experiencia en Python?";

fn admin_request(uri: &str, key: Option<&str>, body: serde_json::Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json");
    if let Some(key) = key {
        builder = builder.header("x-admin-key", key);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

#[tokio::test]
async fn healthz_ok() {
    let h = harness().build();
    let app = build_app_with(test_config(), h.providers).await.unwrap();
    let res = app
        .oneshot(
            Request::builder()
                .uri("/v1/healthz")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn health_reports_degraded_dependencies() {
    let h = harness().llm(false).build();
    let app = build_app_with(test_config(), h.providers).await.unwrap();
    let res = app
        .oneshot(
            Request::builder()
                .uri("/v1/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let payload = json_body(res).await;
    assert_eq!(payload["status"], "degraded");
    assert_eq!(payload["emergency_mode"], false);
    assert_eq!(payload["services"]["llm_available"], false);
}

#[tokio::test]
async fn greeting_is_answered_from_faq() {
    let h = harness().build();
    let generation = h.generation.clone();
    let app = build_app_with(test_config(), h.providers).await.unwrap();

    let res = app
        .oneshot(chat_request(json!({ "message": "hola" }), "greeter"))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let payload = json_body(res).await;
    assert_eq!(payload["success"], true);
    assert_eq!(payload["source"], "faq");
    assert_eq!(payload["language"], "es");
    assert_eq!(payload["response"], responses::GREETING);
    assert_eq!(payload["from_cache"], false);
    let path = flow_path(&payload);
    assert!(path.contains(&"cache_miss".to_string()));
    assert!(path.contains(&"faq_response".to_string()));
    assert_eq!(generation.calls(), 0);
}

#[tokio::test]
async fn rag_answer_uses_indexed_documents() {
    let h = harness().build();
    let generation = h.generation.clone();
    let app = build_app_with(test_config(), h.providers).await.unwrap();

    let res = app
        .oneshot(chat_request(json!({ "message": RAG_QUESTION }), "rag"))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let payload = json_body(res).await;
    assert_eq!(payload["source"], "rag");
    assert_eq!(payload["context_found"], true);
    assert!(payload["sources_used"].as_u64().unwrap() >= 1);
    assert!(flow_path(&payload).contains(&"rag_generation".to_string()));
    assert_eq!(payload["metadata"]["detected_section"], "experience");

    assert_eq!(generation.calls(), 1);
    let prompt = generation.prompts.lock().unwrap()[0].clone();
    assert!(prompt.contains("[Fuente 1]: Cinco años construyendo APIs"));
    assert!(prompt.contains("(de: experiencia.md)"));
    assert!(prompt.ends_with("RESPUESTA:"));
}

#[tokio::test]
async fn repeated_question_is_served_from_cache() {
    let h = harness().build();
    let generation = h.generation.clone();
    let app = build_app_with(test_config(), h.providers).await.unwrap();

    let first = json_body(
        app.clone()
            .oneshot(chat_request(json!({ "message": RAG_QUESTION }), "cache"))
            .await
            .unwrap(),
    )
    .await;
    let second = json_body(
        app.oneshot(chat_request(json!({ "message": RAG_QUESTION }), "cache"))
            .await
            .unwrap(),
    )
    .await;

    assert_eq!(first["from_cache"], false);
    assert_eq!(second["from_cache"], true);
    assert_eq!(second["source"], "cache");
    assert_eq!(second["response"], first["response"]);
    assert!(flow_path(&second).contains(&"cache_hit".to_string()));
    assert_eq!(flow_path(&second).last().map(String::as_str), Some("cache_hit"));
    assert!(!flow_path(&first).contains(&"cache_hit".to_string()));
    assert_eq!(generation.calls(), 1);
}

#[tokio::test]
async fn two_dependencies_down_switches_to_emergency_templates() {
    let h = harness().llm(false).embedding(false).build();
    let generation = h.generation.clone();
    let app = build_app_with(test_config(), h.providers).await.unwrap();

    let res = app
        .oneshot(chat_request(json!({ "message": RAG_QUESTION }), "emergency"))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let payload = json_body(res).await;
    assert_eq!(payload["success"], true);
    assert_eq!(payload["source"], "emergency");
    assert_eq!(payload["template_type"], "emergency_template");
    assert_eq!(payload["response"], templates::EXPERIENCE);
    assert!(flow_path(&payload).contains(&"emergency_mode".to_string()));
    assert_eq!(generation.calls(), 0);
}

#[tokio::test]
async fn llm_down_alone_serves_unavailable_template() {
    let h = harness().llm(false).build();
    let app = build_app_with(test_config(), h.providers).await.unwrap();

    let res = app
        .oneshot(chat_request(json!({ "message": RAG_QUESTION }), "llm-down"))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let payload = json_body(res).await;
    assert_eq!(payload["source"], "template");
    assert_eq!(payload["template_type"], "llm_unavailable");
    assert_eq!(
        payload["response"],
        Localizer::new().message("llm_unavailable", Language::Es)
    );
    assert!(flow_path(&payload).contains(&"llm_unavailable_template".to_string()));
}

#[tokio::test]
async fn unsuccessful_generation_serves_error_template() {
    let h = harness().reply(Reply::Unsuccessful).build();
    let app = build_app_with(test_config(), h.providers).await.unwrap();

    let res = app
        .oneshot(chat_request(json!({ "message": RAG_QUESTION }), "gen-fail"))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let payload = json_body(res).await;
    assert_eq!(payload["template_type"], "generation_error");
    assert!(flow_path(&payload).contains(&"rag_error_template".to_string()));
}

#[tokio::test]
async fn english_request_gets_english_templates() {
    let h = harness().llm(false).build();
    let app = build_app_with(test_config(), h.providers).await.unwrap();

    let res = app
        .oneshot(chat_request(
            json!({ "message": RAG_QUESTION, "language": "en" }),
            "english",
        ))
        .await
        .unwrap();
    let payload = json_body(res).await;
    assert_eq!(payload["language"], "en");
    assert_eq!(
        payload["response"],
        Localizer::new().message("llm_unavailable", Language::En)
    );
}

#[tokio::test]
async fn burst_limit_returns_429_with_retry_after() {
    let mut cfg = test_config();
    cfg.rate_limit.burst_limit = 2;
    let h = harness().build();
    let app = build_app_with(cfg, h.providers).await.unwrap();

    for _ in 0..2 {
        let res = app
            .clone()
            .oneshot(chat_request(json!({ "message": "hola" }), "bursty"))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
    }

    let res = app
        .clone()
        .oneshot(chat_request(json!({ "message": "hola" }), "bursty"))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(res.headers().contains_key(header::RETRY_AFTER));
    let payload = json_body(res).await;
    assert_eq!(payload["success"], false);
    assert!(payload["retry_after"].as_u64().unwrap() >= 1);
    assert_eq!(
        flow_path(&payload),
        vec!["rate_limit_exceeded".to_string()]
    );

    // Other clients keep their own budget.
    let res = app
        .oneshot(chat_request(json!({ "message": "hola" }), "patient"))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn admin_reset_restores_client_budget() {
    let mut cfg = test_config();
    cfg.rate_limit.burst_limit = 1;
    let h = harness().build();
    let app = build_app_with(cfg, h.providers).await.unwrap();

    let ok = app
        .clone()
        .oneshot(chat_request(json!({ "message": "hola" }), "reset-me"))
        .await
        .unwrap();
    assert_eq!(ok.status(), StatusCode::OK);
    let limited = app
        .clone()
        .oneshot(chat_request(json!({ "message": "hola" }), "reset-me"))
        .await
        .unwrap();
    assert_eq!(limited.status(), StatusCode::TOO_MANY_REQUESTS);

    let reset = app
        .clone()
        .oneshot(admin_request(
            "/v1/admin/rate-limits/reset",
            None,
            json!({ "identity": "session:reset-me" }),
        ))
        .await
        .unwrap();
    assert_eq!(reset.status(), StatusCode::OK);
    let payload = json_body(reset).await;
    assert_eq!(payload["identity"], "session:reset-me");
    assert!(payload["windows_cleared"].as_u64().unwrap() >= 1);

    let again = app
        .oneshot(chat_request(json!({ "message": "hola" }), "reset-me"))
        .await
        .unwrap();
    assert_eq!(again.status(), StatusCode::OK);
}

#[tokio::test]
async fn blocked_pattern_is_a_validation_failure() {
    let h = harness().build();
    let app = build_app_with(test_config(), h.providers).await.unwrap();

    let res = app
        .oneshot(chat_request(
            json!({ "message": "hola <script>alert(1)</script>" }),
            "scripted",
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let payload = json_body(res).await;
    assert_eq!(payload["success"], false);
    assert!(payload["error"].is_string());
    assert_eq!(
        payload["response"],
        Localizer::new().message("input_invalid", Language::Es)
    );
    assert!(flow_path(&payload).contains(&"input_validation_failed".to_string()));
}

#[tokio::test]
async fn credential_sharing_is_rejected_as_unsafe() {
    let h = harness().build();
    let generation = h.generation.clone();
    let app = build_app_with(test_config(), h.providers).await.unwrap();

    let res = app
        .oneshot(chat_request(
            json!({ "message": "mi password es 1234" }),
            "leaky",
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let payload = json_body(res).await;
    assert_eq!(
        payload["response"],
        Localizer::new().message("inappropriate_content", Language::Es)
    );
    assert!(flow_path(&payload).contains(&"input_unsafe".to_string()));
    assert!(!payload["issues"].as_array().unwrap().is_empty());
    assert_eq!(generation.calls(), 0);
}

#[tokio::test]
async fn unknown_request_fields_are_rejected() {
    let h = harness().build();
    let app = build_app_with(test_config(), h.providers).await.unwrap();

    let res = app
        .oneshot(chat_request(
            json!({ "message": "hola", "temperature": 2 }),
            "strict",
        ))
        .await
        .unwrap();
    assert!(res.status().is_client_error());
}

#[tokio::test]
async fn emergency_admin_requires_key_and_is_sticky() {
    let mut cfg = test_config();
    cfg.admin.api_keys = vec!["s3cret".to_string()];
    let h = harness().build();
    let app = build_app_with(cfg, h.providers).await.unwrap();

    let denied = app
        .clone()
        .oneshot(admin_request(
            "/v1/admin/emergency/activate",
            None,
            json!({ "reason": "maintenance" }),
        ))
        .await
        .unwrap();
    assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);
    let payload = json_body(denied).await;
    assert_eq!(payload["error"]["code"], "unauthorized");

    let wrong = app
        .clone()
        .oneshot(admin_request(
            "/v1/admin/emergency/activate",
            Some("guess"),
            json!({}),
        ))
        .await
        .unwrap();
    assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);

    let activated = app
        .clone()
        .oneshot(admin_request(
            "/v1/admin/emergency/activate",
            Some("s3cret"),
            json!({ "reason": "maintenance" }),
        ))
        .await
        .unwrap();
    assert_eq!(activated.status(), StatusCode::OK);
    let payload = json_body(activated).await;
    assert_eq!(payload["status"]["active"], true);
    assert_eq!(payload["status"]["manual"], true);

    // Healthy dependencies do not lift a manual activation.
    let res = app
        .clone()
        .oneshot(chat_request(json!({ "message": "hola" }), "during"))
        .await
        .unwrap();
    let payload = json_body(res).await;
    assert_eq!(payload["source"], "emergency");
    assert_eq!(payload["template_type"], "faq");
    assert!(flow_path(&payload).contains(&"emergency_mode".to_string()));

    let deactivated = app
        .clone()
        .oneshot(admin_request(
            "/v1/admin/emergency/deactivate",
            Some("s3cret"),
            json!({}),
        ))
        .await
        .unwrap();
    assert_eq!(deactivated.status(), StatusCode::OK);
    let payload = json_body(deactivated).await;
    assert_eq!(payload["status"]["active"], false);

    let res = app
        .oneshot(chat_request(json!({ "message": "hola" }), "after"))
        .await
        .unwrap();
    let payload = json_body(res).await;
    assert_eq!(payload["source"], "faq");
}

#[tokio::test]
async fn status_and_reload_report_indexed_documents() {
    let h = harness().build();
    let app = build_app_with(test_config(), h.providers).await.unwrap();

    let res = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/v1/status")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let payload = json_body(res).await;
    assert_eq!(payload["documents_indexed"], 2);
    assert_eq!(payload["emergency"]["active"], false);
    assert_eq!(payload["providers"]["generation"], "fake");

    let res = app
        .oneshot(admin_request("/v1/admin/reload", None, json!({})))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let payload = json_body(res).await;
    assert_eq!(payload["success"], true);
    assert_eq!(payload["documents_loaded"], 2);
}
