mod common;

use anyhow::Result;
use axum::response::Response;
use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use common::*;
use dashrender::http::app_server::{AppServer, HEADER_TOKEN_ID, HEADER_USER_ID, PATH_HEALTH};
use serde_json::{json, Value};
use tower::util::ServiceExt;

async fn setup_test() -> (Router, Fixture) {
    let (cache, _backend) = CacheKind::memory();
    let fx = fixture(cache).await;
    fx.dashboards
        .insert(dashboard(FINANCE_DASHBOARD, same_query_charts()));
    let app = AppServer::from_arc(fx.engine.clone());
    (app.router, fx)
}

async fn body_json(response: Response) -> Result<Value> {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await?;
    Ok(serde_json::from_slice(&body)?)
}

fn render_request(dashboard_id: &str, user_id: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(format!("/dashboards/{dashboard_id}/render"))
        .header("content-type", "application/json");
    if let Some(user_id) = user_id {
        builder = builder.header(HEADER_USER_ID, user_id);
    }
    builder
        .body(Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_health() -> Result<()> {
    let (router, _fx) = setup_test().await;
    let response = router
        .oneshot(Request::builder().uri(PATH_HEALTH).body(Body::empty())?)
        .await?;

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await?;
    assert_eq!(json["service"], "dashrender");
    assert_eq!(json["cache_backend"], "memory");
    assert_eq!(json["cache_available"], true);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_render_dashboard() -> Result<()> {
    let (router, fx) = setup_test().await;
    let response = router
        .oneshot(render_request(FINANCE_DASHBOARD, Some("north"), json!({})))
        .await?;

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await?;
    assert_eq!(json["dashboard_id"], FINANCE_DASHBOARD);
    assert_eq!(json["charts"]["total"]["status"], "success");
    assert_eq!(json["charts"]["total"]["data"]["kind"], "metric");
    assert_eq!(json["charts"]["total"]["data"]["value"], 250.0);
    assert_eq!(json["charts"]["trend"]["data"]["kind"], "series");
    assert_eq!(json["metadata"]["unique_queries"], 1);
    assert_eq!(json["metadata"]["deduplicated_queries"], 2);
    assert_eq!(fx.executor.execution_count(), 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_render_applies_universal_filters() -> Result<()> {
    let (router, _fx) = setup_test().await;
    let body = json!({"universal_filters": {"provider_name": "Dr. B"}});
    let response = router
        .oneshot(render_request(FINANCE_DASHBOARD, Some("admin"), body))
        .await?;

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await?;
    assert_eq!(json["charts"]["total"]["data"]["value"], 150.0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_render_without_body() -> Result<()> {
    let (router, _fx) = setup_test().await;
    let request = Request::builder()
        .method("POST")
        .uri(format!("/dashboards/{FINANCE_DASHBOARD}/render"))
        .header(HEADER_USER_ID, "admin")
        .body(Body::empty())?;
    let response = router.oneshot(request).await?;

    assert_eq!(response.status(), StatusCode::OK);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_render_requires_known_user() -> Result<()> {
    let (router, _fx) = setup_test().await;

    let response = router
        .clone()
        .oneshot(render_request(FINANCE_DASHBOARD, None, json!({})))
        .await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let json = body_json(response).await?;
    assert_eq!(json["error"]["code"], "UNAUTHORIZED");

    let response = router
        .oneshot(render_request(FINANCE_DASHBOARD, Some("ghost"), json!({})))
        .await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_render_missing_dashboard_and_denied_access() -> Result<()> {
    let (router, fx) = setup_test().await;

    let response = router
        .clone()
        .oneshot(render_request("missing", Some("admin"), json!({})))
        .await?;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let mut other_org = dashboard("other", same_query_charts());
    other_org.organization_id = Some("org-2".to_string());
    fx.dashboards.insert(other_org);
    let response = router
        .oneshot(render_request("other", Some("north"), json!({})))
        .await?;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let json = body_json(response).await?;
    assert_eq!(json["error"]["code"], "FORBIDDEN");
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_blacklisted_token_is_rejected() -> Result<()> {
    let (router, _fx) = setup_test().await;

    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/tokens/jti-9/blacklist")
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_vec(&json!({"user_id": "north"}))?))?,
        )
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await?;
    assert_eq!(json["token_id"], "jti-9");
    assert_eq!(json["blacklisted"], true);

    let mut request = render_request(FINANCE_DASHBOARD, Some("north"), json!({}));
    request
        .headers_mut()
        .insert(HEADER_TOKEN_ID, "jti-9".parse()?);
    let response = router.oneshot(request).await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_blacklist_requires_user_id() -> Result<()> {
    let (router, _fx) = setup_test().await;
    let response = router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/tokens/jti-9/blacklist")
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_vec(&json!({"user_id": " "}))?))?,
        )
        .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_invalidate_user_reloads_context() -> Result<()> {
    let (router, fx) = setup_test().await;

    let response = router
        .clone()
        .oneshot(render_request(FINANCE_DASHBOARD, Some("south"), json!({})))
        .await?;
    let json = body_json(response).await?;
    assert_eq!(json["charts"]["total"]["data"]["value"], 80.0);

    // South gains practice 101; the cached context hides it until invalidated.
    fx.rbac.insert_user(user("south", false, vec![101, 202]));
    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/cache/users/south")
                .body(Body::empty())?,
        )
        .await?;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = router
        .oneshot(render_request(FINANCE_DASHBOARD, Some("south"), json!({})))
        .await?;
    let json = body_json(response).await?;
    assert_eq!(json["charts"]["total"]["data"]["value"], 330.0);
    assert_eq!(fx.rbac.user_context_loads(), 2);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cache_stats() -> Result<()> {
    let (router, _fx) = setup_test().await;
    router
        .clone()
        .oneshot(render_request(FINANCE_DASHBOARD, Some("admin"), json!({})))
        .await?;

    let response = router
        .oneshot(Request::builder().uri("/cache/stats").body(Body::empty())?)
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await?;
    assert_eq!(json["backend"], "memory");
    assert_eq!(json["namespaces"]["user_context"]["misses"], 1);
    assert_eq!(json["namespaces"]["datasource"]["misses"], 1);
    assert_eq!(json["namespaces"]["token_bl"]["hits"], 0);
    Ok(())
}
