mod common;

use common::{openai_reply, state_with, Reply, ScriptedTransport};
use modelrouter_lib::server::router;
use modelrouter_lib::AppState;
use serde_json::{json, Value};
use std::sync::Arc;

async fn serve(state: Arc<AppState>) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = router::create_router(state);
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

#[tokio::test]
async fn health_reports_ok() {
    let base = serve(state_with(ScriptedTransport::new()).await).await;
    let body: Value = reqwest::get(format!("{}/health", base)).await.unwrap().json().await.unwrap();
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn admin_route_lifecycle() {
    let base = serve(state_with(ScriptedTransport::new()).await).await;
    let client = reqwest::Client::new();
    let new_route = json!({
        "name": "a",
        "model": "gpt-4",
        "api_url": "http://a.test",
        "api_key": "sk-a",
        "group": "",
        "format": "openai"
    });

    let resp = client.post(format!("{}/admin/routes", base)).json(&new_route).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    let created: Value = resp.json().await.unwrap();
    let id = created["id"].as_i64().unwrap();

    let resp = client.post(format!("{}/admin/routes", base)).json(&new_route).send().await.unwrap();
    assert_eq!(resp.status(), 400);
    let err: Value = resp.json().await.unwrap();
    assert_eq!(err["kind"], "validation");

    let resp = client
        .post(format!("{}/admin/routes/{}/toggle", base, id))
        .send()
        .await
        .unwrap();
    let toggled: Value = resp.json().await.unwrap();
    assert_eq!(toggled["enabled"], false);

    let resp = client.delete(format!("{}/admin/routes/{}", base, id)).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    let resp = client.delete(format!("{}/admin/routes/{}", base, id)).send().await.unwrap();
    assert_eq!(resp.status(), 404);

    let routes: Vec<Value> = client
        .get(format!("{}/admin/routes", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(routes.is_empty());
}

#[tokio::test]
async fn proxy_endpoints_require_the_local_key() {
    let transport = ScriptedTransport::new();
    transport.on("http://a.test", Reply::Json(200, openai_reply("hello there", 2, 3)));
    let state = state_with(transport).await;
    let base = serve(state).await;
    let client = reqwest::Client::new();

    client
        .post(format!("{}/admin/routes", base))
        .json(&json!({"name": "a", "model": "gpt-4", "api_url": "http://a.test", "api_key": "sk-a"}))
        .send()
        .await
        .unwrap();
    client
        .put(format!("{}/admin/config/local-api-key", base))
        .json(&json!({"key": "local-secret"}))
        .send()
        .await
        .unwrap();

    let request = json!({"model": "gpt-4", "messages": [{"role": "user", "content": "hi"}]});
    let resp = client
        .post(format!("{}/v1/chat/completions", base))
        .json(&request)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);

    let resp = client
        .post(format!("{}/v1/chat/completions", base))
        .bearer_auth("local-secret")
        .json(&request)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["choices"][0]["message"]["content"], "hello there");

    let models: Value = client
        .get(format!("{}/v1/models", base))
        .header("x-api-key", "local-secret")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(models["data"][0]["id"], "a/gpt-4");

    let stats: Value = client
        .get(format!("{}/admin/stats", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["total_requests"], 1);
    assert_eq!(stats["total_tokens"], 5);
}

#[tokio::test]
async fn unknown_model_maps_to_not_found() {
    let base = serve(state_with(ScriptedTransport::new()).await).await;
    let resp = reqwest::Client::new()
        .post(format!("{}/v1/chat/completions", base))
        .json(&json!({"model": "missing", "messages": [{"role": "user", "content": "hi"}]}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["type"], "no_route_found");
}

#[tokio::test]
async fn daily_stats_cover_the_requested_window() {
    let base = serve(state_with(ScriptedTransport::new()).await).await;
    let days: Vec<Value> = reqwest::get(format!("{}/admin/stats/daily?days=7", base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(days.len(), 7);
    assert!(days.iter().all(|d| d["requests"] == 0));

    let hours: Vec<Value> = reqwest::get(format!("{}/admin/stats/hourly", base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(hours.len(), 24);
}

#[tokio::test]
async fn zero_day_window_is_a_bad_request() {
    let base = serve(state_with(ScriptedTransport::new()).await).await;
    let resp = reqwest::get(format!("{}/admin/stats/daily?days=0", base)).await.unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["kind"], "validation");
}
