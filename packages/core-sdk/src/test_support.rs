//! Local chat-completions stub used by the engine tests.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json, Router,
};
use serde_json::{json, Value};

use crate::credentials::SecretSource;

#[derive(Debug, Clone)]
pub(crate) struct Hit {
    pub secret: String,
    pub body: Value,
    pub title: Option<String>,
    pub at: Instant,
}

pub(crate) struct StubServer {
    /** \brief `http://host:port` */
    pub base: String,
    /** \brief Default completions endpoint on the stub. */
    pub url: String,
    hits: Arc<Mutex<Vec<Hit>>>,
}

impl StubServer {
    pub fn hits(&self) -> Vec<Hit> {
        self.hits.lock().expect("hits lock").clone()
    }

    pub fn hits_for(&self, model: &str) -> Vec<Hit> {
        self.hits()
            .into_iter()
            .filter(|h| h.body["model"] == model)
            .collect()
    }
}

pub(crate) fn secrets(pairs: &[(&str, &str)]) -> Arc<dyn SecretSource> {
    let map: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    Arc::new(map)
}

/**
 * \brief Starts a stub whose behaviour is chosen by the bearer secret:
 * `ok*` echoes `model:prompt`, `limited` 429, `down` 503, `bad` 400,
 * `empty` 200 without choices, `slow` answers after 5s, `html` non-JSON 200.
 */
pub(crate) async fn spawn_stub() -> StubServer {
    let hits = Arc::new(Mutex::new(Vec::new()));
    let app = Router::new().fallback(completions).with_state(hits.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind stub");
    let addr = listener.local_addr().expect("stub addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });
    let base = format!("http://{}", addr);
    StubServer {
        url: format!("{}/v1/chat/completions", base),
        base,
        hits,
    }
}

async fn completions(
    State(hits): State<Arc<Mutex<Vec<Hit>>>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let secret = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or_default()
        .to_string();
    let title = headers
        .get("x-title")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());
    hits.lock().expect("hits lock").push(Hit {
        secret: secret.clone(),
        body: body.clone(),
        title,
        at: Instant::now(),
    });

    let model = body["model"].as_str().unwrap_or_default();
    let prompt = body["messages"][0]["content"].as_str().unwrap_or_default();
    let echo = || {
        Json(json!({
            "choices": [{"message": {"role": "assistant", "content": format!("{}:{}", model, prompt)}}]
        }))
        .into_response()
    };

    match secret.as_str() {
        "limited" => (StatusCode::TOO_MANY_REQUESTS, "rate limited").into_response(),
        "down" => (StatusCode::SERVICE_UNAVAILABLE, "upstream down").into_response(),
        "bad" => (StatusCode::BAD_REQUEST, "provider says no").into_response(),
        "empty" => Json(json!({"choices": []})).into_response(),
        "html" => (StatusCode::OK, "<html>oops</html>").into_response(),
        "slow" => {
            tokio::time::sleep(Duration::from_secs(5)).await;
            echo()
        }
        s if s.starts_with("ok") => echo(),
        _ => (StatusCode::UNAUTHORIZED, "unknown key").into_response(),
    }
}
