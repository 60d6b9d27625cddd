#![allow(dead_code)]

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Request, Response};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::Value;
use slidegate::comms::local_api::{create_router, AppState};
use slidegate::config::Config;
use slidegate::security::auth::{Credentials, LocalAuthProvider};
use slidegate::translation::Translator;
use std::collections::HashMap;
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;

pub const USERNAME: &str = "admin";
pub const PASSWORD: &str = "s3cret";

/// Upper-cases every text; stands in for the LLM backend.
#[derive(Debug)]
pub struct UpperTranslator;

#[async_trait]
impl Translator for UpperTranslator {
    fn name(&self) -> &'static str {
        "upper"
    }

    async fn translate_batch(&self, texts: &[String], _lang: &str) -> anyhow::Result<Vec<String>> {
        Ok(texts.iter().map(|t| t.to_uppercase()).collect())
    }
}

pub struct TestApp {
    pub router: Router,
    pub state: Arc<AppState>,
    _work_dir: TempDir,
}

pub fn test_app() -> TestApp {
    test_app_with(Config::default())
}

pub fn test_app_with(mut config: Config) -> TestApp {
    let work_dir = TempDir::new().unwrap();
    config.sidecar.work_dir = work_dir.path().to_string_lossy().into_owned();
    let auth = LocalAuthProvider::new(Credentials {
        username: USERNAME.to_string(),
        password: PASSWORD.to_string(),
    });
    let state = Arc::new(AppState::new(config, Arc::new(auth), Arc::new(UpperTranslator)));
    TestApp {
        router: create_router(state.clone()),
        state,
        _work_dir: work_dir,
    }
}

/// Cookies a browser would hold, updated from Set-Cookie headers.
#[derive(Debug, Default, Clone)]
pub struct CookieJar {
    pub cookies: HashMap<String, String>,
}

impl CookieJar {
    pub fn absorb<B>(&mut self, resp: &Response<B>) {
        for value in resp.headers().get_all(header::SET_COOKIE) {
            let raw = value.to_str().unwrap();
            let pair = raw.split(';').next().unwrap();
            let (name, val) = pair.split_once('=').unwrap();
            if val.is_empty() {
                self.cookies.remove(name);
            } else {
                self.cookies.insert(name.to_string(), val.to_string());
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(String::as_str)
    }

    pub fn header(&self) -> String {
        self.cookies
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

pub async fn send(app: &Router, req: Request<Body>) -> Response<Body> {
    app.clone().oneshot(req).await.unwrap()
}

pub async fn body_json(resp: Response<Body>) -> Value {
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

/// Fetches a CSRF token (creating an anonymous session) and returns it.
pub async fn fetch_csrf(app: &Router, jar: &mut CookieJar) -> String {
    let mut req = Request::builder().uri("/api/csrf");
    if !jar.cookies.is_empty() {
        req = req.header(header::COOKIE, jar.header());
    }
    let resp = send(app, req.body(Body::empty()).unwrap()).await;
    assert!(resp.status().is_success());
    jar.absorb(&resp);
    body_json(resp).await["token"].as_str().unwrap().to_string()
}

pub fn json_post(uri: &str, jar: &CookieJar, token: Option<&str>, body: Value) -> Request<Body> {
    let mut req = Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::COOKIE, jar.header());
    if let Some(t) = token {
        req = req.header("x-csrf-token", t);
    }
    req.body(Body::from(body.to_string())).unwrap()
}

/// Logs in and returns the post-login CSRF token.
pub async fn login(app: &Router, jar: &mut CookieJar) -> String {
    let token = fetch_csrf(app, jar).await;
    let resp = send(
        app,
        json_post(
            "/api/auth/login",
            jar,
            Some(&token),
            serde_json::json!({"username": USERNAME, "password": PASSWORD}),
        ),
    )
    .await;
    assert_eq!(resp.status(), 200);
    jar.absorb(&resp);
    body_json(resp).await["csrf"]["token"].as_str().unwrap().to_string()
}
