//! HTTP surface of a single preview instance.
//!
//! Static files are served from the instance root. Unmatched GETs fall back to
//! the root `index.html` (client-side routing) and, failing that, to a generated
//! listing of the files written so far. `/api` and everything under it answer
//! with a JSON placeholder since generated backends are never executed.
//! `OPTIONS` is answered with `204` on every path.

use axum::{
    body::Bytes,
    extract::{Request, State},
    http::{header, HeaderName, HeaderValue, Method, StatusCode, Uri},
    middleware::{self, Next},
    response::{Html, IntoResponse, Response},
    routing::{any, get, MethodRouter},
    Json, Router,
};
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, RwLock};
use tokio::task::JoinHandle;
use tower_http::services::ServeDir;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;
use tracing::warn;

/// Extensions linked with a `download` attribute in the listing.
const DOWNLOAD_EXTENSIONS: &[&str] = &[
    "bin", "exe", "dll", "so", "dylib", "zip", "tar", "gz", "tgz", "7z", "rar", "pdf", "png",
    "jpg", "jpeg", "gif", "webp", "bmp", "ico", "mp3", "mp4", "wav", "ogg", "webm", "mov", "woff",
    "woff2", "ttf", "otf", "eot", "wasm",
];

/// State shared by the handlers of one preview site.
#[derive(Debug, Clone)]
pub struct SiteState {
    pub root: PathBuf,
    /// Relative paths written by create and later updates
    pub files: Arc<RwLock<BTreeSet<String>>>,
}

#[derive(Debug, Serialize)]
struct ApiPlaceholder {
    message: &'static str,
    method: String,
    path: String,
    body: serde_json::Value,
}

/// Build the router for one preview instance.
pub fn build_router(state: SiteState) -> Router {
    let fallback: MethodRouter = get(spa_fallback).with_state(state.clone());
    let static_files = ServeDir::new(&state.root).fallback(fallback);

    Router::new()
        .route("/api", any(api_placeholder))
        .route("/api/", any(api_placeholder))
        .route("/api/*rest", any(api_placeholder))
        .fallback_service(static_files)
        .layer(middleware::from_fn(answer_preflight))
        .layer(TraceLayer::new_for_http())
        .layer(header_layer(
            header::ACCESS_CONTROL_ALLOW_ORIGIN,
            HeaderValue::from_static("*"),
        ))
        .layer(header_layer(
            header::ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_static("GET, POST, PUT, DELETE, PATCH, OPTIONS"),
        ))
        .layer(header_layer(
            header::ACCESS_CONTROL_ALLOW_HEADERS,
            HeaderValue::from_static("Content-Type, Authorization, X-Requested-With"),
        ))
        .layer(header_layer(
            header::X_FRAME_OPTIONS,
            HeaderValue::from_static("SAMEORIGIN"),
        ))
        .layer(header_layer(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
}

/// A spawned preview listener and its shutdown trigger.
///
/// Dropping the handle without calling [`ServerHandle::close`] also shuts the
/// server down, but nothing waits for the port to be released.
#[derive(Debug)]
pub struct ServerHandle {
    shutdown_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl ServerHandle {
    /// Serve `app` on an already bound listener.
    pub fn spawn(listener: TcpListener, app: Router) -> Self {
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
            {
                warn!(error = %e, "Preview server error");
            }
        });
        Self { shutdown_tx, task }
    }

    /// Stop accepting connections and wait for the listener to go away.
    ///
    /// Connections still open after `grace` are cut by aborting the task.
    pub async fn close(self, grace: Duration) {
        let _ = self.shutdown_tx.send(());
        let mut task = self.task;
        match tokio::time::timeout(grace, &mut task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Preview server task failed"),
            Err(_) => {
                warn!(?grace, "Preview server did not drain in time, aborting");
                task.abort();
                let _ = task.await;
            }
        }
    }
}

fn header_layer(name: HeaderName, value: HeaderValue) -> SetResponseHeaderLayer<HeaderValue> {
    SetResponseHeaderLayer::overriding(name, value)
}

/// Short-circuit CORS preflights; the header layers still decorate the reply.
async fn answer_preflight(req: Request, next: Next) -> Response {
    if req.method() == Method::OPTIONS {
        return StatusCode::NO_CONTENT.into_response();
    }
    next.run(req).await
}

async fn api_placeholder(method: Method, uri: Uri, body: Bytes) -> Json<ApiPlaceholder> {
    let body = if body.is_empty() {
        serde_json::json!({})
    } else {
        serde_json::from_slice(&body)
            .unwrap_or_else(|_| serde_json::Value::String(String::from_utf8_lossy(&body).into()))
    };

    Json(ApiPlaceholder {
        message: "API endpoint placeholder - backend logic is not executed in previews",
        method: method.to_string(),
        path: uri.path().to_string(),
        body,
    })
}

async fn spa_fallback(State(state): State<SiteState>) -> Response {
    match tokio::fs::read_to_string(state.root.join("index.html")).await {
        Ok(index) => Html(index).into_response(),
        Err(_) => {
            let files = state.files.read().await;
            Html(render_listing(&files)).into_response()
        }
    }
}

/// Render an HTML page linking every written file.
pub fn render_listing(files: &BTreeSet<String>) -> String {
    let mut items = String::new();
    for path in files {
        let escaped = escape_html(path);
        let attrs = if is_download(path) {
            " download"
        } else {
            " target=\"_blank\""
        };
        items.push_str(&format!(
            "      <li><a href=\"/{escaped}\"{attrs}>{escaped}</a></li>\n"
        ));
    }
    if items.is_empty() {
        items.push_str("      <li><em>No files</em></li>\n");
    }

    format!(
        "<!DOCTYPE html>\n\
<html>\n\
  <head>\n\
    <meta charset=\"utf-8\">\n\
    <title>Project Preview</title>\n\
    <style>body {{ font-family: sans-serif; margin: 2rem; }} li {{ margin: 0.25rem 0; }}</style>\n\
  </head>\n\
  <body>\n\
    <h1>Project Files</h1>\n\
    <ul>\n\
{items}    </ul>\n\
  </body>\n\
</html>\n"
    )
}

fn is_download(path: &str) -> bool {
    path.rsplit_once('.')
        .map(|(_, ext)| DOWNLOAD_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::fs;
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn site(files: &[(&str, &str)]) -> (TempDir, Router) {
        let tmp = TempDir::new().unwrap();
        let mut written = BTreeSet::new();
        for (path, content) in files {
            let target = tmp.path().join(path);
            fs::create_dir_all(target.parent().unwrap()).unwrap();
            fs::write(&target, content).unwrap();
            written.insert(path.to_string());
        }
        let state = SiteState {
            root: tmp.path().to_path_buf(),
            files: Arc::new(RwLock::new(written)),
        };
        (tmp, build_router(state))
    }

    async fn get_body(app: Router, uri: &str) -> (StatusCode, axum::http::HeaderMap, String) {
        let req = Request::builder().uri(uri).body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let headers = resp.headers().clone();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        (status, headers, String::from_utf8_lossy(&bytes).into_owned())
    }

    #[tokio::test]
    async fn serves_index_at_root() {
        let (_tmp, app) = site(&[("index.html", "<h1>hi</h1>")]);
        let (status, _, body) = get_body(app, "/").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("<h1>hi</h1>"));
    }

    #[tokio::test]
    async fn serves_nested_static_file() {
        let (_tmp, app) = site(&[("index.html", "home"), ("css/site.css", "body{}")]);
        let (status, headers, body) = get_body(app, "/css/site.css").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "body{}");
        assert_eq!(headers[header::CONTENT_TYPE], "text/css");
    }

    #[tokio::test]
    async fn unknown_route_falls_back_to_index() {
        let (_tmp, app) = site(&[("index.html", "<div id=\"app\"></div>")]);
        let (status, _, body) = get_body(app, "/dashboard/settings").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("<div id=\"app\"></div>"));
    }

    #[tokio::test]
    async fn listing_when_no_index() {
        let (_tmp, app) = site(&[("a.txt", "x"), ("b.bin", "y")]);
        let (status, _, body) = get_body(app, "/").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("href=\"/a.txt\""));
        assert!(body.contains("href=\"/b.bin\""));
    }

    #[tokio::test]
    async fn api_placeholder_echoes_request() {
        let (_tmp, app) = site(&[("index.html", "home")]);
        let req = Request::builder()
            .method("POST")
            .uri("/api/users")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"name":"ada"}"#))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["method"], "POST");
        assert_eq!(json["path"], "/api/users");
        assert_eq!(json["body"]["name"], "ada");
        assert!(json["message"].as_str().unwrap().contains("placeholder"));
    }

    #[tokio::test]
    async fn api_placeholder_handles_empty_and_text_bodies() {
        let (_tmp, app) = site(&[]);
        let (_, _, body) = get_body(app.clone(), "/api/health").await;
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["body"], serde_json::json!({}));

        let req = Request::builder()
            .method("PUT")
            .uri("/api/raw")
            .body(Body::from("plain text"))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["body"], "plain text");
    }

    #[tokio::test]
    async fn security_and_cors_headers_on_every_response() {
        let (_tmp, app) = site(&[("index.html", "home")]);
        for uri in ["/", "/missing/route", "/api/x"] {
            let (_, headers, _) = get_body(app.clone(), uri).await;
            assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
            assert!(headers.contains_key(header::ACCESS_CONTROL_ALLOW_METHODS));
            assert!(headers.contains_key(header::ACCESS_CONTROL_ALLOW_HEADERS));
            assert_eq!(headers[header::X_FRAME_OPTIONS], "SAMEORIGIN");
            assert_eq!(headers[header::X_CONTENT_TYPE_OPTIONS], "nosniff");
        }
    }

    #[tokio::test]
    async fn non_get_outside_api_is_rejected() {
        let (_tmp, app) = site(&[("index.html", "home")]);
        let req = Request::builder()
            .method("POST")
            .uri("/index.html")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn api_root_with_trailing_slash_is_placeholder() {
        let (_tmp, app) = site(&[("index.html", "home")]);
        for method in ["GET", "POST"] {
            let req = Request::builder()
                .method(method)
                .uri("/api/")
                .body(Body::empty())
                .unwrap();
            let resp = app.clone().oneshot(req).await.unwrap();
            assert_eq!(resp.status(), StatusCode::OK, "{method} /api/");

            let bytes = resp.into_body().collect().await.unwrap().to_bytes();
            let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
            assert_eq!(json["method"], method);
            assert_eq!(json["path"], "/api/");
        }
    }

    #[tokio::test]
    async fn options_is_answered_on_every_path() {
        let (_tmp, app) = site(&[("index.html", "home")]);
        for uri in ["/index.html", "/missing/route", "/api/x", "/api"] {
            let req = Request::builder()
                .method("OPTIONS")
                .uri(uri)
                .header(header::ORIGIN, "http://example.com")
                .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
                .body(Body::empty())
                .unwrap();
            let resp = app.clone().oneshot(req).await.unwrap();
            assert_eq!(resp.status(), StatusCode::NO_CONTENT, "OPTIONS {uri}");
            assert_eq!(resp.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
            assert_eq!(resp.headers()[header::X_CONTENT_TYPE_OPTIONS], "nosniff");
        }
    }

    #[tokio::test]
    async fn closed_handle_releases_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = ServerHandle::spawn(listener, Router::new());

        assert!(tokio::net::TcpStream::connect(addr).await.is_ok());
        handle.close(Duration::from_secs(5)).await;
        assert!(tokio::net::TcpStream::connect(addr).await.is_err());
    }

    #[test]
    fn listing_marks_binary_files_for_download() {
        let files: BTreeSet<String> = ["notes.md", "logo.PNG", "dist/app.zip"]
            .into_iter()
            .map(String::from)
            .collect();
        let html = render_listing(&files);
        assert!(html.contains("<a href=\"/logo.PNG\" download>"));
        assert!(html.contains("<a href=\"/dist/app.zip\" download>"));
        assert!(html.contains("<a href=\"/notes.md\" target=\"_blank\">"));
    }

    #[test]
    fn listing_escapes_file_names() {
        let files: BTreeSet<String> = ["<script>.txt".to_string()].into_iter().collect();
        let html = render_listing(&files);
        assert!(html.contains("&lt;script&gt;.txt"));
        assert!(!html.contains("<script>.txt"));
    }

    #[test]
    fn empty_listing_says_so() {
        assert!(render_listing(&BTreeSet::new()).contains("No files"));
    }
}
