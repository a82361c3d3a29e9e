//! HTTP side of the fake cloud
//!
//! - `/` answers with a banner so a phone on the access point can check it
//! - `/gw.json` and `/d.json` carry the device API, GET or POST alike
//! - `/files/*` serves the firmware directory
//! - everything else redirects to `/`

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::Router;
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::envelope::plain_response;
use crate::gateway::{ApiRequest, GatewayService};

pub const BANNER: &str = "You are connected to vtrust-flash";

const JSON_CONTENT_TYPE: &str = "application/json;charset=UTF-8";
const CONTENT_LANGUAGE: &str = "zh-CN";

pub fn router(service: Arc<GatewayService>, files_dir: impl Into<PathBuf>) -> Router {
    Router::new()
        .route("/", get(banner))
        .route("/gw.json", get(api).post(api))
        .route("/d.json", get(api).post(api))
        .nest_service("/files", ServeDir::new(files_dir.into()))
        .fallback(redirect_home)
        .layer(TraceLayer::new_for_http())
        .with_state(service)
}

/// Serve `app` on `addr` until `shutdown` turns true
pub async fn serve(addr: SocketAddr, app: Router, mut shutdown: watch::Receiver<bool>) -> io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("Listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await
}

async fn banner() -> &'static str {
    BANNER
}

async fn redirect_home(State(service): State<Arc<GatewayService>>, uri: Uri) -> Response {
    let location = format!("http://{}/", service.config().addr);
    debug!(%uri, "Redirecting to {}", location);
    match HeaderValue::from_str(&location) {
        Ok(value) => (StatusCode::FOUND, [(header::LOCATION, value)]).into_response(),
        Err(_) => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn api(
    State(service): State<Arc<GatewayService>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    Query(mut params): Query<HashMap<String, String>>,
    body: Bytes,
) -> Response {
    info!("{} {}", method, uri);
    merge_form_body(&mut params, &headers, &body);

    let request = ApiRequest {
        a: params.remove("a"),
        et: params.remove("et"),
        gw_id: params.remove("gwId"),
        body,
    };

    let answer = match service.handle(&request) {
        Ok(reply) => reply.body,
        Err(e) => {
            error!("Failed to build reply: {}", e);
            plain_response(&Value::Null, chrono::Utc::now().timestamp())
        }
    };
    let text = answer.to_string();
    info!("reply {}", text);

    (
        [
            (header::CONTENT_TYPE, JSON_CONTENT_TYPE),
            (header::CONTENT_LANGUAGE, CONTENT_LANGUAGE),
        ],
        text,
    )
        .into_response()
}

/// Add fields of a form-encoded body that the query string doesn't already set
fn merge_form_body(params: &mut HashMap<String, String>, headers: &HeaderMap, body: &[u8]) {
    let is_form = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("application/x-www-form-urlencoded"));
    if !is_form {
        return;
    }

    match serde_urlencoded::from_bytes::<Vec<(String, String)>>(body) {
        Ok(fields) => {
            for (key, value) in fields {
                params.entry(key).or_insert(value);
            }
        }
        Err(e) => warn!("Unparseable form body: {}", e),
    }
}
