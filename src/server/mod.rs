//! The HTTP/JSON surface. Handlers are thin: decode, call the store,
//! possibly poke the fetch engine, encode.

mod add_feed;
mod api;

use std::path::PathBuf;
use std::time::Duration;

use axum::extract::rejection::JsonRejection;
use axum::extract::{FromRequest, Request};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use serde::de::DeserializeOwned;
use serde_json::json;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::services::{ServeDir, ServeFile};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::fetch::FetchHandle;
use crate::store::{Store, StoreError};

#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub fetch: FetchHandle,
    pub client: reqwest::Client,
}

/// An error leaving a handler. Validation problems are the client's fault
/// (400), a stale id is 404, anything the store coughs up beyond that is a
/// 500.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Bad(String),

    #[error("not found")]
    NotFound,

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for ApiError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::Invalid(message) => Self::Bad(message),
            error if error.is_missing_row() => Self::NotFound,
            error => Self::Store(error),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::Bad(_) => StatusCode::BAD_REQUEST,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Store(error) => {
                tracing::error!(%error, "store error serving request");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// `axum::Json` with the rejection mapped onto [`ApiError::Bad`], so a
/// malformed body is a 400 like every other validation failure.
pub struct ApiJson<T>(pub T);

impl<S, T> FromRequest<S> for ApiJson<T>
where
    S: Send + Sync,
    T: DeserializeOwned,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(Self(value)),
            Err(JsonRejection::JsonDataError(e)) => Err(ApiError::Bad(e.to_string())),
            Err(JsonRejection::JsonSyntaxError(e)) => Err(ApiError::Bad(e.to_string())),
            Err(e) => Err(ApiError::Bad(e.to_string())),
        }
    }
}

/// Builds the application router: the JSON API under `/api`, and the UI
/// dist directory (when configured) for everything else.
pub fn router(state: AppState, static_dir: Option<&PathBuf>) -> Router {
    let mut app = Router::new().nest("/api", api::api_router(state));

    if let Some(dir) = static_dir {
        // Client-side routing: unknown paths fall back to index.html.
        let serve = ServeDir::new(dir).fallback(ServeFile::new(dir.join("index.html")));
        app = app.fallback_service(serve);
    }

    app.layer((
        TraceLayer::new_for_http(),
        TimeoutLayer::new(Duration::from_secs(30)),
    ))
}

pub async fn serve(
    listener: TcpListener,
    app: Router,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await
}
