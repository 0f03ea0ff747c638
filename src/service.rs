use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use tracing::info;

use crate::file::FileStore;
use crate::{raw_range, Download, DownloadOptions, DownloadRequest};

struct ServiceState<S> {
    store: S,
    options: DownloadOptions,
}

#[derive(Debug, Deserialize)]
struct FileQuery {
    /// Overrides the file name offered in `Content-Disposition`.
    name: Option<String>,
}

/// Builds a router serving `GET /files/{*path}` out of `store`.
///
/// `?name=` renames the download. Every response advertises byte ranges.
pub fn router<S>(store: S, options: DownloadOptions) -> Router
where
    S: FileStore + Send + Sync + 'static,
{
    let state = Arc::new(ServiceState { store, options });
    Router::new()
        .route("/files/{*path}", get(serve_file::<S>))
        .with_state(state)
}

async fn serve_file<S>(
    State(state): State<Arc<ServiceState<S>>>,
    Path(path): Path<String>,
    Query(query): Query<FileQuery>,
    headers: HeaderMap,
) -> Response
where
    S: FileStore + Send + Sync + 'static,
{
    let range = raw_range(&headers);
    info!(path = %path, range = range.as_deref().unwrap_or("-"), "download requested");

    let file = match state.store.open(&path).await {
        Ok(file) => file,
        Err(err) => return err.into_response(),
    };

    let mut request = DownloadRequest::new(file).range(range);
    if let Some(name) = query.name.filter(|name| !name.is_empty()) {
        request = request.download_name(name);
    }

    Download::new(request, state.options).into_response()
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use super::*;
    use crate::LocalFileStore;

    fn app() -> Router {
        router(LocalFileStore::new("test"), DownloadOptions::default())
    }

    #[tokio::test]
    async fn test_serves_range_through_router() {
        let request = Request::get("/files/fixture.txt")
            .header("range", "bytes=0-4")
            .body(Body::empty())
            .unwrap();
        let response = app().oneshot(request).await.unwrap();

        assert_eq!(StatusCode::PARTIAL_CONTENT, response.status());
        assert_eq!("bytes 0-4/54", response.headers()["content-range"]);
    }

    #[tokio::test]
    async fn test_missing_file_is_404() {
        let request = Request::get("/files/nope.txt").body(Body::empty()).unwrap();
        let response = app().oneshot(request).await.unwrap();
        assert_eq!(StatusCode::NOT_FOUND, response.status());
    }

    #[tokio::test]
    async fn test_name_query_renames_download() {
        let request = Request::get("/files/fixture.txt?name=hello%20world.txt")
            .body(Body::empty())
            .unwrap();
        let response = app().oneshot(request).await.unwrap();

        assert_eq!(StatusCode::OK, response.status());
        assert_eq!(
            "attachment; filename=\"hello%20world.txt\"",
            response.headers()["content-disposition"]
        );
    }
}
