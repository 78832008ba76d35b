//! HTTP surface of the proxy.
//!
//! One `GET /api` endpoint dispatching on the `t` parameter (Newznab
//! convention), the NZB download route, and a health check. Protocol errors
//! are returned in-band: HTTP 200 with an `<error/>` body.

use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use serde::Deserialize;
use tower_http::trace::TraceLayer;

use crate::AppState;
use crate::error::ProxyError;
use crate::newznab::SearchParams;
use crate::proxy::NzbDownload;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api", get(api_handler))
        .route("/getnzb/{id}", get(get_nzb_handler))
        .route("/healthz", get(healthz))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Raw query parameters of a `/api` request. Unknown keys are ignored.
#[derive(Debug, Default, Deserialize)]
struct ApiQuery {
    t: Option<String>,
    apikey: Option<String>,
    #[serde(rename = "q")]
    query: Option<String>,
    #[serde(rename = "cat")]
    category: Option<String>,
    limit: Option<u32>,
    offset: Option<u32>,
    #[serde(rename = "o")]
    output: Option<String>,
    attrs: Option<String>,
    extended: Option<String>,
    del: Option<String>,
    #[serde(rename = "maxage")]
    max_age: Option<u32>,
    group: Option<String>,
}

impl ApiQuery {
    fn into_search_params(self) -> SearchParams {
        SearchParams {
            query: self.query.unwrap_or_default(),
            category: self.category,
            limit: self.limit,
            offset: self.offset,
            output: self.output,
            attrs: self.attrs,
            extended: self.extended,
            del: self.del,
            max_age: self.max_age,
            group: self.group,
        }
    }
}

async fn api_handler(State(state): State<AppState>, Query(query): Query<ApiQuery>) -> Response {
    match handle_api(state, query).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn handle_api(state: AppState, query: ApiQuery) -> Result<Response, ProxyError> {
    let t = query
        .t
        .clone()
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ProxyError::BadRequest("t parameter must be provided".to_string()))?;

    check_api_key(&state, query.apikey.as_deref())?;

    match t.as_str() {
        "search" => {
            let feed = state.service.search(query.into_search_params()).await?;
            Ok(xml_response(feed.to_xml()?))
        }
        other => Err(ProxyError::NotImplemented(other.to_string())),
    }
}

fn check_api_key(state: &AppState, presented: Option<&str>) -> Result<(), ProxyError> {
    let Some(allowed) = &state.api_keys else {
        return Ok(());
    };
    match presented {
        Some(key) if allowed.iter().any(|a| a == key) => Ok(()),
        _ => Err(ProxyError::Unauthorized),
    }
}

async fn get_nzb_handler(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.service.get_nzb(&id).await {
        Ok(download) => nzb_response(download),
        Err(err) => err.into_response(),
    }
}

fn nzb_response(download: NzbDownload) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/x-nzb"),
    );
    let filename = download.title.replace(['"', '\r', '\n'], "_");
    let disposition = format!("attachment; filename=\"{filename}.nzb\"");
    headers.insert(
        header::CONTENT_DISPOSITION,
        HeaderValue::from_str(&disposition)
            .unwrap_or_else(|_| HeaderValue::from_static("attachment")),
    );
    (StatusCode::OK, headers, download.data).into_response()
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

fn xml_response(body: String) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/xml")],
        body,
    )
        .into_response()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
