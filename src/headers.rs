use axum::http::header::{InvalidHeaderValue, CONTENT_DISPOSITION, CONTENT_RANGE, CONTENT_TYPE};
use axum::http::{HeaderMap, HeaderName, HeaderValue};
use axum_extra::headers::{AcceptRanges, ContentLength, HeaderMapExt};
use thiserror::Error;

use crate::range::TransferPlan;

/// A computed header value is not valid HTTP.
#[derive(Debug, Error)]
#[error("invalid value for {name} header")]
pub struct HeaderError {
    name: HeaderName,
    #[source]
    source: InvalidHeaderValue,
}

/// Knobs for [`build_with`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildOptions {
    /// Send `Accept-Ranges: bytes` on full `200` responses too, so clients
    /// know they may resume later.
    pub advertise_ranges_on_full: bool,
}

impl Default for BuildOptions {
    fn default() -> Self {
        BuildOptions { advertise_ranges_on_full: true }
    }
}

/// Builds the response headers for `plan` with [`BuildOptions::default`].
pub fn build(
    plan: &TransferPlan,
    content_type: &str,
    download_name: &str,
) -> Result<HeaderMap, HeaderError> {
    build_with(plan, content_type, download_name, BuildOptions::default())
}

/// Builds the response headers for `plan`.
///
/// Always sets `Content-Type`, `Content-Length` and an attachment
/// `Content-Disposition` carrying the url-escaped `download_name`. Partial
/// responses additionally get `Accept-Ranges` and `Content-Range`.
pub fn build_with(
    plan: &TransferPlan,
    content_type: &str,
    download_name: &str,
    options: BuildOptions,
) -> Result<HeaderMap, HeaderError> {
    let mut headers = HeaderMap::new();

    headers.insert(CONTENT_TYPE, header_value(CONTENT_TYPE, content_type)?);
    headers.typed_insert(ContentLength(plan.length));

    let disposition = format!("attachment; filename=\"{}\"", urlencoding::encode(download_name));
    headers.insert(CONTENT_DISPOSITION, header_value(CONTENT_DISPOSITION, &disposition)?);

    if plan.is_partial() || options.advertise_ranges_on_full {
        headers.typed_insert(AcceptRanges::bytes());
    }

    if let Some(content_range) = &plan.content_range {
        headers.insert(CONTENT_RANGE, header_value(CONTENT_RANGE, content_range)?);
    }

    Ok(headers)
}

fn header_value(name: HeaderName, value: &str) -> Result<HeaderValue, HeaderError> {
    HeaderValue::from_str(value).map_err(|source| HeaderError { name, source })
}
