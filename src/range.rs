use std::str::FromStr;

use axum::http::StatusCode;
use thiserror::Error;

const BYTES_UNIT: &str = "bytes=";

/// A parsed `Range` request header.
///
/// Only the two single-range grammars `bytes=<start>-` and
/// `bytes=<start>-<end>` are understood. Suffix ranges (`bytes=-500`) and
/// comma-separated range sets are rejected as [`MalformedRange`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeSpec {
    /// No `Range` header was sent, the whole file is served.
    NoRange,
    /// `bytes=<start>-`: everything from `start` to the end of the file.
    FromOffset(u64),
    /// `bytes=<start>-<end>` with an inclusive end. Parsing guarantees
    /// `start <= end`.
    Bounded(u64, u64),
}

/// The `Range` header does not match a supported grammar.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed range header {value:?}")]
pub struct MalformedRange {
    pub value: String,
}

/// The requested range lies outside the file. Implements
/// [`IntoResponse`](axum::response::IntoResponse) as `416 Range Not Satisfiable`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("range not satisfiable for a file of {file_length} bytes")]
pub struct RangeNotSatisfiable {
    pub file_length: u64,
}

/// Concrete transfer boundaries for one response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferPlan {
    /// `200 OK` or `206 Partial Content`.
    pub status: StatusCode,
    /// First byte offset to send.
    pub start: u64,
    /// Number of bytes to send. `start + length` never exceeds the file length.
    pub length: u64,
    /// `Content-Range` value, present exactly when `status` is 206.
    pub content_range: Option<String>,
}

impl RangeSpec {
    /// Parses an optional raw header value. A missing header is [`RangeSpec::NoRange`].
    pub fn parse(raw: Option<&str>) -> Result<RangeSpec, MalformedRange> {
        match raw {
            None => Ok(RangeSpec::NoRange),
            Some(value) => value.parse(),
        }
    }

    /// Resolves this request against a file of `file_length` bytes.
    ///
    /// Offsets beyond the end of the file are never clamped, they fail with
    /// [`RangeNotSatisfiable`]. Any range against an empty file fails the
    /// same way.
    pub fn resolve(self, file_length: u64) -> Result<TransferPlan, RangeNotSatisfiable> {
        match self {
            RangeSpec::NoRange => Ok(TransferPlan::full(file_length)),
            RangeSpec::FromOffset(start) if start < file_length => {
                Ok(TransferPlan::partial(start, file_length - 1, file_length))
            }
            RangeSpec::Bounded(start, end) if start <= end && end < file_length => {
                Ok(TransferPlan::partial(start, end, file_length))
            }
            _ => Err(RangeNotSatisfiable { file_length }),
        }
    }
}

impl FromStr for RangeSpec {
    type Err = MalformedRange;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let malformed = || MalformedRange { value: value.to_owned() };

        let spec = value.trim().strip_prefix(BYTES_UNIT).ok_or_else(malformed)?;

        if let Some(start) = spec.strip_suffix('-') {
            return parse_offset(start)
                .map(RangeSpec::FromOffset)
                .ok_or_else(malformed);
        }

        let (start, end) = spec.split_once('-').ok_or_else(malformed)?;
        match (parse_offset(start), parse_offset(end)) {
            (Some(start), Some(end)) if start <= end => Ok(RangeSpec::Bounded(start, end)),
            _ => Err(malformed()),
        }
    }
}

// u64::from_str accepts a leading '+', header offsets may not
fn parse_offset(digits: &str) -> Option<u64> {
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

impl TransferPlan {
    fn full(file_length: u64) -> Self {
        TransferPlan {
            status: StatusCode::OK,
            start: 0,
            length: file_length,
            content_range: None,
        }
    }

    fn partial(start: u64, end_inclusive: u64, file_length: u64) -> Self {
        TransferPlan {
            status: StatusCode::PARTIAL_CONTENT,
            start,
            length: end_inclusive - start + 1,
            content_range: Some(format!("bytes {start}-{end_inclusive}/{file_length}")),
        }
    }

    /// Whether this plan answers a range request.
    pub fn is_partial(&self) -> bool {
        self.status == StatusCode::PARTIAL_CONTENT
    }

    /// Offset one past the last byte sent.
    pub fn end_exclusive(&self) -> u64 {
        self.start + self.length
    }
}
