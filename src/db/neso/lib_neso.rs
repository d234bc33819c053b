use std::{fmt, str::FromStr, time::Duration};

use itertools::Itertools;
use jiff::{SignedDuration, Timestamp};
use log::info;
use reqwest::{
    blocking::Client,
    header::{ACCEPT, USER_AGENT},
};
use serde::Deserialize;

use crate::errors::{truncate_body, IngestError};

use super::generation_mix::{format_timestamp, RawRecord, DATETIME};

/// Longest response body (in characters) kept in an error message.
const MAX_ERROR_BODY: usize = 500;

/// Which HTTP statuses fail a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusPolicy {
    /// Anything but 200 is an error.
    OkOnly,
    /// Only 4xx and 5xx are errors.
    RejectErrors,
}

impl StatusPolicy {
    pub fn is_failure(&self, status: u16) -> bool {
        match self {
            StatusPolicy::OkOnly => status != 200,
            StatusPolicy::RejectErrors => status >= 400,
        }
    }
}

impl FromStr for StatusPolicy {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ok-only" => Ok(StatusPolicy::OkOnly),
            "reject-errors" => Ok(StatusPolicy::RejectErrors),
            _ => Err(format!("Unknown http status policy: {}", s)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NesoConfig {
    /// e.g. `https://api.neso.energy/api/3/action`
    pub base_url: String,
    pub resource_id: String,
    pub lookback: SignedDuration,
    pub timeout: Duration,
    pub status_policy: StatusPolicy,
    pub reject_negative: bool,
}

/// The half-open interval `[start, end)` requested in one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub start: Timestamp,
    pub end: Timestamp,
}

impl Window {
    /// The window ending at `now` (truncated to whole seconds) and reaching
    /// `lookback` into the past.
    pub fn last(lookback: SignedDuration, now: Timestamp) -> Result<Window, IngestError> {
        let end = Timestamp::from_second(now.as_second())
            .map_err(|e| IngestError::Config(format!("invalid current time: {e}")))?;
        let start = end
            .checked_sub(lookback)
            .map_err(|e| IngestError::Config(format!("invalid lookback {lookback:?}: {e}")))?;
        Ok(Window { start, end })
    }

    pub fn start_iso(&self) -> String {
        format_timestamp(&self.start)
    }

    pub fn end_iso(&self) -> String {
        format_timestamp(&self.end)
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.start_iso(), self.end_iso())
    }
}

/// SQL sent to the datastore.  Identifiers are double quoted because the
/// remote column names are upper case.
pub fn build_sql_query(resource_id: &str, columns: &[&str], window: &Window) -> String {
    format!(
        r#"SELECT {} FROM "{}" WHERE "{}" >= '{}' AND "{}" < '{}' ORDER BY "{}""#,
        columns.iter().map(|c| format!("\"{}\"", c)).join(", "),
        resource_id,
        DATETIME,
        window.start_iso(),
        DATETIME,
        window.end_iso(),
        DATETIME,
    )
}

/// Where raw records come from.  The production implementation is
/// [`NesoClient`].
pub trait RecordSource {
    fn fetch(&self, sql: &str) -> Result<Vec<RawRecord>, IngestError>;
}

#[derive(Debug, Deserialize)]
struct Envelope {
    success: Option<bool>,
    result: Option<ResultBody>,
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ResultBody {
    records: Vec<RawRecord>,
}

/// Validate a `datastore_search_sql` response and pull out its records.
pub fn parse_envelope(
    status: u16,
    body: &str,
    policy: StatusPolicy,
) -> Result<Vec<RawRecord>, IngestError> {
    if policy.is_failure(status) {
        return Err(IngestError::RemoteService {
            status: Some(status),
            message: truncate_body(body, MAX_ERROR_BODY),
        });
    }
    let envelope: Envelope =
        serde_json::from_str(body).map_err(|e| IngestError::RemoteService {
            status: Some(status),
            message: format!("malformed response: {e}"),
        })?;
    if envelope.success == Some(false) {
        let detail = match envelope.error {
            Some(e) => e.to_string(),
            None => truncate_body(body, MAX_ERROR_BODY),
        };
        return Err(IngestError::RemoteService {
            status: Some(status),
            message: format!("request was not successful: {}", truncate_body(&detail, MAX_ERROR_BODY)),
        });
    }
    match envelope.result {
        Some(result) => Ok(result.records),
        None => Err(IngestError::RemoteService {
            status: Some(status),
            message: "response has no result".to_string(),
        }),
    }
}

/// Blocking client for the NESO CKAN data portal.
pub struct NesoClient {
    client: Client,
    base_url: String,
    status_policy: StatusPolicy,
}

impl NesoClient {
    pub fn new(config: &NesoConfig) -> Result<Self, IngestError> {
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(NesoClient {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            status_policy: config.status_policy,
        })
    }
}

impl RecordSource for NesoClient {
    fn fetch(&self, sql: &str) -> Result<Vec<RawRecord>, IngestError> {
        let response = self
            .client
            .get(format!("{}/datastore_search_sql", self.base_url))
            .header(USER_AGENT, concat!("gridmix/", env!("CARGO_PKG_VERSION")))
            .header(ACCEPT, "application/json")
            .query(&[("sql", sql)])
            .send()?;
        let status = response.status().as_u16();
        let body = response.text()?;
        let records = parse_envelope(status, &body, self.status_policy)?;
        info!("API ok ({}). Records fetched: {}", status, records.len());
        Ok(records)
    }
}
