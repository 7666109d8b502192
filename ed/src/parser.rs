//! Parsing of recorded raw requests
//!
//! Queries and results are logged as raw HTTP/1.x request bytes. The parsing
//! pass turns every unparsed row into its structured counterpart so the
//! summaries can be rebuilt from `parsed_results`.

use std::net::{IpAddr, SocketAddr};

use encorestore::{Parameters, ParsedQuery, ParsedResult, QueryRecord, ResultRecord};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::geo::{Geolocator, country_or_empty};
use crate::metrics::{Counter, MetricsSink};
use crate::state::{StoreManager, StoreResponse};
use crate::stats::normalize_referer;

/// Request line, query parameters and headers of a raw request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRequest {
    pub method: String,
    pub target: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
}

impl RawRequest {
    /// Parse the head of an HTTP/1.x request; the body is ignored
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        let head_end = bytes
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
            .unwrap_or(bytes.len());
        let head = String::from_utf8_lossy(&bytes[..head_end]);
        let mut lines = head.split('\n').map(|line| line.trim_end_matches('\r'));

        let mut request_line = lines.next()?.split_whitespace();
        let method = request_line.next()?.to_string();
        let target = request_line.next()?.to_string();
        if !request_line.next()?.starts_with("HTTP/") {
            return None;
        }

        let mut headers = Vec::new();
        for line in lines {
            let (name, value) = line.split_once(':')?;
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }

        let query = match target.split_once('?') {
            Some((_, query)) => url::form_urlencoded::parse(query.as_bytes()).into_owned().collect(),
            None => Vec::new(),
        };

        Some(Self {
            method,
            target,
            query,
            headers,
        })
    }

    /// First header with `name`, case-insensitively
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// First query parameter named `name`
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query.iter().find(|(n, _)| n == name).map(|(_, v)| v.as_str())
    }
}

/// Client address: `X-Real-Ip` if valid, else the remote address without port
pub fn client_ip(request: Option<&RawRequest>, remote_addr: &str) -> Option<IpAddr> {
    request
        .and_then(|r| r.header("X-Real-Ip"))
        .and_then(|v| v.trim().parse().ok())
        .or_else(|| strip_port(remote_addr))
}

fn strip_port(addr: &str) -> Option<IpAddr> {
    addr.parse::<SocketAddr>()
        .map(|s| s.ip())
        .ok()
        .or_else(|| addr.parse().ok())
}

/// Structured view of a result; the flag is false when the raw request was
/// unreadable and the row carries empty fields
pub fn parse_result(record: &ResultRecord, geolocator: &dyn Geolocator) -> (ParsedResult, bool) {
    let request = RawRequest::parse(&record.raw_request);
    let ip = client_ip(request.as_ref(), &record.remote_addr);
    let query = |name: &str| {
        request
            .as_ref()
            .and_then(|r| r.query_param(name))
            .unwrap_or_default()
            .to_string()
    };
    let header = |name: &str| request.as_ref().and_then(|r| r.header(name)).unwrap_or_default().to_string();

    let parsed = ParsedResult {
        result_id: record.id,
        measurement_id: query("cmh-id"),
        timestamp: record.timestamp,
        outcome: query("cmh-result"),
        message: query("cmh-message"),
        origin: header("Origin"),
        referer: normalize_referer(&header("Referer")).unwrap_or_default(),
        client_ip: ip,
        client_location: country_or_empty(geolocator, ip),
        user_agent: header("User-Agent"),
    };
    (parsed, request.is_some())
}

/// Structured view of a served query
pub fn parse_query(record: &QueryRecord, geolocator: &dyn Geolocator) -> (ParsedQuery, bool) {
    let request = RawRequest::parse(&record.raw_request);
    let ip = client_ip(request.as_ref(), &record.remote_addr);
    let parameters: Option<Parameters> = serde_json::from_str(&record.parameters_json).ok();
    let ok = request.is_some() && parameters.is_some();
    let parameters = parameters.unwrap_or_default();

    let parsed = ParsedQuery {
        query_id: record.id,
        measurement_id: parameters
            .get("measurementId")
            .cloned()
            .flatten()
            .unwrap_or_default(),
        timestamp: record.timestamp,
        client_ip: ip,
        client_location: country_or_empty(geolocator, ip),
        substrate: record.substrate.clone(),
        parameters,
    };
    (parsed, ok)
}

/// Rows handled by one parsing pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ParseReport {
    pub queries: usize,
    pub results: usize,
    pub errors: usize,
}

/// Parse every query and result that has no parsed row yet
pub async fn parse_pending(
    store: &StoreManager,
    geolocator: &dyn Geolocator,
    metrics: &dyn MetricsSink,
) -> StoreResponse<ParseReport> {
    debug!("parse_pending: called");
    let mut report = ParseReport::default();

    let mut parsed_queries = Vec::new();
    for record in store.unparsed_queries().await? {
        let (parsed, ok) = parse_query(&record, geolocator);
        if !ok {
            warn!(query_id = record.id, "Unparseable query recorded with empty fields");
            report.errors += 1;
        }
        parsed_queries.push(parsed);
    }
    if !parsed_queries.is_empty() {
        report.queries = store.write_parsed_queries(parsed_queries).await?;
    }

    let mut parsed_results = Vec::new();
    for record in store.unparsed_results().await? {
        let (parsed, ok) = parse_result(&record, geolocator);
        if !ok {
            warn!(result_id = record.id, "Unparseable result recorded with empty fields");
            report.errors += 1;
        }
        parsed_results.push(parsed);
    }
    if !parsed_results.is_empty() {
        report.results = store.write_parsed_results(parsed_results).await?;
    }

    if report.errors > 0 {
        metrics.add(Counter::ParseError, report.errors as u64);
    }
    info!(queries = report.queries, results = report.results, errors = report.errors, "Parsing pass complete");
    Ok(report)
}
