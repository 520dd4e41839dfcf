use serde::Serialize;
use std::collections::HashMap;

use reqwest::Method;
use tracing::{debug, warn};

use crate::config::RequestOptions;
use crate::error::{CoreError, CoreResult};
use crate::net::{HeaderMapping, HttpTransport};

/// Response headers of a URL plus where the request ended up.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct ProbeResult {
    pub headers: HashMap<String, String>,
    /// 0 when no response was received.
    pub status_code: u16,
    pub effective_url: String,
    pub diagnostic: Option<String>,
}

impl ProbeResult {
    fn new(url: &str) -> Self {
        Self {
            effective_url: url.to_string(),
            ..Self::default()
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(|value| value.as_str())
    }

    pub fn content_length(&self) -> Option<u64> {
        self.header("content-length")
            .and_then(|value| value.parse::<u64>().ok())
    }

    pub fn accepts_ranges(&self) -> bool {
        self.header("accept-ranges")
            .map(|value| value == "bytes")
            .unwrap_or(false)
    }
}

/// Lower-cases a raw header line (ISO-8859-1) and splits it on the first
/// colon. Lines without a colon, such as status lines, yield `None`.
pub fn parse_header_line(raw: &[u8]) -> Option<(String, String)> {
    let line: String = raw.iter().map(|&byte| byte as char).collect();
    let line = line.to_lowercase();
    let (name, value) = line.split_once(':')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    Some((name.to_string(), value.trim().to_string()))
}

impl HttpTransport {
    /// Fetches only the response headers of `url`. Never fails: transport
    /// errors are logged and reported through `diagnostic`.
    pub fn probe(&self, url: &str, header_overrides: Option<&HeaderMapping>) -> ProbeResult {
        debug!("probing headers for {}", url);
        let mut result = ProbeResult::new(url);
        match self.read_headers(url, header_overrides, &mut result) {
            Ok(()) | Err(CoreError::BodyAborted) => {}
            Err(err) => {
                warn!("probe {}: {}", url, err);
                result.diagnostic = Some(err.to_string());
            }
        }
        result
    }

    fn read_headers(
        &self,
        url: &str,
        header_overrides: Option<&HeaderMapping>,
        result: &mut ProbeResult,
    ) -> CoreResult<()> {
        let response = match self.dispatch(Method::GET, url, header_overrides, None)? {
            Ok(response) => response,
            Err(err) => {
                if let Some(last) = err.url() {
                    result.effective_url = last.to_string();
                }
                if let Some(status) = err.status() {
                    result.status_code = status.as_u16();
                }
                return Err(CoreError::from_transport(err));
            }
        };
        result.status_code = response.status().as_u16();
        result.effective_url = response.url().to_string();

        let mut line = Vec::new();
        for (name, value) in response.headers() {
            line.clear();
            line.extend_from_slice(name.as_str().as_bytes());
            line.extend_from_slice(b": ");
            line.extend_from_slice(value.as_bytes());
            if let Some((name, value)) = parse_header_line(&line) {
                result.headers.insert(name, value);
            }
        }

        // Headers are all we need; dropping the response closes the
        // connection before any body is read.
        drop(response);
        Err(CoreError::BodyAborted)
    }
}

/// One-shot probe with a transport built from `options`.
pub fn probe(
    options: &RequestOptions,
    url: &str,
    header_overrides: Option<&HeaderMapping>,
) -> ProbeResult {
    match HttpTransport::new(options.clone()) {
        Ok(transport) => transport.probe(url, header_overrides),
        Err(err) => {
            warn!("probe {}: {}", url, err);
            ProbeResult {
                diagnostic: Some(err.to_string()),
                ..ProbeResult::new(url)
            }
        }
    }
}
