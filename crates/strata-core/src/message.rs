//! HTTP messages as carried by flows.
//!
//! Header names keep their original case and order so that unmodified
//! messages are forwarded byte for byte. Values are stored latin-1 decoded,
//! which round-trips every byte.

use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::{Method, StatusCode};

/// Decodes bytes as latin-1.
pub fn latin1_decode(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

/// Encodes a latin-1 string. Characters above U+00FF are replaced by `?`.
pub fn latin1_encode(s: &str) -> Vec<u8> {
    s.chars()
        .map(|c| if (c as u32) < 256 { c as u8 } else { b'?' })
        .collect()
}

/// Ordered, case-preserving header multimap.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Headers {
    fields: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<N, V, I>(pairs: I) -> Self
    where
        N: Into<String>,
        V: Into<String>,
        I: IntoIterator<Item = (N, V)>,
    {
        Self {
            fields: pairs
                .into_iter()
                .map(|(n, v)| (n.into(), v.into()))
                .collect(),
        }
    }

    /// First value for `name`, case-insensitively.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.fields
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Replaces every field named `name` with a single one, kept at the
    /// position of the first occurrence.
    pub fn insert(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self
            .fields
            .iter()
            .position(|(n, _)| n.eq_ignore_ascii_case(name))
        {
            Some(pos) => {
                self.fields[pos].1 = value;
                let mut index = 0;
                self.fields.retain(|(n, _)| {
                    let keep = index <= pos || !n.eq_ignore_ascii_case(name);
                    index += 1;
                    keep
                });
            }
            None => self.fields.push((name.to_string(), value)),
        }
    }

    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.fields.push((name.into(), value.into()));
    }

    pub fn remove(&mut self, name: &str) {
        self.fields.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// True if a comma separated header contains `token`.
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.get_all(name)
            .flat_map(|v| v.split(','))
            .any(|t| t.trim().eq_ignore_ascii_case(token))
    }

    /// Serializes as HTTP/1 header lines including the blank line.
    pub fn write_http1(&self, out: &mut Vec<u8>) {
        for (name, value) in &self.fields {
            out.extend_from_slice(&latin1_encode(name));
            out.extend_from_slice(b": ");
            out.extend_from_slice(&latin1_encode(value));
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
    }
}

impl fmt::Debug for Headers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.fields.iter()).finish()
    }
}

/// How the request target was written on the request line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestForm {
    /// `/path`
    Relative,
    /// `http://host/path`
    Absolute,
    /// `host:port`, used by CONNECT.
    Authority,
}

/// An HTTP request.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub scheme: String,
    pub host: String,
    pub port: u16,
    /// `host:port` for authority form and HTTP/2 `:authority`.
    pub authority: String,
    pub path: String,
    pub http_version: String,
    pub headers: Headers,
    /// `None` while the body is unknown or streamed.
    pub content: Option<Bytes>,
    pub trailers: Option<Headers>,
    /// Forward body chunks as they arrive instead of buffering.
    pub stream: bool,
    pub timestamp_start: DateTime<Utc>,
    pub timestamp_end: Option<DateTime<Utc>>,
}

impl Request {
    /// A request with an empty body and no host information.
    pub fn new(method: Method, path: impl Into<String>, http_version: impl Into<String>) -> Self {
        Self {
            method,
            scheme: "http".to_string(),
            host: String::new(),
            port: 80,
            authority: String::new(),
            path: path.into(),
            http_version: http_version.into(),
            headers: Headers::new(),
            content: None,
            trailers: None,
            stream: false,
            timestamp_start: Utc::now(),
            timestamp_end: None,
        }
    }

    pub fn is_http2(&self) -> bool {
        self.http_version == "HTTP/2.0"
    }

    pub fn is_connect(&self) -> bool {
        self.method == Method::CONNECT
    }

    /// The Host header if present, else the request host.
    pub fn host_header(&self) -> Option<&str> {
        self.headers.get("host")
    }

    /// Host as the user would see it.
    pub fn pretty_host(&self) -> &str {
        match self.host_header() {
            Some(host) => host.rsplit_once(':').map(|(h, _)| h).unwrap_or(host),
            None => &self.host,
        }
    }

    /// How the target is written on an HTTP/1 request line.
    pub fn form(&self) -> RequestForm {
        if self.is_connect() {
            RequestForm::Authority
        } else if self.authority.is_empty() {
            RequestForm::Relative
        } else {
            RequestForm::Absolute
        }
    }

    /// Sets or replaces the Host header.
    pub fn set_host_header(&mut self, value: impl Into<String>) {
        self.headers.insert("Host", value);
    }

    pub fn url(&self) -> String {
        if self.form() == RequestForm::Authority {
            return self.authority.clone();
        }
        let default_port = if self.scheme == "https" { 443 } else { 80 };
        if self.port == default_port {
            format!("{}://{}{}", self.scheme, self.host, self.path)
        } else {
            format!("{}://{}:{}{}", self.scheme, self.host, self.port, self.path)
        }
    }

    /// True if this request asks for a WebSocket upgrade.
    pub fn is_websocket_upgrade(&self) -> bool {
        self.headers.has_token("connection", "upgrade")
            && self
                .headers
                .get("upgrade")
                .map(|u| u.eq_ignore_ascii_case("websocket"))
                .unwrap_or(false)
    }
}

/// An HTTP response.
#[derive(Debug, Clone)]
pub struct Response {
    pub http_version: String,
    pub status_code: u16,
    pub reason: String,
    pub headers: Headers,
    pub content: Option<Bytes>,
    pub trailers: Option<Headers>,
    pub stream: bool,
    pub timestamp_start: DateTime<Utc>,
    pub timestamp_end: Option<DateTime<Utc>>,
}

impl Response {
    pub fn new(http_version: impl Into<String>, status_code: u16, reason: impl Into<String>) -> Self {
        Self {
            http_version: http_version.into(),
            status_code,
            reason: reason.into(),
            headers: Headers::new(),
            content: None,
            trailers: None,
            stream: false,
            timestamp_start: Utc::now(),
            timestamp_end: None,
        }
    }

    /// A complete synthetic response with a content length.
    pub fn make(status_code: u16, content: impl Into<Bytes>, headers: Headers) -> Self {
        let content = content.into();
        let mut response = Self::new("HTTP/1.1", status_code, canonical_reason(status_code));
        response.headers = headers;
        response
            .headers
            .insert("content-length", content.len().to_string());
        response.content = Some(content);
        response.timestamp_end = Some(Utc::now());
        response
    }

    pub fn is_http2(&self) -> bool {
        self.http_version == "HTTP/2.0"
    }
}

/// Reason phrase for a status code, empty when unknown.
pub fn canonical_reason(status_code: u16) -> &'static str {
    StatusCode::from_u16(status_code)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or("")
}

/// Builds the plain-text error response sent for protocol errors.
pub fn make_error_response(status_code: u16, message: &str) -> Response {
    let body = format!(
        "<html><head><title>{code} {reason}</title></head><body><h1>{code} {reason}</h1><p>{message}</p></body></html>\n",
        code = status_code,
        reason = canonical_reason(status_code),
        message = escape_html(message),
    );
    Response::make(
        status_code,
        body,
        Headers::from_pairs([
            ("Server", "strata"),
            ("Connection", "close"),
            ("Content-Type", "text/html"),
        ]),
    )
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}
