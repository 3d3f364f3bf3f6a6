//! Process-wide proxy options consumed by the layers.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::connection::ServerSpec;

/// Default HTTP/2 keepalive interval in seconds.
pub const DEFAULT_HTTP2_PING_KEEPALIVE: u64 = 58;

/// How the proxy learns where requests should go.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ProxyMode {
    /// Forward proxy: absolute-form and CONNECT requests.
    Regular,
    /// Destination comes from the surrounding context.
    Transparent,
    /// Forward everything through another HTTP proxy.
    Upstream(ServerSpec),
    /// Send everything to a fixed server.
    Reverse(ServerSpec),
}

impl FromStr for ProxyMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "regular" => Ok(ProxyMode::Regular),
            "transparent" => Ok(ProxyMode::Transparent),
            _ => {
                if let Some(spec) = s.strip_prefix("upstream:") {
                    Ok(ProxyMode::Upstream(spec.parse()?))
                } else if let Some(spec) = s.strip_prefix("reverse:") {
                    Ok(ProxyMode::Reverse(spec.parse()?))
                } else {
                    Err(format!("invalid proxy mode: {}", s))
                }
            }
        }
    }
}

impl fmt::Display for ProxyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyMode::Regular => f.write_str("regular"),
            ProxyMode::Transparent => f.write_str("transparent"),
            ProxyMode::Upstream(spec) => write!(f, "upstream:{}", spec),
            ProxyMode::Reverse(spec) => write!(f, "reverse:{}", spec),
        }
    }
}

impl TryFrom<String> for ProxyMode {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ProxyMode> for String {
    fn from(mode: ProxyMode) -> Self {
        mode.to_string()
    }
}

/// When server connections are opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStrategy {
    /// Open the server connection as soon as the destination is known.
    Eager,
    /// Defer until a request actually needs it.
    Lazy,
}

/// Proxy options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    pub mode: ProxyMode,
    /// Allow WebSocket upgrades.
    pub websocket: bool,
    /// Fall back to raw TCP for upgrades and non-HTTP traffic.
    pub rawtcp: bool,
    /// Offer and accept HTTP/2.
    pub http2: bool,
    /// Keep the original Host header in reverse mode.
    pub keep_host_header: bool,
    pub connection_strategy: ConnectionStrategy,
    /// Bodies larger than this are rejected with 413.
    pub body_size_limit: Option<usize>,
    /// Bodies announced larger than this are streamed.
    pub stream_large_bodies: Option<usize>,
    pub allow_hosts: Vec<String>,
    pub ignore_hosts: Vec<String>,
    /// Seconds of idleness before an HTTP/2 PING is sent. Zero disables.
    pub http2_ping_keepalive: u64,
    pub validate_inbound_headers: bool,
    /// Sent as `Proxy-Authorization` to an upstream proxy.
    pub upstream_auth: Option<String>,
    /// Trace every event and command through the layer stack.
    pub proxy_debug: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            mode: ProxyMode::Regular,
            websocket: true,
            rawtcp: false,
            http2: true,
            keep_host_header: false,
            connection_strategy: ConnectionStrategy::Eager,
            body_size_limit: None,
            stream_large_bodies: None,
            allow_hosts: Vec::new(),
            ignore_hosts: Vec::new(),
            http2_ping_keepalive: DEFAULT_HTTP2_PING_KEEPALIVE,
            validate_inbound_headers: true,
            upstream_auth: None,
            proxy_debug: false,
        }
    }
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the proxy mode.
    pub fn with_mode(mut self, mode: ProxyMode) -> Self {
        self.mode = mode;
        self
    }

    /// Enables or disables WebSocket interception.
    pub fn with_websocket(mut self, enabled: bool) -> Self {
        self.websocket = enabled;
        self
    }

    /// Enables or disables raw TCP fallback.
    pub fn with_rawtcp(mut self, enabled: bool) -> Self {
        self.rawtcp = enabled;
        self
    }

    /// Enables or disables HTTP/2.
    pub fn with_http2(mut self, enabled: bool) -> Self {
        self.http2 = enabled;
        self
    }

    pub fn with_keep_host_header(mut self, keep: bool) -> Self {
        self.keep_host_header = keep;
        self
    }

    /// Sets the connection strategy.
    pub fn with_connection_strategy(mut self, strategy: ConnectionStrategy) -> Self {
        self.connection_strategy = strategy;
        self
    }

    /// Sets the maximum accepted body size.
    pub fn with_body_size_limit(mut self, limit: usize) -> Self {
        self.body_size_limit = Some(limit);
        self
    }

    /// Sets the threshold above which bodies are streamed.
    pub fn with_stream_large_bodies(mut self, threshold: usize) -> Self {
        self.stream_large_bodies = Some(threshold);
        self
    }

    pub fn with_ignore_hosts(mut self, patterns: Vec<String>) -> Self {
        self.ignore_hosts = patterns;
        self
    }

    pub fn with_allow_hosts(mut self, patterns: Vec<String>) -> Self {
        self.allow_hosts = patterns;
        self
    }

    /// Sets the HTTP/2 keepalive interval in seconds.
    pub fn with_http2_ping_keepalive(mut self, seconds: u64) -> Self {
        self.http2_ping_keepalive = seconds;
        self
    }

    pub fn with_upstream_auth(mut self, auth: impl Into<String>) -> Self {
        self.upstream_auth = Some(auth.into());
        self
    }

    /// Enables layer debug tracing.
    pub fn with_proxy_debug(mut self, enabled: bool) -> Self {
        self.proxy_debug = enabled;
        self
    }

    pub fn keepalive_interval(&self) -> Option<Duration> {
        (self.http2_ping_keepalive > 0).then(|| Duration::from_secs(self.http2_ping_keepalive))
    }
}
