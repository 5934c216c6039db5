//! WebSocket URL parsing.
//!
//! Exactly two schemes are recognized: `ws://` (plaintext, default port 80)
//! and `wss://` (TLS, default port 443). The parsed form keeps only what the
//! connection sequence needs: scheme security, host, port and request path.

use url::Url;

use crate::WsError;

/// A parsed `ws[s]://host[:port]/path` URL.
///
/// Immutable after parsing; the session holds one for the lifetime of the
/// configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WsUrl {
    /// `true` for `wss://`.
    pub secure: bool,
    /// Host name or IP literal, used for DNS, SNI and the `Host` header.
    pub host: String,
    /// Port, explicit or the scheme default.
    pub port: u16,
    /// Request path including any query string, never empty.
    pub path: String,
}

impl WsUrl {
    /// Parses a WebSocket URL.
    ///
    /// Any scheme other than `ws`/`wss`, a missing host, or port 0 is
    /// rejected with [`WsError::InvalidUrl`].
    pub fn parse(input: &str) -> crate::Result<Self> {
        let url =
            Url::parse(input).map_err(|err| WsError::InvalidUrl(format!("{input}: {err}")))?;

        let secure = match url.scheme() {
            "ws" => false,
            "wss" => true,
            other => {
                return Err(WsError::InvalidUrl(format!(
                    "unsupported scheme `{other}`, expected ws or wss"
                )))
            }
        };

        let host = url
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| WsError::InvalidUrl(format!("{input}: missing host")))?
            .to_string();

        let port = url
            .port_or_known_default()
            .filter(|port| *port != 0)
            .ok_or_else(|| WsError::InvalidUrl(format!("{input}: invalid port")))?;

        let path = match url.query() {
            Some(query) => format!("{}?{}", url.path(), query),
            None => url.path().to_string(),
        };

        Ok(Self {
            secure,
            host,
            port,
            path,
        })
    }

    /// Returns `true` when the port is the default for the scheme.
    pub fn is_default_port(&self) -> bool {
        self.port == if self.secure { 443 } else { 80 }
    }

    /// The `Host` header value: the port is appended only when non-default.
    pub fn authority(&self) -> String {
        if self.is_default_port() {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}
