//! Resolved, immutable per-session configuration.
//!
//! This is the record the core consumes; persistence, import/export, and
//! the shareable-URL clipboard flow belong to the outer GUI shell. The core
//! only needs to validate a config and round-trip the share URL.

use clap::Parser;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::crypto;

/// Resolved configuration for one tunnel session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub name: String,
    pub sni_host: String,
    /// Alternate TCP destination for CDN-front mode. `None` means direct
    /// mode, where the TCP target equals `sni_host`.
    pub proxy_ip: Option<String>,
    pub ws_path: String,
    pub server_port: u16,
    pub socks_port: u16,
    pub http_port: u16,
    #[serde(with = "psk_hex")]
    pub psk: [u8; 32],
}

impl Config {
    /// The actual TCP dial target: `proxy_ip` in CDN-front mode, `sni_host`
    /// otherwise.
    pub fn effective_host(&self) -> &str {
        self.proxy_ip.as_deref().unwrap_or(&self.sni_host)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server_port == 0 || self.socks_port == 0 || self.http_port == 0 {
            return Err(ConfigError::InvalidPort);
        }
        if self.socks_port == self.http_port {
            return Err(ConfigError::PortCollision);
        }
        if self.sni_host.is_empty() {
            return Err(ConfigError::MissingField("sni_host"));
        }
        if !self.ws_path.starts_with('/') {
            return Err(ConfigError::InvalidPath);
        }
        Ok(())
    }

    /// Parse the shareable configuration URL: `wss://<sni_host>:<server_port>
    /// <path>?psk=<64-hex>&socks=<port>&http=<port>&name=<label>
    /// [&proxy_ip=<addr>]`.
    pub fn parse_share_url(raw: &str) -> Result<Config, ConfigError> {
        let url = Url::parse(raw).map_err(|_| ConfigError::InvalidShareUrl)?;
        if url.scheme() != "wss" {
            return Err(ConfigError::InvalidShareUrl);
        }
        let sni_host = url
            .host_str()
            .ok_or(ConfigError::InvalidShareUrl)?
            .to_string();
        let server_port = url.port().unwrap_or(443);
        let ws_path = if url.path().is_empty() {
            "/".to_string()
        } else {
            url.path().to_string()
        };

        let mut psk: Option<[u8; 32]> = None;
        let mut socks_port: u16 = 1080;
        let mut http_port: u16 = 8080;
        let mut name = sni_host.clone();
        let mut proxy_ip: Option<String> = None;

        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "psk" => {
                    psk = Some(crypto::decode_psk(&value).ok_or(ConfigError::InvalidPskHex)?);
                }
                "socks" => {
                    socks_port = value.parse().map_err(|_| ConfigError::InvalidPort)?;
                }
                "http" => {
                    http_port = value.parse().map_err(|_| ConfigError::InvalidPort)?;
                }
                "name" => name = value.into_owned(),
                "proxy_ip" => proxy_ip = Some(value.into_owned()),
                _ => {}
            }
        }

        let psk = psk.ok_or(ConfigError::MissingField("psk"))?;

        let config = Config {
            name,
            sni_host,
            proxy_ip,
            ws_path,
            server_port,
            socks_port,
            http_port,
            psk,
        };
        config.validate().map_err(|_| ConfigError::InvalidShareUrl)?;
        Ok(config)
    }

    /// Render this config as a shareable URL (inverse of
    /// [`Config::parse_share_url`] for valid inputs).
    pub fn to_share_url(&self) -> String {
        let mut url = format!(
            "wss://{}:{}{}?psk={}&socks={}&http={}&name={}",
            self.sni_host,
            self.server_port,
            self.ws_path,
            hex::encode(self.psk),
            self.socks_port,
            self.http_port,
            urlencoding_name(&self.name),
        );
        if let Some(ref proxy_ip) = self.proxy_ip {
            url.push_str("&proxy_ip=");
            url.push_str(proxy_ip);
        }
        url
    }
}

/// Minimal percent-encoding for the `name` query value; avoids pulling in a
/// separate crate for one field.
fn urlencoding_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for b in name.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}

mod psk_hex {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(psk: &[u8; 32], s: S) -> Result<S::Ok, S::Error> {
        hex::encode(psk).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 32], D::Error> {
        let s = String::deserialize(d)?;
        crate::crypto::decode_psk(&s)
            .ok_or_else(|| serde::de::Error::custom("psk must be 64 hex characters"))
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("psk must be exactly 64 hex characters decoding to 32 bytes")]
    InvalidPskHex,
    #[error("port must be in 1..=65535 and local ports must not collide")]
    InvalidPort,
    #[error("local socks and http ports must differ")]
    PortCollision,
    #[error("websocket path must start with '/'")]
    InvalidPath,
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("not a valid share URL")]
    InvalidShareUrl,
}

/// CLI/environment surface for running the binary directly.
#[derive(Parser, Debug)]
#[command(
    version,
    about = "Local SOCKS5/HTTP-CONNECT front end tunneled over an encrypted WebSocket"
)]
pub struct Cli {
    /// A full shareable configuration URL; if given, overrides the
    /// individual flags below.
    #[arg(long, env = "VEILPROXY_SHARE_URL")]
    pub share_url: Option<String>,

    #[arg(long, env = "VEILPROXY_NAME", default_value = "default")]
    pub name: String,

    #[arg(long, env = "VEILPROXY_SNI_HOST")]
    pub sni_host: Option<String>,

    #[arg(long, env = "VEILPROXY_PROXY_IP")]
    pub proxy_ip: Option<String>,

    #[arg(long, env = "VEILPROXY_WS_PATH", default_value = "/tunnel")]
    pub ws_path: String,

    #[arg(long, env = "VEILPROXY_SERVER_PORT", default_value_t = 443)]
    pub server_port: u16,

    #[arg(long, env = "VEILPROXY_SOCKS_PORT", default_value_t = 1080)]
    pub socks_port: u16,

    #[arg(long, env = "VEILPROXY_HTTP_PORT", default_value_t = 8080)]
    pub http_port: u16,

    /// 64 hex character pre-shared key.
    #[arg(long, env = "VEILPROXY_PSK")]
    pub psk: Option<String>,

    #[arg(long, env = "VEILPROXY_MIN_TUNNELS", default_value_t = 2)]
    pub min_tunnels: usize,

    #[arg(long, env = "VEILPROXY_MAX_TUNNELS", default_value_t = 5)]
    pub max_tunnels: usize,

    #[arg(long, env = "VEILPROXY_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[arg(long, env = "VEILPROXY_LOG_JSON", default_value_t = false)]
    pub log_json: bool,
}

impl Cli {
    /// Resolve the CLI surface into a validated [`Config`].
    pub fn resolve(&self) -> Result<Config, ConfigError> {
        if let Some(ref share_url) = self.share_url {
            return Config::parse_share_url(share_url);
        }

        let sni_host = self
            .sni_host
            .clone()
            .ok_or(ConfigError::MissingField("sni_host"))?;
        let psk_hex = self.psk.as_ref().ok_or(ConfigError::MissingField("psk"))?;
        let psk = crypto::decode_psk(psk_hex).ok_or(ConfigError::InvalidPskHex)?;

        let config = Config {
            name: self.name.clone(),
            sni_host,
            proxy_ip: self.proxy_ip.clone(),
            ws_path: self.ws_path.clone(),
            server_port: self.server_port,
            socks_port: self.socks_port,
            http_port: self.http_port,
            psk,
        };
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Config {
        Config {
            name: "my proxy".to_string(),
            sni_host: "edge.example.com".to_string(),
            proxy_ip: None,
            ws_path: "/tunnel".to_string(),
            server_port: 443,
            socks_port: 1080,
            http_port: 8080,
            psk: [0xab; 32],
        }
    }

    #[test]
    fn validate_accepts_sample() {
        assert!(sample().validate().is_ok());
    }

    #[test]
    fn validate_rejects_port_collision() {
        let mut c = sample();
        c.http_port = c.socks_port;
        assert_eq!(c.validate(), Err(ConfigError::PortCollision));
    }

    #[test]
    fn validate_rejects_zero_port() {
        let mut c = sample();
        c.server_port = 0;
        assert_eq!(c.validate(), Err(ConfigError::InvalidPort));
    }

    #[test]
    fn share_url_roundtrips() {
        let c = sample();
        let url = c.to_share_url();
        let parsed = Config::parse_share_url(&url).expect("share url should parse");
        assert_eq!(parsed.sni_host, c.sni_host);
        assert_eq!(parsed.server_port, c.server_port);
        assert_eq!(parsed.ws_path, c.ws_path);
        assert_eq!(parsed.psk, c.psk);
        assert_eq!(parsed.socks_port, c.socks_port);
        assert_eq!(parsed.http_port, c.http_port);
        assert_eq!(parsed.name, c.name);
    }

    #[test]
    fn share_url_with_proxy_ip_roundtrips() {
        let mut c = sample();
        c.proxy_ip = Some("203.0.113.9".to_string());
        let url = c.to_share_url();
        let parsed = Config::parse_share_url(&url).unwrap();
        assert_eq!(parsed.proxy_ip.as_deref(), Some("203.0.113.9"));
        assert_eq!(parsed.effective_host(), "203.0.113.9");
    }

    #[test]
    fn share_url_rejects_missing_psk() {
        let url = "wss://edge.example.com:443/tunnel?socks=1080&http=8080";
        assert_eq!(
            Config::parse_share_url(url),
            Err(ConfigError::MissingField("psk"))
        );
    }

    #[test]
    fn share_url_rejects_bad_psk_length() {
        let url = format!("wss://edge.example.com:443/tunnel?psk={}", "ab".repeat(10));
        assert_eq!(
            Config::parse_share_url(&url),
            Err(ConfigError::InvalidPskHex)
        );
    }

    #[test]
    fn effective_host_defaults_to_sni() {
        assert_eq!(sample().effective_host(), "edge.example.com");
    }
}

