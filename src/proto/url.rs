//! `varys://host:port` peer addresses

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

fn url_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^varys://([A-Za-z0-9._-]+):(\d{1,5})$").expect("static regex"))
}

/// A parsed peer address. Invalid URLs fail registration up front.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VarysUrl {
    pub host: String,
    pub port: u16,
}

impl VarysUrl {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn parse(url: &str) -> Result<Self> {
        let caps = url_regex()
            .captures(url)
            .ok_or_else(|| Error::Configuration(format!("invalid varys URL: {url}")))?;
        let port: u32 = caps[2]
            .parse()
            .map_err(|_| Error::Configuration(format!("invalid port in URL: {url}")))?;
        if port == 0 || port > u16::MAX as u32 {
            return Err(Error::Configuration(format!("port out of range in URL: {url}")));
        }
        Ok(Self {
            host: caps[1].to_string(),
            port: port as u16,
        })
    }

    /// The `host:port` form used for socket connects.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl std::fmt::Display for VarysUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "varys://{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_roundtrip() {
        let url = VarysUrl::parse("varys://master.cluster.local:1606").unwrap();
        assert_eq!(url.host, "master.cluster.local");
        assert_eq!(url.port, 1606);
        assert_eq!(url.to_string(), "varys://master.cluster.local:1606");
        assert_eq!(url.authority(), "master.cluster.local:1606");
    }

    #[test]
    fn test_parse_ip_host() {
        let url = VarysUrl::parse("varys://127.0.0.2:9000").unwrap();
        assert_eq!(url.host, "127.0.0.2");
    }

    #[test]
    fn test_rejects_malformed() {
        for bad in [
            "http://h:1",
            "varys://h",
            "varys://h:0",
            "varys://h:70000",
            "varys://:1606",
            "varys://h:1606/extra",
            "varys:// h:1",
        ] {
            assert!(VarysUrl::parse(bad).is_err(), "should reject {bad}");
        }
    }
}
