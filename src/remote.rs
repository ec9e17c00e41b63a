//! Remote endpoint addressing.
//!
//! A `RemoteHost` names the machine exporting devices. It is parsed both
//! from the caller's `--host` value and from the `usbip://host:port/busid`
//! uri printed by `usbip port`.

use std::fmt;
use std::str::FromStr;

use crate::error::MonitorError;

/// The only port the usbip client tool will talk to.
pub const DEFAULT_USBIP_PORT: u16 = 3240;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteHost {
    pub host: String,
    pub port: u16,
}

impl RemoteHost {
    /// Parse `host`, `host:port`, `[v6]`, `[v6]:port` or a bare IPv6 literal.
    ///
    /// A leading `scheme://` and trailing `/` are tolerated.
    pub fn parse(value: &str) -> crate::Result<Self> {
        let invalid = |why: &str| MonitorError::InvalidConfig(format!("remote host '{}' {}", value, why));

        let mut authority = value.trim();
        if let Some((_scheme, rest)) = authority.split_once("://") {
            authority = rest;
        }
        let authority = authority.trim_end_matches('/');

        let (host, port) = if let Some(bracketed) = authority.strip_prefix('[') {
            let (host, rest) = bracketed
                .split_once(']')
                .ok_or_else(|| invalid("has an unterminated '['"))?;
            let port = match rest {
                "" => None,
                _ => Some(
                    rest.strip_prefix(':')
                        .ok_or_else(|| invalid("has trailing text after ']'"))?,
                ),
            };
            (host, port)
        } else if authority.matches(':').count() == 1 {
            let (host, port) = authority.split_once(':').unwrap_or((authority, ""));
            (host, Some(port))
        } else {
            (authority, None)
        };

        if host.is_empty() {
            return Err(invalid("is missing a host name"));
        }

        let port = match port {
            Some(p) => p
                .parse::<u16>()
                .map_err(|_| invalid("has an invalid port number"))?,
            None => DEFAULT_USBIP_PORT,
        };

        Ok(RemoteHost {
            host: host.to_string(),
            port,
        })
    }

    /// ASCII case-insensitive comparison of the host component only.
    pub fn matches_host(&self, host: &str) -> bool {
        self.host.eq_ignore_ascii_case(host)
    }
}

impl FromStr for RemoteHost {
    type Err = MonitorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RemoteHost::parse(s)
    }
}

impl fmt::Display for RemoteHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}
