use std::fmt;

use anyhow::{Result, bail};

use crate::proxy::request::parse_host_header;

/// Authority named by a CONNECT request line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectTarget {
    pub host: String,
    pub port: u16,
}

impl ConnectTarget {
    pub fn parse(target: &str) -> Result<Self> {
        let (host, port) = parse_host_header(target)?;
        let Some(port) = port else {
            bail!("CONNECT target '{target}' must include an explicit port");
        };
        if port == 0 {
            bail!("CONNECT target '{target}' has an invalid port");
        }
        Ok(Self { host, port })
    }

    /// `host:port`, bracketing IPv6 literals.
    pub fn authority(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ConnectTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_host_and_port() {
        let target = ConnectTarget::parse("registry-1.docker.io:443").unwrap();
        assert_eq!(target.host, "registry-1.docker.io");
        assert_eq!(target.port, 443);
        assert_eq!(target.authority(), "registry-1.docker.io:443");
    }

    #[test]
    fn brackets_ipv6_authority() {
        let target = ConnectTarget::parse("[2001:db8::1]:8443").unwrap();
        assert_eq!(target.host, "2001:db8::1");
        assert_eq!(target.authority(), "[2001:db8::1]:8443");
    }

    #[test]
    fn rejects_missing_port() {
        let err = ConnectTarget::parse("example.com").unwrap_err();
        assert!(err.to_string().contains("explicit port"), "{err}");
    }

    #[test]
    fn rejects_empty_target() {
        assert!(ConnectTarget::parse("").is_err());
    }
}
