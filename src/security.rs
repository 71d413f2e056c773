use anyhow::{Result, anyhow};
use ipnet::IpNet;
use serde::Deserialize;
use std::{fmt, net::IpAddr};
use uuid::Uuid;

/// Length in bytes of the access token carried in every request header
pub const TOKEN_LEN: usize = 16;

/// The shared secret a client must present in its request header.
///
/// Written in configuration as a UUID string; compared against untrusted bytes with
/// a fixed structure of four 4-byte XOR-OR groups, so the comparison time does not
/// depend on where the first mismatch sits.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub struct AccessToken([u8; TOKEN_LEN]);

impl AccessToken {
    #[must_use]
    pub const fn from_bytes(bytes: [u8; TOKEN_LEN]) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; TOKEN_LEN] {
        &self.0
    }

    /// Returns true only if `candidate` is exactly 16 bytes equal to this token
    #[must_use]
    pub fn matches(&self, candidate: &[u8]) -> bool {
        let Ok(candidate) = <&[u8; TOKEN_LEN]>::try_from(candidate) else {
            return false;
        };

        let mut diff = 0u32;
        for group in 0..TOKEN_LEN / 4 {
            let at = group * 4;
            let ours = u32::from_ne_bytes([
                self.0[at],
                self.0[at + 1],
                self.0[at + 2],
                self.0[at + 3],
            ]);
            let theirs = u32::from_ne_bytes([
                candidate[at],
                candidate[at + 1],
                candidate[at + 2],
                candidate[at + 3],
            ]);
            diff |= ours ^ theirs;
        }
        diff == 0
    }
}

impl TryFrom<String> for AccessToken {
    type Error = uuid::Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl std::str::FromStr for AccessToken {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(|uuid| Self(uuid.into_bytes()))
    }
}

// Never print the secret itself.
impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AccessToken(..)")
    }
}

/// Parses the original client IP from X-Forwarded-For header
/// Format: "client, proxy1, proxy2, ..." - returns the leftmost (original client) IP
#[must_use]
pub fn parse_original_client_ip(xff_header: &str) -> Option<String> {
    xff_header
        .split(',')
        .next()
        .map(|ip| ip.trim().to_string())
        .filter(|ip| !ip.is_empty())
}

/// Peers permitted to open connections, built once from `allowed_proxy_ips`
#[derive(Debug, Clone, Default)]
pub struct ProxyAllowlist {
    entries: Option<Vec<IpNet>>,
}

impl ProxyAllowlist {
    /// Accepts individual addresses or CIDR subnets; `None` allows every peer
    pub fn parse(allowed_ips: Option<&[String]>) -> Result<Self> {
        let Some(allowed_list) = allowed_ips else {
            return Ok(Self::default());
        };

        let entries = allowed_list
            .iter()
            .map(|entry| {
                entry
                    .parse::<IpAddr>()
                    .map(IpNet::from)
                    .or_else(|_| entry.parse::<IpNet>())
                    .map_err(|_| {
                        anyhow!("Invalid IP address or CIDR in allowed_proxy_ips: {entry}")
                    })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            entries: Some(entries),
        })
    }

    #[must_use]
    pub fn allows(&self, peer: IpAddr) -> bool {
        self.entries
            .as_ref()
            .is_none_or(|nets| nets.iter().any(|net| net.contains(&peer)))
    }
}
