//! Destination endpoints and the strategies that order them.

use common::config::ConfigError;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use strum_macros::{AsRefStr, Display, EnumString};
use url::Url;

use crate::config::RoutingStrategy;

/// The addressable backend identity, compared by its string form.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Tcp { host: String, port: u16 },
    Local { path: String },
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp { host, port } => write!(f, "{host}:{port}"),
            Endpoint::Local { path } => write!(f, "{path}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, AsRefStr, Display)]
pub enum MetadataCacheRole {
    #[strum(serialize = "PRIMARY")]
    Primary,
    #[strum(serialize = "SECONDARY")]
    Secondary,
    #[strum(serialize = "PRIMARY_AND_SECONDARY")]
    PrimaryAndSecondary,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DestinationsConfig {
    Static(Vec<Endpoint>),
    MetadataCache {
        cluster: String,
        role: MetadataCacheRole,
        raw: String,
    },
}

impl fmt::Display for DestinationsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DestinationsConfig::Static(endpoints) => {
                let mut first = true;
                for endpoint in endpoints {
                    if !first {
                        write!(f, ",")?;
                    }
                    write!(f, "{endpoint}")?;
                    first = false;
                }
                Ok(())
            }
            DestinationsConfig::MetadataCache { raw, .. } => write!(f, "{raw}"),
        }
    }
}

const DEFAULT_MYSQL_PORT: u16 = 3306;

fn is_valid_hostname(host: &str) -> bool {
    !host.is_empty()
        && host
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_'))
}

/// One `host[:port]` token, an absolute socket path, or a bracketed IPv6
/// literal.
pub fn parse_endpoint(token: &str) -> Result<Endpoint, ConfigError> {
    let token = token.trim();
    let invalid = || {
        ConfigError::InvalidArgument(format!(
            "'{token}' in 'destinations' is not a valid endpoint"
        ))
    };

    if token.is_empty() {
        return Err(invalid());
    }
    if token.starts_with('/') {
        return Ok(Endpoint::Local {
            path: token.to_string(),
        });
    }

    if let Some(rest) = token.strip_prefix('[') {
        // [v6-literal]:port
        let (host, rest) = rest.split_once(']').ok_or_else(invalid)?;
        if host.parse::<std::net::Ipv6Addr>().is_err() {
            return Err(invalid());
        }
        let port = match rest.strip_prefix(':') {
            Some(port) => port.parse::<u16>().map_err(|_| invalid())?,
            None if rest.is_empty() => DEFAULT_MYSQL_PORT,
            None => return Err(invalid()),
        };
        if port == 0 {
            return Err(invalid());
        }
        return Ok(Endpoint::Tcp {
            host: host.to_string(),
            port,
        });
    }

    let (host, port) = match token.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => {
            let port = port.parse::<u16>().map_err(|_| invalid())?;
            (host.to_string(), port)
        }
        Some(_) => return Err(invalid()),
        None => (token.to_string(), DEFAULT_MYSQL_PORT),
    };

    if !is_valid_hostname(&host) || host.parse::<u16>().is_ok() {
        return Err(invalid());
    }
    if port == 0 {
        return Err(invalid());
    }
    Ok(Endpoint::Tcp { host, port })
}

/// Either a `metadata-cache://…?role=…` URI or a comma-separated endpoint
/// list.
pub fn parse_destinations(value: &str) -> Result<DestinationsConfig, ConfigError> {
    if value.starts_with("metadata-cache:") {
        let url = Url::parse(value).map_err(|e| {
            ConfigError::InvalidArgument(format!("invalid destinations URI '{value}': {e}"))
        })?;
        let cluster = url.host_str().unwrap_or_default().to_string();
        if cluster.is_empty() {
            return Err(ConfigError::InvalidArgument(format!(
                "invalid destinations URI '{value}': no cluster name"
            )));
        }
        let role_value = url
            .query_pairs()
            .find(|(key, _)| key == "role")
            .map(|(_, value)| value.to_string())
            .ok_or_else(|| {
                ConfigError::InvalidArgument(format!(
                    "invalid destinations URI '{value}': role is required"
                ))
            })?;
        let role = MetadataCacheRole::from_str(&role_value).map_err(|_| {
            ConfigError::InvalidArgument(format!(
                "invalid role '{role_value}' in destinations URI; valid are PRIMARY, SECONDARY, PRIMARY_AND_SECONDARY"
            ))
        })?;
        return Ok(DestinationsConfig::MetadataCache {
            cluster,
            role,
            raw: value.to_string(),
        });
    }

    let endpoints = value
        .split(',')
        .map(parse_endpoint)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(DestinationsConfig::Static(endpoints))
}

/// Orders candidate endpoints according to the routing strategy. The
/// metadata-cache variant has no static endpoints; its `next()` source is
/// empty until a cache feeds it (out of scope here).
pub struct Destinations {
    endpoints: Vec<Endpoint>,
    strategy: RoutingStrategy,
    cursor: AtomicUsize,
}

impl Destinations {
    pub fn new(config: &DestinationsConfig, strategy: RoutingStrategy) -> Self {
        let endpoints = match config {
            DestinationsConfig::Static(endpoints) => endpoints.clone(),
            DestinationsConfig::MetadataCache { .. } => Vec::new(),
        };
        Self {
            endpoints,
            strategy,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn all(&self) -> &[Endpoint] {
        &self.endpoints
    }

    /// The endpoints to try for one connect attempt, most preferred first.
    pub fn candidates(&self) -> Vec<Endpoint> {
        if self.endpoints.is_empty() {
            return Vec::new();
        }
        match self.strategy {
            RoutingStrategy::FirstAvailable => self.endpoints.clone(),
            RoutingStrategy::NextAvailable => {
                let start = self.cursor.load(Ordering::Relaxed) % self.endpoints.len();
                let mut out = self.endpoints[start..].to_vec();
                out.extend_from_slice(&self.endpoints[..start]);
                out
            }
            RoutingStrategy::RoundRobin | RoutingStrategy::RoundRobinWithFallback => {
                let start =
                    self.cursor.fetch_add(1, Ordering::Relaxed) % self.endpoints.len();
                let mut out = self.endpoints[start..].to_vec();
                out.extend_from_slice(&self.endpoints[..start]);
                out
            }
        }
    }

    /// next-available never returns to an endpoint that failed.
    pub fn report_failure(&self, endpoint: &Endpoint) {
        if self.strategy != RoutingStrategy::NextAvailable {
            return;
        }
        if let Some(pos) = self.endpoints.iter().position(|e| e == endpoint) {
            let len = self.endpoints.len();
            let _ = self.cursor.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |cur| {
                (cur % len == pos).then_some((pos + 1) % len)
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_host_port() {
        assert_eq!(
            parse_endpoint("db1:3307").unwrap(),
            Endpoint::Tcp {
                host: "db1".into(),
                port: 3307
            }
        );
        assert_eq!(
            parse_endpoint("db1").unwrap().to_string(),
            "db1:3306".to_string()
        );
    }

    #[test]
    fn parse_ipv6() {
        assert_eq!(
            parse_endpoint("[::1]:3307").unwrap(),
            Endpoint::Tcp {
                host: "::1".into(),
                port: 3307
            }
        );
        assert!(parse_endpoint("[not-v6]:3307").is_err());
    }

    #[test]
    fn parse_unix_path() {
        assert_eq!(
            parse_endpoint("/tmp/mysql.sock").unwrap(),
            Endpoint::Local {
                path: "/tmp/mysql.sock".into()
            }
        );
    }

    #[test]
    fn reject_empty_and_bad_tokens() {
        assert!(parse_endpoint("").is_err());
        assert!(parse_endpoint("host:port").is_err());
        assert!(parse_endpoint("host:0").is_err());
        assert!(parse_destinations("db1,,db2").is_err());
        assert!(parse_endpoint("bad host").is_err());
    }

    #[test]
    fn parse_static_list() {
        let config = parse_destinations("db1:3306, db2:3307").unwrap();
        match &config {
            DestinationsConfig::Static(endpoints) => assert_eq!(endpoints.len(), 2),
            _ => panic!("expected static destinations"),
        }
        assert_eq!(config.to_string(), "db1:3306,db2:3307");
    }

    #[test]
    fn parse_metadata_cache_uri() {
        let config =
            parse_destinations("metadata-cache://mycluster/?role=PRIMARY_AND_SECONDARY").unwrap();
        match config {
            DestinationsConfig::MetadataCache { cluster, role, .. } => {
                assert_eq!(cluster, "mycluster");
                assert_eq!(role, MetadataCacheRole::PrimaryAndSecondary);
            }
            _ => panic!("expected metadata-cache destinations"),
        }
    }

    #[test]
    fn metadata_cache_requires_role() {
        assert!(parse_destinations("metadata-cache://mycluster/").is_err());
        assert!(parse_destinations("metadata-cache://mycluster/?role=KING").is_err());
    }

    #[test]
    fn round_robin_rotates() {
        let config = parse_destinations("a:1,b:2,c:3").unwrap();
        let destinations = Destinations::new(&config, RoutingStrategy::RoundRobin);
        assert_eq!(destinations.candidates()[0].to_string(), "a:1");
        assert_eq!(destinations.candidates()[0].to_string(), "b:2");
        assert_eq!(destinations.candidates()[0].to_string(), "c:3");
        assert_eq!(destinations.candidates()[0].to_string(), "a:1");
    }

    #[test]
    fn first_available_sticks_to_head() {
        let config = parse_destinations("a:1,b:2").unwrap();
        let destinations = Destinations::new(&config, RoutingStrategy::FirstAvailable);
        assert_eq!(destinations.candidates()[0].to_string(), "a:1");
        assert_eq!(destinations.candidates()[0].to_string(), "a:1");
    }

    #[test]
    fn next_available_never_goes_back() {
        let config = parse_destinations("a:1,b:2,c:3").unwrap();
        let destinations = Destinations::new(&config, RoutingStrategy::NextAvailable);
        let first = destinations.candidates()[0].clone();
        assert_eq!(first.to_string(), "a:1");
        destinations.report_failure(&first);
        assert_eq!(destinations.candidates()[0].to_string(), "b:2");
        // reporting an endpoint that is not current is a no-op.
        destinations.report_failure(&first);
        assert_eq!(destinations.candidates()[0].to_string(), "b:2");
    }
}
