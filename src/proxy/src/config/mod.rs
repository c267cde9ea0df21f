//! Typed per-route configuration.
//!
//! A route section is parsed into [`RouteConfig`] and validated at load
//! time; the interdependencies between the two ssl modes and the ssl file
//! options follow the classic routing plugin rules.

use crate::destinations::{parse_destinations, DestinationsConfig, MetadataCacheRole};

use common::config::options::{option_as_bool, option_as_double, option_as_uint, ConfigOption};
use common::config::{ConfigError, SectionView};
use common::dynamic_config::{DynamicConfig, SectionId};
use std::str::FromStr;
use std::time::Duration;
use strum_macros::{AsRefStr, Display, EnumString};

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, AsRefStr, Display)]
pub enum ClientSslMode {
    #[strum(serialize = "DISABLED")]
    Disabled,
    #[strum(serialize = "PREFERRED")]
    Preferred,
    #[strum(serialize = "REQUIRED")]
    Required,
    #[strum(serialize = "PASSTHROUGH")]
    Passthrough,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, AsRefStr, Display)]
pub enum ServerSslMode {
    #[strum(serialize = "DISABLED")]
    Disabled,
    #[strum(serialize = "PREFERRED")]
    Preferred,
    #[strum(serialize = "REQUIRED")]
    Required,
    #[strum(serialize = "AS_CLIENT")]
    AsClient,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, AsRefStr, Display)]
pub enum SslVerify {
    #[strum(serialize = "DISABLED")]
    Disabled,
    #[strum(serialize = "VERIFY_CA")]
    VerifyCa,
    #[strum(serialize = "VERIFY_IDENTITY")]
    VerifyIdentity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, AsRefStr, Display)]
pub enum RoutingStrategy {
    #[strum(serialize = "first-available")]
    FirstAvailable,
    #[strum(serialize = "next-available")]
    NextAvailable,
    #[strum(serialize = "round-robin")]
    RoundRobin,
    #[strum(serialize = "round-robin-with-fallback")]
    RoundRobinWithFallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, AsRefStr, Display)]
pub enum AccessMode {
    #[strum(serialize = "undefined")]
    Undefined,
    #[strum(serialize = "auto")]
    Auto,
    #[strum(serialize = "read-only")]
    ReadOnly,
    #[strum(serialize = "read-write")]
    ReadWrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, AsRefStr, Display)]
pub enum Protocol {
    #[strum(serialize = "classic")]
    Classic,
    #[strum(serialize = "x")]
    X,
}

/// The ssl file/knob options of one side, kept verbatim for the TLS layer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SslOptions {
    pub cert: String,
    pub key: String,
    pub cipher: String,
    pub ca: String,
    pub capath: String,
    pub crl: String,
    pub crlpath: String,
    pub curves: String,
    pub dh_params: String,
    pub session_cache_mode: bool,
    pub session_cache_size: u32,
    pub session_cache_timeout: u32,
}

#[derive(Debug, Clone)]
pub struct RouteConfig {
    pub name: String,
    pub protocol: Protocol,
    pub destinations: DestinationsConfig,
    pub bind_address: Option<String>,
    pub bind_port: u16,
    pub socket: Option<String>,
    pub connect_timeout: Duration,
    pub client_connect_timeout: Duration,
    pub routing_strategy: RoutingStrategy,
    pub max_connections: u32,
    pub max_connect_errors: u32,
    pub net_buffer_length: u32,
    pub thread_stack_size: u32,

    pub client_ssl_mode: ClientSslMode,
    pub client_ssl: SslOptions,
    pub server_ssl_mode: ServerSslMode,
    pub server_ssl_verify: SslVerify,
    pub server_ssl: SslOptions,

    pub connection_sharing: bool,
    pub connection_sharing_delay: Duration,
    pub connect_retry_timeout: Duration,
    pub access_mode: AccessMode,
    pub wait_for_my_writes: bool,
    pub wait_for_my_writes_timeout: Duration,
    pub router_require_enforce: bool,
}

impl RouteConfig {
    /// The router synthesises the greeting unless the leg is a passthrough.
    pub fn greeting_from_router(&self) -> bool {
        self.client_ssl_mode != ClientSslMode::Passthrough
    }

    /// TLS toward the server, before the client's choice is known.
    pub fn server_requires_tls(&self) -> bool {
        matches!(
            self.server_ssl_mode,
            ServerSslMode::Required | ServerSslMode::Preferred
        )
    }
}

const KNOWN_OPTIONS: &[&str] = &[
    "protocol",
    "destinations",
    "bind_port",
    "bind_address",
    "socket",
    "connect_timeout",
    "routing_strategy",
    "max_connections",
    "max_connect_errors",
    "client_connect_timeout",
    "net_buffer_length",
    "thread_stack_size",
    "client_ssl_mode",
    "client_ssl_cert",
    "client_ssl_key",
    "client_ssl_cipher",
    "client_ssl_ca",
    "client_ssl_capath",
    "client_ssl_crl",
    "client_ssl_crlpath",
    "client_ssl_curves",
    "client_ssl_dh_params",
    "client_ssl_session_cache_mode",
    "client_ssl_session_cache_size",
    "client_ssl_session_cache_timeout",
    "server_ssl_mode",
    "server_ssl_verify",
    "server_ssl_cipher",
    "server_ssl_ca",
    "server_ssl_capath",
    "server_ssl_crl",
    "server_ssl_crlpath",
    "server_ssl_curves",
    "server_ssl_session_cache_mode",
    "server_ssl_session_cache_size",
    "server_ssl_session_cache_timeout",
    "connection_sharing",
    "connection_sharing_delay",
    "connect_retry_timeout",
    "access_mode",
    "wait_for_my_writes",
    "wait_for_my_writes_timeout",
    "router_require_enforce",
];

fn parse_enum<T>(value: &str, option_desc: &str, valid: &str) -> Result<T, ConfigError>
where
    T: FromStr,
{
    T::from_str(value).map_err(|_| {
        ConfigError::InvalidArgument(format!(
            "invalid value '{value}' for {option_desc}; valid are {valid}"
        ))
    })
}

impl RouteConfig {
    pub fn from_section(section: &SectionView<'_>) -> Result<RouteConfig, ConfigError> {
        let section_desc = match section.key() {
            Some(key) => format!("[{}:{}]", section.name(), key),
            None => format!("[{}]", section.name()),
        };
        let name = section.key().unwrap_or(section.name()).to_string();

        for option in section.section().option_names() {
            if !KNOWN_OPTIONS.contains(&option) {
                return Err(ConfigError::InvalidArgument(format!(
                    "unknown option {option} in {section_desc}"
                )));
            }
        }

        let get = |name: &'static str| -> Result<Option<String>, ConfigError> {
            Ok(section
                .get(name)?
                .filter(|value| !value.is_empty()))
        };

        let protocol = match get("protocol")? {
            Some(value) => parse_enum::<Protocol>(&value, "protocol", "classic, x")?,
            None => Protocol::Classic,
        };

        let destinations_value = ConfigOption::required("destinations")
            .get_option_string(section, &section_desc)?;
        let destinations = parse_destinations(&destinations_value)?;

        let bind_address = get("bind_address")?;
        let bind_port = match get("bind_port")? {
            Some(value) => option_as_uint::<u16>(&value, "bind_port", 1, 65535)?,
            None => 0,
        };
        let socket = get("socket")?;
        if bind_address.is_none() && bind_port == 0 && socket.is_none() {
            return Err(ConfigError::InvalidArgument(format!(
                "either bind_address or socket option needs to be supplied, or both; {section_desc}"
            )));
        }

        let connect_timeout = match get("connect_timeout")? {
            Some(value) => option_as_uint::<u64>(&value, "connect_timeout", 1, 65535)?,
            None => 5,
        };
        let client_connect_timeout = match get("client_connect_timeout")? {
            Some(value) => option_as_uint::<u64>(&value, "client_connect_timeout", 2, 31536000)?,
            None => 9,
        };

        let routing_strategy = match get("routing_strategy")? {
            Some(value) => parse_enum::<RoutingStrategy>(
                &value,
                "routing_strategy",
                "first-available, next-available, round-robin, round-robin-with-fallback",
            )?,
            None => RoutingStrategy::RoundRobin,
        };

        let max_connections = match get("max_connections")? {
            Some(value) => option_as_uint::<u32>(&value, "max_connections", 0, 65535)?,
            None => 512,
        };
        let max_connect_errors = match get("max_connect_errors")? {
            Some(value) => option_as_uint::<u32>(&value, "max_connect_errors", 1, u32::MAX)?,
            None => 100,
        };
        let net_buffer_length = match get("net_buffer_length")? {
            Some(value) => option_as_uint::<u32>(&value, "net_buffer_length", 1024, 1048576)?,
            None => 16384,
        };
        let thread_stack_size = match get("thread_stack_size")? {
            Some(value) => option_as_uint::<u32>(&value, "thread_stack_size", 1, 65535)?,
            None => 64,
        };

        let client_ssl_mode = match get("client_ssl_mode")? {
            Some(value) => parse_enum::<ClientSslMode>(
                &value.to_ascii_uppercase(),
                "client_ssl_mode",
                "DISABLED, PREFERRED, REQUIRED, PASSTHROUGH",
            )?,
            None => ClientSslMode::Preferred,
        };
        let server_ssl_mode = match get("server_ssl_mode")? {
            Some(value) => parse_enum::<ServerSslMode>(
                &value.to_ascii_uppercase(),
                "server_ssl_mode",
                "DISABLED, PREFERRED, REQUIRED, AS_CLIENT",
            )?,
            None => ServerSslMode::AsClient,
        };
        let server_ssl_verify = match get("server_ssl_verify")? {
            Some(value) => parse_enum::<SslVerify>(
                &value.to_ascii_uppercase(),
                "server_ssl_verify",
                "DISABLED, VERIFY_CA, VERIFY_IDENTITY",
            )?,
            None => SslVerify::Disabled,
        };

        let ssl_options = |prefix: &str| -> Result<SslOptions, ConfigError> {
            let opt = |suffix: &str| -> Result<String, ConfigError> {
                let full: String = format!("{prefix}{suffix}");
                Ok(section.get(&full)?.unwrap_or_default())
            };
            Ok(SslOptions {
                cert: opt("cert")?,
                key: opt("key")?,
                cipher: opt("cipher")?,
                ca: opt("ca")?,
                capath: opt("capath")?,
                crl: opt("crl")?,
                crlpath: opt("crlpath")?,
                curves: opt("curves")?,
                dh_params: opt("dh_params")?,
                session_cache_mode: match section.get(&format!("{prefix}session_cache_mode"))? {
                    Some(value) if !value.is_empty() => {
                        option_as_bool(&value, &format!("{prefix}session_cache_mode"))?
                    }
                    _ => true,
                },
                session_cache_size: match section.get(&format!("{prefix}session_cache_size"))? {
                    Some(value) if !value.is_empty() => option_as_uint::<u32>(
                        &value,
                        &format!("{prefix}session_cache_size"),
                        1,
                        u32::MAX,
                    )?,
                    _ => 1024,
                },
                session_cache_timeout: match section
                    .get(&format!("{prefix}session_cache_timeout"))?
                {
                    Some(value) if !value.is_empty() => option_as_uint::<u32>(
                        &value,
                        &format!("{prefix}session_cache_timeout"),
                        0,
                        86400,
                    )?,
                    _ => 300,
                },
            })
        };
        let client_ssl = ssl_options("client_ssl_")?;
        let server_ssl = ssl_options("server_ssl_")?;

        let connection_sharing = match get("connection_sharing")? {
            Some(value) => option_as_bool(&value, "connection_sharing")?,
            None => false,
        };
        let connection_sharing_delay = match get("connection_sharing_delay")? {
            Some(value) => {
                option_as_double(&value, "connection_sharing_delay", 0.0, 3600.0)?
            }
            None => 1.0,
        };
        let connect_retry_timeout = match get("connect_retry_timeout")? {
            Some(value) => option_as_uint::<u64>(&value, "connect_retry_timeout", 0, 3600000)?,
            None => 7000,
        };
        let access_mode = match get("access_mode")? {
            Some(value) => parse_enum::<AccessMode>(
                &value,
                "access_mode",
                "undefined, auto, read-only, read-write",
            )?,
            None => AccessMode::Undefined,
        };
        let wait_for_my_writes = match get("wait_for_my_writes")? {
            Some(value) => option_as_bool(&value, "wait_for_my_writes")?,
            None => true,
        };
        let wait_for_my_writes_timeout = match get("wait_for_my_writes_timeout")? {
            Some(value) => option_as_uint::<u64>(&value, "wait_for_my_writes_timeout", 0, 3600)?,
            None => 2,
        };
        let router_require_enforce = match get("router_require_enforce")? {
            Some(value) => option_as_bool(&value, "router_require_enforce")?,
            None => false,
        };

        let config = RouteConfig {
            name,
            protocol,
            destinations,
            bind_address,
            bind_port,
            socket,
            connect_timeout: Duration::from_secs(connect_timeout),
            client_connect_timeout: Duration::from_secs(client_connect_timeout),
            routing_strategy,
            max_connections,
            max_connect_errors,
            net_buffer_length,
            thread_stack_size,
            client_ssl_mode,
            client_ssl,
            server_ssl_mode,
            server_ssl_verify,
            server_ssl,
            connection_sharing,
            connection_sharing_delay: Duration::from_secs_f64(connection_sharing_delay),
            connect_retry_timeout: Duration::from_millis(connect_retry_timeout),
            access_mode,
            wait_for_my_writes,
            wait_for_my_writes_timeout: Duration::from_secs(wait_for_my_writes_timeout),
            router_require_enforce,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        self.validate_ssl_matrix()?;
        self.validate_strategy()?;
        self.validate_access_mode()?;
        Ok(())
    }

    fn validate_ssl_matrix(&self) -> Result<(), ConfigError> {
        use ClientSslMode as C;
        use ServerSslMode as S;

        let invalid = |msg: String| Err(ConfigError::InvalidArgument(msg));

        if matches!(self.client_ssl_mode, C::Required | C::Preferred) {
            if self.client_ssl.cert.is_empty() {
                return invalid(format!(
                    "client_ssl_cert must be set, if client_ssl_mode is '{}'.",
                    self.client_ssl_mode
                ));
            }
            if self.client_ssl.key.is_empty() {
                return invalid(format!(
                    "client_ssl_key must be set, if client_ssl_mode is '{}'.",
                    self.client_ssl_mode
                ));
            }
        }

        if self.client_ssl_mode == C::Passthrough && self.server_ssl_mode != S::AsClient {
            return invalid(
                "If client_ssl_mode is PASSTHROUGH, server_ssl_mode must be AS_CLIENT."
                    .to_string(),
            );
        }

        if self.server_ssl_verify != SslVerify::Disabled
            && self.server_ssl.ca.is_empty()
            && self.server_ssl.capath.is_empty()
        {
            return invalid(format!(
                "server_ssl_ca or server_ssl_capath must be set, if server_ssl_verify is '{}'.",
                self.server_ssl_verify
            ));
        }

        if self.client_ssl_mode == C::Passthrough {
            let offending: &[(&str, &String)] = &[
                ("client_ssl_ca", &self.client_ssl.ca),
                ("client_ssl_capath", &self.client_ssl.capath),
                ("client_ssl_crl", &self.client_ssl.crl),
                ("client_ssl_crlpath", &self.client_ssl.crlpath),
                ("server_ssl_key", &self.server_ssl.key),
                ("server_ssl_cert", &self.server_ssl.cert),
            ];
            for (option, value) in offending {
                if !value.is_empty() {
                    return invalid(format!(
                        "client_ssl_mode=PASSTHROUGH can not be combined with {option}={value}"
                    ));
                }
            }
            if self.router_require_enforce {
                return invalid(
                    "client_ssl_mode=PASSTHROUGH can not be combined with router_require_enforce=1"
                        .to_string(),
                );
            }
        } else if self.client_ssl_mode == C::Disabled {
            let offending: &[(&str, &String)] = &[
                ("client_ssl_ca", &self.client_ssl.ca),
                ("client_ssl_capath", &self.client_ssl.capath),
                ("client_ssl_crl", &self.client_ssl.crl),
                ("client_ssl_crlpath", &self.client_ssl.crlpath),
            ];
            for (option, value) in offending {
                if !value.is_empty() {
                    return invalid(format!(
                        "client_ssl_mode=DISABLED can not be combined with {option}={value}"
                    ));
                }
            }
        }

        if self.server_ssl_mode == S::Disabled
            || (self.client_ssl_mode == C::Disabled && self.server_ssl_mode == S::AsClient)
        {
            let offending: &[(&str, &String)] = &[
                ("server_ssl_key", &self.server_ssl.key),
                ("server_ssl_cert", &self.server_ssl.cert),
            ];
            for (option, value) in offending {
                if !value.is_empty() {
                    return invalid(format!(
                        "server_ssl_mode=DISABLED can not be combined with {option}={value}"
                    ));
                }
            }
        }

        if self.protocol == Protocol::X {
            let offending: &[(&str, &String)] = &[
                ("client_ssl_ca", &self.client_ssl.ca),
                ("client_ssl_capath", &self.client_ssl.capath),
                ("client_ssl_crl", &self.client_ssl.crl),
                ("client_ssl_crlpath", &self.client_ssl.crlpath),
                ("server_ssl_key", &self.server_ssl.key),
                ("server_ssl_cert", &self.server_ssl.cert),
            ];
            for (option, value) in offending {
                if !value.is_empty() {
                    return invalid(format!(
                        "protocol=x can not be combined with {option}={value}"
                    ));
                }
            }
        }

        Ok(())
    }

    fn validate_strategy(&self) -> Result<(), ConfigError> {
        if self.routing_strategy == RoutingStrategy::RoundRobinWithFallback
            && !matches!(self.destinations, DestinationsConfig::MetadataCache { .. })
        {
            return Err(ConfigError::InvalidArgument(
                "routing_strategy=round-robin-with-fallback requires metadata-cache destinations"
                    .to_string(),
            ));
        }
        Ok(())
    }

    fn validate_access_mode(&self) -> Result<(), ConfigError> {
        if self.access_mode != AccessMode::Auto {
            return Ok(());
        }
        let invalid = |msg: &str| Err(ConfigError::InvalidArgument(msg.to_string()));

        match &self.destinations {
            DestinationsConfig::MetadataCache { role, .. } => {
                if *role != MetadataCacheRole::PrimaryAndSecondary {
                    return invalid(
                        "access_mode=auto requires a metadata-cache destination with role=PRIMARY_AND_SECONDARY",
                    );
                }
            }
            DestinationsConfig::Static(_) => {
                return invalid(
                    "access_mode=auto requires a metadata-cache destination with role=PRIMARY_AND_SECONDARY",
                );
            }
        }
        if self.protocol != Protocol::Classic {
            return invalid("access_mode=auto requires protocol=classic");
        }
        if self.client_ssl_mode == ClientSslMode::Passthrough {
            return invalid("access_mode=auto can not be combined with client_ssl_mode=PASSTHROUGH");
        }
        if self.client_ssl_mode == ClientSslMode::Preferred
            && self.server_ssl_mode == ServerSslMode::AsClient
        {
            return invalid(
                "access_mode=auto can not be combined with client_ssl_mode=PREFERRED and server_ssl_mode=AS_CLIENT",
            );
        }
        if !self.connection_sharing {
            return invalid("access_mode=auto requires connection_sharing=1");
        }
        Ok(())
    }

    /// Registers the effective options in the process-wide dynamic config.
    pub fn expose(&self, dynamic_config: &DynamicConfig) {
        let id = SectionId::new("routing", Some(&self.name));
        dynamic_config.set_option_configured(&id, "protocol", self.protocol.as_ref());
        dynamic_config.set_option_configured(&id, "destinations", self.destinations.to_string());
        if let Some(bind_address) = &self.bind_address {
            dynamic_config.set_option_configured(&id, "bind_address", bind_address.as_str());
        }
        if self.bind_port != 0 {
            dynamic_config.set_option_configured(&id, "bind_port", self.bind_port as i64);
        }
        if let Some(socket) = &self.socket {
            dynamic_config.set_option_configured(&id, "socket", socket.as_str());
        }
        dynamic_config.set_option_configured(
            &id,
            "routing_strategy",
            self.routing_strategy.as_ref(),
        );
        dynamic_config.set_option_configured(&id, "client_ssl_mode", self.client_ssl_mode.as_ref());
        dynamic_config.set_option_configured(&id, "server_ssl_mode", self.server_ssl_mode.as_ref());
        dynamic_config.set_option_configured(
            &id,
            "server_ssl_verify",
            self.server_ssl_verify.as_ref(),
        );
        dynamic_config.set_option_configured(&id, "connection_sharing", self.connection_sharing);
        dynamic_config.set_option_configured(
            &id,
            "connection_sharing_delay",
            self.connection_sharing_delay.as_secs_f64(),
        );
        dynamic_config.set_option_configured(
            &id,
            "connect_retry_timeout",
            self.connect_retry_timeout.as_millis() as i64,
        );
        dynamic_config.set_option_configured(&id, "access_mode", self.access_mode.as_ref());
        dynamic_config.set_option_default(&id, "protocol", Protocol::Classic.as_ref());
        dynamic_config.set_option_default(&id, "connection_sharing", false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::config::Config;

    fn route_from(text: &str) -> Result<RouteConfig, ConfigError> {
        let mut config = Config::new();
        config.read_str(text).unwrap();
        let section = config.sections().next().unwrap();
        RouteConfig::from_section(&section)
    }

    #[test]
    fn minimal_route() {
        let route = route_from(
            "[routing:rw]\nbind_port = 6446\ndestinations = 127.0.0.1:3306\nclient_ssl_mode = DISABLED\nserver_ssl_mode = DISABLED\n",
        )
        .unwrap();
        assert_eq!(route.name, "rw");
        assert_eq!(route.bind_port, 6446);
        assert_eq!(route.routing_strategy, RoutingStrategy::RoundRobin);
        assert!(route.greeting_from_router());
    }

    #[test]
    fn unknown_option_is_rejected() {
        let err = route_from(
            "[routing]\nbind_port = 6446\ndestinations = 127.0.0.1\nnot_an_option = 1\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("unknown option not_an_option"));
    }

    #[test]
    fn missing_bind_and_socket_is_rejected() {
        let err = route_from("[routing]\ndestinations = 127.0.0.1\nclient_ssl_mode = DISABLED\n")
            .unwrap_err();
        assert!(err
            .to_string()
            .contains("either bind_address or socket option needs to be supplied"));
    }

    #[test]
    fn passthrough_requires_as_client() {
        let err = route_from(
            "[routing]\nbind_port = 6446\ndestinations = 127.0.0.1\nclient_ssl_mode = PASSTHROUGH\nserver_ssl_mode = REQUIRED\n",
        )
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "If client_ssl_mode is PASSTHROUGH, server_ssl_mode must be AS_CLIENT."
        );
    }

    #[test]
    fn passthrough_rejects_server_ssl_files() {
        let err = route_from(
            "[routing]\nbind_port = 6446\ndestinations = 127.0.0.1\nclient_ssl_mode = PASSTHROUGH\nserver_ssl_mode = AS_CLIENT\nserver_ssl_cert = /tmp/cert.pem\n",
        )
        .unwrap_err();
        assert!(err
            .to_string()
            .starts_with("client_ssl_mode=PASSTHROUGH can not be combined with server_ssl_cert="));
    }

    #[test]
    fn passthrough_rejects_require_enforce() {
        let err = route_from(
            "[routing]\nbind_port = 6446\ndestinations = 127.0.0.1\nclient_ssl_mode = PASSTHROUGH\nserver_ssl_mode = AS_CLIENT\nrouter_require_enforce = 1\n",
        )
        .unwrap_err();
        assert!(err
            .to_string()
            .contains("can not be combined with router_require_enforce"));
    }

    #[test]
    fn disabled_client_rejects_client_ca() {
        let err = route_from(
            "[routing]\nbind_port = 6446\ndestinations = 127.0.0.1\nclient_ssl_mode = DISABLED\nserver_ssl_mode = DISABLED\nclient_ssl_ca = /tmp/ca.pem\n",
        )
        .unwrap_err();
        assert!(err
            .to_string()
            .starts_with("client_ssl_mode=DISABLED can not be combined with client_ssl_ca="));
    }

    #[test]
    fn required_needs_cert_and_key() {
        let err = route_from(
            "[routing]\nbind_port = 6446\ndestinations = 127.0.0.1\nclient_ssl_mode = REQUIRED\nserver_ssl_mode = DISABLED\n",
        )
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "client_ssl_cert must be set, if client_ssl_mode is 'REQUIRED'."
        );
    }

    #[test]
    fn server_disabled_rejects_server_cert() {
        let err = route_from(
            "[routing]\nbind_port = 6446\ndestinations = 127.0.0.1\nclient_ssl_mode = DISABLED\nserver_ssl_mode = DISABLED\nserver_ssl_cert = /tmp/cert.pem\n",
        )
        .unwrap_err();
        assert!(err
            .to_string()
            .starts_with("server_ssl_mode=DISABLED can not be combined with server_ssl_cert="));
    }

    #[test]
    fn verify_needs_ca() {
        let err = route_from(
            "[routing]\nbind_port = 6446\ndestinations = 127.0.0.1\nclient_ssl_mode = DISABLED\nserver_ssl_mode = REQUIRED\nserver_ssl_verify = VERIFY_CA\n",
        )
        .unwrap_err();
        assert!(err
            .to_string()
            .starts_with("server_ssl_ca or server_ssl_capath must be set"));
    }

    #[test]
    fn round_robin_with_fallback_needs_metadata_cache() {
        let err = route_from(
            "[routing]\nbind_port = 6446\ndestinations = 127.0.0.1\nclient_ssl_mode = DISABLED\nserver_ssl_mode = DISABLED\nrouting_strategy = round-robin-with-fallback\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("requires metadata-cache"));
    }

    #[test]
    fn access_mode_auto_preconditions() {
        let err = route_from(
            "[routing]\nbind_port = 6446\ndestinations = metadata-cache://cluster/?role=PRIMARY_AND_SECONDARY\nclient_ssl_mode = DISABLED\nserver_ssl_mode = DISABLED\naccess_mode = auto\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("connection_sharing=1"));

        let route = route_from(
            "[routing]\nbind_port = 6446\ndestinations = metadata-cache://cluster/?role=PRIMARY_AND_SECONDARY\nclient_ssl_mode = DISABLED\nserver_ssl_mode = DISABLED\naccess_mode = auto\nconnection_sharing = 1\n",
        )
        .unwrap();
        assert_eq!(route.access_mode, AccessMode::Auto);
    }

    #[test]
    fn protocol_x_rejects_ssl_files() {
        let err = route_from(
            "[routing]\nbind_port = 6446\ndestinations = 127.0.0.1\nprotocol = x\nclient_ssl_mode = DISABLED\nserver_ssl_mode = DISABLED\nserver_ssl_cert = /tmp/c.pem\n",
        )
        .unwrap_err();
        assert!(err.to_string().starts_with("protocol=x can not be combined"));
    }
}
