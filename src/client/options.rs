use super::connection::RecoveryKey;
use crate::auth::{ApiKey, AuthCallback, AuthMethod, ConnectAuth, TokenDetails, TokenParams};
use crate::types::{RealtimeError, Result, constants::*};
use std::collections::BTreeMap;
use std::time::Duration;
use url::Url;

/// User supplied client options. Every `None` falls back to a default when
/// the options are resolved into a [`ClientConfig`].
#[derive(Debug, Clone, Default)]
pub struct RealtimeClientOptions {
    /// Full API key, `name:secret`
    pub key: Option<String>,
    pub token: Option<String>,
    pub token_details: Option<TokenDetails>,
    pub auth_callback: Option<AuthCallback>,
    pub auth_url: Option<String>,
    pub auth_method: AuthMethod,
    pub auth_headers: Vec<(String, String)>,
    pub auth_params: Vec<(String, String)>,
    /// Always use token auth, even when a key is configured
    pub use_token_auth: bool,
    pub default_token_params: Option<TokenParams>,
    pub client_id: Option<String>,

    pub environment: Option<String>,
    pub realtime_host: Option<String>,
    pub rest_host: Option<String>,
    pub port: Option<u16>,
    pub tls_port: Option<u16>,
    pub no_tls: bool,
    pub fallback_hosts: Option<Vec<String>>,
    /// Keep the default fallback hosts even with a custom host or port
    pub fallback_hosts_use_default: bool,

    /// Don't connect on construction
    pub no_connect: bool,
    /// Ask the server not to echo our own messages back
    pub no_echo: bool,
    /// Fail publishes immediately instead of queueing them while not connected
    pub no_queueing: bool,
    /// Give every published message a client generated id
    pub idempotent_publishing: bool,
    /// Recovery key of a previous client instance
    pub recover: Option<String>,
    pub transport_params: BTreeMap<String, String>,

    pub disconnected_retry_timeout: Option<Duration>,
    pub suspended_retry_timeout: Option<Duration>,
    /// Time spent disconnected before the connection is suspended
    pub connection_state_ttl: Option<Duration>,
    pub fallback_retry_timeout: Option<Duration>,
    pub realtime_request_timeout: Option<Duration>,
    /// Time allowed for the close handshake
    pub disconnect_timeout: Option<Duration>,
    pub http_request_timeout: Option<Duration>,
    pub http_max_retry_count: Option<usize>,
    pub max_queued_messages: Option<usize>,
    pub credential_retry_limit: Option<u32>,
}

/// Immutable, fully resolved configuration shared by every component.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub key: Option<ApiKey>,
    pub token: Option<String>,
    pub token_details: Option<TokenDetails>,
    pub auth_callback: Option<AuthCallback>,
    pub auth_url: Option<String>,
    pub auth_method: AuthMethod,
    pub auth_headers: Vec<(String, String)>,
    pub auth_params: Vec<(String, String)>,
    pub use_token_auth: bool,
    pub default_token_params: TokenParams,
    pub client_id: Option<String>,

    pub realtime_host: String,
    pub rest_host: String,
    pub fallback_hosts: Vec<String>,
    pub port: u16,
    pub tls_port: u16,
    pub no_tls: bool,

    pub no_connect: bool,
    pub no_echo: bool,
    pub no_queueing: bool,
    pub idempotent_publishing: bool,
    pub recover: Option<RecoveryKey>,
    pub transport_params: BTreeMap<String, String>,

    pub disconnected_retry_timeout: Duration,
    pub suspended_retry_timeout: Duration,
    pub connection_state_ttl: Duration,
    pub fallback_retry_timeout: Duration,
    pub realtime_request_timeout: Duration,
    pub disconnect_timeout: Duration,
    pub http_request_timeout: Duration,
    pub http_max_retry_count: usize,
    pub max_queued_messages: usize,
    pub credential_retry_limit: u32,
}

/// Default fallback hosts, optionally for a named environment.
pub fn default_fallback_hosts(environment: Option<&str>) -> Vec<String> {
    FALLBACK_LETTERS
        .iter()
        .map(|letter| match environment {
            Some(env) => format!("{env}-{letter}-fallback.{FALLBACK_DOMAIN}"),
            None => format!("{letter}.{FALLBACK_DOMAIN}"),
        })
        .collect()
}

impl ClientConfig {
    /// Validates `options` and merges them with the defaults.
    pub fn resolve(options: &RealtimeClientOptions) -> Result<Self> {
        let has_external_auth = options.token.is_some()
            || options.token_details.is_some()
            || options.auth_callback.is_some()
            || options.auth_url.is_some();
        if options.key.is_none() && !has_external_auth {
            return Err(RealtimeError::Config(
                "a key, token, auth callback or auth URL is required".to_string(),
            ));
        }

        let key = options.key.as_deref().map(str::parse::<ApiKey>).transpose()?;

        let recover = options
            .recover
            .as_deref()
            .filter(|key| !key.is_empty())
            .map(str::parse::<RecoveryKey>)
            .transpose()?;

        let environment = options
            .environment
            .as_deref()
            .filter(|env| !env.is_empty() && *env != PRODUCTION_ENVIRONMENT);

        let prefixed = |host: &str| match environment {
            Some(env) => format!("{env}-{host}"),
            None => host.to_string(),
        };
        let realtime_host = options
            .realtime_host
            .clone()
            .unwrap_or_else(|| prefixed(REALTIME_HOST));
        let rest_host = options
            .rest_host
            .clone()
            .unwrap_or_else(|| prefixed(REST_HOST));

        let custom_endpoint = options.realtime_host.is_some()
            || options.rest_host.is_some()
            || options.port.is_some()
            || options.tls_port.is_some();
        let fallback_hosts = match &options.fallback_hosts {
            Some(hosts) => hosts.clone(),
            None if options.fallback_hosts_use_default => default_fallback_hosts(None),
            None if custom_endpoint => Vec::new(),
            None => default_fallback_hosts(environment),
        };

        let realtime_request_timeout = options
            .realtime_request_timeout
            .unwrap_or(REALTIME_REQUEST_TIMEOUT);
        if realtime_request_timeout.is_zero() {
            return Err(RealtimeError::Config(
                "realtime_request_timeout must be greater than zero".to_string(),
            ));
        }

        let mut default_token_params = options.default_token_params.clone().unwrap_or_default();
        if default_token_params.ttl.is_none() {
            default_token_params.ttl = Some(DEFAULT_TOKEN_TTL.as_millis() as u64);
        }

        Ok(Self {
            key,
            token: options.token.clone(),
            token_details: options.token_details.clone(),
            auth_callback: options.auth_callback.clone(),
            auth_url: options.auth_url.clone(),
            auth_method: options.auth_method,
            auth_headers: options.auth_headers.clone(),
            auth_params: options.auth_params.clone(),
            use_token_auth: options.use_token_auth,
            default_token_params,
            client_id: options.client_id.clone(),
            realtime_host,
            rest_host,
            fallback_hosts,
            port: options.port.unwrap_or(DEFAULT_PORT),
            tls_port: options.tls_port.unwrap_or(DEFAULT_TLS_PORT),
            no_tls: options.no_tls,
            no_connect: options.no_connect,
            no_echo: options.no_echo,
            no_queueing: options.no_queueing,
            idempotent_publishing: options.idempotent_publishing,
            recover,
            transport_params: options.transport_params.clone(),
            disconnected_retry_timeout: options
                .disconnected_retry_timeout
                .unwrap_or(DISCONNECTED_RETRY_TIMEOUT),
            suspended_retry_timeout: options
                .suspended_retry_timeout
                .unwrap_or(SUSPENDED_RETRY_TIMEOUT),
            connection_state_ttl: options.connection_state_ttl.unwrap_or(TIMEOUT_SUSPENDED),
            fallback_retry_timeout: options
                .fallback_retry_timeout
                .unwrap_or(FALLBACK_RETRY_TIMEOUT),
            realtime_request_timeout,
            disconnect_timeout: options.disconnect_timeout.unwrap_or(TIMEOUT_DISCONNECT),
            http_request_timeout: options
                .http_request_timeout
                .unwrap_or(REALTIME_REQUEST_TIMEOUT),
            http_max_retry_count: options.http_max_retry_count.unwrap_or(HTTP_MAX_RETRY_COUNT),
            max_queued_messages: options.max_queued_messages.unwrap_or(MAX_QUEUED_MESSAGES),
            credential_retry_limit: options
                .credential_retry_limit
                .unwrap_or(CREDENTIAL_RETRY_LIMIT),
        })
    }

    fn base_url(&self, secure_scheme: &str, plain_scheme: &str, host: &str) -> String {
        if self.no_tls {
            format!("{plain_scheme}://{host}:{}", self.port)
        } else {
            format!("{secure_scheme}://{host}:{}", self.tls_port)
        }
    }

    pub fn realtime_url(&self, host: &str) -> String {
        self.base_url("wss", "ws", host)
    }

    pub fn rest_url(&self, host: &str) -> String {
        self.base_url("https", "http", host)
    }

    /// Full URL for a connection attempt against `host`.
    pub fn connect_url(&self, host: &str, auth: &ConnectAuth, continuity: &Continuity) -> Result<Url> {
        let mut url = Url::parse(&self.realtime_url(host))?;
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("v", PROTOCOL_VERSION)
                .append_pair("format", PROTOCOL_FORMAT)
                .append_pair("echo", if self.no_echo { "false" } else { "true" });

            match auth {
                ConnectAuth::Key(key) => query.append_pair("key", key),
                ConnectAuth::Token(token) => query.append_pair("access_token", token),
            };
            if let Some(client_id) = &self.client_id {
                query.append_pair("clientId", client_id);
            }

            match continuity {
                Continuity::Fresh => {}
                Continuity::Resume {
                    connection_key,
                    connection_serial,
                } => {
                    query
                        .append_pair("resume", connection_key)
                        .append_pair("connectionSerial", &connection_serial.to_string());
                }
                Continuity::Recover(key) => {
                    query
                        .append_pair("recover", &key.connection_key)
                        .append_pair("connectionSerial", &key.connection_serial.to_string());
                }
            }

            for (name, value) in &self.transport_params {
                query.append_pair(name, value);
            }
        }
        Ok(url)
    }
}

/// Whether a connection attempt continues an earlier session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Continuity {
    Fresh,
    Resume {
        connection_key: String,
        connection_serial: i64,
    },
    Recover(RecoveryKey),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_key() -> RealtimeClientOptions {
        RealtimeClientOptions {
            key: Some("app.key:secret".to_string()),
            ..Default::default()
        }
    }

    fn query(url: &Url) -> Vec<(String, String)> {
        url.query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect()
    }

    #[test]
    fn test_defaults() {
        let config = ClientConfig::resolve(&with_key()).unwrap();
        assert_eq!(config.realtime_host, "realtime.ably.io");
        assert_eq!(config.rest_host, "rest.ably.io");
        assert_eq!(config.fallback_hosts, default_fallback_hosts(None));
        assert_eq!(config.fallback_hosts[0], "a.ably-realtime.com");
        assert_eq!(config.disconnected_retry_timeout, Duration::from_secs(15));
        assert_eq!(config.suspended_retry_timeout, Duration::from_secs(30));
        assert_eq!(config.connection_state_ttl, Duration::from_secs(120));
        assert_eq!(config.fallback_retry_timeout, Duration::from_secs(600));
        assert_eq!(config.realtime_request_timeout, Duration::from_secs(10));
        assert_eq!(config.disconnect_timeout, Duration::from_secs(30));
        assert_eq!(config.http_max_retry_count, 3);
        assert_eq!(config.max_queued_messages, 1000);
        assert_eq!(config.key.as_ref().map(|k| k.name.as_str()), Some("app.key"));
    }

    #[test]
    fn test_missing_auth_is_rejected() {
        let err = ClientConfig::resolve(&RealtimeClientOptions::default()).unwrap_err();
        assert!(matches!(err, RealtimeError::Config(_)));
    }

    #[test]
    fn test_malformed_key_is_rejected() {
        let options = RealtimeClientOptions {
            key: Some("just-a-name".to_string()),
            ..Default::default()
        };
        assert!(ClientConfig::resolve(&options).is_err());
    }

    #[test]
    fn test_environment_prefixes_hosts() {
        let options = RealtimeClientOptions {
            environment: Some("sandbox".to_string()),
            ..with_key()
        };
        let config = ClientConfig::resolve(&options).unwrap();
        assert_eq!(config.realtime_host, "sandbox-realtime.ably.io");
        assert_eq!(config.rest_host, "sandbox-rest.ably.io");
        assert_eq!(
            config.fallback_hosts,
            vec![
                "sandbox-a-fallback.ably-realtime.com",
                "sandbox-b-fallback.ably-realtime.com",
                "sandbox-c-fallback.ably-realtime.com",
                "sandbox-d-fallback.ably-realtime.com",
                "sandbox-e-fallback.ably-realtime.com",
            ]
        );
    }

    #[test]
    fn test_production_environment_uses_default_hosts() {
        let options = RealtimeClientOptions {
            environment: Some("production".to_string()),
            ..with_key()
        };
        let config = ClientConfig::resolve(&options).unwrap();
        assert_eq!(config.realtime_host, "realtime.ably.io");
        assert_eq!(config.fallback_hosts, default_fallback_hosts(None));
    }

    #[test]
    fn test_custom_host_or_port_disables_fallbacks() {
        let custom_host = RealtimeClientOptions {
            realtime_host: Some("localhost".to_string()),
            ..with_key()
        };
        assert!(ClientConfig::resolve(&custom_host).unwrap().fallback_hosts.is_empty());

        let custom_port = RealtimeClientOptions {
            port: Some(8080),
            ..with_key()
        };
        assert!(ClientConfig::resolve(&custom_port).unwrap().fallback_hosts.is_empty());

        let forced = RealtimeClientOptions {
            realtime_host: Some("localhost".to_string()),
            fallback_hosts_use_default: true,
            ..with_key()
        };
        assert_eq!(
            ClientConfig::resolve(&forced).unwrap().fallback_hosts,
            default_fallback_hosts(None)
        );
    }

    #[test]
    fn test_urls_honour_tls_settings() {
        let config = ClientConfig::resolve(&with_key()).unwrap();
        assert_eq!(config.realtime_url("h"), "wss://h:443");
        assert_eq!(config.rest_url("h"), "https://h:443");

        let plain = ClientConfig::resolve(&RealtimeClientOptions {
            no_tls: true,
            port: Some(8080),
            ..with_key()
        })
        .unwrap();
        assert_eq!(plain.realtime_url("h"), "ws://h:8080");
        assert_eq!(plain.rest_url("h"), "http://h:8080");
    }

    #[test]
    fn test_connect_url_parameters() {
        let mut transport_params = BTreeMap::new();
        transport_params.insert("heartbeats".to_string(), "true".to_string());
        let config = ClientConfig::resolve(&RealtimeClientOptions {
            no_echo: true,
            client_id: Some("alice".to_string()),
            transport_params,
            ..with_key()
        })
        .unwrap();

        let url = config
            .connect_url(
                "realtime.ably.io",
                &ConnectAuth::Token("tok".to_string()),
                &Continuity::Resume {
                    connection_key: "ck".to_string(),
                    connection_serial: 7,
                },
            )
            .unwrap();

        assert_eq!(url.scheme(), "wss");
        assert_eq!(url.host_str(), Some("realtime.ably.io"));
        assert_eq!(
            query(&url),
            vec![
                ("v".to_string(), "1.2".to_string()),
                ("format".to_string(), "json".to_string()),
                ("echo".to_string(), "false".to_string()),
                ("access_token".to_string(), "tok".to_string()),
                ("clientId".to_string(), "alice".to_string()),
                ("resume".to_string(), "ck".to_string()),
                ("connectionSerial".to_string(), "7".to_string()),
                ("heartbeats".to_string(), "true".to_string()),
            ]
        );
    }

    #[test]
    fn test_recover_option_is_parsed_into_connect_url() {
        let config = ClientConfig::resolve(&RealtimeClientOptions {
            recover: Some("conn-key:5:2".to_string()),
            ..with_key()
        })
        .unwrap();
        let recover = config.recover.clone().unwrap();
        assert_eq!(recover.msg_serial, 2);

        let url = config
            .connect_url(
                "h",
                &ConnectAuth::Key("app.key:secret".to_string()),
                &Continuity::Recover(recover),
            )
            .unwrap();
        let pairs = query(&url);
        assert!(pairs.contains(&("recover".to_string(), "conn-key".to_string())));
        assert!(pairs.contains(&("connectionSerial".to_string(), "5".to_string())));
        assert!(pairs.contains(&("key".to_string(), "app.key:secret".to_string())));
    }

    #[test]
    fn test_invalid_recover_key_is_rejected() {
        let options = RealtimeClientOptions {
            recover: Some("garbage".to_string()),
            ..with_key()
        };
        assert!(ClientConfig::resolve(&options).is_err());
    }
}
