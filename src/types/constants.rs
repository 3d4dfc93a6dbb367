use std::time::Duration;

/// Primary realtime host
pub const REALTIME_HOST: &str = "realtime.ably.io";

/// Primary REST host (token requests)
pub const REST_HOST: &str = "rest.ably.io";

/// Domain used for environment specific fallback hosts
pub const FALLBACK_DOMAIN: &str = "ably-realtime.com";

/// Letters of the five fallback hosts
pub const FALLBACK_LETTERS: [&str; 5] = ["a", "b", "c", "d", "e"];

/// Environment name that maps onto the default hosts
pub const PRODUCTION_ENVIRONMENT: &str = "production";

/// Protocol version sent on connect
pub const PROTOCOL_VERSION: &str = "1.2";

/// Wire format requested from the server
pub const PROTOCOL_FORMAT: &str = "json";

/// Protocol name handed to the transport when dialing
pub const PROTOCOL_JSON: &str = "application/json";

/// Default ports
pub const DEFAULT_PORT: u16 = 80;
pub const DEFAULT_TLS_PORT: u16 = 443;

/// Maximum number of fallback hosts tried per REST request
pub const HTTP_MAX_RETRY_COUNT: usize = 3;

/// Default timeouts
pub const DISCONNECTED_RETRY_TIMEOUT: Duration = Duration::from_secs(15);
pub const SUSPENDED_RETRY_TIMEOUT: Duration = Duration::from_secs(30);
pub const TIMEOUT_SUSPENDED: Duration = Duration::from_secs(120);
pub const FALLBACK_RETRY_TIMEOUT: Duration = Duration::from_secs(600);
pub const REALTIME_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
pub const TIMEOUT_DISCONNECT: Duration = Duration::from_secs(30);

/// Default token lifetime requested from credential providers
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(60 * 60);

/// Credential backoff intervals (milliseconds)
pub const CREDENTIAL_RETRY_INTERVALS: [u64; 4] = [1000, 2000, 5000, 10000];

/// Consecutive credential failures tolerated before the connection fails
pub const CREDENTIAL_RETRY_LIMIT: u32 = 3;

/// Max outbound queue size (messages, across all channels)
pub const MAX_QUEUED_MESSAGES: usize = 1000;

/// Buffer of each channel subscription receiver
pub const SUBSCRIPTION_BUFFER: usize = 100;

/// Error codes carried in `ErrorInfo`
pub mod error_codes {
    pub const BAD_REQUEST: u32 = 40000;
    pub const INVALID_CREDENTIALS: u32 = 40101;
    pub const TOKEN_ERROR_START: u32 = 40140;
    pub const TOKEN_ERROR_END: u32 = 40149;
    pub const TOKEN_EXPIRED: u32 = 40142;
    pub const CLIENT_ERROR_END: u32 = 49999;
    pub const INTERNAL_ERROR: u32 = 50000;
    pub const TIMEOUT: u32 = 50003;
    pub const CONNECTION_FAILED: u32 = 80000;
    pub const CONNECTION_SUSPENDED: u32 = 80002;
    pub const DISCONNECTED: u32 = 80003;
    pub const CONNECTION_CLOSED: u32 = 80017;
    pub const AUTH_CALLBACK_FAILED: u32 = 80019;
    pub const CHANNEL_OPERATION_FAILED: u32 = 90001;
    pub const CHANNEL_NOT_ATTACHED: u32 = 90002;
    pub const QUEUE_FULL: u32 = 90003;
    pub const CANCELLED: u32 = 80099;
}
