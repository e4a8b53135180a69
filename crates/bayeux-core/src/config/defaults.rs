/// Bayeux protocol version this client speaks
pub const DEFAULT_VERSION: &str = "1.0";

/// Oldest protocol version this client accepts from a server
pub const DEFAULT_MINIMUM_VERSION: &str = "0.9";

/// Expected network latency added to every request timeout (milliseconds)
pub const DEFAULT_EXPECTED_NETWORK_DELAY_MS: u64 = 10_000;

/// Step added to the backoff after each failure (milliseconds)
pub const DEFAULT_BACKOFF_INCREMENT_MS: u64 = 1_000;

/// Upper bound for the backoff (milliseconds)
pub const DEFAULT_MAX_BACKOFF_MS: u64 = 60_000;

/// Delay before the REST transport re-subscribes after losing its channel (milliseconds)
pub const DEFAULT_AUTO_RECONNECT_TIME_MS: u64 = 3_000;

/// Accept header sent by the REST transport
pub const DEFAULT_ACCEPT_TYPE: &str = "application/rest+json,application/http;q=0.9,*/*;q=0.7";
