use std::time::Duration;

const DEFAULT_API_HOST: &str = "api.mixpanel.com";
const DEFAULT_REQUEST_TIMEOUT_IN_SECONDS: u64 = 10;
const DEFAULT_POLLING_INTERVAL_IN_SECONDS: u64 = 60;

/// Options shared by the local and remote providers.
#[derive(Clone, Debug)]
pub struct FlagsConfig {
    /// Host name of the flags API. A bare host is requested over HTTPS; a
    /// value carrying a scheme (e.g. for a proxy or a test server) is used
    /// as-is.
    pub api_host: String,
    pub request_timeout_in_seconds: u64,
}

impl Default for FlagsConfig {
    fn default() -> Self {
        FlagsConfig {
            api_host: DEFAULT_API_HOST.to_string(),
            request_timeout_in_seconds: DEFAULT_REQUEST_TIMEOUT_IN_SECONDS,
        }
    }
}

impl FlagsConfig {
    pub(crate) fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_in_seconds)
    }
}

/// Options for the local provider, which evaluates from a cached copy of the
/// project's flag definitions.
#[derive(Clone, Debug)]
pub struct LocalFlagsConfig {
    pub flags: FlagsConfig,
    /// Whether `start` also begins a background refresh loop after the
    /// initial fetch.
    pub enable_polling: bool,
    pub polling_interval_in_seconds: u64,
}

impl Default for LocalFlagsConfig {
    fn default() -> Self {
        LocalFlagsConfig {
            flags: FlagsConfig::default(),
            enable_polling: true,
            polling_interval_in_seconds: DEFAULT_POLLING_INTERVAL_IN_SECONDS,
        }
    }
}

impl LocalFlagsConfig {
    pub(crate) fn polling_interval(&self) -> Duration {
        Duration::from_secs(self.polling_interval_in_seconds)
    }
}

/// Options for the remote provider, which delegates every evaluation to the
/// server.
#[derive(Clone, Debug, Default)]
pub struct RemoteFlagsConfig {
    pub flags: FlagsConfig,
}
