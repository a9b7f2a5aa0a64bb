use crate::error::{ProxyError, Result};
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Listener and front-end configuration
    pub proxy: ProxyServerConfig,
    /// Remote worker configuration
    pub workers: WorkerConfig,
    /// Large payload transport configuration
    pub payload: PayloadConfig,
    /// TLS interception configuration
    pub mitm: MitmConfig,
    /// Logging configuration
    pub log: LogConfig,
}

#[derive(Debug, Clone)]
pub struct ProxyServerConfig {
    /// Port for the proxy server (default: 1080)
    pub port: u16,
    /// Host to bind to (default: 127.0.0.1)
    pub host: String,
    /// Dial targets directly instead of using remote functions
    pub run_local: bool,
    /// Timeout for dialing CONNECT targets, in seconds
    pub connect_timeout: u64,
    /// Close plain tunnels after this many idle seconds
    pub tunnel_idle_timeout: u64,
    /// Replace the outbound User-Agent header
    pub override_user_agent: bool,
    /// Log every proxied request and response
    pub verbose: bool,
    /// Seconds between stats summaries (0 disables)
    pub stats_interval: u64,
}

/// How requests are scheduled onto remote functions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchStrategy {
    /// One invocation per request
    #[default]
    ShortLived,
    /// Persistent workers draining a shared queue
    LongLived,
    /// Persistent workers with short-lived overflow
    Hybrid,
}

impl DispatchStrategy {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "short" | "short_lived" | "short-lived" => Some(Self::ShortLived),
            "long" | "long_lived" | "long-lived" => Some(Self::LongLived),
            "hybrid" => Some(Self::Hybrid),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ShortLived => "short",
            Self::LongLived => "long",
            Self::Hybrid => "hybrid",
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Remote functions, by name or URL
    pub functions: Vec<String>,
    /// Base URL of the function invocation API
    pub invoke_endpoint: Url,
    /// Scheduling strategy
    pub strategy: DispatchStrategy,
    /// Maximum concurrently active remote invocations
    pub max_workers: usize,
    /// Persistent workers started in hybrid mode
    pub persistent_workers: usize,
    /// Queue depth above which hybrid mode overflows to short-lived invocations
    pub overflow_threshold: usize,
    /// Timeout for a single remote invocation, in seconds
    pub invoke_timeout: u64,
    /// Total time a long-lived request may wait for its result, in seconds
    pub queue_timeout: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadMode {
    None,
    ObjectStore,
    Queue,
}

impl PayloadMode {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "" | "none" => Some(Self::None),
            "s3" | "object-store" | "object_store" => Some(Self::ObjectStore),
            "sqs" | "queue" => Some(Self::Queue),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PayloadConfig {
    pub mode: PayloadMode,
    pub s3_bucket: Option<String>,
    pub s3_region: String,
    /// Custom S3-compatible endpoint; AWS is used when unset
    pub s3_endpoint: Option<String>,
    /// Keep fetched objects instead of deleting them
    pub s3_retain: bool,
    /// Base URL of the queue gateway. Messages are fetched with
    /// `GET {queue_url}/messages/{id}` and acknowledged with `DELETE` on the
    /// same path; this is not the SQS API.
    pub queue_url: Option<Url>,
}

#[derive(Debug, Clone)]
pub struct MitmConfig {
    pub enabled: bool,
    pub ca_cert_path: PathBuf,
    pub ca_key_path: PathBuf,
    /// Timeout for the client-side TLS handshake, in seconds
    pub handshake_timeout: u64,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level (debug, info, warn, error)
    pub level: String,
    /// Output format (json, pretty)
    pub format: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let max_workers: usize = parse_env("PROXY_MAX_WORKERS", "5")?;
        let strategy_raw = get_env_or("PROXY_DISPATCH_STRATEGY", "short");
        let strategy = DispatchStrategy::from_str(&strategy_raw).ok_or_else(|| {
            ProxyError::InvalidConfig(format!(
                "PROXY_DISPATCH_STRATEGY must be short, long or hybrid, got {}",
                strategy_raw
            ))
        })?;
        let default_persistent = (max_workers / 2).max(1).to_string();

        let payload_raw = get_env_or("PROXY_PAYLOAD_TRANSPORT", "none");
        let payload_mode = PayloadMode::from_str(&payload_raw).ok_or_else(|| {
            ProxyError::InvalidConfig(format!(
                "PROXY_PAYLOAD_TRANSPORT must be none, s3 or queue (alias sqs), got {}",
                payload_raw
            ))
        })?;

        let invoke_endpoint = Url::parse(&get_env_or(
            "PROXY_INVOKE_ENDPOINT",
            "http://127.0.0.1:9001",
        ))
        .map_err(|e| {
            ProxyError::InvalidConfig(format!("PROXY_INVOKE_ENDPOINT must be a valid URL: {}", e))
        })?;

        let queue_url = optional_env("PROXY_QUEUE_URL")
            .map(|raw| {
                Url::parse(&raw).map_err(|e| {
                    ProxyError::InvalidConfig(format!("PROXY_QUEUE_URL must be a valid URL: {}", e))
                })
            })
            .transpose()?;

        Ok(Config {
            proxy: ProxyServerConfig {
                port: get_env_or("PROXY_PORT", "1080").parse().map_err(|_| {
                    ProxyError::InvalidConfig("PROXY_PORT must be a valid port number".into())
                })?,
                host: get_env_or("PROXY_HOST", "127.0.0.1"),
                run_local: parse_env("PROXY_RUN_LOCAL", "false")?,
                connect_timeout: parse_env("PROXY_CONNECT_TIMEOUT", "10")?,
                tunnel_idle_timeout: parse_env("PROXY_TUNNEL_IDLE_TIMEOUT", "60")?,
                override_user_agent: parse_env("PROXY_OVERRIDE_USER_AGENT", "true")?,
                verbose: parse_env("PROXY_VERBOSE", "false")?,
                stats_interval: parse_env("PROXY_STATS_INTERVAL", "0")?,
            },
            workers: WorkerConfig {
                functions: get_env_or("PROXY_FUNCTIONS", "")
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
                invoke_endpoint,
                strategy,
                max_workers,
                persistent_workers: parse_env("PROXY_PERSISTENT_WORKERS", &default_persistent)?,
                overflow_threshold: parse_env("PROXY_OVERFLOW_THRESHOLD", "0")?,
                invoke_timeout: parse_env("PROXY_INVOKE_TIMEOUT", "30")?,
                queue_timeout: parse_env("PROXY_QUEUE_TIMEOUT", "60")?,
            },
            payload: PayloadConfig {
                mode: payload_mode,
                s3_bucket: optional_env("PROXY_S3_BUCKET"),
                s3_region: get_env_or("PROXY_S3_REGION", "us-east-1"),
                s3_endpoint: optional_env("PROXY_S3_ENDPOINT"),
                s3_retain: parse_env("PROXY_S3_RETAIN", "false")?,
                queue_url,
            },
            mitm: MitmConfig {
                enabled: parse_env("PROXY_MITM_ENABLED", "false")?,
                ca_cert_path: PathBuf::from(get_env_or("PROXY_MITM_CA_CERT", "mitm.ca.pem")),
                ca_key_path: PathBuf::from(get_env_or("PROXY_MITM_CA_KEY", "mitm.key.pem")),
                handshake_timeout: parse_env("PROXY_TLS_HANDSHAKE_TIMEOUT", "10")?,
            },
            log: LogConfig {
                level: get_env_or("LOG_LEVEL", "info"),
                format: get_env_or("LOG_FORMAT", "pretty"),
            },
        })
    }

    /// Reject configurations the proxy cannot start with
    pub fn validate(&self) -> Result<()> {
        if !self.proxy.run_local && self.workers.functions.is_empty() {
            return Err(ProxyError::InvalidConfig(
                "PROXY_FUNCTIONS is required unless PROXY_RUN_LOCAL is set".into(),
            ));
        }
        if self.workers.max_workers == 0 {
            return Err(ProxyError::InvalidConfig(
                "PROXY_MAX_WORKERS must be at least 1".into(),
            ));
        }
        if self.workers.strategy == DispatchStrategy::Hybrid
            && (self.workers.persistent_workers == 0
                || self.workers.persistent_workers > self.workers.max_workers)
        {
            return Err(ProxyError::InvalidConfig(format!(
                "PROXY_PERSISTENT_WORKERS must be between 1 and {}",
                self.workers.max_workers
            )));
        }
        match self.payload.mode {
            PayloadMode::ObjectStore if self.payload.s3_bucket.is_none() => {
                return Err(ProxyError::InvalidConfig(
                    "PROXY_S3_BUCKET is required for the s3 payload transport".into(),
                ))
            }
            PayloadMode::Queue if self.payload.queue_url.is_none() => {
                return Err(ProxyError::InvalidConfig(
                    "PROXY_QUEUE_URL (queue gateway base URL) is required for the queue payload transport"
                        .into(),
                ))
            }
            _ => {}
        }
        Ok(())
    }
}

impl WorkerConfig {
    pub fn invoke_timeout(&self) -> Duration {
        Duration::from_secs(self.invoke_timeout.max(1))
    }

    pub fn queue_timeout(&self) -> Duration {
        Duration::from_secs(self.queue_timeout.max(1))
    }
}

/// Get environment variable with a default value
fn get_env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn optional_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_env<T: std::str::FromStr>(key: &str, default: &str) -> Result<T> {
    get_env_or(key, default)
        .trim()
        .parse()
        .map_err(|_| ProxyError::InvalidConfig(format!("{} has an invalid value", key)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    const CONFIG_ENV_KEYS: &[&str] = &[
        "PROXY_PORT",
        "PROXY_HOST",
        "PROXY_RUN_LOCAL",
        "PROXY_CONNECT_TIMEOUT",
        "PROXY_TUNNEL_IDLE_TIMEOUT",
        "PROXY_OVERRIDE_USER_AGENT",
        "PROXY_VERBOSE",
        "PROXY_STATS_INTERVAL",
        "PROXY_FUNCTIONS",
        "PROXY_INVOKE_ENDPOINT",
        "PROXY_DISPATCH_STRATEGY",
        "PROXY_MAX_WORKERS",
        "PROXY_PERSISTENT_WORKERS",
        "PROXY_OVERFLOW_THRESHOLD",
        "PROXY_INVOKE_TIMEOUT",
        "PROXY_QUEUE_TIMEOUT",
        "PROXY_PAYLOAD_TRANSPORT",
        "PROXY_S3_BUCKET",
        "PROXY_S3_REGION",
        "PROXY_S3_ENDPOINT",
        "PROXY_S3_RETAIN",
        "PROXY_QUEUE_URL",
        "PROXY_MITM_ENABLED",
        "PROXY_MITM_CA_CERT",
        "PROXY_MITM_CA_KEY",
        "PROXY_TLS_HANDSHAKE_TIMEOUT",
        "LOG_LEVEL",
        "LOG_FORMAT",
    ];

    struct EnvGuard {
        saved: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new(keys: &[&str]) -> Self {
            let saved = keys
                .iter()
                .map(|&key| {
                    let old = env::var(key).ok();
                    env::remove_var(key);
                    (key.to_string(), old)
                })
                .collect();

            Self { saved }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.saved.drain(..) {
                match value {
                    Some(v) => env::set_var(key, v),
                    None => env::remove_var(key),
                }
            }
        }
    }

    #[test]
    fn test_config_from_env_defaults() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        let config = Config::from_env().unwrap();

        assert_eq!(config.proxy.port, 1080);
        assert_eq!(config.proxy.host, "127.0.0.1");
        assert!(!config.proxy.run_local);
        assert!(config.proxy.override_user_agent);
        assert!(config.workers.functions.is_empty());
        assert_eq!(config.workers.strategy, DispatchStrategy::ShortLived);
        assert_eq!(config.workers.max_workers, 5);
        assert_eq!(config.workers.persistent_workers, 2);
        assert_eq!(config.payload.mode, PayloadMode::None);
        assert!(!config.mitm.enabled);
        assert_eq!(config.mitm.ca_cert_path, PathBuf::from("mitm.ca.pem"));
    }

    #[test]
    fn test_config_from_env_overrides() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        env::set_var("PROXY_PORT", "9000");
        env::set_var("PROXY_FUNCTIONS", "proxy-a, proxy-b ,https://fn.example/");
        env::set_var("PROXY_DISPATCH_STRATEGY", "hybrid");
        env::set_var("PROXY_MAX_WORKERS", "8");
        env::set_var("PROXY_PAYLOAD_TRANSPORT", "s3");
        env::set_var("PROXY_S3_BUCKET", "proxy-bodies");

        let config = Config::from_env().unwrap();

        assert_eq!(config.proxy.port, 9000);
        assert_eq!(
            config.workers.functions,
            vec![
                "proxy-a".to_string(),
                "proxy-b".to_string(),
                "https://fn.example/".to_string()
            ]
        );
        assert_eq!(config.workers.strategy, DispatchStrategy::Hybrid);
        assert_eq!(config.workers.persistent_workers, 4);
        assert_eq!(config.payload.mode, PayloadMode::ObjectStore);
        assert_eq!(config.payload.s3_bucket.as_deref(), Some("proxy-bodies"));
        config.validate().unwrap();
    }

    #[test]
    fn test_config_from_env_invalid_port() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        env::set_var("PROXY_PORT", "not-a-port");
        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ProxyError::InvalidConfig(_)));
    }

    #[test]
    fn test_config_rejects_unknown_strategy() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        env::set_var("PROXY_DISPATCH_STRATEGY", "forever");
        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ProxyError::InvalidConfig(_)));
    }

    #[test]
    fn test_validate_requires_functions_unless_local() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        let config = Config::from_env().unwrap();
        assert!(matches!(
            config.validate(),
            Err(ProxyError::InvalidConfig(_))
        ));

        env::set_var("PROXY_RUN_LOCAL", "true");
        let config = Config::from_env().unwrap();
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_requires_transport_identifiers() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        env::set_var("PROXY_FUNCTIONS", "proxy-a");
        env::set_var("PROXY_PAYLOAD_TRANSPORT", "sqs");
        let config = Config::from_env().unwrap();
        assert_eq!(config.payload.mode, PayloadMode::Queue);
        match config.validate() {
            Err(ProxyError::InvalidConfig(msg)) => assert!(msg.contains("queue gateway")),
            other => panic!("unexpected validation result: {:?}", other.err()),
        }

        env::set_var("PROXY_QUEUE_URL", "http://queue.local/results");
        let config = Config::from_env().unwrap();
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_persistent_workers_bound() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        env::set_var("PROXY_FUNCTIONS", "proxy-a");
        env::set_var("PROXY_DISPATCH_STRATEGY", "hybrid");
        env::set_var("PROXY_MAX_WORKERS", "2");
        env::set_var("PROXY_PERSISTENT_WORKERS", "3");
        let config = Config::from_env().unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_strategy_round_trip_names() {
        for strategy in [
            DispatchStrategy::ShortLived,
            DispatchStrategy::LongLived,
            DispatchStrategy::Hybrid,
        ] {
            assert_eq!(DispatchStrategy::from_str(strategy.as_str()), Some(strategy));
        }
        assert_eq!(
            DispatchStrategy::from_str("long-lived"),
            Some(DispatchStrategy::LongLived)
        );
        assert_eq!(PayloadMode::from_str("queue"), Some(PayloadMode::Queue));
        assert_eq!(PayloadMode::from_str("gcs"), None);
    }
}
