use clap::Parser;
use std::str::FromStr;

/// Service configuration. Every flag is mirrored by an environment variable;
/// precedence is env, then flag, then default.
#[derive(Parser, Debug, Clone)]
#[command(name = "flagrelay", about = "Feature flag edge relay", version)]
pub struct Options {
    /// The proxy key used to authenticate with the upstream
    #[arg(long, default_value = "")]
    pub proxy_key: String,

    /// Base URL of the upstream config service
    #[arg(long, default_value = "https://config.ff.example.com/api/1.0")]
    pub client_service: String,

    /// Base URL of the upstream metrics service
    #[arg(long, default_value = "https://events.ff.example.com/api/1.0")]
    pub metric_service: String,

    /// Secret used for signing edge auth tokens
    #[arg(long, default_value = "secret")]
    pub auth_secret: String,

    /// Seconds between metrics flushes to upstream. 0 disables metrics.
    #[arg(long, default_value_t = 60)]
    pub metric_post_duration: u64,

    /// Seconds between health self-pings. 0 disables the heartbeat.
    #[arg(long, default_value_t = 60)]
    pub heartbeat_interval: u64,

    /// Dump offline config to the config dir and exit
    #[arg(long, default_value_t = false)]
    pub generate_offline_config: bool,

    /// Run as a read replica that serves SDK traffic from the shared cache
    /// and never talks to the upstream
    #[arg(long, default_value_t = false)]
    pub read_replica: bool,

    /// Forward target identities upstream during the auth flow
    #[arg(long, default_value_t = false)]
    pub forward_targets: bool,

    /// Load config from the config dir instead of the upstream
    #[arg(long, default_value_t = false)]
    pub offline: bool,

    /// Directory offline config is read from and exported to
    #[arg(long, default_value = "/config")]
    pub config_dir: String,

    /// Redis host:port address. Multiple addresses are comma separated.
    #[arg(long, default_value = "")]
    pub redis_address: String,

    /// Optional Redis password
    #[arg(long, default_value = "")]
    pub redis_password: String,

    /// Redis database selected after connecting
    #[arg(long, default_value_t = 0)]
    pub redis_db: i64,

    /// Redis connection pool size per CPU
    #[arg(long, default_value_t = 10)]
    pub redis_pool_size: u32,

    /// Port the relay service listens on
    #[arg(long, default_value_t = 8000)]
    pub port: u16,

    /// Serve with TLS using tls-cert and tls-key
    #[arg(long, default_value_t = false)]
    pub tls_enabled: bool,

    /// Path to the TLS certificate file. Required when TLS is enabled.
    #[arg(long, default_value = "")]
    pub tls_cert: String,

    /// Path to the TLS key file. Required when TLS is enabled.
    #[arg(long, default_value = "")]
    pub tls_key: String,

    /// Port Prometheus metrics are exposed on. Shares the main listener
    /// when equal to --port.
    #[arg(long, default_value_t = 8000)]
    pub prometheus_port: u16,

    /// Bypass edge authentication (development only)
    #[arg(long, default_value_t = false)]
    pub bypass_auth: bool,

    /// Log level: INFO, DEBUG or ERROR
    #[arg(long, default_value = "INFO")]
    pub log_level: String,

    /// Max length of the stream replicas send metrics to the Primary on
    #[arg(long, default_value_t = 1000)]
    pub metrics_stream_max_len: u64,

    /// Number of Primary-side consumers draining the replica metrics stream
    #[arg(long, default_value_t = 10)]
    pub metric_stream_read_concurrency: usize,

    /// Feature gate for the newer AND-rule semantics for target groups
    #[arg(long, default_value_t = false)]
    pub and_rules: bool,
}

impl Options {
    pub fn load() -> Self {
        let mut options = Options::parse();
        options.apply_env();
        options
    }

    /// Overlays environment variables onto parsed flags. Env wins over
    /// flags, flags win over defaults.
    pub fn apply_env(&mut self) {
        env_string("PROXY_KEY", &mut self.proxy_key);
        env_string("CLIENT_SERVICE", &mut self.client_service);
        env_string("METRIC_SERVICE", &mut self.metric_service);
        env_string("AUTH_SECRET", &mut self.auth_secret);
        env_parse("METRIC_POST_DURATION", &mut self.metric_post_duration);
        env_parse("HEARTBEAT_INTERVAL", &mut self.heartbeat_interval);
        env_parse("GENERATE_OFFLINE_CONFIG", &mut self.generate_offline_config);
        env_parse("READ_REPLICA", &mut self.read_replica);
        env_parse("FORWARD_TARGETS", &mut self.forward_targets);
        env_parse("OFFLINE", &mut self.offline);
        env_string("CONFIG_DIR", &mut self.config_dir);
        env_string("REDIS_ADDRESS", &mut self.redis_address);
        env_string("REDIS_PASSWORD", &mut self.redis_password);
        env_parse("REDIS_DB", &mut self.redis_db);
        env_parse("REDIS_POOL_SIZE", &mut self.redis_pool_size);
        env_parse("PORT", &mut self.port);
        env_parse("TLS_ENABLED", &mut self.tls_enabled);
        env_string("TLS_CERT", &mut self.tls_cert);
        env_string("TLS_KEY", &mut self.tls_key);
        env_parse("PROMETHEUS_PORT", &mut self.prometheus_port);
        env_parse("BYPASS_AUTH", &mut self.bypass_auth);
        env_string("LOG_LEVEL", &mut self.log_level);
        env_parse("METRICS_STREAM_MAX_LEN", &mut self.metrics_stream_max_len);
        env_parse(
            "METRIC_STREAM_READ_CONCURRENCY",
            &mut self.metric_stream_read_concurrency,
        );
        env_parse("AND_RULES", &mut self.and_rules);
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.proxy_key.is_empty() && !self.offline && !self.read_replica {
            return Err("the following configuration values are required: PROXY_KEY".to_string());
        }
        if self.read_replica && self.redis_address.is_empty() {
            return Err("read replicas require REDIS_ADDRESS".to_string());
        }
        if self.tls_enabled && (self.tls_cert.is_empty() || self.tls_key.is_empty()) {
            return Err("TLS_CERT and TLS_KEY are required when TLS is enabled".to_string());
        }
        Ok(())
    }
}

fn env_string(name: &str, target: &mut String) {
    if let Ok(value) = std::env::var(name)
        && !value.is_empty()
    {
        *target = value;
    }
}

fn env_parse<T: FromStr>(name: &str, target: &mut T) {
    if let Ok(value) = std::env::var(name)
        && let Ok(parsed) = value.parse()
    {
        *target = parsed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_overrides_flags() {
        let mut options = Options::parse_from(["flagrelay", "--port", "9000"]);
        assert_eq!(options.port, 9000);

        // SAFETY: test-local env mutation, no other threads read it
        unsafe {
            std::env::set_var("PORT", "9001");
            std::env::set_var("READ_REPLICA", "true");
        }
        options.apply_env();
        unsafe {
            std::env::remove_var("PORT");
            std::env::remove_var("READ_REPLICA");
        }

        assert_eq!(options.port, 9001);
        assert!(options.read_replica);
    }

    #[test]
    fn proxy_key_required_for_primary() {
        let options = Options::parse_from(["flagrelay"]);
        assert!(options.validate().is_err());

        let options = Options::parse_from(["flagrelay", "--offline"]);
        assert!(options.validate().is_ok());

        let options = Options::parse_from(["flagrelay", "--proxy-key", "key"]);
        assert!(options.validate().is_ok());
    }
}
