//! Service configuration loaded from `WSMAN_*` environment variables.

use std::{net::SocketAddr, path::PathBuf, time::Duration};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterMode {
    Kube,
    Memory,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub namespace: String,
    pub instance_prefix: String,
    pub reconcile_interval: Duration,
    /// Upper bound for every single cluster API call.
    pub cluster_timeout: Duration,
    /// User-owned instances untouched for this long are evicted.
    pub idle_ttl: Duration,
    pub default_pool_size: u32,
    pub jwt_secret: Vec<u8>,
    pub instance_token_ttl: Duration,
    pub template_path: Option<PathBuf>,
    pub catalog_path: Option<PathBuf>,
    pub cluster: ClusterMode,
    pub data_dir: PathBuf,
    pub public_url: Option<String>,
    pub log_dir: Option<PathBuf>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(&'static str),
    #[error("invalid value for {var}: {value:?}")]
    Invalid { var: &'static str, value: String },
}

struct Env<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Env<F> {
    fn get(&self, var: &str) -> Option<String> {
        (self.lookup)(var)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T: std::str::FromStr>(&self, var: &'static str) -> Result<Option<T>, ConfigError> {
        match self.get(var) {
            None => Ok(None),
            Some(raw) => raw
                .parse::<T>()
                .map(Some)
                .map_err(|_| ConfigError::Invalid { var, value: raw }),
        }
    }

    fn millis(&self, var: &'static str, default: u64, min: u64, max: u64) -> Result<Duration, ConfigError> {
        let ms = self.parse::<u64>(var)?.unwrap_or(default).clamp(min, max);
        Ok(Duration::from_millis(ms))
    }

    fn flag(&self, var: &str) -> bool {
        self.get(var).is_some_and(|v| {
            matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
        })
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env { lookup };

        let listen_addr = env
            .parse::<SocketAddr>("WSMAN_LISTEN_ADDR")?
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 8080)));

        let cluster = match env.get("WSMAN_CLUSTER").as_deref() {
            None | Some("kube") | Some("kubernetes") => ClusterMode::Kube,
            Some("memory") => ClusterMode::Memory,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    var: "WSMAN_CLUSTER",
                    value: other.to_string(),
                });
            }
        };

        let jwt_secret = match env.get("WSMAN_JWT_SECRET") {
            Some(secret) => secret.into_bytes(),
            None if env.flag("WSMAN_INSECURE_DEV") => b"insecure-dev-secret".to_vec(),
            None => return Err(ConfigError::MissingEnvVar("WSMAN_JWT_SECRET")),
        };

        let idle_secs = env
            .parse::<u64>("WSMAN_IDLE_TTL_SECS")?
            .unwrap_or(30 * 60)
            .clamp(60, 7 * 24 * 3600);
        let token_secs = env
            .parse::<u64>("WSMAN_INSTANCE_TOKEN_TTL_SECS")?
            .unwrap_or(24 * 3600)
            .clamp(60, 30 * 24 * 3600);

        Ok(Self {
            listen_addr,
            namespace: env.get("WSMAN_NAMESPACE").unwrap_or_else(|| "default".to_string()),
            instance_prefix: env
                .get("WSMAN_INSTANCE_PREFIX")
                .unwrap_or_else(|| "wsinst-".to_string()),
            reconcile_interval: env.millis("WSMAN_RECONCILE_INTERVAL_MS", 5_000, 500, 10 * 60_000)?,
            cluster_timeout: env.millis("WSMAN_CLUSTER_TIMEOUT_MS", 10_000, 1_000, 120_000)?,
            idle_ttl: Duration::from_secs(idle_secs),
            default_pool_size: env.parse::<u32>("WSMAN_DEFAULT_POOL_SIZE")?.unwrap_or(0).min(50),
            jwt_secret,
            instance_token_ttl: Duration::from_secs(token_secs),
            template_path: env.get("WSMAN_TEMPLATE_PATH").map(PathBuf::from),
            catalog_path: env.get("WSMAN_CATALOG_PATH").map(PathBuf::from),
            cluster,
            data_dir: PathBuf::from(env.get("WSMAN_DATA_DIR").unwrap_or_else(|| ".data".to_string())),
            public_url: env.get("WSMAN_PUBLIC_URL"),
            log_dir: env.get("WSMAN_LOG_DIR").map(PathBuf::from),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(move |k| map.get(k).cloned())
    }

    #[test]
    fn defaults_apply() {
        let cfg = load(&[("WSMAN_JWT_SECRET", "s3cret")]).unwrap();
        assert_eq!(cfg.listen_addr.port(), 8080);
        assert_eq!(cfg.namespace, "default");
        assert_eq!(cfg.instance_prefix, "wsinst-");
        assert_eq!(cfg.cluster_timeout, Duration::from_secs(10));
        assert_eq!(cfg.idle_ttl, Duration::from_secs(1800));
        assert_eq!(cfg.cluster, ClusterMode::Kube);
        assert_eq!(cfg.jwt_secret, b"s3cret");
    }

    #[test]
    fn secret_is_required_unless_insecure_dev() {
        assert!(matches!(
            load(&[]),
            Err(ConfigError::MissingEnvVar("WSMAN_JWT_SECRET"))
        ));
        assert!(load(&[("WSMAN_INSECURE_DEV", "true")]).is_ok());
    }

    #[test]
    fn values_are_parsed_and_clamped() {
        let cfg = load(&[
            ("WSMAN_JWT_SECRET", "x"),
            ("WSMAN_RECONCILE_INTERVAL_MS", "1"),
            ("WSMAN_CLUSTER", "memory"),
            ("WSMAN_DEFAULT_POOL_SIZE", "3"),
        ])
        .unwrap();
        assert_eq!(cfg.reconcile_interval, Duration::from_millis(500));
        assert_eq!(cfg.cluster, ClusterMode::Memory);
        assert_eq!(cfg.default_pool_size, 3);

        let err = load(&[("WSMAN_JWT_SECRET", "x"), ("WSMAN_CLUSTER_TIMEOUT_MS", "soon")]).unwrap_err();
        assert!(err.to_string().contains("WSMAN_CLUSTER_TIMEOUT_MS"));
    }
}
