use crate::{ConfigError, FromEnv, env_or_default, env_required};

/// Redis connection settings for the durable queue backend
#[derive(Clone, Debug)]
pub struct RedisConfig {
    pub uri: String,
    /// Namespace prepended to every key the queue writes
    pub key_prefix: String,
}

impl RedisConfig {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            key_prefix: "queue".to_string(),
        }
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }
}

impl FromEnv for RedisConfig {
    /// `REDIS_HOST` is required; `REDIS_KEY_PREFIX` defaults to `queue`.
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self::new(env_required("REDIS_HOST")?)
            .with_key_prefix(env_or_default("REDIS_KEY_PREFIX", "queue")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_env_reads_host_and_prefix() {
        temp_env::with_vars(
            [
                ("REDIS_HOST", Some("redis://localhost:6379")),
                ("REDIS_KEY_PREFIX", Some("clinic")),
            ],
            || {
                let config = RedisConfig::from_env().unwrap();
                assert_eq!(config.uri, "redis://localhost:6379");
                assert_eq!(config.key_prefix, "clinic");
            },
        );
    }

    #[test]
    fn from_env_requires_host() {
        temp_env::with_var_unset("REDIS_HOST", || {
            let err = RedisConfig::from_env().unwrap_err();
            assert!(matches!(err, ConfigError::MissingEnvVar(ref k) if k == "REDIS_HOST"));
        });
    }

    #[test]
    fn default_prefix_is_queue() {
        assert_eq!(RedisConfig::new("redis://h:6379").key_prefix, "queue");
    }
}
