use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cache::SegmentCacheConfig;
use crate::nntp::{ConnectionConfig, PoolConfig};

/// One NNTP provider account.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProviderConfig {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub tls: bool,
    pub tls_skip_verify: bool,
    /// Lower is tried first.
    pub priority: i32,
    /// Backups are only asked for segments no primary could serve.
    pub is_backup: bool,
    pub max_connections: usize,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            host: String::new(),
            port: 563,
            username: String::new(),
            password: String::new(),
            tls: true,
            tls_skip_verify: false,
            priority: 0,
            is_backup: false,
            max_connections: 10,
            updated_at: None,
        }
    }
}

impl ProviderConfig {
    /// `host:port:username`, the id of the provider's connection pool.
    pub fn id(&self) -> String {
        format!("{}:{}:{}", self.host, self.port, self.username)
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            connection: ConnectionConfig {
                host: self.host.clone(),
                port: self.port,
                username: self.username.clone(),
                password: self.password.clone(),
                tls: self.tls,
                tls_skip_verify: self.tls_skip_verify,
                ..Default::default()
            },
            max_size: self.max_connections,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct UsenetConfig {
    pub providers: Vec<ProviderConfig>,
    pub segment_cache: SegmentCacheConfig,
    /// Segments kept decoded ahead of a sequential reader, including the
    /// current one.
    pub segment_buffer_size: usize,
}

impl Default for UsenetConfig {
    fn default() -> Self {
        Self {
            providers: Vec::new(),
            segment_cache: SegmentCacheConfig::default(),
            segment_buffer_size: 5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_defaults_from_partial_json() {
        let config: UsenetConfig = serde_json::from_str(
            r#"{"providers":[{"host":"news.example.com","username":"u","priority":1}]}"#,
        )
        .unwrap();
        assert_eq!(config.segment_buffer_size, 5);
        let provider = &config.providers[0];
        assert_eq!(provider.port, 563);
        assert!(provider.tls);
        assert_eq!(provider.id(), "news.example.com:563:u");

        let pool = provider.pool_config();
        assert_eq!(pool.max_size, 10);
        assert_eq!(pool.connection.host, "news.example.com");
    }
}
