use serde::Deserialize;

/// Static configuration for a read-through cache instance.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Cache identifier used to tag metrics and log records.
    pub name: String,

    /// Maximum number of entries kept by the store before the least recently
    /// used ones start getting evicted.
    ///
    /// Zero is allowed and disables storage entirely, but does not guarantee
    /// that every acquire results in a lookup: concurrent acquires for the
    /// same key still group together into a single lookup.
    pub capacity: usize,
}

impl CacheConfig {
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        CacheConfig {
            name: name.into(),
            capacity,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            name: "default".into(),
            capacity: 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() -> anyhow::Result<()> {
        let yaml = "capacity: 16\n";
        let config: CacheConfig = serde_yaml::from_str(yaml)?;

        assert_eq!(config.capacity, 16);
        assert_eq!(config.name, "default");

        Ok(())
    }

    #[test]
    fn test_config_full() -> anyhow::Result<()> {
        let yaml = r#"
            name: "objects"
            capacity: 4096
        "#;
        let config: CacheConfig = serde_yaml::from_str(yaml)?;

        assert_eq!(config.name, "objects");
        assert_eq!(config.capacity, 4096);

        Ok(())
    }
}
