//! # DogRS Configuration
//!
//! A minimal string key/value store. Keys are dotted (`s3.bucket`),
//! values are strings parsed on read.
//!
//! ## Environment overrides
//! `load_env("DOGTUS__")` maps `DOGTUS__S3__BUCKET=uploads` to
//! `s3.bucket = "uploads"`:
//!
//! ```rust
//! use dog_core::DogConfig;
//! let mut config = DogConfig::new();
//! config.load_vars("DOGTUS__", [("DOGTUS__HTTP__PORT".to_string(), "8080".to_string())]);
//! assert_eq!(config.get("http.port"), Some("8080"));
//! ```

use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Default, Clone)]
pub struct DogConfig {
    values: HashMap<String, String>,
}

impl DogConfig {
    /// Create an empty config store.
    pub fn new() -> Self {
        Self {
            values: HashMap::new(),
        }
    }

    /// Set a configuration key to a string value.
    pub fn set<K, V>(&mut self, key: K, value: V)
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.values.insert(key.into(), value.into());
    }

    /// Get a configuration value by key.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(|s| s.as_str())
    }

    pub fn has(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Overlay every process environment variable that starts with `prefix`.
    pub fn load_env(&mut self, prefix: &str) -> &mut Self {
        self.load_vars(prefix, std::env::vars())
    }

    /// Same as `load_env` over an explicit variable list.
    pub fn load_vars<I>(&mut self, prefix: &str, vars: I) -> &mut Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            if let Some(stripped) = key.strip_prefix(prefix) {
                let normalized = stripped.to_lowercase().replace("__", "."); // DOGTUS__S3__BUCKET → s3.bucket
                self.set(normalized, value);
            }
        }
        self
    }

    pub fn snapshot(&self) -> DogConfigSnapshot {
        DogConfigSnapshot::new(self.values.clone())
    }
}

/// Immutable view with typed getters. Unparseable values read as `None`.
#[derive(Debug, Clone, Default)]
pub struct DogConfigSnapshot {
    map: HashMap<String, String>,
}

impl DogConfigSnapshot {
    pub(crate) fn new(map: HashMap<String, String>) -> Self {
        Self { map }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.map.get(key).map(|s| s.as_str())
    }

    pub fn get_string(&self, key: &str) -> Option<String> {
        self.map.get(key).cloned()
    }

    pub fn get_usize(&self, key: &str) -> Option<usize> {
        self.get(key).and_then(|v| v.trim().parse::<usize>().ok())
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(|v| v.trim().parse::<u64>().ok())
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(|v| v.trim().parse::<bool>().ok())
    }

    /// Whole seconds.
    pub fn get_secs(&self, key: &str) -> Option<Duration> {
        self.get_u64(key).map(Duration::from_secs)
    }

    pub fn get_millis(&self, key: &str) -> Option<Duration> {
        self.get_u64(key).map(Duration::from_millis)
    }
}
