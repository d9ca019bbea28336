//! Cache configuration, read from `PAGECACHE_*` environment variables.

use std::ops::RangeInclusive;
use std::time::Duration;

/// Tuning knobs of a [`PageCache`](crate::PageCache). Fixed for a session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheConfig {
    /// Pages ahead of the current page to prefetch.
    pub ensure_forward: usize,
    /// Pages behind the current page to keep warm.
    pub retain_backward: usize,
    /// Upper bound on materialized pages. Raised to the window size if lower.
    pub max_resident: usize,
    /// Extra attempts after a failed page fetch.
    pub max_retries: u32,
    /// Base delay before a retry, doubled on each attempt.
    pub retry_backoff: Duration,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ensure_forward: 2,
            retain_backward: 1,
            max_resident: 16,
            max_retries: 2,
            retry_backoff: Duration::from_millis(250),
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(30),
        }
    }
}

impl CacheConfig {
    /// Defaults overridden by whatever `PAGECACHE_*` variables are set.
    pub fn from_env() -> Result<Self, String> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();
        let parse = |key: &str| -> Result<Option<u64>, String> {
            match lookup(key) {
                Some(raw) => raw
                    .trim()
                    .parse::<u64>()
                    .map(Some)
                    .map_err(|_| format!("Invalid {}: {:?}", key, raw)),
                None => Ok(None),
            }
        };

        if let Some(v) = parse("PAGECACHE_ENSURE_FORWARD")? {
            cfg.ensure_forward = v as usize;
        }
        if let Some(v) = parse("PAGECACHE_RETAIN_BACKWARD")? {
            cfg.retain_backward = v as usize;
        }
        if let Some(v) = parse("PAGECACHE_MAX_RESIDENT")? {
            cfg.max_resident = v as usize;
        }
        if let Some(v) = parse("PAGECACHE_MAX_RETRIES")? {
            cfg.max_retries = u32::try_from(v).unwrap_or(u32::MAX);
        }
        if let Some(v) = parse("PAGECACHE_RETRY_BACKOFF_MS")? {
            cfg.retry_backoff = Duration::from_millis(v);
        }
        if let Some(v) = parse("PAGECACHE_CONNECT_TIMEOUT_SECS")? {
            cfg.connect_timeout = Duration::from_secs(v);
        }
        if let Some(v) = parse("PAGECACHE_READ_TIMEOUT_SECS")? {
            cfg.read_timeout = Duration::from_secs(v);
        }
        Ok(cfg)
    }

    /// Number of pages in a full prefetch window, current page included.
    pub fn window_len(&self) -> usize {
        self.retain_backward
            .saturating_add(self.ensure_forward)
            .saturating_add(1)
    }

    /// Prefetch window around page `num`, before clipping to the manifest.
    pub fn window(&self, num: usize) -> RangeInclusive<usize> {
        num.saturating_sub(self.retain_backward)..=num.saturating_add(self.ensure_forward)
    }

    /// `max_resident`, never below the window size.
    pub fn resident_limit(&self) -> usize {
        self.max_resident.max(self.window_len())
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.retry_backoff.saturating_mul(1u32 << shift)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let cfg = CacheConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(cfg, CacheConfig::default());
        assert_eq!(cfg.ensure_forward, 2);
        assert_eq!(cfg.retain_backward, 1);
        assert_eq!(cfg.window_len(), 4);
    }

    #[test]
    fn test_overrides() {
        let cfg = CacheConfig::from_lookup(lookup(&[
            ("PAGECACHE_ENSURE_FORWARD", "5"),
            ("PAGECACHE_RETAIN_BACKWARD", " 0 "),
            ("PAGECACHE_RETRY_BACKOFF_MS", "10"),
        ]))
        .unwrap();
        assert_eq!(cfg.ensure_forward, 5);
        assert_eq!(cfg.retain_backward, 0);
        assert_eq!(cfg.retry_backoff, Duration::from_millis(10));
        assert_eq!(cfg.max_resident, 16);
    }

    #[test]
    fn test_invalid_value() {
        let err = CacheConfig::from_lookup(lookup(&[("PAGECACHE_MAX_RESIDENT", "lots")]))
            .unwrap_err();
        assert!(err.contains("PAGECACHE_MAX_RESIDENT"));
    }

    #[test]
    fn test_resident_limit_covers_window() {
        let cfg = CacheConfig {
            ensure_forward: 4,
            retain_backward: 2,
            max_resident: 3,
            ..CacheConfig::default()
        };
        assert_eq!(cfg.resident_limit(), 7);
    }

    #[test]
    fn test_window() {
        let cfg = CacheConfig::default();
        assert_eq!(cfg.window(5), 4..=7);
        assert_eq!(cfg.window(1), 0..=3);

        let cfg = CacheConfig {
            ensure_forward: 1,
            retain_backward: 0,
            ..CacheConfig::default()
        };
        assert_eq!(cfg.window(2), 2..=3);
    }

    #[test]
    fn test_backoff_doubles() {
        let cfg = CacheConfig {
            retry_backoff: Duration::from_millis(100),
            ..CacheConfig::default()
        };
        assert_eq!(cfg.backoff_for(1), Duration::from_millis(100));
        assert_eq!(cfg.backoff_for(2), Duration::from_millis(200));
        assert_eq!(cfg.backoff_for(3), Duration::from_millis(400));
    }
}
