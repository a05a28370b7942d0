use std::str::FromStr;
use std::time::Duration;

use reflex_core::ObjectKey;
use reflex_queue::{ExponentialBackoff, MaxOf, TokenBucket};
use reflex_store::ReflectorConfig;

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Used for the queue name and in logs.
    pub name: String,
    pub workers: usize,
    /// Failed syncs retried this many times before giving up.
    pub max_retries: u32,
    pub cache_sync_timeout: Duration,
    pub retry_backoff: ExponentialBackoff,
    /// Overall retry rate cap across all keys.
    pub retry_qps: f64,
    pub retry_burst: u32,
    pub reflector: ReflectorConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            name: "controller".to_string(),
            workers: 1,
            max_retries: 5,
            cache_sync_timeout: Duration::from_secs(60),
            retry_backoff: ExponentialBackoff::default(),
            retry_qps: 10.0,
            retry_burst: 100,
            reflector: ReflectorConfig::default(),
        }
    }
}

impl ControllerConfig {
    /// Defaults overridden by `REFLEX_*` environment variables.
    pub fn from_env() -> Self { Self::from_lookup(|k| std::env::var(k).ok()) }

    /// Like `from_env`, reading variables through `lookup`. Unparseable values
    /// keep the default.
    pub fn from_lookup<F: Fn(&str) -> Option<String>>(lookup: F) -> Self {
        fn parse<T: FromStr>(lookup: &dyn Fn(&str) -> Option<String>, key: &str) -> Option<T> {
            lookup(key).and_then(|s| s.trim().parse::<T>().ok())
        }
        let l: &dyn Fn(&str) -> Option<String> = &lookup;
        let mut c = Self::default();
        if let Some(v) = lookup("REFLEX_NAME").filter(|s| !s.is_empty()) {
            c.name = v;
        }
        if let Some(v) = parse::<usize>(l, "REFLEX_WORKERS") {
            c.workers = v.max(1);
        }
        if let Some(v) = parse(l, "REFLEX_MAX_RETRIES") {
            c.max_retries = v;
        }
        if let Some(v) = parse(l, "REFLEX_CACHE_SYNC_TIMEOUT_SECS") {
            c.cache_sync_timeout = Duration::from_secs(v);
        }
        if let Some(v) = parse(l, "REFLEX_RETRY_BASE_MS") {
            c.retry_backoff.base = Duration::from_millis(v);
        }
        if let Some(v) = parse(l, "REFLEX_RETRY_MAX_SECS") {
            c.retry_backoff.max = Duration::from_secs(v);
        }
        if let Some(v) = parse(l, "REFLEX_RETRY_QPS") {
            c.retry_qps = v;
        }
        if let Some(v) = parse(l, "REFLEX_RETRY_BURST") {
            c.retry_burst = v;
        }
        if let Some(v) = parse(l, "REFLEX_RELIST_BASE_MS") {
            c.reflector.relist_backoff.base = Duration::from_millis(v);
        }
        if let Some(v) = parse(l, "REFLEX_RELIST_MAX_SECS") {
            c.reflector.relist_backoff.max = Duration::from_secs(v);
        }
        if let Some(v) = parse::<u64>(l, "REFLEX_RESYNC_SECS") {
            c.reflector.resync_period = (v > 0).then(|| Duration::from_secs(v));
        }
        if let Some(v) = lookup("REFLEX_RESUME_WATCH") {
            c.reflector.resume_watch_on_close = v == "1" || v.eq_ignore_ascii_case("true");
        }
        c
    }

    /// Per-key exponential backoff combined with the overall token bucket.
    pub fn rate_limiter(&self) -> MaxOf<ObjectKey> {
        MaxOf::new(vec![
            Box::new(self.retry_backoff),
            Box::new(TokenBucket::new(self.retry_qps, self.retry_burst)),
        ])
    }
}
