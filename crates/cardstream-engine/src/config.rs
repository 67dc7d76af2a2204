use std::time::Duration;

/// Tunables for the streaming service.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamingConfig {
    /// Interval between `: heartbeat` comment frames.
    pub heartbeat_interval: Duration,
    /// Maximum lifetime of a session before it is aborted.
    pub session_timeout: Duration,
    /// Default per-card stagger when the request carries no `streamDelay`.
    pub stage_delay: Duration,
    pub max_connections: usize,
    pub max_card_count: usize,
    /// Frames buffered per connection before writes wait on the client.
    pub frame_buffer: usize,
    /// Connections without activity for this long are reaped by the janitor.
    pub idle_timeout: Duration,
    pub janitor_interval: Duration,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(15),
            session_timeout: Duration::from_secs(120),
            stage_delay: Duration::ZERO,
            max_connections: 100,
            max_card_count: 20,
            frame_buffer: 64,
            idle_timeout: Duration::from_secs(300),
            janitor_interval: Duration::from_secs(60),
        }
    }
}

impl StreamingConfig {
    /// Defaults overridden by `SSE_HEARTBEAT_INTERVAL`, `SSE_CONNECTION_TIMEOUT`,
    /// `SSE_STAGE_DELAY` (milliseconds) and `SSE_MAX_CONNECTIONS`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(ms) = parse_var(&lookup, "SSE_HEARTBEAT_INTERVAL") {
            config.heartbeat_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var(&lookup, "SSE_CONNECTION_TIMEOUT") {
            config.session_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var(&lookup, "SSE_STAGE_DELAY") {
            config.stage_delay = Duration::from_millis(ms);
        }
        if let Some(n) = parse_var(&lookup, "SSE_MAX_CONNECTIONS") {
            config.max_connections = n as usize;
        }
        config
    }

    /// Per-card stagger for a request: card `index` waits `delay * (index + 1)`.
    pub fn card_delay(&self, stream_delay_ms: Option<u64>, index: usize) -> Duration {
        let base = stream_delay_ms
            .map(Duration::from_millis)
            .unwrap_or(self.stage_delay);
        base.saturating_mul(index as u32 + 1)
    }
}

fn parse_var(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<u64> {
    let raw = lookup(key)?;
    match raw.trim().parse::<u64>() {
        Ok(value) if value > 0 || key == "SSE_STAGE_DELAY" => Some(value),
        _ => {
            tracing::warn!(key, value = %raw, "Ignoring invalid configuration value");
            None
        }
    }
}
