//! Configuration: a small sectioned key=value loader plus the typed option
//! structs consumed by the engine.
//!
//! The file format is INI-like: `[section]` headers turn following keys into
//! `section.key`, `#` and `;` start comments. Unknown keys are kept and
//! ignored; malformed lines are errors.

use std::collections::HashMap;
use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use crate::error::Error;

/// Flat key/value view of a parsed configuration file.
#[derive(Debug, Default, Clone)]
pub struct Config {
    values: HashMap<String, String>,
}

impl Config {
    /// Load and parse a configuration file.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        let content = fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("{}: {e}", path.as_ref().display())))?;
        Self::load_from_str(&content)
    }

    /// Parse configuration from a string.
    pub fn load_from_str(content: &str) -> Result<Self, Error> {
        let mut values = HashMap::new();
        let mut section = String::new();

        for (line_no, raw) in content.lines().enumerate() {
            let line = strip_comment(raw).trim();
            if line.is_empty() {
                continue;
            }
            if line.starts_with('[') && line.ends_with(']') {
                section = line[1..line.len() - 1].trim().to_string();
                continue;
            }
            let Some(eq) = line.find('=') else {
                return Err(Error::Config(format!("line {}: missing '='", line_no + 1)));
            };
            let key = line[..eq].trim();
            let value = line[eq + 1..].trim();
            if key.is_empty() {
                return Err(Error::Config(format!("line {}: empty key", line_no + 1)));
            }
            let full_key = if section.is_empty() {
                key.to_string()
            } else {
                format!("{section}.{key}")
            };
            values.insert(full_key, value.to_string());
        }

        Ok(Config { values })
    }

    pub fn has(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn get_str(&self, key: &str, default: &str) -> String {
        self.values
            .get(key)
            .cloned()
            .unwrap_or_else(|| default.to_string())
    }

    pub fn get_u64(&self, key: &str, default: u64) -> u64 {
        self.values
            .get(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    pub fn get_usize(&self, key: &str, default: usize) -> usize {
        self.values
            .get(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.values.get(key).map(|v| v.to_ascii_lowercase()) {
            Some(v) if v == "true" || v == "yes" || v == "on" || v == "1" => true,
            Some(v) if v == "false" || v == "no" || v == "off" || v == "0" => false,
            _ => default,
        }
    }

    pub fn get_ms(&self, key: &str, default: Duration) -> Duration {
        self.values
            .get(key)
            .and_then(|v| v.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(default)
    }
}

fn strip_comment(line: &str) -> &str {
    let end = line
        .find(|c| c == '#' || c == ';')
        .unwrap_or(line.len());
    &line[..end]
}

/// Per-event-loop options.
///
/// Zero values select defaults; [`LoopOptions::normalize`] applies the
/// corrections before the loop is constructed.
#[derive(Debug, Clone)]
pub struct LoopOptions {
    /// io_uring submission queue depth.
    pub ring_entries: u32,
    /// Enable kernel-side submission polling (IORING_SETUP_SQPOLL).
    pub sqpoll: bool,
    /// SQPOLL kernel thread idle timeout in milliseconds.
    pub sqpoll_idle_ms: u32,
    /// Number of fixed buffers registered with the kernel per loop.
    pub registered_buffers_count: usize,
    /// Size of each fixed buffer in bytes (page-aligned allocation).
    pub registered_buffers_size: usize,
    /// Cross-thread task ring capacity (rounded up to a power of two).
    pub pending_queue_capacity: usize,
    /// Task ring high watermark; 0 = 80% of capacity.
    pub pending_queue_high_mark: usize,
    /// Task ring low watermark; 0 = 20% of capacity.
    pub pending_queue_low_mark: usize,
    /// Log a warning each time the task ring rejects an enqueue.
    pub enable_queue_full_stats: bool,
}

impl Default for LoopOptions {
    fn default() -> Self {
        LoopOptions {
            ring_entries: 32768,
            sqpoll: false,
            sqpoll_idle_ms: 50,
            registered_buffers_count: 16384,
            registered_buffers_size: 4096,
            pending_queue_capacity: 65536,
            pending_queue_high_mark: 0,
            pending_queue_low_mark: 0,
            enable_queue_full_stats: true,
        }
    }
}

impl LoopOptions {
    /// Read `event_loop.*` keys from a parsed config.
    pub fn from_config(config: &Config) -> Self {
        let defaults = LoopOptions::default();
        LoopOptions {
            ring_entries: config.get_u64("event_loop.ring_entries", defaults.ring_entries as u64)
                as u32,
            sqpoll: config.get_bool("event_loop.sqpoll", defaults.sqpoll),
            sqpoll_idle_ms: config
                .get_u64("event_loop.sqpoll_idle_ms", defaults.sqpoll_idle_ms as u64)
                as u32,
            registered_buffers_count: config.get_usize(
                "event_loop.registered_buffers_count",
                defaults.registered_buffers_count,
            ),
            registered_buffers_size: config.get_usize(
                "event_loop.registered_buffers_size",
                defaults.registered_buffers_size,
            ),
            pending_queue_capacity: config.get_usize(
                "event_loop.pending_queue_capacity",
                defaults.pending_queue_capacity,
            ),
            pending_queue_high_mark: 0,
            pending_queue_low_mark: 0,
            enable_queue_full_stats: defaults.enable_queue_full_stats,
        }
    }

    /// Replace zero or out-of-range fields with usable values.
    ///
    /// Ring depth is clamped to at least 1024, the task ring capacity is
    /// rounded up to a power of two with a 1024 floor, and the low
    /// watermark is forced strictly below the high watermark.
    pub fn normalize(mut self) -> Self {
        if self.ring_entries == 0 {
            self.ring_entries = 32768;
        }
        self.ring_entries = self.ring_entries.max(1024).next_power_of_two();

        if self.registered_buffers_count == 0 {
            self.registered_buffers_count = 1;
        }
        if self.registered_buffers_size == 0 {
            self.registered_buffers_size = 4096;
        }

        self.pending_queue_capacity = self
            .pending_queue_capacity
            .max(1024)
            .next_power_of_two();

        let cap = self.pending_queue_capacity;
        if self.pending_queue_high_mark == 0 || self.pending_queue_high_mark > cap {
            self.pending_queue_high_mark = cap * 80 / 100;
        }
        if self.pending_queue_low_mark == 0
            || self.pending_queue_low_mark >= self.pending_queue_high_mark
        {
            self.pending_queue_low_mark = cap * 20 / 100;
        }
        self
    }
}

/// Server-level options read from the `server.*` section.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub ip: IpAddr,
    pub port: u16,
    pub name: String,
    pub thread_num: usize,
    pub read_timeout: Duration,
}

impl Default for ServerOptions {
    fn default() -> Self {
        ServerOptions {
            ip: IpAddr::from([0, 0, 0, 0]),
            port: 8888,
            name: "ringnet".to_string(),
            thread_num: 0,
            read_timeout: Duration::ZERO,
        }
    }
}

impl ServerOptions {
    /// Read `server.*` keys from a parsed config.
    pub fn from_config(config: &Config) -> Self {
        let defaults = ServerOptions::default();
        let ip = config
            .get_str("server.ip", "0.0.0.0")
            .parse()
            .unwrap_or(defaults.ip);
        ServerOptions {
            ip,
            port: config.get_u64("server.port", defaults.port as u64) as u16,
            name: config.get_str("server.name", &defaults.name),
            thread_num: config.get_usize("server.thread_num", defaults.thread_num),
            read_timeout: config.get_ms("server.read_timeout_ms", defaults.read_timeout),
        }
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

/// Logging options read from the `log.*` section and handed to
/// [`crate::logging::init`].
#[derive(Debug, Clone)]
pub struct LoggingOptions {
    /// Default level filter (`trace` .. `error`); `RUST_LOG` overrides.
    pub level: String,
    /// Emit to stdout.
    pub console: bool,
    /// Optional log file path.
    pub file: Option<String>,
}

impl Default for LoggingOptions {
    fn default() -> Self {
        LoggingOptions {
            level: "info".to_string(),
            console: true,
            file: None,
        }
    }
}

impl LoggingOptions {
    pub fn from_config(config: &Config) -> Self {
        let defaults = LoggingOptions::default();
        let file = config.get_str("log.file", "");
        LoggingOptions {
            level: config.get_str("log.level", &defaults.level),
            console: config.get_bool("log.console", defaults.console),
            file: if file.is_empty() { None } else { Some(file) },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sections_and_comments() {
        let config = Config::load_from_str(
            "# global\n\
             [server]\n\
             ip = 127.0.0.1   ; loopback\n\
             port = 9000\n\
             name = echo\n\
             thread_num = 4\n\
             \n\
             [event_loop]\n\
             ring_entries = 2048\n\
             sqpoll = true\n",
        )
        .unwrap();

        assert!(config.has("server.ip"));
        assert_eq!(config.get_str("server.name", ""), "echo");
        assert_eq!(config.get_u64("server.port", 0), 9000);
        assert!(config.get_bool("event_loop.sqpoll", false));

        let server = ServerOptions::from_config(&config);
        assert_eq!(server.listen_addr().to_string(), "127.0.0.1:9000");
        assert_eq!(server.thread_num, 4);

        let lp = LoopOptions::from_config(&config);
        assert_eq!(lp.ring_entries, 2048);
        assert!(lp.sqpoll);
    }

    #[test]
    fn rejects_malformed_lines() {
        assert!(Config::load_from_str("no equals sign here").is_err());
        assert!(Config::load_from_str("= value").is_err());
    }

    #[test]
    fn missing_keys_fall_back_to_defaults() {
        let config = Config::load_from_str("").unwrap();
        let server = ServerOptions::from_config(&config);
        assert_eq!(server.port, 8888);
        assert_eq!(server.read_timeout, Duration::ZERO);
        let log = LoggingOptions::from_config(&config);
        assert_eq!(log.level, "info");
        assert!(log.file.is_none());
    }

    #[test]
    fn normalize_fixes_zero_fields() {
        let opts = LoopOptions {
            ring_entries: 0,
            registered_buffers_count: 0,
            registered_buffers_size: 0,
            pending_queue_capacity: 0,
            ..LoopOptions::default()
        }
        .normalize();
        assert_eq!(opts.ring_entries, 32768);
        assert_eq!(opts.registered_buffers_count, 1);
        assert_eq!(opts.registered_buffers_size, 4096);
        assert_eq!(opts.pending_queue_capacity, 1024);
    }

    #[test]
    fn normalize_orders_watermarks() {
        let opts = LoopOptions {
            pending_queue_capacity: 4096,
            pending_queue_high_mark: 100,
            pending_queue_low_mark: 200,
            ..LoopOptions::default()
        }
        .normalize();
        assert!(opts.pending_queue_low_mark < opts.pending_queue_high_mark);
        assert_eq!(opts.pending_queue_low_mark, 4096 * 20 / 100);
    }

    #[test]
    fn normalize_rounds_queue_capacity_up() {
        let opts = LoopOptions {
            pending_queue_capacity: 5000,
            ..LoopOptions::default()
        }
        .normalize();
        assert_eq!(opts.pending_queue_capacity, 8192);
        assert_eq!(opts.pending_queue_high_mark, 8192 * 80 / 100);
    }
}
