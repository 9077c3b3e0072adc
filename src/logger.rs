//! Logging backend for the agent.
//!
//! Every subsystem logs under one of a small set of fixed targets
//! (`telemetry`, `rpz`, `axfr`, `eviction`, `solver`, `console`, `stats`,
//! `agent`), and each target can be raised or silenced on its own. Lines
//! are stamped with the same wall-clock seconds the telemetry counters
//! use, so console output and zone TXT metadata can be read side by side.

use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};

use crate::stats::unix_now;

pub struct Logger {
    /// Level applied to any target without an override.
    default_level: LevelFilter,

    /// Exact-match per-target overrides. The target set is small and
    /// fixed, so a linear scan is fine.
    target_levels: Vec<(&'static str, LevelFilter)>,

    /// Whether to log on stderr or stdout
    stderr: bool,
}

impl Logger {
    pub fn new() -> Logger {
        Logger {
            default_level: LevelFilter::Info,
            target_levels: Vec::new(),
            stderr: false,
        }
    }

    pub fn with_level(mut self, level: LevelFilter) -> Logger {
        self.default_level = level;
        self
    }

    /// Override the level for a single target.
    pub fn with_target(mut self, target: &'static str, level: LevelFilter) -> Logger {
        self.target_levels.retain(|(name, _)| *name != target);
        self.target_levels.push((target, level));
        self
    }

    /// The periodic statistics report has its own target so it can be
    /// switched off without touching anything else.
    pub fn with_stats(self, stats: bool) -> Logger {
        if stats {
            self
        } else {
            self.with_target("stats", LevelFilter::Off)
        }
    }

    pub fn with_stderr(mut self, stderr: bool) -> Logger {
        self.stderr = stderr;
        self
    }

    fn level_for(&self, target: &str) -> LevelFilter {
        self.target_levels
            .iter()
            .find(|(name, _)| *name == target)
            .map(|(_, level)| *level)
            .unwrap_or(self.default_level)
    }

    fn max_level(&self) -> LevelFilter {
        self.target_levels
            .iter()
            .map(|(_, level)| *level)
            .max()
            .unwrap_or(LevelFilter::Off)
            .max(self.default_level)
    }

    /// Hand the logger to the `log` facade; call once at startup.
    pub fn init(self) -> Result<(), SetLoggerError> {
        log::set_max_level(self.max_level());
        log::set_boxed_logger(Box::new(self))
    }
}

impl Default for Logger {
    fn default() -> Self {
        Logger::new()
    }
}

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level().to_level_filter() <= self.level_for(metadata.target())
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let target = if record.target().is_empty() {
            record.module_path().unwrap_or_default()
        } else {
            record.target()
        };

        let line = format!(
            "{:.3} {:<5} [{}] {}",
            unix_now(),
            record.level(),
            target,
            record.args()
        );

        if self.stderr {
            eprintln!("{}", line);
        } else {
            println!("{}", line);
        }
    }

    fn flush(&self) {}
}
