//! Build context providing logging and per-stage timing
//!
//! Every client owns one context. Messages are mirrored to the `log` facade
//! and also kept in memory so that callers can fetch the build log after
//! the fact.

use std::collections::HashMap;
use std::time::Duration;
use web_time::Instant;

/// Default cap on retained log entries
const DEFAULT_MAX_LOG_ENTRIES: usize = 1000;

/// Log level for context messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug = 0,
    Progress = 1,
    Warning = 2,
    Error = 3,
}

/// Timer categories for the build stages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerCategory {
    /// Whole build invocation
    Total,
    /// Triangle rasterization into the span heightfield
    Rasterization,
    /// Walkable span filtering
    Filtering,
    /// Compact heightfield, erosion and area marking
    CompactHeightfield,
    /// Heightfield layer extraction
    Layers,
    /// Layer compression and cache insertion
    TileCompression,
    /// Layer to polygon mesh conversion
    PolyMesh,
    /// Navmesh tile creation and linking
    NavMeshTiles,
    /// Crowd (re)initialization
    Crowd,
}

impl TimerCategory {
    /// All categories in report order
    pub const ALL: [TimerCategory; 9] = [
        TimerCategory::Rasterization,
        TimerCategory::Filtering,
        TimerCategory::CompactHeightfield,
        TimerCategory::Layers,
        TimerCategory::TileCompression,
        TimerCategory::PolyMesh,
        TimerCategory::NavMeshTiles,
        TimerCategory::Crowd,
        TimerCategory::Total,
    ];

    fn label(self) -> &'static str {
        match self {
            TimerCategory::Total => "Total",
            TimerCategory::Rasterization => "Rasterize",
            TimerCategory::Filtering => "Filter Walkable",
            TimerCategory::CompactHeightfield => "Build Compact",
            TimerCategory::Layers => "Build Layers",
            TimerCategory::TileCompression => "Compress Tiles",
            TimerCategory::PolyMesh => "Build Polymesh",
            TimerCategory::NavMeshTiles => "Build Navmesh Tiles",
            TimerCategory::Crowd => "Init Crowd",
        }
    }
}

/// Log entry containing message and metadata
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub level: LogLevel,
    pub timestamp: Instant,
    pub message: String,
}

/// Context for build operations providing logging and profiling
#[derive(Debug)]
pub struct RecastContext {
    logs: Vec<LogEntry>,
    active_timers: HashMap<TimerCategory, Instant>,
    accumulated: HashMap<TimerCategory, Duration>,
    enable_timing: bool,
    max_log_entries: usize,
}

impl Default for RecastContext {
    fn default() -> Self {
        Self::new()
    }
}

impl RecastContext {
    /// Creates a new context with timing enabled
    pub fn new() -> Self {
        Self {
            logs: Vec::new(),
            active_timers: HashMap::new(),
            accumulated: HashMap::new(),
            enable_timing: true,
            max_log_entries: DEFAULT_MAX_LOG_ENTRIES,
        }
    }

    /// Enables or disables performance timing
    pub fn set_timing_enabled(&mut self, enabled: bool) {
        self.enable_timing = enabled;
    }

    /// Sets the maximum number of log entries to keep
    pub fn set_max_log_entries(&mut self, max_entries: usize) {
        self.max_log_entries = max_entries.max(1);
    }

    pub fn log_debug(&mut self, message: impl Into<String>) {
        self.log(LogLevel::Debug, message.into());
    }

    pub fn log_progress(&mut self, message: impl Into<String>) {
        self.log(LogLevel::Progress, message.into());
    }

    pub fn log_warning(&mut self, message: impl Into<String>) {
        self.log(LogLevel::Warning, message.into());
    }

    pub fn log_error(&mut self, message: impl Into<String>) {
        self.log(LogLevel::Error, message.into());
    }

    fn log(&mut self, level: LogLevel, message: String) {
        match level {
            LogLevel::Debug => log::debug!("{message}"),
            LogLevel::Progress => log::info!("{message}"),
            LogLevel::Warning => log::warn!("{message}"),
            LogLevel::Error => log::error!("{message}"),
        }

        self.logs.push(LogEntry {
            level,
            timestamp: Instant::now(),
            message,
        });
        if self.logs.len() > self.max_log_entries {
            let excess = self.logs.len() - self.max_log_entries;
            self.logs.drain(..excess);
        }
    }

    /// Starts a timer for the given category
    pub fn start_timer(&mut self, category: TimerCategory) {
        if self.enable_timing {
            self.active_timers.insert(category, Instant::now());
        }
    }

    /// Stops a timer and adds the elapsed time to its accumulated total
    pub fn stop_timer(&mut self, category: TimerCategory) {
        if let Some(start) = self.active_timers.remove(&category) {
            *self.accumulated.entry(category).or_default() += start.elapsed();
        }
    }

    /// Accumulated time for a category, if it was ever timed
    pub fn accumulated_time(&self, category: TimerCategory) -> Option<Duration> {
        self.accumulated.get(&category).copied()
    }

    /// Clears accumulated timers
    pub fn reset_timers(&mut self) {
        self.active_timers.clear();
        self.accumulated.clear();
    }

    /// All retained log entries, oldest first
    pub fn logs(&self) -> &[LogEntry] {
        &self.logs
    }

    /// Retained log messages, oldest first
    pub fn messages(&self) -> Vec<String> {
        self.logs.iter().map(|entry| entry.message.clone()).collect()
    }

    /// Clears all logs
    pub fn clear_logs(&mut self) {
        self.logs.clear();
    }

    /// Appends a per-stage timing report to the log
    pub fn log_build_times(&mut self) {
        let total = self
            .accumulated_time(TimerCategory::Total)
            .unwrap_or_default()
            .as_secs_f32()
            * 1000.0;
        let pc = if total > 0.0 { 100.0 / total } else { 0.0 };

        self.log_progress("Build Times");
        for category in TimerCategory::ALL {
            if category == TimerCategory::Total {
                continue;
            }
            if let Some(duration) = self.accumulated_time(category) {
                let ms = duration.as_secs_f32() * 1000.0;
                self.log_progress(format!(
                    "- {}:\t{:.2}ms\t({:.1}%)",
                    category.label(),
                    ms,
                    ms * pc
                ));
            }
        }
        self.log_progress(format!("=== TOTAL:\t{total:.2}ms"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_cap_drops_oldest() {
        let mut ctx = RecastContext::new();
        ctx.set_max_log_entries(3);
        for i in 0..5 {
            ctx.log_progress(format!("message {i}"));
        }
        assert_eq!(ctx.messages(), vec!["message 2", "message 3", "message 4"]);
    }

    #[test]
    fn test_timers_accumulate() {
        let mut ctx = RecastContext::new();
        ctx.start_timer(TimerCategory::Layers);
        ctx.stop_timer(TimerCategory::Layers);
        ctx.start_timer(TimerCategory::Layers);
        ctx.stop_timer(TimerCategory::Layers);
        assert!(ctx.accumulated_time(TimerCategory::Layers).is_some());
        assert!(ctx.accumulated_time(TimerCategory::PolyMesh).is_none());

        ctx.set_timing_enabled(false);
        ctx.start_timer(TimerCategory::PolyMesh);
        ctx.stop_timer(TimerCategory::PolyMesh);
        assert!(ctx.accumulated_time(TimerCategory::PolyMesh).is_none());
    }

    #[test]
    fn test_build_times_report() {
        let mut ctx = RecastContext::new();
        ctx.start_timer(TimerCategory::Total);
        ctx.start_timer(TimerCategory::Rasterization);
        ctx.stop_timer(TimerCategory::Rasterization);
        ctx.stop_timer(TimerCategory::Total);
        ctx.log_build_times();

        let messages = ctx.messages();
        assert_eq!(messages.first().map(String::as_str), Some("Build Times"));
        assert!(messages.iter().any(|m| m.starts_with("- Rasterize")));
        assert!(messages.last().is_some_and(|m| m.starts_with("=== TOTAL")));
    }
}
