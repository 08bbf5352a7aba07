//! Console output for audit records.
//!
//! Renders one coloured line per record:
//! `[LEVEL] [time] action | Key: json | ...`
//!
//! The level column shows the level code in the level's configured colour.

use crate::audit::aggregator::RecordSink;
use crate::audit::entry::{AuditRecord, LogLevel};
use crate::core::now;
use colored::{Color, Colorize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Destination for rendered lines.
pub trait ConsoleOutput: Send + Sync {
    /// Write one rendered line.
    fn write_line(&self, line: &str);
}

/// Standard output.
#[derive(Clone, Copy, Debug, Default)]
pub struct Stdout;

impl ConsoleOutput for Stdout {
    fn write_line(&self, line: &str) {
        println!("{line}");
    }
}

/// Label and colour for one level.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LevelStyle {
    /// Display name of the level
    pub label: String,
    /// Colour of the level column
    pub color: Color,
}

impl LevelStyle {
    /// Create a style.
    pub fn new(label: &str, color: Color) -> Self {
        Self {
            label: label.to_string(),
            color,
        }
    }

    fn default_for(level: LogLevel) -> Self {
        match level {
            LogLevel::Info => Self::new("Info", Color::Cyan),
            LogLevel::Warn => Self::new("Warning", Color::Yellow),
            LogLevel::Error => Self::new("Error", Color::Red),
            LogLevel::Debug => Self::new("Debug", Color::Magenta),
            LogLevel::Custom => Self::new("Custom", Color::Green),
        }
    }
}

/// Console echo of audit records.
#[derive(Clone)]
pub struct ConsoleLogger {
    enabled: bool,
    styles: HashMap<LogLevel, LevelStyle>,
    output: Arc<dyn ConsoleOutput>,
}

impl ConsoleLogger {
    /// Create a logger with the default styles.
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            styles: LogLevel::ALL
                .into_iter()
                .map(|level| (level, LevelStyle::default_for(level)))
                .collect(),
            output: Arc::new(Stdout),
        }
    }

    /// A logger that prints nothing.
    pub fn disabled() -> Self {
        Self::new(false)
    }

    /// Override the style of one level.
    pub fn with_style(mut self, level: LogLevel, style: LevelStyle) -> Self {
        self.styles.insert(level, style);
        self
    }

    /// Send rendered lines to `output` instead of stdout.
    pub fn with_output(mut self, output: Arc<dyn ConsoleOutput>) -> Self {
        self.output = output;
        self
    }

    /// Whether output is enabled.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Style used for a level.
    pub fn style(&self, level: LogLevel) -> LevelStyle {
        self.styles
            .get(&level)
            .cloned()
            .unwrap_or_else(|| LevelStyle::default_for(level))
    }

    /// Render a record as one line.
    pub fn format_record(&self, record: &AuditRecord) -> String {
        let style = self.style(record.log_level);
        let mut parts = vec![
            format!("[{}]", record.log_level).color(style.color).to_string(),
            format!("[{}]", now().to_rfc3339()).bright_black().to_string(),
            record.action.cyan().to_string(),
        ];

        let properties: Vec<String> = match serde_json::to_value(record) {
            Ok(Value::Object(map)) => map
                .iter()
                .filter(|(key, _)| key.as_str() != "action" && key.as_str() != "logLevel")
                .map(|(key, value)| format!("{} {}", format!("{}:", capitalize(key)).yellow(), value))
                .collect(),
            _ => Vec::new(),
        };
        if !properties.is_empty() {
            parts.push(format!("| {}", properties.join(" | ")));
        }
        parts.join(" ")
    }

    /// Print a record when enabled.
    pub fn log_event_to_console(&self, record: &AuditRecord) {
        if self.enabled {
            self.output.write_line(&self.format_record(record));
        }
    }
}

impl Default for ConsoleLogger {
    fn default() -> Self {
        Self::new(true)
    }
}

impl RecordSink for ConsoleLogger {
    fn emit(&self, record: &AuditRecord) {
        self.log_event_to_console(record);
    }
}

fn capitalize(key: &str) -> String {
    let mut chars = key.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
