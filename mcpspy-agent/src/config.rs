//! Agent configuration, built once at startup and passed by value to
//! each subsystem.

use std::path::PathBuf;

use log::LevelFilter;

#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: LevelFilter,
    /// Print raw message buffers alongside each event.
    pub show_buffers: bool,
    /// Write events as JSON lines to this path.
    pub jsonl_output: Option<PathBuf>,
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }
}

#[derive(Debug, Default)]
pub struct ConfigBuilder {
    log_level: Option<LevelFilter>,
    show_buffers: bool,
    jsonl_output: Option<PathBuf>,
}

impl ConfigBuilder {
    pub fn log_level(mut self, level: LevelFilter) -> Self {
        self.log_level = Some(level);
        self
    }

    pub fn show_buffers(mut self, show: bool) -> Self {
        self.show_buffers = show;
        self
    }

    pub fn jsonl_output(mut self, path: Option<PathBuf>) -> Self {
        self.jsonl_output = path;
        self
    }

    pub fn build(self) -> Config {
        Config {
            log_level: self.log_level.unwrap_or(LevelFilter::Info),
            show_buffers: self.show_buffers,
            jsonl_output: self.jsonl_output,
        }
    }
}
