//! Runtime configuration.
//!
//! Supports project-level configuration with default-filling merge
//! semantics:
//!
//! ```text
//! Priority (high → low):
//! 1. Environment variables (XUANJI_LOG)
//! 2. Project-level (xuanji.toml)
//! 3. Default values
//! ```

use std::fs;
use std::path::Path;
use std::str::FromStr;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::memory::HeapConfig;
use crate::task::SchedulerConfig;
use crate::unwind::PanicStrategy;
use crate::util::logger::LogLevel;

/// Project config file name.
pub const CONFIG_FILE: &str = "xuanji.toml";

/// Log level override from the environment, read once.
static ENV_LOG_LEVEL: Lazy<Option<LogLevel>> = Lazy::new(|| {
    std::env::var("XUANJI_LOG")
        .ok()
        .and_then(|v| LogLevel::from_str(&v).ok())
});

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Top-level runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RuntimeConfig {
    /// Task/scheduler settings.
    #[serde(default)]
    pub task: TaskSection,
    /// Heap region settings.
    #[serde(default)]
    pub heap: HeapSection,
    /// Abnormal-termination settings.
    #[serde(default)]
    pub panic: PanicSection,
    /// Logging settings.
    #[serde(default)]
    pub log: LogSection,
}

/// Task/scheduler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSection {
    /// Stack size for spawned tasks.
    #[serde(default = "default_stack_size")]
    pub stack_size: usize,
    /// Prefix for native thread names.
    #[serde(default = "default_name_prefix")]
    pub name_prefix: String,
}

impl Default for TaskSection {
    fn default() -> Self {
        Self {
            stack_size: default_stack_size(),
            name_prefix: default_name_prefix(),
        }
    }
}

/// Heap region settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeapSection {
    /// Committed size at startup.
    #[serde(default = "default_heap_initial")]
    pub initial_size: usize,
    /// Reserved capacity the heap may grow into.
    #[serde(default = "default_heap_max")]
    pub max_size: usize,
}

impl Default for HeapSection {
    fn default() -> Self {
        Self {
            initial_size: default_heap_initial(),
            max_size: default_heap_max(),
        }
    }
}

/// Abnormal-termination settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PanicSection {
    /// Unwind through cleanup frames, or halt immediately.
    #[serde(default)]
    pub strategy: PanicStrategy,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LogSection {
    /// Minimum level emitted.
    #[serde(default)]
    pub level: LogLevel,
}

fn default_stack_size() -> usize {
    2 * 1024 * 1024
}

fn default_name_prefix() -> String {
    "xuanji-task".to_string()
}

fn default_heap_initial() -> usize {
    16 * 1024 * 1024
}

fn default_heap_max() -> usize {
    256 * 1024 * 1024
}

impl RuntimeConfig {
    /// Parse a configuration from TOML text. Missing fields fill with
    /// defaults.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let mut config: Self = toml::from_str(text)?;
        config.apply_env();
        Ok(config)
    }

    /// Load a configuration file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Load `xuanji.toml` from the working directory, falling back to
    /// defaults when it does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Path::new(CONFIG_FILE);
        if path.exists() {
            Self::from_file(path)
        } else {
            let mut config = Self::default();
            config.apply_env();
            Ok(config)
        }
    }

    fn apply_env(&mut self) {
        if let Some(level) = *ENV_LOG_LEVEL {
            self.log.level = level;
        }
    }

    /// The scheduler view of this configuration.
    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            stack_size: self.task.stack_size,
            name_prefix: self.task.name_prefix.clone(),
        }
    }

    /// The heap view of this configuration.
    pub fn heap_config(&self) -> HeapConfig {
        HeapConfig {
            initial_size: self.heap.initial_size,
            max_size: self.heap.max_size,
        }
    }
}
