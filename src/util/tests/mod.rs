//! 配置与日志单元测试

use std::str::FromStr;

use crate::unwind::PanicStrategy;
use crate::util::config::{ConfigError, RuntimeConfig};
use crate::util::logger::LogLevel;

#[test]
fn test_default_config() {
    let config = RuntimeConfig::default();
    assert_eq!(config.task.stack_size, 2 * 1024 * 1024);
    assert_eq!(config.task.name_prefix, "xuanji-task");
    assert_eq!(config.heap.initial_size, 16 * 1024 * 1024);
    assert_eq!(config.heap.max_size, 256 * 1024 * 1024);
    assert_eq!(config.panic.strategy, PanicStrategy::Unwind);
    assert_eq!(config.log.level, LogLevel::Info);
}

#[test]
fn test_partial_toml_fills_defaults() {
    let config = RuntimeConfig::from_toml(
        r#"
        [heap]
        initial_size = 4096
        "#,
    )
    .unwrap();
    assert_eq!(config.heap.initial_size, 4096);
    // Untouched fields keep their defaults.
    assert_eq!(config.heap.max_size, 256 * 1024 * 1024);
    assert_eq!(config.task.stack_size, 2 * 1024 * 1024);
}

#[test]
fn test_full_toml() {
    let config = RuntimeConfig::from_toml(
        r#"
        [task]
        stack_size = 65536
        name_prefix = "worker"

        [heap]
        initial_size = 8192
        max_size = 32768

        [panic]
        strategy = "halt"

        [log]
        level = "debug"
        "#,
    )
    .unwrap();
    assert_eq!(config.task.stack_size, 65536);
    assert_eq!(config.task.name_prefix, "worker");
    assert_eq!(config.heap.max_size, 32768);
    assert_eq!(config.panic.strategy, PanicStrategy::Halt);
    assert_eq!(config.log.level, LogLevel::Debug);
}

#[test]
fn test_bad_toml_reports_parse_error() {
    let err = RuntimeConfig::from_toml("not [ valid = toml").unwrap_err();
    assert!(matches!(err, ConfigError::Parse(_)));
}

#[test]
fn test_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("xuanji.toml");
    std::fs::write(&path, "[task]\nstack_size = 123456\n").unwrap();

    let config = RuntimeConfig::from_file(&path).unwrap();
    assert_eq!(config.task.stack_size, 123456);

    let missing = RuntimeConfig::from_file(&dir.path().join("nope.toml"));
    assert!(matches!(missing.unwrap_err(), ConfigError::Io(_)));
}

#[test]
fn test_config_views() {
    let config = RuntimeConfig::default();
    let sched = config.scheduler_config();
    assert_eq!(sched.stack_size, config.task.stack_size);
    let heap = config.heap_config();
    assert_eq!(heap.max_size, config.heap.max_size);
}

#[test]
fn test_log_level_from_str() {
    assert_eq!(LogLevel::from_str("debug"), Ok(LogLevel::Debug));
    assert_eq!(LogLevel::from_str("WARN"), Ok(LogLevel::Warn));
    assert_eq!(LogLevel::from_str("warning"), Ok(LogLevel::Warn));
    assert!(LogLevel::from_str("loud").is_err());
}

#[test]
fn test_log_level_to_tracing() {
    assert_eq!(tracing::Level::from(LogLevel::Error), tracing::Level::ERROR);
    assert_eq!(tracing::Level::from(LogLevel::Trace), tracing::Level::TRACE);
}
