// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::io::Write;

use super::*;

#[test]
fn validate_rejects_rank_not_less_than_size() {
    let config = BrokerConfig {
        rank: 2,
        size: 2,
        socket: PathBuf::from("/tmp/x.sock"),
        module_path: None,
        conf_path: None,
        hello_timeout: 10.0,
        log_format: "json".to_string(),
        log_level: "info".to_string(),
    };
    assert!(config.validate().is_err());
}

#[test]
fn validate_rejects_nonpositive_hello_timeout() {
    let config = BrokerConfig {
        rank: 0,
        size: 1,
        socket: PathBuf::from("/tmp/x.sock"),
        module_path: None,
        conf_path: None,
        hello_timeout: 0.0,
        log_format: "json".to_string(),
        log_level: "info".to_string(),
    };
    assert!(config.validate().is_err());
}

#[test]
fn is_root_is_true_only_for_rank_zero() {
    let mut config = BrokerConfig {
        rank: 0,
        size: 4,
        socket: PathBuf::from("/tmp/x.sock"),
        module_path: None,
        conf_path: None,
        hello_timeout: 10.0,
        log_format: "json".to_string(),
        log_level: "info".to_string(),
    };
    assert!(config.is_root());
    config.rank = 1;
    assert!(!config.is_root());
}

#[test]
fn toml_config_source_loads_nested_tables_as_json() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "[modules]\nsched = \"enabled\"\n\n[hello]\ntimeout = 10.0").unwrap();
    let source = TomlConfigSource::new(file.path());

    let value = source.load().unwrap();
    assert_eq!(value["modules"]["sched"], "enabled");
    assert_eq!(value["hello"]["timeout"], 10.0);
}

#[test]
fn toml_config_source_reports_missing_file() {
    let source = TomlConfigSource::new("/nonexistent/path/flux.toml");
    assert!(source.load().is_err());
}
