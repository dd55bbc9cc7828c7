//! Unit tests for configuration and graceful degradation
//!
//! Note: Uses serial_test crate to prevent ENV variable race conditions.
//! Tests that manipulate ROSTER_ROOT_FOLDER or ROSTER_CONFIG are marked with #[serial].

use roster_common::config::{
    RootFolderInitializer, RootFolderResolver, TomlConfig, CONFIG_FILE_ENV, DATABASE_FILE_NAME,
    ROOT_FOLDER_ENV,
};
use serial_test::serial;
use std::env;
use std::path::{Path, PathBuf};

#[test]
fn test_defaults_when_sections_missing() {
    let config = TomlConfig::parse("").unwrap();

    assert_eq!(config.logging.level, "info");
    assert_eq!(config.import.columns.name, "Name");
    assert_eq!(config.import.columns.national_id, "NationalId");
    assert_eq!(config.import.columns.local_id, "LocalId");
    assert_eq!(config.import.columns.group_name, "GroupName");
    assert_eq!(config.import.class_column, "GroupName");
    assert_eq!(config.import.max_rows_per_statement, 500);
    assert!(config.import.start_timeout_ms.is_none());
}

#[test]
fn test_custom_header_labels() {
    let config = TomlConfig::parse(
        r#"
        [logging]
        level = "debug"

        [import]
        class_column = "Kelas"
        start_timeout_ms = 2000

        [import.columns]
        name = "Nama"
        national_id = "NISN"
        local_id = "NIS"
        group_name = "Kelas"
        "#,
    )
    .unwrap();

    assert_eq!(config.logging.level, "debug");
    assert_eq!(config.import.columns.name, "Nama");
    assert_eq!(config.import.columns.national_id, "NISN");
    assert_eq!(config.import.columns.local_id, "NIS");
    assert_eq!(config.import.columns.group_name, "Kelas");
    assert_eq!(config.import.class_column, "Kelas");
    assert_eq!(config.import.start_timeout_ms, Some(2000));
    // Untouched keys keep their defaults
    assert_eq!(config.import.event_capacity, 100);
}

#[test]
fn test_invalid_values_rejected() {
    assert!(TomlConfig::parse("[import]\nmax_rows_per_statement = 0").is_err());
    assert!(TomlConfig::parse("[import.columns]\nname = \"  \"").is_err());
    assert!(TomlConfig::parse("not = [valid").is_err());
}

#[test]
fn test_database_path_resolution() {
    let root = PathBuf::from("/srv/roster");

    let config = TomlConfig::default();
    assert_eq!(config.resolve_database_path(&root), root.join(DATABASE_FILE_NAME));

    let config = TomlConfig::parse("database_path = \"data/school.db\"").unwrap();
    assert_eq!(config.resolve_database_path(&root), root.join("data/school.db"));

    let config = TomlConfig::parse("database_path = \"/var/db/school.db\"").unwrap();
    assert_eq!(config.resolve_database_path(&root), PathBuf::from("/var/db/school.db"));
}

#[test]
#[serial]
fn test_resolver_priority_order() {
    env::remove_var(ROOT_FOLDER_ENV);

    let toml = TomlConfig::parse("root_folder = \"/tmp/roster-from-toml\"").unwrap();

    // TOML beats the compiled default
    let resolver = RootFolderResolver::new().with_toml(&toml);
    assert_eq!(resolver.resolve(), PathBuf::from("/tmp/roster-from-toml"));

    // Environment beats TOML
    env::set_var(ROOT_FOLDER_ENV, "/tmp/roster-from-env");
    assert_eq!(resolver.resolve(), PathBuf::from("/tmp/roster-from-env"));

    // CLI beats everything
    let resolver = resolver.with_cli_arg(Some(PathBuf::from("/tmp/roster-from-cli")));
    assert_eq!(resolver.resolve(), PathBuf::from("/tmp/roster-from-cli"));

    env::remove_var(ROOT_FOLDER_ENV);
}

#[test]
#[serial]
fn test_resolver_with_no_overrides_uses_default() {
    env::remove_var(ROOT_FOLDER_ENV);

    let root_folder = RootFolderResolver::new().resolve();
    assert!(!root_folder.as_os_str().is_empty());
}

#[test]
#[serial]
fn test_missing_config_file_falls_back_to_defaults() {
    env::remove_var(CONFIG_FILE_ENV);

    let config = TomlConfig::load_or_default(Some(Path::new(
        "/tmp/roster-definitely-missing/config.toml",
    )));
    assert_eq!(config.logging.level, "info");
}

#[test]
#[serial]
fn test_config_file_from_env() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("roster.toml");
    std::fs::write(&path, "[logging]\nlevel = \"warn\"\n").unwrap();

    env::set_var(CONFIG_FILE_ENV, &path);
    let config = TomlConfig::load_or_default(None);
    env::remove_var(CONFIG_FILE_ENV);

    assert_eq!(config.logging.level, "warn");
}

#[test]
#[serial]
fn test_broken_config_file_falls_back_to_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("roster.toml");
    std::fs::write(&path, "[import]\nmax_rows_per_statement = 0\n").unwrap();

    let config = TomlConfig::load_or_default(Some(path.as_path()));
    assert_eq!(config.import.max_rows_per_statement, 500);
}

#[test]
fn test_initializer_creates_directory() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("nested").join("roster");

    let initializer = RootFolderInitializer::new(root.clone());
    initializer.ensure_directory_exists().unwrap();
    // Idempotent
    initializer.ensure_directory_exists().unwrap();

    assert!(root.is_dir());
    assert_eq!(initializer.database_path(), root.join(DATABASE_FILE_NAME));
}
