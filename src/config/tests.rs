use super::*;
use std::fs;
use tempfile::TempDir;

#[test]
fn config_file_persistence() {
    let temp_dir = TempDir::new().expect("should create TempDir successfully");
    let config_path = temp_dir.path().join("config.toml");

    let original_config = Config {
        embedding: EmbeddingConfig {
            protocol: "https".to_string(),
            host: "test-host".to_string(),
            port: 8080,
            model: "test-model".to_string(),
            ..EmbeddingConfig::default()
        },
        base_dir: temp_dir.path().to_path_buf(),
        ..Config::default()
    };

    let toml_content = toml::to_string_pretty(&original_config)
        .expect("config should convert to toml string successfully");
    fs::write(&config_path, toml_content).expect("should write to config_path successfully");

    let loaded_config = Config::load(temp_dir.path()).expect("should load config");

    assert_eq!(original_config, loaded_config);
}

#[test]
fn invalid_file_is_rejected() {
    let temp_dir = TempDir::new().expect("should create TempDir successfully");
    fs::write(
        temp_dir.path().join("config.toml"),
        "[chunking]\nmax_chunk_size = 100\noverlap = 200\n",
    )
    .expect("should write config");

    assert!(Config::load(temp_dir.path()).is_err());
}

#[test]
fn partial_file_fills_defaults() {
    let temp_dir = TempDir::new().expect("should create TempDir successfully");
    fs::write(
        temp_dir.path().join("config.toml"),
        "[retrieval]\nmax_sources = 3\n",
    )
    .expect("should write config");

    let config = Config::load(temp_dir.path()).expect("should load config");

    assert_eq!(config.retrieval.max_sources, 3);
    assert_eq!(config.retrieval.history_turns, 5);
    assert_eq!(config.cache, CacheConfig::default());
}
