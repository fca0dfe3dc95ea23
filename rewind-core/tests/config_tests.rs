//! Integration tests for configuration system

use rewind_core::capture::CaptureBackendKind;
use rewind_core::config::{sample_config, ConfigFile, ReplayConfig, DEFAULT_RETENTION_SECS};
use rewind_core::error::RewindError;
use rewind_core::trigger::TriggerKind;
use tempfile::TempDir;

#[test]
fn test_missing_file_yields_defaults() {
    let dir = TempDir::new().unwrap();
    let file = ConfigFile::load_from(&dir.path().join("absent.toml")).expect("Should default");
    assert_eq!(file, ConfigFile::default());

    let config = file.to_replay_config().expect("defaults are valid");
    assert_eq!(config.retention_secs, DEFAULT_RETENTION_SECS);
    assert_eq!(config.backend, CaptureBackendKind::Service);
    assert!(!config.has_audio());
}

#[test]
fn test_save_and_reload() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nested").join("config.toml");

    let mut file = ConfigFile::default();
    file.replay.seconds = 45;
    file.capture.device = "card1:42".to_string();
    file.audio.enabled = true;
    file.trigger.kind = TriggerKind::Hotkey;
    file.trigger.hotkey = "ctrl+shift+r".to_string();
    file.save_to(&path).expect("Should save");

    let loaded = ConfigFile::load_from(&path).expect("Should load");
    assert_eq!(loaded, file);

    let config = loaded.to_replay_config().expect("Should convert");
    assert_eq!(config.retention_secs, 45);
    assert_eq!(config.device, "card1:42");
    assert!(config.has_audio());
    assert_eq!(config.trigger.kind, TriggerKind::Hotkey);
    assert_eq!(config.trigger.hotkey, "ctrl+shift+r");
}

#[test]
fn test_sample_config_matches_defaults() {
    let parsed: ConfigFile = toml::from_str(&sample_config()).expect("sample parses");
    assert_eq!(parsed, ConfigFile::default());
}

#[test]
fn test_partial_file_fills_defaults() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(
        &path,
        r#"
[capture]
backend = "kms"
framerate = 30

[output]
template = "/tmp/clips/%H%M%S.mkv"
post_save = "notify-send Saved {file}"
"#,
    )
    .unwrap();

    let config = ConfigFile::load_from(&path).unwrap().to_replay_config().unwrap();
    assert_eq!(config.backend, CaptureBackendKind::Kms);
    assert_eq!(config.framerate, 30);
    assert_eq!(config.output.as_str(), "/tmp/clips/%H%M%S.mkv");
    assert_eq!(config.post_save.as_deref(), Some("notify-send Saved {file}"));
    assert_eq!(config.retention_secs, DEFAULT_RETENTION_SECS);
}

#[test]
fn test_malformed_file_is_config_error() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(&path, "[replay\nseconds = ").unwrap();

    let err = ConfigFile::load_from(&path).unwrap_err();
    assert!(matches!(err, RewindError::Config(_)));
    assert!(err.user_hint().is_some());
}

#[test]
fn test_out_of_range_values_rejected() {
    let mut file = ConfigFile::default();
    file.replay.seconds = 0;
    assert!(file.to_replay_config().is_err());

    let mut file = ConfigFile::default();
    file.audio.enabled = true;
    file.audio.channels = 6;
    assert!(file.to_replay_config().is_err());

    let mut file = ConfigFile::default();
    file.output.template = String::new();
    assert!(file.to_replay_config().is_err());
}

#[test]
fn test_builder_overrides() {
    let config = ReplayConfig::default()
        .with_retention(10)
        .with_framerate(30)
        .with_device("card0")
        .with_post_save("true");

    assert!(config.validate_strict().is_ok());
    assert_eq!(config.retention_secs, 10);
    assert_eq!(config.framerate, 30);
    assert_eq!(config.device, "card0");
    assert_eq!(config.post_save.as_deref(), Some("true"));

    assert!(config.with_retention(601).validate_strict().is_err());
}

#[test]
fn test_show_renders_toml() {
    let rendered = ConfigFile::default().to_toml().expect("Should render");
    assert!(rendered.contains("[replay]"));
    assert!(rendered.contains("seconds = 30"));
    let reparsed: ConfigFile = toml::from_str(&rendered).unwrap();
    assert_eq!(reparsed, ConfigFile::default());
}
