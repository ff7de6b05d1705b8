//! Config loading and device-selection persistence

mod common;

use echocast::config::{Config, DeviceStore};
use echocast::device::DeviceType;

use common::cast_device;

#[test]
fn device_store_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let store = DeviceStore::new(dir.path());

    assert!(store.load().unwrap().is_none());

    let device = cast_device("den");
    store.save(&device).unwrap();

    let loaded = store.load().unwrap().expect("device persisted");
    assert_eq!(loaded.id, device.id);
    assert_eq!(loaded.name, device.name);
    assert_eq!(loaded.address, device.address);
    assert_eq!(loaded.port, device.port);
    assert_eq!(loaded.device_type, DeviceType::Googlecast);
}

#[test]
fn config_file_is_parsed_with_defaults_for_missing_fields() {
    std::env::remove_var("TELEGRAM_BOT_TOKEN");
    std::env::remove_var("ECHOCAST_ALLOWED_USERS");

    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("echocast.toml"),
        r#"
[telegram]
token = "123:abc"
allowed_users = [11, 22]

[tts]
voice = "Samantha"
"#,
    )
    .unwrap();

    let config = Config::load_from(dir.path()).unwrap();
    assert_eq!(config.telegram.token, "123:abc");
    assert_eq!(config.telegram.allowed_users, vec![11, 22]);
    assert_eq!(config.telegram.poll_interval_ms, 1000);
    assert_eq!(config.tts.voice, "Samantha");
    assert_eq!(config.tts.rate, 150);
    assert_eq!(config.cast.keepalive_secs, 25);
    assert_eq!(config.server.idle_timeout_secs, 120);
    assert_eq!(config.config_dir, dir.path());
}

#[test]
fn missing_token_is_an_error() {
    std::env::remove_var("TELEGRAM_BOT_TOKEN");

    let dir = tempfile::tempdir().unwrap();
    let err = Config::load_from(dir.path()).unwrap_err();
    assert_eq!(err.kind(), "config");
}
