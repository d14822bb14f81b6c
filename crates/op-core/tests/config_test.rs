use op_core::config::{Config, ConfigError};

#[test]
fn default_config() {
    let cfg = Config::default();
    assert_eq!(cfg.general.log_level, "info");
    assert_eq!(cfg.general.secret_key_env, "OUTPOST_SECRET_KEY");
    assert_eq!(cfg.transport.enabled, vec!["websocket".to_string()]);
    assert_eq!(cfg.transport.queue_capacity, 500);
    assert_eq!(cfg.transport.probe_delay_ms, 2_000);
    assert_eq!(cfg.transport.retry_delay_ms, 5_000);
    assert_eq!(cfg.transport.write_timeout_ms, 10_000);
    assert_eq!(cfg.aggregation.top_variances, 5);
    assert_eq!(cfg.aggregation.learning_window_secs, 900);
    assert_eq!(cfg.aggregation.ewma_tick_ms, 5_000);
    assert_eq!(cfg.daemon.log_buffer_lines, 20);
    cfg.validate().expect("defaults validate");
}

#[test]
fn config_roundtrip() {
    let mut cfg = Config::default();
    cfg.transport
        .endpoints
        .insert("websocket".into(), "wss://backend.example:443".into());
    let toml_str = cfg.to_toml().expect("serialize to toml");
    assert!(toml_str.contains("wss://backend.example:443"));

    let parsed: Config = toml::from_str(&toml_str).expect("parse toml back");
    assert_eq!(parsed.transport.endpoints, cfg.transport.endpoints);
    assert_eq!(parsed.aggregation.shipping_interval_secs, 30);
    parsed.validate().expect("config validates");
}

#[test]
fn config_partial_toml() {
    let partial = r#"
[general]
server_name = "web-01"
public_key = "pk_123"

[transport]
enabled = ["axon", "websocket"]
queue_capacity = 42

[transport.endpoints]
push = "tcp://10.0.0.1:3900"
reverse = "tcp://10.0.0.1:43554"
"#;
    let cfg: Config = toml::from_str(partial).expect("parse partial");
    assert_eq!(cfg.general.server_name, "web-01");
    assert_eq!(cfg.transport.queue_capacity, 42);
    assert!(cfg.transport.is_enabled("axon"));
    assert_eq!(
        cfg.transport.endpoints.get("reverse").map(String::as_str),
        Some("tcp://10.0.0.1:43554")
    );
    // defaults fill in the rest
    assert_eq!(cfg.general.log_level, "info");
    assert_eq!(cfg.aggregation.top_variances, 5);
    cfg.validate().expect("config validates");
}

#[test]
fn load_from_file_validates() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("config.toml");
    std::fs::write(&path, "[aggregation]\newma_tick_ms = 0\n").expect("write config");

    let err = Config::load_from(&path).expect_err("validation should fail");
    assert!(matches!(err, ConfigError::Validation(_)));
    assert!(err.to_string().contains("ewma_tick_ms"));
}

#[test]
fn load_from_missing_file_is_io_error() {
    let err = Config::load_from("/definitely/not/here/config.toml").expect_err("missing file");
    assert!(matches!(err, ConfigError::Io(_)));
}

#[test]
fn zero_status_interval_fails_to_load() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("config.toml");
    std::fs::write(&path, "[daemon]\nstatus_interval_secs = 0\n").expect("write config");

    let err = Config::load_from(&path).expect_err("validation should fail");
    assert!(matches!(err, ConfigError::Validation(_)));
    assert!(err.to_string().contains("status_interval_secs"));
}
