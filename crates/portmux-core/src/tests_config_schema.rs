#[test]
fn default_config_is_valid() {
    let config = super::PortmuxConfig::default();
    assert!(config.validate().is_ok());
}

#[test]
fn serde_round_trip_preserves_core_fields() {
    let json = r#"
        {
          "listen_addr": "0.0.0.0",
          "listen_port": 11080,
          "tls_required_for_http": true,
          "socks_credentials": { "username": "relay", "password": "hunter2" },
          "binary_remote": { "host": "10.0.0.9", "port": 9000 },
          "event_sink": {
            "kind": "file",
            "path": "/tmp/portmux-events.jsonl"
          }
        }
    "#;
    let parsed = serde_json::from_str::<super::PortmuxConfig>(json).expect("deserialize config");
    assert_eq!(parsed.listen_addr, "0.0.0.0");
    assert_eq!(parsed.listen_port, 11_080);
    assert!(parsed.tls_required_for_http);
    assert_eq!(
        parsed.socks_credentials.as_ref().map(|c| c.username.as_str()),
        Some("relay")
    );
    assert_eq!(
        parsed.binary_remote.as_ref().map(super::RemoteEndpoint::authority),
        Some("10.0.0.9:9000".to_string())
    );
    assert_eq!(parsed.event_sink.kind, super::EventSinkKind::File);
    assert!(parsed.validate().is_ok());
}

#[test]
fn serde_rejects_unknown_fields() {
    let json = r#"{ "unknown_field": true }"#;
    let err =
        serde_json::from_str::<super::PortmuxConfig>(json).expect_err("unknown field must fail");
    let message = err.to_string();
    assert!(
        message.contains("unknown field"),
        "expected unknown field error, got: {message}"
    );
}

#[test]
fn validation_rejects_partial_ca_path_pair() {
    let config = super::PortmuxConfig {
        ca_cert_pem_path: Some("/tmp/ca.crt".to_string()),
        ca_key_pem_path: None,
        ..super::PortmuxConfig::default()
    };
    let err = config.validate().expect_err("partial CA pair should fail");
    assert_eq!(err, super::PortmuxConfigError::InvalidCaPathPair);
}

#[test]
fn validation_rejects_zero_probe_budget() {
    let config = super::PortmuxConfig {
        max_probe_bytes: 0,
        ..super::PortmuxConfig::default()
    };
    let err = config.validate().expect_err("zero probe budget should fail");
    assert_eq!(err, super::PortmuxConfigError::ZeroValue("max_probe_bytes"));
}

#[test]
fn validation_rejects_file_sink_without_path() {
    let config = super::PortmuxConfig {
        event_sink: super::EventSinkConfig {
            kind: super::EventSinkKind::File,
            path: None,
        },
        ..super::PortmuxConfig::default()
    };
    let err = config.validate().expect_err("file sink needs a path");
    assert_eq!(err, super::PortmuxConfigError::MissingEventSinkPath);
}

#[test]
fn validation_rejects_empty_socks_username() {
    let config = super::PortmuxConfig {
        socks_credentials: Some(super::SocksCredentials {
            username: String::new(),
            password: "secret".to_string(),
        }),
        ..super::PortmuxConfig::default()
    };
    let err = config.validate().expect_err("empty username should fail");
    assert_eq!(err, super::PortmuxConfigError::EmptySocksUsername);
}
