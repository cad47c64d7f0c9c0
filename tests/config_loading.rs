//! Configuration loading tests.
//!
//! These mutate process environment variables, so they run serially.

use std::io::Write;

use serial_test::serial;
use stream_sourcing::config::{Config, CONFIG_ENV_VAR};
use stream_sourcing::{Broker, ErrorKind};

const TWO_ACCOUNTS: &str = r#"
server:
  host: 127.0.0.1
  port: 4333
sourcing:
  batch_size: 64
accounts:
  - name: testA
    users:
      - user: user-testA
        password: s3cr3t
    exports:
      - stream: testA
        to: [testB]
  - name: testB
    users:
      - user: user-testB
        password: s3cr3t
"#;

fn write_config(yaml: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(".yaml")
        .tempfile()
        .unwrap();
    file.write_all(yaml.as_bytes()).unwrap();
    file
}

#[test]
#[serial]
fn test_load_from_explicit_path() {
    let file = write_config(TWO_ACCOUNTS);
    let config = Config::load(Some(file.path().to_str().unwrap())).unwrap();

    assert_eq!(config.server.port, 4333);
    assert_eq!(config.sourcing.batch_size, 64);
    assert_eq!(config.sourcing.max_backoff_ms, 2000);
    assert_eq!(config.accounts.len(), 2);
    assert_eq!(config.accounts[0].exports[0].to, vec!["testB"]);
}

#[test]
#[serial]
fn test_env_file_and_overrides() {
    let file = write_config(TWO_ACCOUNTS);
    std::env::set_var(CONFIG_ENV_VAR, file.path());
    std::env::set_var("SOURCING__SERVER__PORT", "5000");

    let loaded = Config::load(None);

    std::env::remove_var(CONFIG_ENV_VAR);
    std::env::remove_var("SOURCING__SERVER__PORT");

    let config = loaded.unwrap();
    assert_eq!(config.server.port, 5000);
    assert_eq!(config.server.client_url(), "nats://127.0.0.1:5000");
    assert_eq!(config.accounts[1].name, "testB");
}

#[test]
#[serial]
fn test_duplicate_user_rejected() {
    let yaml = r#"
accounts:
  - name: testA
    users: [{ user: shared, password: a }]
  - name: testB
    users: [{ user: shared, password: b }]
"#;
    let file = write_config(yaml);
    let err = Config::load(Some(file.path().to_str().unwrap())).unwrap_err();
    assert!(err.to_string().contains("shared"), "{err}");
}

#[tokio::test]
#[serial]
async fn test_broker_starts_from_loaded_config() {
    let file = write_config(TWO_ACCOUNTS);
    let config = Config::load(Some(file.path().to_str().unwrap())).unwrap();
    let broker = Broker::start(config).await.unwrap();

    assert_eq!(broker.client_url(), "nats://127.0.0.1:4333");
    broker.connect("user-testA", "s3cr3t").unwrap();
    let err = broker.connect("user-testB", "wrong").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    broker.shutdown().await;
}
