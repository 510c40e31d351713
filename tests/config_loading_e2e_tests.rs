/// E2E: layered configuration loading (file -> .env -> environment)
use std::env;
use std::fs;

use tempfile::TempDir;

use user_events::infrastructure::config::{
    Compression, ConfigLoader, ConfigSource, MessagingConfig, OffsetReset,
};
use user_events::messaging::{EventKind, MessagingError, SerializationFormat, TopicRouter};

const TOUCHED_VARS: [&str; 3] = [
    "USER_EVENTS_CONSUMER_GROUP",
    "USER_EVENTS_TOPIC_USER_DELETED",
    "USER_EVENTS_BROKERS",
];

fn clear_env_vars() {
    for var in TOUCHED_VARS {
        env::remove_var(var);
    }
}

fn write_json_config(dir: &TempDir) -> std::path::PathBuf {
    let path = dir.path().join("messaging.json");
    fs::write(
        &path,
        r#"{
            "brokers": ["json-broker:9092"],
            "client_id": "signup-service",
            "serialization_format": "msgpack",
            "topics": {
                "user_registered": "users.registered",
                "user_deleted": "users.deleted"
            },
            "producer": { "compression": "gzip", "channel_buffer_size": 64 },
            "consumer": { "auto_offset_reset": "latest" }
        }"#,
    )
    .unwrap();
    path
}

#[test]
fn test_json_file_drives_routing() {
    let dir = TempDir::new().unwrap();
    let path = write_json_config(&dir);

    let config = ConfigLoader::load_from_file(&path).unwrap();
    assert_eq!(config.client_id, "signup-service");
    assert_eq!(config.serialization_format, SerializationFormat::MessagePack);
    assert_eq!(config.producer.compression, Compression::Gzip);
    assert_eq!(config.producer.channel_buffer_size, 64);
    assert_eq!(config.consumer.auto_offset_reset, OffsetReset::Latest);

    let router = TopicRouter::new(config.topics.clone());
    assert_eq!(router.topic_for(EventKind::Registered), "users.registered");
    assert_eq!(router.topic_for(EventKind::Deleted), "users.deleted");
    assert_eq!(router.topic_for(EventKind::Updated), "user_updated");
}

#[test]
fn test_dotenv_and_environment_override_file() {
    clear_env_vars();
    let dir = TempDir::new().unwrap();
    let path = write_json_config(&dir);

    let dotenv = dir.path().join(".env");
    fs::write(
        &dotenv,
        "USER_EVENTS_CONSUMER_GROUP=from-dotenv\nUSER_EVENTS_TOPIC_USER_DELETED=dotenv.deleted\n",
    )
    .unwrap();
    // a real environment variable wins over the .env file
    env::set_var("USER_EVENTS_TOPIC_USER_DELETED", "env.deleted");

    let config = ConfigLoader::new()
        .add_source(ConfigSource::File(path))
        .add_source(ConfigSource::DotEnv(Some(dotenv)))
        .add_source(ConfigSource::Environment)
        .load()
        .unwrap();

    assert_eq!(config.brokers, vec!["json-broker:9092"]);
    assert_eq!(config.consumer_group, "from-dotenv");
    assert_eq!(config.topics["user_deleted"], "env.deleted");
    assert_eq!(config.topics["user_registered"], "users.registered");

    env::set_var("USER_EVENTS_BROKERS", " , ");
    let err = ConfigLoader::new()
        .add_source(ConfigSource::Environment)
        .load()
        .unwrap_err();
    assert!(matches!(err, MessagingError::Config(_)));

    clear_env_vars();
}

#[test]
fn test_missing_file_is_a_config_error() {
    let err = ConfigLoader::new()
        .add_source(ConfigSource::File("/nonexistent/messaging.toml".into()))
        .load()
        .unwrap_err();
    assert!(matches!(err, MessagingError::Config(_)));
}

#[test]
fn test_defaults_round_trip_through_yaml() {
    let defaults = MessagingConfig::default();
    let rendered = serde_yaml::to_string(&defaults).unwrap();
    let parsed: MessagingConfig = serde_yaml::from_str(&rendered).unwrap();

    assert_eq!(parsed.brokers, defaults.brokers);
    assert_eq!(parsed.producer.sync_timeout_secs, 30);
    assert_eq!(parsed.producer.enqueue_timeout_secs, 5);
    assert_eq!(parsed.consumer.auto_offset_reset, OffsetReset::Earliest);
}
