use std::fs;

use once_cell::sync::Lazy;
use tempfile::tempdir;
use vigil_config::{ConfigLoadError, WorkerConfig, WorkerConfigSource};
use vigil_core::scan::orchestration::config::AiMode;

static ENV_LOCK: Lazy<tokio::sync::Mutex<()>> = Lazy::new(|| tokio::sync::Mutex::new(()));

const VARS: &[&str] = &[
    "VIGIL_CONFIG_PATH",
    "VIGIL_CONFIG_JSON",
    "VIGIL_AI_MODE",
    "VIGIL_WORKER_CONCURRENCY",
    "VIGIL_CHAIN_PORT_OFFSET",
    "VIGIL_AUTO_MIGRATE",
    "DATABASE_URL",
];

fn clear_env() {
    for key in VARS {
        unsafe { std::env::remove_var(key) };
    }
}

const SAMPLE_TOML: &str = r#"
agent_pool_size = 4

[orchestrator.pipeline]
ai_mode = "required"
compile_timeout_secs = 120

[orchestrator.consumer]
concurrency = 3
chain_base_port = 9545

[executors.clone]
program = "/opt/vigil/bin/clone"
args = ["--depth", "1"]

[executors.chain.command]
program = "anvil"
args = ["--port", "{port}"]
"#;

#[tokio::test]
async fn config_path_takes_precedence_over_inline_json() {
    let _guard = ENV_LOCK.lock().await;
    clear_env();

    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("worker.toml");
    fs::write(&path, SAMPLE_TOML).unwrap();

    unsafe {
        std::env::set_var("VIGIL_CONFIG_PATH", &path);
        std::env::set_var("VIGIL_CONFIG_JSON", r#"{"agent_pool_size": 9}"#);
    }
    let (config, source) = WorkerConfig::load_from_env().expect("load");
    clear_env();

    assert_eq!(source, WorkerConfigSource::EnvPath(path));
    assert_eq!(config.agent_pool_size, 4);
    assert_eq!(config.orchestrator.consumer.concurrency, 3);
    assert_eq!(config.orchestrator.consumer.chain_base_port, 9545);
    assert_eq!(config.orchestrator.pipeline.compile_timeout_secs, 120);
    // Untouched stage budgets keep their defaults.
    assert_eq!(config.orchestrator.pipeline.ai_timeout_secs, 600);
    assert_eq!(config.executors.clone.args, vec!["--depth", "1"]);
    assert_eq!(config.executors.chain.command.program, "anvil");
    assert_eq!(config.executors.chain.host, "127.0.0.1");
}

#[tokio::test]
async fn inline_json_is_used_without_a_path() {
    let _guard = ENV_LOCK.lock().await;
    clear_env();

    unsafe {
        std::env::set_var(
            "VIGIL_CONFIG_JSON",
            r#"{"orchestrator": {"retry": {"max_attempts": 5}}, "event_bus_capacity": 64}"#,
        )
    };
    let (config, source) = WorkerConfig::load_from_env().expect("load");
    clear_env();

    assert_eq!(source, WorkerConfigSource::EnvInline);
    assert_eq!(config.orchestrator.retry.max_attempts, 5);
    assert_eq!(config.event_bus_capacity, 64);
}

#[tokio::test]
async fn malformed_inline_json_is_an_error() {
    let _guard = ENV_LOCK.lock().await;
    clear_env();

    unsafe { std::env::set_var("VIGIL_CONFIG_JSON", "{not json") };
    let result = WorkerConfig::load_from_env();
    clear_env();

    assert!(result.is_err());
}

#[tokio::test]
async fn env_overrides_beat_file_values() {
    let _guard = ENV_LOCK.lock().await;
    clear_env();

    let mut config = WorkerConfig::parse_from_str(SAMPLE_TOML, "inline").expect("parse");
    unsafe {
        std::env::set_var("VIGIL_AI_MODE", "bypass");
        std::env::set_var("VIGIL_WORKER_CONCURRENCY", "8");
        std::env::set_var("VIGIL_CHAIN_PORT_OFFSET", "3");
        std::env::set_var("DATABASE_URL", "postgres://vigil@localhost/vigil");
        std::env::set_var("VIGIL_AUTO_MIGRATE", "off");
    }
    let result = config.apply_env_overrides();
    clear_env();

    result.expect("overrides");
    assert_eq!(config.orchestrator.pipeline.ai_mode, AiMode::Bypass);
    assert_eq!(config.orchestrator.consumer.concurrency, 8);
    // A second worker beside one running three slots on the same base port.
    assert_eq!(config.orchestrator.consumer.chain_port_for_slot(0), 9548);
    assert_eq!(
        config.database.url.as_deref(),
        Some("postgres://vigil@localhost/vigil")
    );
    assert!(!config.database.auto_migrate);
}

#[tokio::test]
async fn bad_override_names_the_variable() {
    let _guard = ENV_LOCK.lock().await;
    clear_env();

    let mut config = WorkerConfig::default();
    unsafe { std::env::set_var("VIGIL_WORKER_CONCURRENCY", "lots") };
    let result = config.apply_env_overrides();
    clear_env();

    match result {
        Err(ConfigLoadError::InvalidOverride { var, value, .. }) => {
            assert_eq!(var, "VIGIL_WORKER_CONCURRENCY");
            assert_eq!(value, "lots");
        }
        other => panic!("expected invalid override, got {other:?}"),
    }
}

#[tokio::test]
async fn json_file_extension_selects_json_parser() {
    let _guard = ENV_LOCK.lock().await;

    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("worker.json");
    fs::write(&path, r#"{"shutdown_drain_secs": 5}"#).unwrap();

    let config = WorkerConfig::load_from_file(&path).expect("load json");
    assert_eq!(config.shutdown_drain_secs, 5);
}

#[tokio::test]
async fn missing_file_reports_the_path() {
    let _guard = ENV_LOCK.lock().await;

    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("absent.toml");
    let err = WorkerConfig::load_from_file(&path).unwrap_err();
    assert!(err.to_string().contains("absent.toml"));
}

#[tokio::test]
async fn resolved_config_round_trips_through_toml() {
    let _guard = ENV_LOCK.lock().await;

    let config = WorkerConfig::parse_from_str(SAMPLE_TOML, "inline").expect("parse");
    let rendered = toml::to_string(&config).expect("render");
    let reparsed = WorkerConfig::parse_from_str(&rendered, "rendered").expect("reparse");

    assert_eq!(reparsed.agent_pool_size, config.agent_pool_size);
    assert_eq!(reparsed.executors.clone, config.executors.clone);
    assert_eq!(
        reparsed.orchestrator.consumer.chain_base_port,
        config.orchestrator.consumer.chain_base_port
    );
}
