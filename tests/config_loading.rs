use std::io::Write;

use flowgate_core::config::{AppConfig, RoutingMode};
use flowgate_core::flow::TriggerAuth;
use flowgate_core::types::TaskTier;
use flowgate_core::FlowgateError;
use flowgate_router::{build_clients, get_chain};

#[test]
fn test_load_full_config_from_file() {
    let toml_content = r#"
[executor]
node_timeout_ms = 5000
max_loop_iterations = 200

[resolver]
env_allowlist = ["DEPLOY_ENV"]

[router]
attempt_timeout_ms = 20000

[router.tiers.trivial]
provider = "groq"
model = "llama-3.1-8b-instant"

[[router.chains.critical]]
provider = "openrouter"
model = "anthropic/claude-3.5-sonnet"

[[router.chains.critical]]
provider = "openai"
model = "gpt-4o"
is_primary = true

[providers.openai]
api_key = "sk-test-key"

[providers.groq]
kind = "openai-compatible"
base_url = "https://api.groq.com/openai/v1"
api_key = "gsk-test"

[providers.legacy]
kind = "soap"

[pipeline]
mode = "ai_first"
high_priority_min = 9
min_persona_score = 2.0

[pipeline.shortcuts]
"/oncall" = "Dana is on call"

[preprocess]
skip_senders = ["noreply"]
passive_channels = ["feed"]
min_length = 2

[store]
path = "/tmp/flowgate-test/runs.db"

[[personas]]
id = "sre"
name = "Site Reliability"
skills = ["outage", "latency"]

[[intents]]
name = "ops"
keywords = ["server", "deploy"]
system_prompt = "You are on call."
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.executor.node_timeout_ms, 5000);
    assert_eq!(config.executor.loop_limit(), 200);
    assert_eq!(config.resolver.env_allowlist, vec!["DEPLOY_ENV"]);
    assert_eq!(config.pipeline.mode, RoutingMode::AiFirst);
    assert_eq!(config.pipeline.high_priority_min, 9);
    assert_eq!(config.pipeline.shortcuts["/oncall"], "Dana is on call");
    assert_eq!(config.preprocess.min_length, 2);
    assert_eq!(config.personas[0].skills, vec!["outage", "latency"]);
    assert_eq!(config.intents[0].keywords, vec!["server", "deploy"]);
    assert_eq!(config.intents[0].system_prompt.as_deref(), Some("You are on call."));
    assert_eq!(
        config.store_path().unwrap().to_str(),
        Some("/tmp/flowgate-test/runs.db")
    );

    // Custom chain wins, with the primary entry first.
    let critical = get_chain(TaskTier::Critical, &config.router);
    assert_eq!(critical[0].provider, "openai");
    assert_eq!(critical[1].provider, "openrouter");
    let trivial = get_chain(TaskTier::Trivial, &config.router);
    assert_eq!(trivial.len(), 1);
    assert_eq!(trivial[0].model, "llama-3.1-8b-instant");

    // Unsupported provider kinds are skipped.
    let clients = build_clients(&config.providers);
    let names: Vec<&str> = clients.iter().map(|c| c.name()).collect();
    assert_eq!(names, vec!["groq", "openai"]);
}

#[test]
fn test_env_var_expansion_in_config() {
    std::env::set_var("FLOWGATE_TEST_API_KEY", "expanded-key-value");

    let toml_content = r#"
[providers.openai]
api_key = "${FLOWGATE_TEST_API_KEY}"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");
    assert_eq!(
        config.providers["openai"].api_key,
        Some("expanded-key-value".to_string())
    );

    std::env::remove_var("FLOWGATE_TEST_API_KEY");
}

#[test]
fn test_minimal_config_uses_defaults() {
    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(b"").expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.executor.node_timeout_ms, 30_000);
    assert_eq!(config.executor.max_loop_iterations, 1_000);
    assert_eq!(config.router.attempt_timeout_ms, 60_000);
    assert_eq!(config.pipeline.mode, RoutingMode::Balanced);
    assert_eq!(config.pipeline.high_priority_min, 8);
    assert!(config.providers.is_empty());
    assert!(config.personas.is_empty());
    assert!(config.intents.is_empty());
    assert!(config.store.is_none());
    assert!(config.store_path().is_none());
}

#[test]
fn test_missing_and_malformed_config() {
    let missing = AppConfig::load(std::path::Path::new("/nonexistent/flowgate.toml"));
    assert!(matches!(missing, Err(FlowgateError::ConfigNotFound(_))));

    let (_dir, path) = flowgate_test_utils::temp_config("[pipeline]\nmode = \"sideways\"\n");
    assert!(matches!(AppConfig::load(&path), Err(FlowgateError::Config(_))));
}

#[test]
fn test_trigger_auth_in_flow_document() {
    let flow = flowgate_core::Flow::from_json(
        r#"{
            "id": "deploy-hook",
            "trigger": {"auth": {"mode": "hmac_sha256", "secret": "whsec"}},
            "nodes": [{"id": "hook", "type": "trigger:webhook"}]
        }"#,
    )
    .unwrap();
    assert_eq!(
        flow.trigger.auth,
        TriggerAuth::HmacSha256 {
            secret: "whsec".into(),
            header: "x-signature-256".into(),
        }
    );
}

#[test]
fn test_store_opens_from_config() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("nested").join("runs.db");
    let config = flowgate_test_utils::config_from_toml(&format!(
        "[store]\npath = \"{}\"\n",
        db.display()
    ));
    flowgate_store::open_store(&config).expect("open store");
    assert!(db.exists());
}
