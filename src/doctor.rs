use std::path::Path;

use flowgate_core::config::AppConfig;
use flowgate_core::types::TaskTier;
use flowgate_flow::{validate_flow, StepRegistry};
use flowgate_pipeline::{FlowCatalog, Preprocessor};
use flowgate_router::get_chain;
use flowgate_store::SqliteStore;

struct CheckResult {
    label: String,
    ok: bool,
    detail: String,
}

impl CheckResult {
    fn ok(label: &str, detail: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ok: true,
            detail: detail.into(),
        }
    }

    fn fail(label: &str, detail: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ok: false,
            detail: detail.into(),
        }
    }
}

/// Print health checks; returns the number of issues found.
pub fn run_doctor(config: &AppConfig, registry: &StepRegistry, flows_dir: Option<&Path>) -> usize {
    let mut checks = vec![
        check_providers(config),
        check_chains(config),
        check_store(config),
        check_preprocess(config),
    ];
    if let Some(dir) = flows_dir {
        checks.push(check_flows(dir, registry));
    }

    let mut fail_count = 0;
    for check in &checks {
        let icon = if check.ok { "[OK]" } else { "[!!]" };
        println!("  {} {}: {}", icon, check.label, check.detail);
        if !check.ok {
            fail_count += 1;
        }
    }

    println!();
    println!("  {} passed, {} issues found", checks.len() - fail_count, fail_count);
    fail_count
}

fn is_local(base_url: Option<&str>) -> bool {
    base_url.is_some_and(|u| u.contains("localhost") || u.contains("127.0.0.1"))
}

fn check_providers(config: &AppConfig) -> CheckResult {
    if config.providers.is_empty() {
        return CheckResult::fail("Providers", "None configured; fallback routing is unavailable");
    }
    let mut names: Vec<&String> = config.providers.keys().collect();
    names.sort();

    let missing: Vec<&str> = names
        .iter()
        .filter(|name| {
            let p = &config.providers[name.as_str()];
            let has_key = p
                .api_key
                .as_ref()
                .is_some_and(|k| !k.is_empty() && !k.starts_with("${"));
            !has_key && !is_local(p.base_url.as_deref()) && name.as_str() != "ollama"
        })
        .map(|n| n.as_str())
        .collect();

    if missing.is_empty() {
        CheckResult::ok(
            "Providers",
            names.iter().map(|n| n.as_str()).collect::<Vec<_>>().join(", "),
        )
    } else {
        CheckResult::fail("Providers", format!("No API key for: {}", missing.join(", ")))
    }
}

fn check_chains(config: &AppConfig) -> CheckResult {
    let uncovered: Vec<&str> = TaskTier::ALL
        .iter()
        .filter(|tier| {
            !get_chain(**tier, &config.router)
                .iter()
                .any(|e| config.providers.contains_key(&e.provider))
        })
        .map(|tier| tier.as_str())
        .collect();

    if uncovered.is_empty() {
        CheckResult::ok("Failover chains", "Every tier has a configured provider")
    } else {
        CheckResult::fail(
            "Failover chains",
            format!("No configured provider in chain for: {}", uncovered.join(", ")),
        )
    }
}

fn check_store(config: &AppConfig) -> CheckResult {
    let Some(path) = config.store_path() else {
        return CheckResult::ok("Store", "In-memory (runs are not persisted)");
    };
    match SqliteStore::open(&path) {
        Ok(_) => CheckResult::ok("Store", path.display().to_string()),
        Err(e) => CheckResult::fail("Store", format!("{}: {}", path.display(), e)),
    }
}

fn check_preprocess(config: &AppConfig) -> CheckResult {
    match Preprocessor::new(config.preprocess.clone()) {
        Ok(_) => CheckResult::ok(
            "Preprocessing",
            format!(
                "{} skip senders, {} passive channels, {} passive patterns",
                config.preprocess.skip_senders.len(),
                config.preprocess.passive_channels.len(),
                config.preprocess.passive_patterns.len()
            ),
        ),
        Err(e) => CheckResult::fail("Preprocessing", e.to_string()),
    }
}

fn check_flows(dir: &Path, registry: &StepRegistry) -> CheckResult {
    let catalog = match FlowCatalog::load_dir(dir) {
        Ok(catalog) => catalog,
        Err(e) => return CheckResult::fail("Flows", e.to_string()),
    };
    let invalid: Vec<String> = catalog
        .flows()
        .filter_map(|flow| {
            let errors = validate_flow(flow, registry);
            (!errors.is_empty()).then(|| format!("{} ({})", flow.id, errors.join("; ")))
        })
        .collect();

    if invalid.is_empty() {
        CheckResult::ok("Flows", format!("{} flows valid in {}", catalog.len(), dir.display()))
    } else {
        CheckResult::fail("Flows", format!("Invalid: {}", invalid.join(", ")))
    }
}
