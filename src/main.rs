//! Capflow - 模式编排命令行
//!
//! 用法：`capflow <pattern-file> [inputs-json]`（可选 `CAPFLOW_CONFIG=<file>`）
//! 初始化日志、加载配置与模式目录、注册内置能力，运行指定模式并打印 JSON 结果信封。

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use capflow::capabilities::{register_builtins, CapabilityRegistry};
use capflow::config::load_config;
use capflow::flags::FeatureFlagGate;
use capflow::observability::{self, TelemetryRecorder};
use capflow::pattern::{PatternRunner, PatternStore, RunnerOptions};
use capflow::persistence::{AuditStore, MemoryAuditStore, SqliteAuditStore};
use serde_json::{Map, Value};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 日志：默认 info，可通过 RUST_LOG 覆盖
    observability::init();

    let mut registry = CapabilityRegistry::new();
    register_builtins(&mut registry);

    let mut args = std::env::args().skip(1);
    let Some(pattern_file) = args.next() else {
        eprintln!("usage: capflow <pattern-file> [inputs-json]\n\ncapabilities:");
        for (name, description) in registry.descriptions() {
            eprintln!("  {name:<16} {description}");
        }
        std::process::exit(2);
    };
    let inputs: Map<String, Value> = match args.next() {
        Some(raw) => serde_json::from_str(&raw).context("Inputs must be a JSON object")?,
        None => Map::new(),
    };

    // CAPFLOW_CONFIG 指向额外的配置文件（覆盖 config/default.toml）
    let extra_config = std::env::var_os("CAPFLOW_CONFIG").map(PathBuf::from);
    let config = load_config(extra_config.as_deref()).context("Failed to load config")?;

    let mut store = PatternStore::new();
    store
        .load_dir(&config.orchestrator.patterns_dir)
        .context("Failed to load patterns directory")?;
    let pattern = PatternStore::parse_file(Path::new(&pattern_file))?;
    let pattern_id = pattern.id.clone();
    store.insert(pattern);

    let telemetry = Arc::new(TelemetryRecorder::new(config.telemetry.capacity));
    let gate = Arc::new(FeatureFlagGate::from_file(
        &config.flags.path,
        config.flags.reload_interval(),
    ));
    let audit: Arc<dyn AuditStore> = match &config.audit.sqlite_path {
        Some(path) => Arc::new(SqliteAuditStore::open(path).context("Failed to open audit database")?),
        None => Arc::new(MemoryAuditStore::new()),
    };

    let runner = PatternRunner::new(Arc::new(registry), Arc::new(store))
        .with_flags(gate)
        .with_telemetry(Arc::clone(&telemetry))
        .with_audit(audit)
        .with_options(RunnerOptions::from(&config.orchestrator));

    let run = runner.run(&pattern_id, inputs);
    let result = match config.orchestrator.run_timeout_secs {
        0 => run.await,
        secs => tokio::time::timeout(Duration::from_secs(secs), run)
            .await
            .with_context(|| format!("Pattern '{pattern_id}' timed out after {secs}s"))?,
    };

    println!("{}", serde_json::to_string_pretty(&result)?);
    tracing::info!(summary = %serde_json::to_string(&telemetry.summary())?, "telemetry");

    if !result.success {
        std::process::exit(1);
    }
    Ok(())
}
