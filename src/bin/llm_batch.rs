//! llm-batch — run a file of prompts through a chat-completions endpoint
//! under tokens-per-minute and requests-per-minute limits.
//!
//! Usage:
//!   llm-batch run --input <file> [--output <file>] [--model <m>] [--workers N] [--config <yaml>]
//!   llm-batch config [--config <yaml>]

use anyhow::{bail, Context};
use llm_throttle::batch::TpmBatchProcessor;
use llm_throttle::error::ErrorContext;
use llm_throttle::resilience::{with_retry, RateLimiter};
use llm_throttle::telemetry::{init_tracing, MetricsRegistry};
use llm_throttle::tokens::{CharacterEstimator, TokenCounter};
use llm_throttle::{AgentConfig, ChatCompletionsAgent, Error, RuntimeConfig};
use std::fs;
use std::io::{BufWriter, Write};
use std::sync::Arc;
use tracing::info;

/// Completion tokens budgeted per prompt when reserving TPM.
const COMPLETION_ALLOWANCE: usize = 256;

fn main() {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        print_usage();
        std::process::exit(1);
    }

    let outcome = match args[1].as_str() {
        "run" => cmd_run(&args[2..]),
        "config" => cmd_config(&args[2..]),
        "version" | "--version" | "-V" => {
            println!("llm-batch {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {other}");
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    };

    if let Err(e) = outcome {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

fn print_usage() {
    println!(
        r#"llm-batch — rate-governed batch LLM calls

USAGE:
    llm-batch <COMMAND> [OPTIONS]

COMMANDS:
    run --input <file>          Send one prompt per line, write JSON lines
        [--output <file>]       Output file (default: stdout)
        [--model <model>]       Model name
        [--workers <n>]         Worker threads per batch
        [--config <yaml>]       Configuration file
    config [--config <yaml>]    Print the effective configuration
    version                     Show version information
    help                        Show this help message

ENVIRONMENT:
    OPENAI_API_KEY              API key for the chat-completions endpoint
    OPENAI_BASE_URL             Endpoint base URL
    RATE_LIMIT_RPM              Requests per minute (default 20)
    RATE_LIMIT_JITTER_MS        Extra random spacing in ms (default 250)
    LLM_TARGET_TPM              Tokens-per-minute target (default 90000)
    LLM_MAX_WORKERS             Worker threads (default 8)
    LLM_BATCH_SIZE              Items per batch
    RUST_LOG                    Log filter (default info)"#
    );
}

fn flag<'a>(args: &'a [String], name: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == name)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

fn load_config(args: &[String]) -> anyhow::Result<RuntimeConfig> {
    let mut cfg = match flag(args, "--config") {
        Some(path) => RuntimeConfig::from_path(path)?,
        None => RuntimeConfig::from_env(),
    };
    if let Some(raw) = flag(args, "--workers") {
        cfg.max_workers = raw
            .parse()
            .with_context(|| format!("--workers expects a number, got {raw:?}"))?;
    }
    cfg.validate()?;
    Ok(cfg)
}

fn cmd_config(args: &[String]) -> anyhow::Result<()> {
    let cfg = load_config(args)?;
    print!("{}", cfg.to_yaml()?);
    Ok(())
}

fn cmd_run(args: &[String]) -> anyhow::Result<()> {
    init_tracing("info");

    let Some(input) = flag(args, "--input") else {
        bail!("run requires --input <file>");
    };
    let cfg = load_config(args)?;

    let text = fs::read_to_string(input).with_context(|| format!("cannot read {input}"))?;
    let prompts: Vec<(usize, String)> = text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .enumerate()
        .collect();

    let mut agent_cfg = AgentConfig::new();
    if let Some(model) = flag(args, "--model") {
        agent_cfg = agent_cfg.with_model(model);
    }
    // Fail fast on a bad endpoint before any worker starts.
    ChatCompletionsAgent::new(agent_cfg.clone())?;

    let run_id = uuid::Uuid::new_v4();
    info!(
        run = %run_id,
        prompts = prompts.len(),
        model = agent_cfg.model.as_str(),
        rpm = cfg.rate_limit_rpm,
        target_tpm = cfg.target_tpm,
        "starting llm-batch run"
    );

    let metrics = Arc::new(MetricsRegistry::new());
    let limiter = RateLimiter::shared(cfg.rate_limiter_config())?;
    let processor = TpmBatchProcessor::new(cfg.tpm_config(), limiter)
        .with_metrics(Arc::clone(&metrics))
        .with_run_id(run_id);
    let policy = cfg.retry_policy();
    let counter = CharacterEstimator::new();

    let results = processor.process_with_state(
        prompts,
        || ChatCompletionsAgent::new(agent_cfg.clone()).ok(),
        |agent: &mut Option<ChatCompletionsAgent>, (_, prompt): &(usize, String)| {
            let Some(agent) = agent.as_ref() else {
                return Err(Error::runtime_with_context(
                    "agent unavailable on this worker",
                    ErrorContext::new().with_source("llm_batch"),
                ));
            };
            with_retry(&policy, || agent.complete(prompt))
        },
        |(_, prompt)| counter.estimate_call(prompt, COMPLETION_ALLOWANCE),
    );

    let sink: Box<dyn Write> = match flag(args, "--output") {
        Some(path) => {
            Box::new(fs::File::create(path).with_context(|| format!("cannot create {path}"))?)
        }
        None => Box::new(std::io::stdout()),
    };
    let mut out = BufWriter::new(sink);
    let mut failed = 0usize;
    for ((index, prompt), response) in &results {
        if response.is_none() {
            failed += 1;
        }
        let line = serde_json::json!({
            "index": index,
            "prompt": prompt,
            "response": response,
        });
        writeln!(out, "{line}")?;
    }
    out.flush()?;

    let summary = serde_json::to_string(&metrics.snapshot())?;
    info!(
        run = %run_id,
        total = results.len(),
        failed,
        metrics = %summary,
        "llm-batch run finished"
    );
    Ok(())
}
