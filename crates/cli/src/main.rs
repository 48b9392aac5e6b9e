mod cli;
mod config;
mod exec;

use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

use judgeflow_taskgraph::{Code, EngineConfig, ParallelTaskGraph, RunResult, TaskGraph};

use crate::cli::{CliArgs, Command, CompileArgs, ExecArgs};
use crate::exec::ExecOptions;

fn main() -> Result<ExitCode> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let args = CliArgs::parse();

    let mut config = config::load(args.config.as_deref())
        .context("failed to load configuration")?;
    if let Some(jobs) = args.jobs {
        config.jobs = jobs;
    }
    info!(jobs = config.resolved_jobs(), "judgeflow starting");

    let ok = match &args.command {
        Command::Exec(exec) => run_exec(exec, &config, args.json)?,
        Command::Compile(compile) => run_compile(compile, &config, args.json)?,
    };
    Ok(if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

fn run_exec(args: &ExecArgs, config: &EngineConfig, json: bool) -> Result<bool> {
    let timeout = match args.timeout {
        Some(secs) if secs > 0.0 && secs.is_finite() => Some(Duration::from_secs_f64(secs)),
        Some(secs) => anyhow::bail!("--timeout must be positive, got {secs}"),
        None => config.default_timeout(),
    };
    let options = ExecOptions {
        timeout,
        keep_going: args.keep_going,
        exclusive: args.exclusive,
    };

    let mut graph = ParallelTaskGraph::from_config(config);
    let report = exec::run(&mut graph, &args.commands, &options)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        for r in &report.reports {
            let elapsed = r
                .elapsed_secs
                .map(|s| format!(" ({s:.2}s)"))
                .unwrap_or_default();
            println!("[{}] {}: {}{}", r.index, r.command, r.status, elapsed);
        }
        if report.aborted {
            println!("stopped after first failure ({} of {} commands reported)",
                report.reports.len(), args.commands.len());
        }
    }
    Ok(report.all_ok())
}

fn run_compile(args: &CompileArgs, config: &EngineConfig, json: bool) -> Result<bool> {
    let src_name = args
        .source
        .file_name()
        .context("source path has no file name")?
        .to_string_lossy()
        .into_owned();
    let src_dir = match args.source.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => std::env::current_dir().context("failed to resolve current directory")?,
    };
    let out_dir = args.out_dir.clone().unwrap_or_else(|| src_dir.join("out"));
    let mut config = config.clone();
    args.apply_toolchain(&mut config);
    let code = Code::detect(src_name, src_dir, out_dir, &config)
        .with_dependencies(args.dependencies.clone());
    let library_dir = args.library_dir.as_deref().or(config.library_dir.as_deref());

    let mut graph = ParallelTaskGraph::from_config(&config);
    let value = graph
        .run_task(code.compile(library_dir)?)
        .with_context(|| format!("failed to compile {}", code.src_name))?;
    let result = RunResult::from_value(&value)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        println!("{}: {}", code.src_name, result);
    }
    if !result.status.is_ok() {
        match code.read_compile_log() {
            Ok(log) => eprint!("{log}"),
            Err(e) => error!(error = %e, "failed to read compile log"),
        }
    }
    Ok(result.status.is_ok())
}
