use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use judgeflow_taskgraph::{
    BoxTask, Co, CoroutineTask, ExternalProcessTask, ParallelTaskGraph, RunResult, TaskError,
    TaskGraph, Value,
};

/// Outcome of one command, as printed by `judgeflow exec`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandReport {
    pub index: usize,
    pub command: String,
    pub ok: bool,
    pub status: String,
    pub elapsed_secs: Option<f64>,
}

/// Everything `judgeflow exec` learned from one run.
#[derive(Debug, Clone, Serialize)]
pub struct ExecReport {
    pub reports: Vec<CommandReport>,
    /// Set when the branch was cut short by a failing command.
    pub aborted: bool,
}

impl ExecReport {
    pub fn all_ok(&self) -> bool {
        !self.aborted && self.reports.iter().all(|r| r.ok)
    }
}

#[derive(Debug, Clone)]
pub struct ExecOptions {
    pub timeout: Option<Duration>,
    pub keep_going: bool,
    pub exclusive: bool,
}

/// Unit running one shell command; aborts the whole branch on failure
/// unless `keep_going` is set.
fn command_task(index: usize, command: String, options: &ExecOptions) -> Result<BoxTask> {
    let options = options.clone();
    let task = CoroutineTask::named(
        "judgeflow::command",
        (index, command),
        move |co: Co, (index, command): (usize, String)| async move {
            let process = ExternalProcessTask::shell(&command)
                .timeout(options.timeout)
                .exclusive(options.exclusive);
            let result = RunResult::from_value(&co.run(process).await?)?;
            let report = CommandReport {
                index,
                command,
                ok: result.status.is_ok(),
                status: result.status.to_string(),
                elapsed_secs: result.elapsed.map(|d| d.as_secs_f64()),
            };
            let value = serde_json::to_value(&report).map_err(TaskError::failed)?;
            if !report.ok && !options.keep_going {
                return Err(TaskError::abort(value));
            }
            Ok(Value::Json(value))
        },
    )?;
    Ok(Box::new(task))
}

fn parse_report(value: &Value) -> Result<CommandReport> {
    match value {
        Value::Json(json) => {
            serde_json::from_value(json.clone()).context("malformed command report")
        }
        other => Err(anyhow!("unexpected command result: {other}")),
    }
}

/// Run every command as one branch of the task graph.
pub fn run(graph: &mut ParallelTaskGraph, commands: &[String], options: &ExecOptions) -> Result<ExecReport> {
    let children = commands
        .iter()
        .enumerate()
        .map(|(i, cmd)| command_task(i, cmd.clone(), options))
        .collect::<Result<Vec<_>>>()?;
    let root = CoroutineTask::named("judgeflow::exec", commands.len(), move |co: Co, _len: usize| async move {
        co.branch(children).await
    })?;

    let value = graph.run(Box::new(root)).context("task graph failed")?;
    let report = match &value {
        Value::List(items) => ExecReport {
            reports: items.iter().map(parse_report).collect::<Result<_>>()?,
            aborted: false,
        },
        single => ExecReport {
            reports: vec![parse_report(single)?],
            aborted: true,
        },
    };
    info!(
        commands = commands.len(),
        reported = report.reports.len(),
        aborted = report.aborted,
        "exec finished"
    );
    Ok(report)
}
