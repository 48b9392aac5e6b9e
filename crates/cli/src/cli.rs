use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use judgeflow_taskgraph::EngineConfig;

/// Contest build/test runner.
///
/// Drives shell commands and compilations through the judgeflow task
/// graph, overlapping independent processes up to the job limit.
#[derive(Parser, Debug)]
#[command(name = "judgeflow", version, about = "Contest build/test task runner")]
pub struct CliArgs {
    /// Path to config file (default: ~/.config/judgeflow/config.toml)
    #[arg(long, global = true, env = "JUDGEFLOW_CONFIG")]
    pub config: Option<PathBuf>,

    /// Maximum number of processes running at once (0 = one per CPU)
    #[arg(short = 'j', long, global = true)]
    pub jobs: Option<usize>,

    /// Print a JSON report instead of text
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run shell commands as one branch of process units
    Exec(ExecArgs),
    /// Compile one source file
    Compile(CompileArgs),
}

#[derive(Args, Debug)]
pub struct ExecArgs {
    /// Per-command timeout in seconds (overrides default_timeout_secs)
    #[arg(long)]
    pub timeout: Option<f64>,

    /// Run every command even after one fails
    #[arg(long)]
    pub keep_going: bool,

    /// Run each command alone, blocking the runner until it exits
    #[arg(long)]
    pub exclusive: bool,

    /// Commands, each run through `/bin/sh -c`
    #[arg(last = true, required = true)]
    pub commands: Vec<String>,
}

#[derive(Args, Debug)]
pub struct CompileArgs {
    /// Source file to compile
    pub source: PathBuf,

    /// Output directory (default: <source dir>/out)
    #[arg(long)]
    pub out_dir: Option<PathBuf>,

    /// Library files copied from library_dir before compiling
    #[arg(long = "dep")]
    pub dependencies: Vec<String>,

    /// Library directory (overrides library_dir)
    #[arg(long, env = "JUDGEFLOW_LIBRARY_DIR")]
    pub library_dir: Option<PathBuf>,

    /// C compiler (overrides cc)
    #[arg(long, env = "CC")]
    pub cc: Option<String>,

    /// C++ compiler (overrides cxx)
    #[arg(long, env = "CXX")]
    pub cxx: Option<String>,

    /// JDK used for Java sources (overrides java_home)
    #[arg(long, env = "JAVA_HOME")]
    pub java_home: Option<PathBuf>,
}

impl CompileArgs {
    /// Fold the toolchain flags into `config`.
    pub fn apply_toolchain(&self, config: &mut EngineConfig) {
        if let Some(cc) = self.cc.as_ref().filter(|v| !v.is_empty()) {
            config.cc = cc.clone();
        }
        if let Some(cxx) = self.cxx.as_ref().filter(|v| !v.is_empty()) {
            config.cxx = cxx.clone();
        }
        if let Some(home) = &self.java_home {
            config.java_home = Some(home.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_exec_with_trailing_commands() {
        let args = CliArgs::parse_from([
            "judgeflow", "-j", "2", "exec", "--timeout", "1.5", "--keep-going", "--", "echo a",
            "exit 3",
        ]);
        assert_eq!(args.jobs, Some(2));
        match args.command {
            Command::Exec(exec) => {
                assert_eq!(exec.timeout, Some(1.5));
                assert!(exec.keep_going);
                assert!(!exec.exclusive);
                assert_eq!(exec.commands, vec!["echo a", "exit 3"]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn exec_requires_commands() {
        assert!(CliArgs::try_parse_from(["judgeflow", "exec"]).is_err());
    }

    #[test]
    fn parse_compile_with_dependencies() {
        let args = CliArgs::parse_from([
            "judgeflow", "--json", "compile", "sol.cc", "--dep", "testlib.h", "--out-dir", "/tmp/o",
        ]);
        assert!(args.json);
        match args.command {
            Command::Compile(compile) => {
                assert_eq!(compile.source, PathBuf::from("sol.cc"));
                assert_eq!(compile.dependencies, vec!["testlib.h"]);
                assert_eq!(compile.out_dir, Some(PathBuf::from("/tmp/o")));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn compile_toolchain_flags_override_config() {
        let args = CliArgs::parse_from([
            "judgeflow", "compile", "sol.c", "--cc", "clang", "--java-home", "/opt/jdk",
        ]);
        let Command::Compile(compile) = args.command else {
            panic!("expected compile");
        };
        let mut config = EngineConfig::default();
        compile.apply_toolchain(&mut config);
        assert_eq!(config.cc, "clang");
        assert_eq!(config.java_home, Some(PathBuf::from("/opt/jdk")));
    }
}
