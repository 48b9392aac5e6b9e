//! Program sources that can be compiled and run through the task graph.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use tracing::debug;
use walkdir::WalkDir;

use crate::config::EngineConfig;
use crate::coroutine::CoroutineTask;
use crate::error::TaskError;
use crate::process::{ExternalProcessTask, Redirect};
use crate::value::Value;

const EXE_EXT: &str = ".exe";
const LOG_EXT: &str = ".log";

/// Language of a source file, picked from its extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CodeKind {
    C,
    Cxx,
    Kotlin,
    Java,
    Rust,
    JavaScript,
    Haskell,
    CSharp,
    /// Anything else: run through the interpreter named on its `#!` line.
    Script,
    /// Build and run commands supplied by the caller.
    Custom,
}

impl CodeKind {
    pub fn from_extension(ext: &str) -> Self {
        match ext {
            "c" => CodeKind::C,
            "cc" | "cxx" | "cpp" => CodeKind::Cxx,
            "kt" => CodeKind::Kotlin,
            "java" => CodeKind::Java,
            "rs" => CodeKind::Rust,
            "js" => CodeKind::JavaScript,
            "hs" => CodeKind::Haskell,
            "cs" => CodeKind::CSharp,
            _ => CodeKind::Script,
        }
    }
}

/// A source file plus the commands that build and run it.
///
/// Compilation happens in `out_dir`, which receives a copy of `src_dir`
/// and of every listed dependency from the library directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Code {
    pub kind: CodeKind,
    pub src_name: String,
    pub src_dir: PathBuf,
    pub out_dir: PathBuf,
    /// Empty when the source needs no compilation.
    pub compile_args: Vec<String>,
    pub run_args: Vec<String>,
    pub dependencies: Vec<String>,
}

impl Code {
    pub fn new(
        src_name: impl Into<String>,
        src_dir: impl Into<PathBuf>,
        out_dir: impl Into<PathBuf>,
        compile_args: Vec<String>,
        run_args: Vec<String>,
    ) -> Self {
        Self {
            kind: CodeKind::Custom,
            src_name: src_name.into(),
            src_dir: src_dir.into(),
            out_dir: out_dir.into(),
            compile_args,
            run_args,
            dependencies: Vec::new(),
        }
    }

    /// Pick build and run commands from the source extension.
    ///
    /// Compilers come from `config`. Unknown extensions are scripts; a
    /// script whose `#!` line is missing or names a missing interpreter
    /// fails at compile time.
    pub fn detect(
        src_name: impl Into<String>,
        src_dir: impl Into<PathBuf>,
        out_dir: impl Into<PathBuf>,
        config: &EngineConfig,
    ) -> Self {
        let src_name = src_name.into();
        let src_dir = src_dir.into();
        let out_dir = out_dir.into();
        let stem = file_stem(&src_name);
        let exe = out_dir.join(format!("{stem}{EXE_EXT}")).display().to_string();
        let out = out_dir.display().to_string();
        let ext = Path::new(&src_name)
            .extension()
            .map(|e| e.to_string_lossy().into_owned())
            .unwrap_or_default();
        let kind = CodeKind::from_extension(&ext);

        let (compile_args, run_args) = match kind {
            CodeKind::C => (
                strings(&[config.cc.as_str(), "-o", exe.as_str(), src_name.as_str(), "-O2", "-lm"]),
                vec![exe.clone()],
            ),
            CodeKind::Cxx => (
                strings(&[config.cxx.as_str(), "-o", exe.as_str(), src_name.as_str(), "-std=c++17", "-O2"]),
                vec![exe.clone()],
            ),
            CodeKind::Rust => (
                strings(&["rustc", "-o", exe.as_str(), src_name.as_str(), "-C", "opt-level=2"]),
                vec![exe.clone()],
            ),
            CodeKind::Kotlin => {
                let main_class = format!("{}Kt", capitalize(&stem));
                (
                    strings(&["kotlinc", "-d", out.as_str(), src_name.as_str()]),
                    strings(&["kotlin", "-Dline.separator=\n", "-cp", out.as_str(), main_class.as_str()]),
                )
            }
            CodeKind::Java => {
                let (java, javac) = match &config.java_home {
                    Some(home) => (
                        home.join("bin/java").display().to_string(),
                        home.join("bin/javac").display().to_string(),
                    ),
                    None => ("java".to_string(), "javac".to_string()),
                };
                (
                    strings(&[javac.as_str(), "-encoding", "UTF-8", "-d", out.as_str(), src_name.as_str()]),
                    strings(&[java.as_str(), "-Dline.separator=\n", "-cp", out.as_str(), "Main"]),
                )
            }
            CodeKind::Haskell => (
                strings(&["stack", "ghc", "--", "-O", "-o", exe.as_str(), "-outputdir", out.as_str(), src_name.as_str()]),
                vec![exe.clone()],
            ),
            CodeKind::CSharp => (
                strings(&["mcs", src_name.as_str(), format!("-out:{exe}").as_str()]),
                strings(&["mono", exe.as_str()]),
            ),
            CodeKind::JavaScript => {
                let script = src_dir.join(&src_name).display().to_string();
                (Vec::new(), strings(&["node", "--", script.as_str()]))
            }
            CodeKind::Script | CodeKind::Custom => {
                let script = src_dir.join(&src_name);
                let mut run_args = fs::read_to_string(&script)
                    .ok()
                    .and_then(|content| parse_shebang(&content))
                    .unwrap_or_default();
                run_args.push(script.display().to_string());
                (Vec::new(), run_args)
            }
        };
        Self {
            kind,
            ..Self::new(src_name, src_dir, out_dir, compile_args, run_args)
        }
    }

    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies.extend(deps.into_iter().map(Into::into));
        self
    }

    pub fn log_path(&self) -> PathBuf {
        self.out_dir
            .join(format!("{}{LOG_EXT}", file_stem(&self.src_name)))
    }

    /// Build task for this code. Compiling the same code twice in one run
    /// is deduplicated by the graph.
    ///
    /// The task returns [`Value::None`] when there is nothing to compile,
    /// otherwise the compiler's [`ProcessOutcome`](crate::ProcessOutcome).
    /// Interpreted sources fail with [`TaskError::InvalidSource`] when they
    /// cannot be started.
    pub fn compile(&self, library_dir: Option<&Path>) -> Result<CoroutineTask, TaskError> {
        let args = (self.clone(), library_dir.map(Path::to_path_buf));
        CoroutineTask::named("code::compile", args, |co, (code, library_dir)| async move {
            if code.compile_args.is_empty() {
                match code.kind {
                    CodeKind::Script => code.check_interpreter()?,
                    CodeKind::JavaScript if !code.src_dir.join(&code.src_name).is_file() => {
                        return Err(code.invalid("file not found"));
                    }
                    _ => {}
                }
                return Ok(Value::None);
            }
            code.stage(library_dir.as_deref())?;
            let (program, rest) = code
                .compile_args
                .split_first()
                .ok_or_else(|| TaskError::msg("empty compile command"))?;
            let compiler = ExternalProcessTask::new(program)
                .args(rest)
                .current_dir(&code.out_dir)
                .stdin(Redirect::Null)
                .stdout(Redirect::File(code.log_path()))
                .stderr(Redirect::Stdout);
            co.run(compiler).await
        })
    }

    /// Process unit running the compiled program on one input file.
    pub fn run(
        &self,
        args: &[String],
        cwd: impl Into<PathBuf>,
        input: impl Into<PathBuf>,
        output: impl Into<PathBuf>,
        timeout: Option<Duration>,
        redirect_error: bool,
    ) -> Result<ExternalProcessTask, TaskError> {
        let (program, rest) = self
            .run_args
            .split_first()
            .ok_or_else(|| TaskError::Config(format!("{} has no run command", self.src_name)))?;
        Ok(ExternalProcessTask::new(program)
            .args(rest)
            .args(args)
            .current_dir(cwd)
            .stdin(Redirect::File(input.into()))
            .stdout(Redirect::File(output.into()))
            .stderr(if redirect_error {
                Redirect::Stdout
            } else {
                Redirect::Null
            })
            .timeout(timeout))
    }

    pub fn read_compile_log(&self) -> Result<String, TaskError> {
        Ok(fs::read_to_string(self.log_path())?)
    }

    /// Remove the output directory.
    pub fn clean(&self) -> Result<(), TaskError> {
        match fs::remove_dir_all(&self.out_dir) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    /// The `#!` line must name an existing interpreter; for `env` lines the
    /// program must also be on `PATH`.
    fn check_interpreter(&self) -> Result<(), TaskError> {
        let script = self.src_dir.join(&self.src_name);
        let content = fs::read_to_string(&script).map_err(|_| self.invalid("file not found"))?;
        let Some(shebang) = parse_shebang(&content) else {
            return Err(self.invalid("script missing a shebang line"));
        };
        let interpreter = &shebang[0];
        if !Path::new(interpreter).exists() {
            return Err(self.invalid(format!("interpreter not found: {interpreter}")));
        }
        if matches!(interpreter.as_str(), "/bin/env" | "/usr/bin/env") {
            let Some(program) = shebang.get(1) else {
                return Err(self.invalid("script missing a shebang line"));
            };
            if find_program(program).is_none() {
                return Err(self.invalid(format!("interpreter not installed: {program}")));
            }
        }
        debug!(source = %self.src_name, interpreter = %interpreter, "script interpreter found");
        Ok(())
    }

    fn invalid(&self, reason: impl Into<String>) -> TaskError {
        TaskError::InvalidSource {
            name: self.src_name.clone(),
            reason: reason.into(),
        }
    }

    /// Copy sources and library dependencies into `out_dir`.
    fn stage(&self, library_dir: Option<&Path>) -> Result<(), TaskError> {
        fs::create_dir_all(&self.out_dir)?;
        copy_tree(&self.src_dir, &self.out_dir)?;

        if self.dependencies.is_empty() {
            return Ok(());
        }
        let Some(library_dir) = library_dir else {
            return Err(TaskError::Config("library_dir is not defined".into()));
        };
        for dep in &self.dependencies {
            let from = library_dir.join(dep);
            if !from.exists() {
                return Err(TaskError::Io(
                    io::Error::new(
                        io::ErrorKind::NotFound,
                        format!("{dep} is not found in {}", library_dir.display()),
                    )
                    .into(),
                ));
            }
            let to = self.out_dir.join(dep);
            if let Some(parent) = to.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(&from, &to)?;
            debug!(dependency = %dep, to = %to.display(), "copied library file");
        }
        Ok(())
    }
}

fn copy_tree(from: &Path, to: &Path) -> Result<(), TaskError> {
    for entry in WalkDir::new(from).min_depth(1) {
        let entry = entry.map_err(|e| TaskError::Io(io::Error::from(e).into()))?;
        let rel = entry
            .path()
            .strip_prefix(from)
            .map_err(TaskError::failed)?;
        let dest = to.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&dest)?;
        } else {
            fs::copy(entry.path(), &dest)?;
        }
    }
    Ok(())
}

/// Interpreter command from a `#!` line, split on spaces.
fn parse_shebang(content: &str) -> Option<Vec<String>> {
    let line = content.lines().next()?.strip_prefix("#!")?;
    let parts: Vec<String> = line.split_whitespace().map(str::to_string).collect();
    (!parts.is_empty()).then_some(parts)
}

fn strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|a| a.to_string()).collect()
}

/// Resolve `program` the way a shell would.
fn find_program(program: &str) -> Option<PathBuf> {
    if program.contains('/') {
        let path = PathBuf::from(program);
        return path.is_file().then_some(path);
    }
    let path_env = std::env::var_os("PATH")?;
    std::env::split_paths(&path_env)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}

fn file_stem(name: &str) -> String {
    Path::new(name)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.to_string())
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use super::*;
    use crate::graph::{SerialTaskGraph, TaskGraph};
    use crate::verdict::{RunResult, RunStatus};

    fn sh(script: &str) -> Vec<String> {
        vec!["/bin/sh".into(), "-c".into(), script.into()]
    }

    fn compile_error(code: &Code) -> TaskError {
        SerialTaskGraph::new()
            .run_task(code.compile(None).unwrap())
            .unwrap_err()
    }

    #[test]
    fn detect_native_and_script_sources() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::default();
        let c = Code::detect("sol.c", dir.path(), dir.path().join("out"), &config);
        assert_eq!(c.kind, CodeKind::C);
        assert_eq!(c.compile_args[0], "gcc");
        assert!(c.compile_args.contains(&"sol.c".to_string()));
        assert!(c.run_args[0].ends_with("sol.exe"));

        fs::write(dir.path().join("gen.py"), "#!/usr/bin/env python3\nprint(1)\n").unwrap();
        let script = Code::detect("gen.py", dir.path(), dir.path().join("out"), &config);
        assert_eq!(script.kind, CodeKind::Script);
        assert!(script.compile_args.is_empty());
        assert_eq!(&script.run_args[..2], ["/usr/bin/env", "python3"]);
        assert!(script.run_args[2].ends_with("gen.py"));
    }

    #[test]
    fn detect_uses_configured_toolchain() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let config = EngineConfig {
            cc: "clang".into(),
            cxx: "clang++".into(),
            java_home: Some(PathBuf::from("/opt/jdk")),
            ..EngineConfig::default()
        };
        assert_eq!(Code::detect("a.c", dir.path(), &out, &config).compile_args[0], "clang");
        assert_eq!(Code::detect("a.cpp", dir.path(), &out, &config).compile_args[0], "clang++");

        let java = Code::detect("Main.java", dir.path(), &out, &config);
        assert_eq!(java.kind, CodeKind::Java);
        assert_eq!(java.compile_args[0], "/opt/jdk/bin/javac");
        assert_eq!(java.run_args[0], "/opt/jdk/bin/java");
        assert_eq!(java.run_args.last().map(String::as_str), Some("Main"));
    }

    #[test]
    fn detect_other_compiled_languages() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let config = EngineConfig::default();

        let kotlin = Code::detect("solve.kt", dir.path(), &out, &config);
        assert_eq!(kotlin.compile_args[0], "kotlinc");
        assert_eq!(kotlin.run_args.last().map(String::as_str), Some("SolveKt"));

        let haskell = Code::detect("sol.hs", dir.path(), &out, &config);
        assert_eq!(&haskell.compile_args[..3], ["stack", "ghc", "--"]);
        assert!(haskell.run_args[0].ends_with("sol.exe"));

        let cs = Code::detect("sol.cs", dir.path(), &out, &config);
        assert_eq!(cs.compile_args[0], "mcs");
        assert!(cs.compile_args[2].starts_with("-out:"));
        assert_eq!(cs.run_args[0], "mono");

        let js = Code::detect("sol.js", dir.path(), &out, &config);
        assert_eq!(js.kind, CodeKind::JavaScript);
        assert!(js.compile_args.is_empty());
        assert_eq!(&js.run_args[..2], ["node", "--"]);
    }

    #[test]
    fn script_without_shebang_fails_to_compile() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("gen.sh"), "echo 1\n").unwrap();
        let code = Code::detect("gen.sh", dir.path(), dir.path().join("out"), &EngineConfig::default());
        let err = compile_error(&code);
        assert!(matches!(err, TaskError::InvalidSource { .. }), "{err}");
        assert!(err.to_string().contains("missing a shebang"), "{err}");
    }

    #[test]
    fn unknown_extension_is_validated_as_script() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::default();
        fs::write(dir.path().join("solve.xyz"), "print 1\n").unwrap();
        let code = Code::detect("solve.xyz", dir.path(), dir.path().join("out"), &config);
        assert_eq!(code.kind, CodeKind::Script);
        assert!(matches!(compile_error(&code), TaskError::InvalidSource { .. }));

        let gone = Code::detect("missing.xyz", dir.path(), dir.path().join("out"), &config);
        assert!(compile_error(&gone).to_string().contains("file not found"));
    }

    #[test]
    fn missing_interpreters_fail_to_compile() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::default();
        fs::write(dir.path().join("a.sh"), "#!/no/such/shell\necho 1\n").unwrap();
        let code = Code::detect("a.sh", dir.path(), dir.path().join("out"), &config);
        assert!(compile_error(&code).to_string().contains("interpreter not found: /no/such/shell"));

        fs::write(dir.path().join("b.py"), "#!/usr/bin/env judgeflow-no-such-interpreter\n").unwrap();
        let code = Code::detect("b.py", dir.path(), dir.path().join("out"), &config);
        let err = compile_error(&code).to_string();
        assert!(
            err.contains("interpreter not installed: judgeflow-no-such-interpreter")
                || err.contains("interpreter not found: /usr/bin/env"),
            "{err}"
        );
    }

    #[test]
    fn script_with_valid_shebang_needs_no_compilation() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("ok.sh"), "#!/bin/sh\necho 1\n").unwrap();
        let code = Code::detect("ok.sh", dir.path(), dir.path().join("out"), &EngineConfig::default());
        let value = SerialTaskGraph::new().run_task(code.compile(None).unwrap()).unwrap();
        assert_eq!(RunResult::from_value(&value).unwrap(), RunResult::ok_without_run());
    }

    #[test]
    fn capitalize_matches_kotlin_main_class() {
        assert_eq!(capitalize("solve"), "Solve");
        assert_eq!(capitalize("mAIN"), "Main");
        assert_eq!(capitalize(""), "");
    }

    #[test]
    fn nothing_to_compile_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let code = Code::new("a.sh", dir.path(), dir.path().join("out"), vec![], vec![]);
        let value = SerialTaskGraph::new().run_task(code.compile(None).unwrap()).unwrap();
        assert_eq!(RunResult::from_value(&value).unwrap(), RunResult::ok_without_run());
    }

    #[test]
    fn compile_stages_sources_and_logs_both_streams() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        let lib = dir.path().join("lib");
        fs::create_dir_all(src.join("inc")).unwrap();
        fs::create_dir_all(&lib).unwrap();
        fs::write(src.join("main.c"), "int main(){}").unwrap();
        fs::write(src.join("inc/util.h"), "").unwrap();
        fs::write(lib.join("testlib.h"), "").unwrap();

        let code = Code::new(
            "main.c",
            &src,
            dir.path().join("out"),
            sh("test -f inc/util.h && test -f testlib.h && echo built && echo warning >&2"),
            vec![],
        )
        .with_dependencies(["testlib.h"]);
        let value = SerialTaskGraph::new()
            .run_task(code.compile(Some(&lib)).unwrap())
            .unwrap();
        assert_eq!(RunResult::from_value(&value).unwrap().status, RunStatus::Ok);
        assert_eq!(code.read_compile_log().unwrap(), "built\nwarning\n");

        code.clean().unwrap();
        assert!(!code.out_dir.exists());
        code.clean().unwrap();
    }

    #[test]
    fn compile_failure_is_reported_as_status() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        fs::create_dir_all(&src).unwrap();
        let code = Code::new("x.c", &src, dir.path().join("out"), sh("exit 1"), vec![]);
        let value = SerialTaskGraph::new().run_task(code.compile(None).unwrap()).unwrap();
        assert_eq!(
            RunResult::from_value(&value).unwrap().status,
            RunStatus::ExitedAbnormally(1)
        );
    }

    #[test]
    fn dependencies_require_library_dir() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        fs::create_dir_all(&src).unwrap();
        let code = Code::new("x.c", &src, dir.path().join("out"), sh("true"), vec![])
            .with_dependencies(["testlib.h"]);
        let err = SerialTaskGraph::new().run_task(code.compile(None).unwrap()).unwrap_err();
        assert!(matches!(err, TaskError::Config(_)));

        let err = SerialTaskGraph::new()
            .run_task(code.compile(Some(dir.path())).unwrap())
            .unwrap_err();
        assert!(err.to_string().contains("testlib.h is not found"));
    }

    #[test]
    fn run_feeds_input_and_captures_output() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("echo.sh");
        fs::write(&script, "#!/bin/sh\ntr a-z A-Z\n").unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
        let input = dir.path().join("1.in");
        let output = dir.path().join("1.out");
        fs::write(&input, "hello\n").unwrap();

        let code = Code::detect("echo.sh", dir.path(), dir.path().join("out"), &EngineConfig::default());
        let task = code
            .run(&[], dir.path(), &input, &output, Some(Duration::from_secs(5)), false)
            .unwrap();
        let value = SerialTaskGraph::new().run_task(task).unwrap();
        assert!(RunResult::from_value(&value).unwrap().status.is_ok());
        assert_eq!(fs::read_to_string(output).unwrap(), "HELLO\n");
    }
}
