//! Out-of-process script runners

use crate::ExecutorConfig;
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};

/// Harness exit status meaning the CAD library could not be imported
const EXIT_LIBRARY_UNAVAILABLE: i32 = 3;

const SCRIPT_FILE: &str = "script.py";
const HARNESS_FILE: &str = "_harness.py";

/// Keep error messages readable when a traceback is long
const MAX_STDERR_CHARS: usize = 2000;

/// Binds the restricted namespace and runs the script file given as argv[1]
const HARNESS: &str = r#"import builtins
import sys

try:
    import cadquery
except Exception as exc:
    sys.stderr.write("cadquery unavailable: %s\n" % exc)
    sys.exit(3)

import math

_ALLOWED_MODULES = {"cadquery", "math"}
_real_import = builtins.__import__


def _guarded_import(name, globals=None, locals=None, fromlist=(), level=0):
    if level != 0 or name.split(".")[0] not in _ALLOWED_MODULES:
        raise ImportError("import of '%s' is not allowed" % name)
    return _real_import(name, globals, locals, fromlist, level)


_SAFE_NAMES = [
    "abs", "all", "any", "bool", "callable", "dict", "divmod", "enumerate",
    "filter", "float", "frozenset", "getattr", "hasattr", "int", "isinstance",
    "issubclass", "iter", "len", "list", "map", "max", "min", "next", "object",
    "pow", "print", "property", "range", "repr", "reversed", "round", "set",
    "setattr", "slice", "sorted", "staticmethod", "classmethod", "str", "sum",
    "super", "tuple", "type", "zip", "True", "False", "None",
    "__build_class__",
    "Exception", "ArithmeticError", "AssertionError", "AttributeError",
    "IndexError", "KeyError", "LookupError", "NotImplementedError",
    "RuntimeError", "StopIteration", "TypeError", "ValueError",
    "ZeroDivisionError",
]
_safe_builtins = {n: getattr(builtins, n) for n in _SAFE_NAMES if hasattr(builtins, n)}
_safe_builtins["__import__"] = _guarded_import

namespace = {
    "__builtins__": _safe_builtins,
    "__name__": "__main__",
    "cq": cadquery,
    "cadquery": cadquery,
    "math": math,
}

with open(sys.argv[1], encoding="utf-8") as fh:
    source = fh.read()

try:
    exec(compile(source, "script.py", "exec"), namespace)
except Exception as exc:
    sys.stderr.write("%s: %s\n" % (type(exc).__name__, exc))
    sys.exit(1)
"#;

const PROBE: &str = r#"import importlib.util, json
print(json.dumps([m for m in ("cadquery", "OCP", "build123d") if importlib.util.find_spec(m)]))"#;

/// Runner-level outcome of one script run
#[derive(Error, Debug)]
pub enum RunError {
    #[error("CAD library unavailable: {0}")]
    LibraryUnavailable(String),

    #[error("{0}")]
    Failed(String),

    #[error("script did not finish within {0:?}")]
    Timeout(Duration),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Runs script text against the CAD library with a given working directory
#[async_trait]
pub trait ScriptRunner: Send + Sync {
    fn name(&self) -> &str;

    /// Run `script` with `workdir` as its current directory. Export files are
    /// left in `workdir` for the caller to harvest.
    async fn run(&self, script: &str, workdir: &Path) -> Result<(), RunError>;

    /// CAD modules the runtime can import, reported by `/health`
    async fn available_modules(&self) -> Vec<String>;
}

/// Spawns the configured Python interpreter on a harness script
pub struct PythonRunner {
    python: String,
    timeout: Duration,
    env_passthrough: Vec<String>,
    env: Vec<(String, String)>,
}

impl PythonRunner {
    pub fn new(config: &ExecutorConfig) -> Self {
        Self {
            python: config.python.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
            env_passthrough: config.env_passthrough.clone(),
            env: config
                .env
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }

    fn command(&self, workdir: &Path) -> Command {
        let mut cmd = Command::new(&self.python);
        cmd.current_dir(workdir)
            .env_clear()
            .envs(
                self.env_passthrough
                    .iter()
                    .filter_map(|key| std::env::var_os(key).map(|value| (key, value))),
            )
            .envs(self.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    fn interpreter_missing(&self) -> RunError {
        RunError::LibraryUnavailable(format!("python interpreter '{}' not found", self.python))
    }
}

#[async_trait]
impl ScriptRunner for PythonRunner {
    fn name(&self) -> &str {
        "python"
    }

    async fn run(&self, script: &str, workdir: &Path) -> Result<(), RunError> {
        tokio::fs::write(workdir.join(HARNESS_FILE), HARNESS).await?;
        tokio::fs::write(workdir.join(SCRIPT_FILE), script).await?;

        let mut cmd = self.command(workdir);
        cmd.arg("-B").arg(HARNESS_FILE).arg(SCRIPT_FILE);
        debug!(python = %self.python, workdir = %workdir.display(), "Spawning script runner");

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(self.interpreter_missing()),
            Err(e) => return Err(RunError::Io(e)),
        };

        // Dropping the child on timeout kills it
        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| RunError::Timeout(self.timeout))??;

        let stderr = tail(&String::from_utf8_lossy(&output.stderr), MAX_STDERR_CHARS);
        match output.status.code() {
            Some(0) => Ok(()),
            Some(EXIT_LIBRARY_UNAVAILABLE) => Err(RunError::LibraryUnavailable(stderr)),
            Some(code) => {
                debug!(code, stderr = %stderr, "Script exited with failure");
                Err(RunError::Failed(if stderr.is_empty() {
                    format!("script exited with status {code}")
                } else {
                    stderr
                }))
            }
            None => Err(RunError::Failed("script terminated by a signal".to_string())),
        }
    }

    async fn available_modules(&self) -> Vec<String> {
        let Ok(workdir) = tempfile::TempDir::new() else {
            return Vec::new();
        };
        let mut cmd = self.command(workdir.path());
        cmd.arg("-c").arg(PROBE);

        let output = match tokio::time::timeout(Duration::from_secs(10), cmd.output()).await {
            Ok(Ok(output)) if output.status.success() => output,
            Ok(Ok(_)) | Err(_) => return Vec::new(),
            Ok(Err(e)) => {
                warn!(python = %self.python, error = %e, "Cannot probe CAD modules");
                return Vec::new();
            }
        };

        serde_json::from_slice(&output.stdout).unwrap_or_default()
    }
}

/// Last `max` characters of `text`, trimmed
fn tail(text: &str, max: usize) -> String {
    let text = text.trim();
    let count = text.chars().count();
    if count <= max {
        return text.to_string();
    }
    text.chars().skip(count - max).collect()
}
