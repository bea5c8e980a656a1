//! Sandboxed executor
//!
//! Every run gets a fresh [`tempfile::TempDir`] that is removed when the run
//! returns, whatever the outcome. The script itself runs out of process via a
//! [`ScriptRunner`]; this module owns harvesting and normalizing whatever
//! export files it left behind.

mod normalize;
mod runner;

pub use normalize::{data_uri, normalize_export};
pub use runner::{PythonRunner, RunError, ScriptRunner};

use crate::ExecutorConfig;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Preview formats in order of preference
const PREVIEW_EXTENSIONS: &[&str] = &["gltf", "glb"];

/// CAD interchange formats
const STEP_EXTENSIONS: &[&str] = &["step", "stp"];

#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("CAD library unavailable: {0}")]
    LibraryUnavailable(String),

    #[error("Script execution failed: {0}")]
    Script(String),

    #[error("Script ran but produced no export file")]
    NoExportProduced,

    #[error("Script execution timed out after {0} seconds")]
    Timeout(u64),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ExecutionError {
    pub fn is_library_unavailable(&self) -> bool {
        matches!(self, ExecutionError::LibraryUnavailable(_))
    }
}

impl From<RunError> for ExecutionError {
    fn from(err: RunError) -> Self {
        match err {
            RunError::LibraryUnavailable(msg) => ExecutionError::LibraryUnavailable(msg),
            RunError::Failed(msg) => ExecutionError::Script(msg),
            RunError::Timeout(limit) => ExecutionError::Timeout(limit.as_secs()),
            RunError::Io(e) => ExecutionError::Io(e),
        }
    }
}

/// Normalized output of one successful run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExportArtifact {
    /// glTF JSON text, STEP text, or a base64 data URI for binary files
    pub export: String,

    /// STEP text produced alongside a preview export
    pub step: Option<String>,

    /// Name of the file `export` was read from
    pub file_name: String,
}

pub struct SandboxedExecutor {
    runner: Arc<dyn ScriptRunner>,
}

impl SandboxedExecutor {
    pub fn new(runner: Arc<dyn ScriptRunner>) -> Self {
        Self { runner }
    }

    /// Executor backed by the configured Python interpreter
    pub fn from_config(config: &ExecutorConfig) -> Self {
        Self::new(Arc::new(PythonRunner::new(config)))
    }

    pub fn runner(&self) -> &dyn ScriptRunner {
        self.runner.as_ref()
    }

    /// Run `script` in a private working directory and return its export
    pub async fn execute(&self, script: &str) -> Result<ExportArtifact, ExecutionError> {
        let workdir = tempfile::TempDir::new()?;
        let start = Instant::now();

        let outcome = self.runner.run(script, workdir.path()).await;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        if let Err(e) = outcome {
            warn!(runner = self.runner.name(), elapsed_ms, error = %e, "Script run failed");
            return Err(e.into());
        }

        // Blocking reads; the directory is dropped at the end of the task
        let artifact = tokio::task::spawn_blocking(move || harvest(workdir.path()))
            .await
            .map_err(|e| ExecutionError::Io(std::io::Error::other(e)))??;
        info!(
            runner = self.runner.name(),
            elapsed_ms,
            file = %artifact.file_name,
            export_len = artifact.export.len(),
            has_step = artifact.step.is_some(),
            "Script produced export"
        );
        Ok(artifact)
    }
}

fn harvest(workdir: &Path) -> Result<ExportArtifact, ExecutionError> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(workdir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file())
        .collect();
    files.sort();

    let preview = first_with_extension(&files, PREVIEW_EXTENSIONS);
    let step = first_with_extension(&files, STEP_EXTENSIONS);
    debug!(candidates = files.len(), ?preview, ?step, "Harvesting exports");

    let (primary, step_text) = match (preview, step) {
        (Some(preview), Some(step)) => (preview, Some(read_step(step)?)),
        (Some(preview), None) => (preview, None),
        (None, Some(step)) => (step, None),
        (None, None) => return Err(ExecutionError::NoExportProduced),
    };

    Ok(ExportArtifact {
        export: normalize_export(primary)?,
        step: step_text,
        file_name: primary
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
    })
}

fn first_with_extension<'a>(files: &'a [PathBuf], extensions: &[&str]) -> Option<&'a Path> {
    extensions.iter().find_map(|wanted| {
        files
            .iter()
            .find(|path| {
                path.extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| e.eq_ignore_ascii_case(wanted))
            })
            .map(PathBuf::as_path)
    })
}

fn read_step(path: &Path) -> Result<String, ExecutionError> {
    let bytes = std::fs::read(path)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}


#[cfg(test)]
mod tests {
    use super::testing::{FailingRunner, FileWritingRunner};
    use super::*;
    use tempfile::TempDir;

    /// Stand-in `cadquery` whose `save` writes a minimal glTF
    const STUB_CADQUERY: &str = r#"import json


def save(path):
    with open(path, "w") as fh:
        json.dump({"asset": {"version": "2.0"}}, fh)
"#;

    /// Executor over the real interpreter with the stub package on
    /// `PYTHONPATH`; `None` when python3 is not installed
    fn stub_python_executor(timeout_secs: u64) -> Option<(SandboxedExecutor, TempDir)> {
        let installed = std::process::Command::new("python3")
            .arg("--version")
            .output()
            .is_ok_and(|out| out.status.success());
        if !installed {
            return None;
        }

        let site = TempDir::new().unwrap();
        std::fs::create_dir(site.path().join("cadquery")).unwrap();
        std::fs::write(site.path().join("cadquery/__init__.py"), STUB_CADQUERY).unwrap();

        let mut config = ExecutorConfig {
            timeout_secs,
            ..ExecutorConfig::default()
        };
        config.env.insert(
            "PYTHONPATH".to_string(),
            site.path().display().to_string(),
        );
        Some((SandboxedExecutor::from_config(&config), site))
    }

    #[tokio::test]
    async fn test_gltf_export_is_returned() {
        let runner = Arc::new(FileWritingRunner::gltf());
        let executor = SandboxedExecutor::new(runner.clone());

        let artifact = executor.execute("result = box()").await.unwrap();
        assert_eq!(artifact.file_name, "output.gltf");
        assert!(artifact.export.starts_with("{\"asset\""));
        assert_eq!(artifact.step, None);
        assert_eq!(runner.scripts(), vec!["result = box()".to_string()]);
    }

    #[tokio::test]
    async fn test_workdir_is_removed_after_every_run() {
        let runner = Arc::new(FileWritingRunner::gltf());
        let executor = SandboxedExecutor::new(runner.clone());
        executor.execute("a").await.unwrap();

        let empty = Arc::new(FileWritingRunner::default());
        let executor = SandboxedExecutor::new(empty.clone());
        assert!(executor.execute("b").await.is_err());

        for dir in runner
            .workdirs
            .lock()
            .unwrap()
            .iter()
            .chain(empty.workdirs.lock().unwrap().iter())
        {
            assert!(!dir.exists(), "{} still exists", dir.display());
        }
    }

    #[tokio::test]
    async fn test_concurrent_runs_get_distinct_workdirs() {
        let runner = Arc::new(FileWritingRunner::gltf());
        let executor = SandboxedExecutor::new(runner.clone());
        let (a, b) = tokio::join!(executor.execute("a"), executor.execute("b"));
        assert!(a.is_ok() && b.is_ok());

        let dirs = runner.workdirs.lock().unwrap();
        assert_eq!(dirs.len(), 2);
        assert_ne!(dirs[0], dirs[1]);
    }

    #[tokio::test]
    async fn test_no_export_is_an_error() {
        let runner = Arc::new(FileWritingRunner::new(vec![("notes.txt", b"hello".to_vec())]));
        let err = SandboxedExecutor::new(runner)
            .execute("x")
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::NoExportProduced));
    }

    #[tokio::test]
    async fn test_preview_preferred_and_step_attached() {
        let runner = Arc::new(FileWritingRunner::new(vec![
            ("output.step", b"ISO-10303-21;".to_vec()),
            ("model.glb", b"glTF\xff\x00".to_vec()),
            ("output.gltf", b"{\"asset\":{}}".to_vec()),
        ]));
        let artifact = SandboxedExecutor::new(runner).execute("x").await.unwrap();
        assert_eq!(artifact.file_name, "output.gltf");
        assert_eq!(artifact.step.as_deref(), Some("ISO-10303-21;"));
    }

    #[tokio::test]
    async fn test_step_only_becomes_export() {
        let runner = Arc::new(FileWritingRunner::new(vec![("part.STP", b"ISO-10303-21;".to_vec())]));
        let artifact = SandboxedExecutor::new(runner).execute("x").await.unwrap();
        assert_eq!(artifact.export, "ISO-10303-21;");
        assert_eq!(artifact.step, None);
    }

    #[tokio::test]
    async fn test_glb_only_becomes_binary_data_uri() {
        let runner = Arc::new(FileWritingRunner::new(vec![("output.glb", b"glTF\xff\x00".to_vec())]));
        let artifact = SandboxedExecutor::new(runner).execute("x").await.unwrap();
        assert!(artifact.export.starts_with("data:model/gltf-binary;base64,"));
    }

    #[tokio::test]
    async fn test_runner_failures_are_classified() {
        let err = SandboxedExecutor::new(Arc::new(FailingRunner::LibraryUnavailable))
            .execute("x")
            .await
            .unwrap_err();
        assert!(err.is_library_unavailable());

        let err = SandboxedExecutor::new(Arc::new(FailingRunner::ScriptError(
            "NameError: name 'cq' is not defined",
        )))
        .execute("x")
        .await
        .unwrap_err();
        assert!(!err.is_library_unavailable());
        assert_eq!(
            err.to_string(),
            "Script execution failed: NameError: name 'cq' is not defined"
        );

        let err = SandboxedExecutor::new(Arc::new(FailingRunner::Timeout))
            .execute("x")
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::Timeout(60)));
    }

    #[tokio::test]
    async fn test_python_script_exports() {
        let Some((executor, _site)) = stub_python_executor(30) else {
            println!("Skipping: python3 not available");
            return;
        };

        let artifact = executor
            .execute("import cadquery as cq\nimport math\ncq.save('output.gltf')\n")
            .await
            .unwrap();
        assert_eq!(artifact.file_name, "output.gltf");
        let doc: serde_json::Value = serde_json::from_str(&artifact.export).unwrap();
        assert_eq!(doc["asset"]["version"], "2.0");
    }

    #[tokio::test]
    async fn test_python_main_guard_runs() {
        let Some((executor, _site)) = stub_python_executor(30) else {
            println!("Skipping: python3 not available");
            return;
        };

        let script = "import cadquery as cq\n\nif __name__ == '__main__':\n    cq.save('output.gltf')\n";
        let artifact = executor.execute(script).await.unwrap();
        assert_eq!(artifact.file_name, "output.gltf");
    }

    #[tokio::test]
    async fn test_python_classes_and_introspection() {
        let Some((executor, _site)) = stub_python_executor(30) else {
            println!("Skipping: python3 not available");
            return;
        };

        let script = r#"import cadquery as cq


class Part:
    size = 3

    def name(self):
        return type(self).__name__


part = Part()
assert hasattr(part, "size") and getattr(part, "size") == 3
try:
    1 / 0
except ArithmeticError:
    pass
cq.save(part.name().lower() + ".gltf")
"#;
        let artifact = executor.execute(script).await.unwrap();
        assert_eq!(artifact.file_name, "part.gltf");
    }

    #[tokio::test]
    async fn test_python_import_guard() {
        let Some((executor, _site)) = stub_python_executor(30) else {
            println!("Skipping: python3 not available");
            return;
        };

        let err = executor
            .execute("import os\nimport cadquery as cq\ncq.save('output.gltf')\n")
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::Script(_)));
        assert!(err.to_string().contains("import of 'os' is not allowed"));
    }

    #[tokio::test]
    async fn test_python_runaway_script_is_killed() {
        let Some((executor, _site)) = stub_python_executor(1) else {
            println!("Skipping: python3 not available");
            return;
        };

        let start = Instant::now();
        let err = executor.execute("while True:\n    pass\n").await.unwrap_err();
        assert!(matches!(err, ExecutionError::Timeout(1)));
        assert!(start.elapsed() < std::time::Duration::from_secs(10));
    }
}
