//! Executor that runs each task through an external sandbox runtime.
//!
//! Every task gets a fresh temporary directory holding the module file and a
//! `root` directory, into which the rootfs archive is unpacked. The runtime
//! is started as
//!
//! ```text
//! <runtime> <runtime args...> <module path> <task args...>
//! ```
//!
//! with `root` as its working directory. Requested artifacts are collected
//! from `root` into a zip archive once the process exits.

use crate::cancel::CancellationToken;
use crate::config::ProviderConfig;
use crate::pool::{Executor, ExecutorFactory, TaskParams};
use crate::protocol::TaskOutput;
use crate::store::filesize;
use crate::{ProviderError, Result};
use bytes::Bytes;
use std::io::{Cursor, Write};
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Runs tasks as child processes of the provider.
#[derive(Debug)]
pub struct CommandExecutor {
    index: usize,
    runtime: String,
    runtime_args: Vec<String>,
    respawn_after_task: bool,
    terminated: CancellationToken,
}

impl CommandExecutor {
    pub fn new(index: usize, runtime: impl Into<String>, runtime_args: Vec<String>) -> Self {
        Self {
            index,
            runtime: runtime.into(),
            runtime_args,
            respawn_after_task: false,
            terminated: CancellationToken::new(),
        }
    }

    /// Replace this executor after every task instead of reusing it.
    pub fn with_respawn_after_task(mut self, respawn: bool) -> Self {
        self.respawn_after_task = respawn;
        self
    }

    pub fn index(&self) -> usize {
        self.index
    }
}

#[async_trait::async_trait]
impl Executor for CommandExecutor {
    async fn run(&self, task_id: &str, params: TaskParams) -> Result<TaskOutput> {
        if self.terminated.is_cancelled() {
            return Err(ProviderError::TaskCancelled {
                task_id: task_id.to_string(),
            });
        }

        let workdir = tempfile::Builder::new()
            .prefix("offload-task-")
            .tempdir()
            .map_err(|e| ProviderError::Storage {
                message: format!("Failed to create task directory: {}", e),
            })?;
        let root = workdir.path().join("root");
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| ProviderError::io_with_path(e, &root))?;

        let module_path = workdir.path().join("module.wasm");
        tokio::fs::write(&module_path, &params.module.bytes)
            .await
            .map_err(|e| ProviderError::io_with_path(e, &module_path))?;

        if let Some(rootfs) = params.rootfs.clone() {
            debug!(
                "Unpacking rootfs of {} ({}) for task {}",
                params.module.name,
                filesize(rootfs.len() as u64),
                task_id
            );
            let target = root.clone();
            blocking(move || unpack_rootfs(rootfs, &target)).await?;
        }

        let mut command = Command::new(&self.runtime);
        command
            .args(&self.runtime_args)
            .arg(&module_path)
            .args(&params.args)
            .envs(parse_envs(&params.envs))
            .current_dir(&root)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(
            "Executor {} starting task {} with module {}",
            self.index, task_id, params.module.name
        );
        let mut child = command.spawn().map_err(|e| ProviderError::Task {
            message: format!("Failed to start {}: {}", self.runtime, e),
        })?;

        if let Some(mut stdin) = child.stdin.take() {
            let input = params.stdin.clone();
            tokio::spawn(async move {
                // a runtime that never reads its input closes the pipe early
                if let Err(e) = stdin.write_all(&input).await {
                    debug!("Task stdin closed early: {}", e);
                }
            });
        }

        let output = tokio::select! {
            output = child.wait_with_output() => output.map_err(|e| ProviderError::Task {
                message: format!("Failed to wait for {}: {}", self.runtime, e),
            })?,
            _ = self.terminated.cancelled() => {
                return Err(ProviderError::TaskCancelled {
                    task_id: task_id.to_string(),
                });
            }
        };

        // killed by a signal
        let exit_status = output.status.code().unwrap_or(-1);
        info!(
            "Task {} on executor {} exited with status {}",
            task_id, self.index, exit_status
        );

        let artifacts = if params.artifacts.is_empty() {
            None
        } else {
            let paths = params.artifacts.clone();
            let source = root.clone();
            Some(blocking(move || collect_artifacts(&source, &paths)).await?)
        };

        Ok(TaskOutput {
            exit_status,
            stdout: output.stdout,
            stderr: output.stderr,
            artifacts,
        })
    }

    fn terminate(&self) {
        debug!("Terminating executor {}", self.index);
        self.terminated.cancel();
    }

    fn respawn_after_task(&self) -> bool {
        self.respawn_after_task
    }
}

/// Creates [`CommandExecutor`]s sharing one runtime command.
#[derive(Debug, Clone)]
pub struct CommandExecutorFactory {
    runtime: String,
    runtime_args: Vec<String>,
    respawn_after_task: bool,
}

impl CommandExecutorFactory {
    pub fn new(runtime: impl Into<String>, runtime_args: Vec<String>) -> Self {
        Self {
            runtime: runtime.into(),
            runtime_args,
            respawn_after_task: false,
        }
    }

    pub fn from_config(config: &ProviderConfig) -> Self {
        Self::new(config.runtime.clone(), config.runtime_args.clone())
            .with_respawn_after_task(config.respawn_after_task)
    }

    /// Give every executor a single task before it is replaced.
    pub fn with_respawn_after_task(mut self, respawn: bool) -> Self {
        self.respawn_after_task = respawn;
        self
    }
}

#[async_trait::async_trait]
impl ExecutorFactory for CommandExecutorFactory {
    async fn spawn(&self, index: usize) -> Result<Arc<dyn Executor>> {
        Ok(Arc::new(
            CommandExecutor::new(index, self.runtime.clone(), self.runtime_args.clone())
                .with_respawn_after_task(self.respawn_after_task),
        ))
    }
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ProviderError::Other(format!("Blocking task failed: {}", e)))?
}

/// Split `KEY=VALUE` pairs; entries without `=` get an empty value.
fn parse_envs(envs: &[String]) -> Vec<(String, String)> {
    envs.iter()
        .filter(|e| !e.is_empty())
        .map(|e| match e.split_once('=') {
            Some((key, value)) => (key.to_string(), value.to_string()),
            None => (e.clone(), String::new()),
        })
        .collect()
}

fn unpack_rootfs(archive: Bytes, target: &Path) -> Result<()> {
    let mut archive = zip::ZipArchive::new(Cursor::new(archive))?;
    // extract() refuses entries that would escape the target directory
    archive.extract(target)?;
    Ok(())
}

/// Resolve an artifact path inside `root`, rejecting anything that leaves it.
fn sandbox_path(root: &Path, path: &str) -> Option<PathBuf> {
    let relative = Path::new(path.trim_start_matches('/'));
    if relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
    {
        return None;
    }
    Some(root.join(relative))
}

fn collect_artifacts(root: &Path, paths: &[String]) -> Result<Vec<u8>> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default();

    let mut pending: Vec<PathBuf> = Vec::new();
    for path in paths {
        match sandbox_path(root, path) {
            Some(resolved) if resolved.exists() => pending.push(resolved),
            Some(_) => warn!("Artifact {} does not exist", path),
            None => warn!("Artifact {} is outside the task root", path),
        }
    }

    while let Some(path) = pending.pop() {
        if path.is_dir() {
            let entries =
                std::fs::read_dir(&path).map_err(|e| ProviderError::io_with_path(e, &path))?;
            for entry in entries {
                let entry = entry.map_err(|e| ProviderError::io_with_path(e, &path))?;
                pending.push(entry.path());
            }
            continue;
        }
        let Ok(name) = path.strip_prefix(root) else {
            continue;
        };
        let name = name.to_string_lossy().replace('\\', "/");
        let contents = std::fs::read(&path).map_err(|e| ProviderError::io_with_path(e, &path))?;
        writer.start_file(name, options)?;
        writer
            .write_all(&contents)
            .map_err(|e| ProviderError::io_with_path(e, &path))?;
    }

    Ok(writer.finish()?.into_inner())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::store::CompiledModule;
    use std::io::Read;

    fn module() -> Arc<CompiledModule> {
        Arc::new(CompiledModule::compile("hello", Bytes::from_static(b"\0asm\x01\0\0\0")).unwrap())
    }

    /// Runs `script` with `sh -c`; `$1` is the module path, task args follow.
    fn shell(script: &str) -> CommandExecutor {
        CommandExecutor::new(
            0,
            "sh",
            vec!["-c".to_string(), script.to_string(), "task".to_string()],
        )
    }

    fn params(args: &[&str]) -> TaskParams {
        TaskParams {
            module: module(),
            args: args.iter().map(|a| a.to_string()).collect(),
            envs: Vec::new(),
            stdin: Bytes::new(),
            rootfs: None,
            artifacts: Vec::new(),
        }
    }

    fn zip_of(files: &[(&str, &[u8])]) -> Bytes {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        for (name, contents) in files {
            writer
                .start_file(*name, zip::write::SimpleFileOptions::default())
                .unwrap();
            writer.write_all(contents).unwrap();
        }
        Bytes::from(writer.finish().unwrap().into_inner())
    }

    #[tokio::test]
    async fn test_captures_output_and_exit_status() {
        let executor = shell("read line; echo \"$line $2\"; echo oops >&2; exit 3");
        let mut params = params(&["world"]);
        params.stdin = Bytes::from_static(b"hello\n");

        let output = executor.run("t1", params).await.unwrap();
        assert_eq!(output.exit_status, 3);
        assert_eq!(output.stdout, b"hello world\n");
        assert_eq!(output.stderr, b"oops\n");
        assert!(output.artifacts.is_none());
    }

    #[tokio::test]
    async fn test_module_is_written_and_envs_are_set() {
        let executor = shell("test -s \"$1\" && printf '%s' \"$GREETING\"");
        let mut params = params(&[]);
        params.envs = vec!["GREETING=hi there".to_string()];

        let output = executor.run("t1", params).await.unwrap();
        assert_eq!(output.exit_status, 0);
        assert_eq!(output.stdout, b"hi there");
    }

    #[tokio::test]
    async fn test_rootfs_is_working_directory_and_artifacts_are_zipped() {
        let executor = shell("read value < input.txt; mkdir -p out; echo \"$value!\" > out/result.txt");
        let mut params = params(&[]);
        params.rootfs = Some(zip_of(&[("input.txt", b"data\n")]));
        params.artifacts = vec!["/out".to_string(), "../escape".to_string()];

        let output = executor.run("t1", params).await.unwrap();
        assert_eq!(output.exit_status, 0);

        let archive = output.artifacts.unwrap();
        let mut archive = zip::ZipArchive::new(Cursor::new(archive)).unwrap();
        assert_eq!(archive.len(), 1);
        let mut contents = String::new();
        archive
            .by_name("out/result.txt")
            .unwrap()
            .read_to_string(&mut contents)
            .unwrap();
        assert_eq!(contents, "data!\n");
    }

    #[tokio::test]
    async fn test_missing_runtime_is_task_error() {
        let executor = CommandExecutor::new(0, "/nonexistent/offload-runtime", Vec::new());
        assert!(matches!(
            executor.run("t1", params(&[])).await,
            Err(ProviderError::Task { .. })
        ));
    }

    #[tokio::test]
    async fn test_terminate_stops_running_task() {
        let executor = Arc::new(shell("sleep 30"));
        let running = {
            let executor = executor.clone();
            tokio::spawn(async move { executor.run("t1", params(&[])).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        executor.terminate();

        let result = running.await.unwrap();
        assert!(result.unwrap_err().is_cancelled());
        assert!(executor.run("t2", params(&[])).await.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn test_factory_applies_respawn_policy() {
        let config = ProviderConfig {
            runtime: "sh".to_string(),
            runtime_args: vec!["-c".to_string(), "printf once".to_string(), "task".to_string()],
            respawn_after_task: true,
            ..Default::default()
        };
        let factory = Arc::new(CommandExecutorFactory::from_config(&config));
        assert!(factory.spawn(0).await.unwrap().respawn_after_task());
        assert!(!CommandExecutorFactory::new("sh", Vec::new())
            .spawn(0)
            .await
            .unwrap()
            .respawn_after_task());

        let pool = crate::pool::WorkerPool::new(factory, 1);
        pool.scale(1).await.unwrap();
        let first = pool.current_tasks()[0].index;
        let output = pool.run_task("t1", params(&[])).await.unwrap();
        assert_eq!(output.stdout, b"once");
        assert_eq!(pool.len(), 1);
        assert_ne!(pool.current_tasks()[0].index, first);
    }

    #[test]
    fn test_parse_envs() {
        let envs = vec!["A=1".to_string(), "B=x=y".to_string(), "C".to_string()];
        assert_eq!(
            parse_envs(&envs),
            vec![
                ("A".to_string(), "1".to_string()),
                ("B".to_string(), "x=y".to_string()),
                ("C".to_string(), String::new()),
            ]
        );
    }
}
