//! Transform sandbox that runs an operator-supplied interpreter process.
//!
//! The child reads `{"source", "trace", "destination"}` as JSON on stdin and
//! must write the payload as JSON on stdout. Output beyond the size cap fails
//! the transform. The child is killed when the caller stops waiting.
//!
//! Every child is launched through a [`Confinement`]: `prlimit` applies
//! address-space, CPU-time and descriptor ceilings, then `bwrap` places the
//! interpreter in fresh user, network, PID, IPC and mount namespaces. Inside,
//! the child sees only the configured read-only system paths, an empty
//! `/tmp`, a minimal `/dev` and its scratch directory mounted at `/work`. It
//! has no network, cannot see host processes and runs with an empty
//! environment. The interpreter binary itself must live under one of the
//! read-only paths.

use std::{
    path::{Path, PathBuf},
    process::Stdio,
    sync::Arc,
};

use serde::Serialize;
use serde_json::Value;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    process::Command,
    sync::Semaphore,
};

use super::{DestinationView, TraceView, TransformInput, TransformSandbox};
use crate::error::{DeliveryError, Result};

/// Default cap on concurrently running transform processes.
pub const DEFAULT_MAX_CONCURRENT: usize = 8;

/// Default cap on bytes read from the child's stdout.
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 1024 * 1024;

/// Mount point of the scratch directory inside the sandbox.
pub const SANDBOX_WORKDIR: &str = "/work";

/// Namespace and resource confinement applied to every transform process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Confinement {
    /// Path to the bubblewrap binary.
    pub bwrap: PathBuf,
    /// Path to the util-linux `prlimit` binary.
    pub prlimit: PathBuf,
    /// Host paths mounted read-only inside the sandbox. Missing paths are
    /// skipped.
    pub read_only_paths: Vec<PathBuf>,
    /// Address-space ceiling in bytes.
    pub memory_limit_bytes: u64,
    /// CPU-time ceiling in seconds.
    pub cpu_limit_secs: u64,
    /// Open file descriptor ceiling.
    pub max_open_files: u64,
}

impl Default for Confinement {
    fn default() -> Self {
        Self {
            bwrap: PathBuf::from("/usr/bin/bwrap"),
            prlimit: PathBuf::from("/usr/bin/prlimit"),
            read_only_paths: ["/usr", "/bin", "/lib", "/lib64", "/etc/alternatives"]
                .into_iter()
                .map(PathBuf::from)
                .collect(),
            memory_limit_bytes: 256 * 1024 * 1024,
            cpu_limit_secs: 2,
            max_open_files: 64,
        }
    }
}

impl Confinement {
    /// Checks that the wrapper binaries are present.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Configuration` naming the first missing binary.
    pub fn verify(&self) -> Result<()> {
        for binary in [&self.bwrap, &self.prlimit] {
            if !binary.is_file() {
                return Err(DeliveryError::configuration(format!(
                    "transform confinement binary {} not found",
                    binary.display()
                )));
            }
        }
        Ok(())
    }

    /// Wraps `program args` so it runs confined with `workdir` as `/work`.
    fn wrap(&self, program: &Path, args: &[String], workdir: &Path) -> Command {
        let mut command = Command::new(&self.prlimit);
        command
            .arg(format!("--as={}", self.memory_limit_bytes))
            .arg(format!("--cpu={}", self.cpu_limit_secs))
            .arg(format!("--nofile={}", self.max_open_files))
            .arg("--")
            .arg(&self.bwrap)
            .args(["--unshare-all", "--die-with-parent", "--new-session", "--clearenv"]);
        for path in &self.read_only_paths {
            command.arg("--ro-bind-try").arg(path).arg(path);
        }
        command
            .args(["--dev", "/dev", "--tmpfs", "/tmp", "--bind"])
            .arg(workdir)
            .arg(SANDBOX_WORKDIR)
            .args(["--chdir", SANDBOX_WORKDIR, "--"])
            .arg(program)
            .args(args);
        command
    }
}

#[derive(Serialize)]
struct ProcessRequest<'a> {
    source: &'a str,
    trace: &'a TraceView,
    destination: &'a DestinationView,
}

/// Runs transforms in a confined child process.
#[derive(Debug, Clone)]
pub struct ProcessSandbox {
    program: PathBuf,
    args: Vec<String>,
    confinement: Option<Confinement>,
    max_output_bytes: usize,
    semaphore: Arc<Semaphore>,
}

impl ProcessSandbox {
    /// Creates a sandbox running `program` with `args` under `confinement`.
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>, confinement: Confinement) -> Self {
        Self {
            program: program.into(),
            args,
            confinement: Some(confinement),
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            semaphore: Arc::new(Semaphore::new(DEFAULT_MAX_CONCURRENT)),
        }
    }

    /// Sandbox without namespace or rlimit wrapping, for exercising the
    /// stdin/stdout protocol in tests.
    #[cfg(test)]
    fn unconfined(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self { confinement: None, ..Self::new(program, args, Confinement::default()) }
    }

    /// Sets the maximum number of concurrently running children.
    #[must_use]
    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.semaphore = Arc::new(Semaphore::new(max_concurrent.max(1)));
        self
    }

    /// Sets the stdout size cap.
    #[must_use]
    pub fn with_max_output_bytes(mut self, max_output_bytes: usize) -> Self {
        self.max_output_bytes = max_output_bytes;
        self
    }

    fn scratch_dir() -> Result<PathBuf> {
        let dir =
            std::env::temp_dir().join(format!("tracerelay-transform-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir(&dir)
            .map_err(|e| DeliveryError::transform(format!("failed to create scratch dir: {e}")))?;
        Ok(dir)
    }

    fn command(&self, workdir: &Path) -> Command {
        let mut command = match &self.confinement {
            Some(confinement) => confinement.wrap(&self.program, &self.args, workdir),
            None => {
                let mut command = Command::new(&self.program);
                command.args(&self.args);
                command
            },
        };
        command
            .env_clear()
            .current_dir(workdir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        command
    }

    async fn run(&self, request: Vec<u8>, workdir: &Path) -> Result<Value> {
        let mut child = self
            .command(workdir)
            .spawn()
            .map_err(|e| DeliveryError::transform(format!("failed to spawn transform: {e}")))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| DeliveryError::transform("transform stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| DeliveryError::transform("transform stdout unavailable"))?;

        let write = async move {
            stdin.write_all(&request).await?;
            stdin.shutdown().await
        };

        let limit = self.max_output_bytes;
        let read = async move {
            let mut output = Vec::new();
            stdout.take(limit as u64 + 1).read_to_end(&mut output).await?;
            Ok::<_, std::io::Error>(output)
        };

        let (written, output) = tokio::join!(write, read);
        // a child that ignores stdin may close it early
        if let Err(e) = written {
            if e.kind() != std::io::ErrorKind::BrokenPipe {
                return Err(DeliveryError::transform(format!(
                    "failed to write transform input: {e}"
                )));
            }
        }
        let output = output.map_err(|e| {
            DeliveryError::transform(format!("failed to read transform output: {e}"))
        })?;
        if output.len() > limit {
            return Err(DeliveryError::transform(format!("transform output exceeds {limit} bytes")));
        }

        let status = child
            .wait()
            .await
            .map_err(|e| DeliveryError::transform(format!("failed to wait for transform: {e}")))?;
        if !status.success() {
            return Err(DeliveryError::transform(format!("transform exited with {status}")));
        }

        serde_json::from_slice(&output)
            .map_err(|e| DeliveryError::transform(format!("transform output is not JSON: {e}")))
    }
}

#[async_trait::async_trait]
impl TransformSandbox for ProcessSandbox {
    async fn execute(&self, source: &str, input: &TransformInput) -> Result<Value> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| DeliveryError::transform("transform sandbox closed"))?;

        let request = serde_json::to_vec(&ProcessRequest {
            source,
            trace: &input.trace,
            destination: &input.destination,
        })
        .map_err(|e| DeliveryError::transform(format!("unserializable transform input: {e}")))?;

        let workdir = Self::scratch_dir()?;
        let result = self.run(request, &workdir).await;
        if let Err(e) = std::fs::remove_dir_all(&workdir) {
            tracing::debug!(path = %workdir.display(), error = %e, "failed to remove scratch dir");
        }
        result
    }
}
