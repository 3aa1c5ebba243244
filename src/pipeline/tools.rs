//! External tool invocation.
//!
//! Every stage of the pipeline is an opaque subprocess. Invocations are
//! assembled as structured argument lists (never shell strings) and executed
//! through the [`ToolRunner`] seam so the pipeline state machine can be
//! exercised in tests without GDAL installed.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};

/// Errors that can occur while launching an external tool.
#[derive(Debug, Error)]
pub enum ToolError {
    /// The process could not be spawned at all.
    #[error("Failed to launch '{program}': {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// Reading the process output failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Captured result of a finished tool process.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    /// Exit code, if the process exited normally.
    pub exit_code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl ToolOutput {
    /// Returns true for a zero exit code.
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// A structured external tool invocation.
///
/// Arguments are kept as a list end to end; nothing is ever interpolated
/// into a shell string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolInvocation {
    /// Program name or path.
    pub program: PathBuf,
    /// Arguments, in order.
    pub args: Vec<String>,
    /// Reduced OS scheduling priority (nice increment), if any.
    pub nice: Option<u8>,
}

impl ToolInvocation {
    /// Creates an invocation of the given program.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            nice: None,
        }
    }

    /// Appends one argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends several arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Runs the tool at a reduced scheduling priority.
    pub fn with_nice(mut self, increment: u8) -> Self {
        self.nice = Some(increment);
        self
    }

    /// The full argv the runner executes, including the `nice` wrapper.
    pub fn argv(&self) -> Vec<String> {
        let mut argv = Vec::with_capacity(self.args.len() + 4);
        if let Some(increment) = self.nice {
            argv.push("nice".to_string());
            argv.push("-n".to_string());
            argv.push(increment.to_string());
        }
        argv.push(self.program.to_string_lossy().to_string());
        argv.extend(self.args.iter().cloned());
        argv
    }
}

impl std::fmt::Display for ToolInvocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.argv().join(" "))
    }
}

/// Abstraction over external process execution.
///
/// The production implementation spawns real processes; tests substitute a
/// recording mock.
#[async_trait]
pub trait ToolRunner: Send + Sync {
    /// Runs the tool to completion and captures its output.
    async fn run(&self, invocation: &ToolInvocation) -> Result<ToolOutput, ToolError>;
}

/// Tool runner backed by real OS processes.
#[derive(Debug, Default, Clone)]
pub struct SystemToolRunner;

impl SystemToolRunner {
    /// Creates a new system tool runner.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ToolRunner for SystemToolRunner {
    async fn run(&self, invocation: &ToolInvocation) -> Result<ToolOutput, ToolError> {
        let argv = invocation.argv();
        debug!(command = %invocation, "Running external tool");

        let output = Command::new(&argv[0])
            .args(&argv[1..])
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| ToolError::Launch {
                program: argv[0].clone(),
                source,
            })?;

        Ok(ToolOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// GDAL versions from 2.1.0 understand the multi-threading options the
/// pipeline wants to pass (NUM_THREADS open/creation options, warp
/// data-source options).
const MULTICORE_MIN_VERSION: (u32, u32) = (2, 1);

/// Probed capabilities of the installed GDAL tool chain.
///
/// Probed once at startup and cached for the whole run; per-job code only
/// ever branches on the boolean.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GdalCapabilities {
    /// Whether the multi-core tool options are supported.
    pub multicore: bool,
}

impl GdalCapabilities {
    /// Capabilities with the multi-core options enabled, for tests and for
    /// installations known to be recent.
    pub fn assume_multicore() -> Self {
        Self { multicore: true }
    }

    /// Probes the installed GDAL version via `gdal-config --version`.
    ///
    /// A failed probe degrades to single-threaded tool options rather than
    /// failing the run.
    pub async fn probe(runner: &dyn ToolRunner) -> Self {
        let invocation = ToolInvocation::new("gdal-config").arg("--version");

        let multicore = match runner.run(&invocation).await {
            Ok(output) if output.success() => match parse_version(output.stdout.trim()) {
                Some(version) => version >= MULTICORE_MIN_VERSION,
                None => {
                    warn!(output = %output.stdout.trim(), "Unparseable GDAL version, using single-threaded tool options");
                    false
                }
            },
            Ok(output) => {
                warn!(exit_code = ?output.exit_code, "gdal-config failed, using single-threaded tool options");
                false
            }
            Err(e) => {
                warn!(error = %e, "gdal-config not available, using single-threaded tool options");
                false
            }
        };

        Self { multicore }
    }
}

/// Parses "major.minor[.patch...]" into (major, minor).
fn parse_version(version: &str) -> Option<(u32, u32)> {
    let mut parts = version.split('.');
    let major = parts.next()?.trim().parse().ok()?;
    let minor = parts.next().unwrap_or("0").trim().parse().ok()?;
    Some((major, minor))
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invocation_argv() {
        let invocation = ToolInvocation::new("gdalwarp")
            .arg("-t_srs")
            .arg("epsg:32632")
            .args(["in.tif", "out.tif"]);

        assert_eq!(
            invocation.argv(),
            vec!["gdalwarp", "-t_srs", "epsg:32632", "in.tif", "out.tif"]
        );
    }

    #[test]
    fn test_invocation_nice_wrapper() {
        let invocation = ToolInvocation::new("iiq2tif")
            .arg("in.iiq")
            .with_nice(10);

        assert_eq!(invocation.argv(), vec!["nice", "-n", "10", "iiq2tif", "in.iiq"]);
    }

    #[test]
    fn test_invocation_display() {
        let invocation = ToolInvocation::new("gdalinfo").arg("-json").arg("x.tif");
        assert_eq!(invocation.to_string(), "gdalinfo -json x.tif");
    }

    #[test]
    fn test_parse_version() {
        assert_eq!(parse_version("3.8.4"), Some((3, 8)));
        assert_eq!(parse_version("2.1.0"), Some((2, 1)));
        assert_eq!(parse_version("2"), Some((2, 0)));
        assert_eq!(parse_version("not-a-version"), None);
        assert_eq!(parse_version(""), None);
    }

    #[test]
    fn test_multicore_threshold() {
        assert!((2, 1) >= MULTICORE_MIN_VERSION);
        assert!((3, 0) >= MULTICORE_MIN_VERSION);
        assert!((2, 0) < MULTICORE_MIN_VERSION);
        assert!((1, 11) < MULTICORE_MIN_VERSION);
    }

    #[tokio::test]
    async fn test_system_runner_captures_output() {
        let runner = SystemToolRunner::new();
        let invocation = ToolInvocation::new("echo").arg("hello");

        let output = runner.run(&invocation).await.unwrap();
        assert!(output.success());
        assert_eq!(output.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn test_system_runner_nonzero_exit() {
        let runner = SystemToolRunner::new();
        let invocation = ToolInvocation::new("sh").args(["-c", "exit 3"]);

        let output = runner.run(&invocation).await.unwrap();
        assert!(!output.success());
        assert_eq!(output.exit_code, Some(3));
    }

    #[tokio::test]
    async fn test_system_runner_missing_program() {
        let runner = SystemToolRunner::new();
        let invocation = ToolInvocation::new("definitely-not-a-real-tool-7f3a");

        let err = runner.run(&invocation).await.unwrap_err();
        assert!(matches!(err, ToolError::Launch { .. }));
    }

    #[tokio::test]
    async fn test_probe_without_gdal_degrades() {
        struct FailingRunner;

        #[async_trait]
        impl ToolRunner for FailingRunner {
            async fn run(&self, invocation: &ToolInvocation) -> Result<ToolOutput, ToolError> {
                Err(ToolError::Launch {
                    program: invocation.program.to_string_lossy().to_string(),
                    source: std::io::Error::from(std::io::ErrorKind::NotFound),
                })
            }
        }

        let caps = GdalCapabilities::probe(&FailingRunner).await;
        assert!(!caps.multicore);
    }

    #[tokio::test]
    async fn test_probe_parses_version() {
        struct VersionRunner(&'static str);

        #[async_trait]
        impl ToolRunner for VersionRunner {
            async fn run(&self, _invocation: &ToolInvocation) -> Result<ToolOutput, ToolError> {
                Ok(ToolOutput {
                    exit_code: Some(0),
                    stdout: format!("{}\n", self.0),
                    stderr: String::new(),
                })
            }
        }

        let caps = GdalCapabilities::probe(&VersionRunner("3.8.4")).await;
        assert!(caps.multicore);

        let caps = GdalCapabilities::probe(&VersionRunner("1.11.5")).await;
        assert!(!caps.multicore);
    }
}
