//! The content materializer: the external tool (chezmoi by default) that
//! renders the source tree into live files.

use std::path::Path;
use std::process::{Command, Stdio};

use tracing::{debug, info, warn};

use crate::config::{MaterializerConfig, SOURCE_PLACEHOLDER};
use crate::errors::MaterializerError;

/// Verification and application of tracked content.
///
/// Every method may return [`MaterializerError::Unavailable`]; callers treat
/// that as a skip.
pub trait Materializer: Send + Sync {
    fn is_available(&self) -> bool;

    /// Check templates and schema without touching live files.
    fn verify(&self, source: &Path) -> Result<(), MaterializerError>;

    /// Render everything without writing to the live tree.
    fn apply_dry_run(&self, source: &Path) -> Result<(), MaterializerError>;

    /// Write the rendered content to the live tree.
    fn apply(&self, source: &Path) -> Result<(), MaterializerError>;
}

/// Runs a configured program with per-step argument lists.
#[derive(Debug, Clone)]
pub struct CommandMaterializer {
    config: MaterializerConfig,
}

impl CommandMaterializer {
    pub fn new(config: MaterializerConfig) -> Self {
        Self { config }
    }

    pub fn program(&self) -> &str {
        &self.config.program
    }

    fn run(&self, step: &str, args: &[String], source: &Path) -> Result<(), MaterializerError> {
        let source = source.to_string_lossy();
        let args: Vec<String> = args
            .iter()
            .map(|a| a.replace(SOURCE_PLACEHOLDER, &source))
            .collect();

        debug!(step, program = %self.config.program, ?args, "running materializer");
        let output = Command::new(&self.config.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    MaterializerError::Unavailable(self.config.program.clone())
                } else {
                    MaterializerError::IoError(e)
                }
            })?;

        if !output.status.success() {
            let exit_code = output.status.code().unwrap_or(-1);
            let detail = String::from_utf8_lossy(&output.stderr).trim().to_string();
            warn!(step, exit_code, %detail, "materializer step failed");
            return Err(MaterializerError::Failed {
                step: step.to_string(),
                exit_code,
                detail,
            });
        }
        info!(step, "materializer step succeeded");
        Ok(())
    }
}

impl Materializer for CommandMaterializer {
    fn is_available(&self) -> bool {
        Command::new(&self.config.program)
            .arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .is_ok()
    }

    fn verify(&self, source: &Path) -> Result<(), MaterializerError> {
        self.run("verify", &self.config.verify_args, source)
    }

    fn apply_dry_run(&self, source: &Path) -> Result<(), MaterializerError> {
        self.run("dry-run apply", &self.config.dry_run_args, source)
    }

    fn apply(&self, source: &Path) -> Result<(), MaterializerError> {
        self.run("apply", &self.config.apply_args, source)
    }
}
