//! Script Runner
//!
//! Runs the playlist scripts that consume the saved credential. They read
//! the same .env file and are treated as opaque processes.

use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{info, warn};

use crate::error::{ResolveError, Result};

/// Captured result of one script run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScriptOutput {
    /// Process exit code, -1 when it could not be spawned or was killed
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ScriptOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Spawns `{interpreter} {scripts_dir}/{name} [id]`
#[derive(Debug, Clone)]
pub struct ScriptRunner {
    interpreter: PathBuf,
    scripts_dir: PathBuf,
}

impl ScriptRunner {
    pub fn new(interpreter: impl Into<PathBuf>, scripts_dir: impl Into<PathBuf>) -> Self {
        Self {
            interpreter: interpreter.into(),
            scripts_dir: scripts_dir.into(),
        }
    }

    /// Run a script by bare file name and wait for it
    pub async fn run(&self, name: &str, id: Option<&str>) -> Result<ScriptOutput> {
        if !is_bare_name(name) {
            return Err(ResolveError::InvalidRequest(format!(
                "script name must be a bare file name: {}",
                name
            )));
        }

        let script = self.scripts_dir.join(name);
        let mut command = Command::new(&self.interpreter);
        command.arg(&script);
        if let Some(id) = id {
            command.arg(id);
        }
        if let Some(root) = self.scripts_dir.parent().filter(|p| !p.as_os_str().is_empty()) {
            command.current_dir(root);
        }

        info!(script = %script.display(), id, "Running script");
        let output = match command.output().await {
            Ok(output) => output,
            Err(e) => {
                warn!(script = %script.display(), error = %e, "Script failed to start");
                return Ok(ScriptOutput {
                    exit_code: -1,
                    stdout: String::new(),
                    stderr: e.to_string(),
                });
            }
        };

        let result = ScriptOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        if !result.success() {
            warn!(script = %script.display(), exit_code = result.exit_code, "Script exited with failure");
        }
        Ok(result)
    }
}

fn is_bare_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && Path::new(name).file_name().map(|f| f == name).unwrap_or(false)
        && !name.contains(['/', '\\'])
}
