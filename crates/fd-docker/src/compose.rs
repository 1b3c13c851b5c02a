//! `docker compose` invocations. Compose has no engine API, so it runs as a
//! child process with the project file on stdin.

use std::process::Stdio;

use fd_protocol::{ComposeProject, ProgressSink};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::debug;

use crate::error::DockerError;

#[derive(Debug, Clone)]
pub struct ComposeRunner {
    binary: String,
}

impl Default for ComposeRunner {
    fn default() -> Self {
        Self::new("docker")
    }
}

impl ComposeRunner {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Run a compose subcommand for `project`, with its definition on stdin and
    /// its variables in the environment.
    pub async fn run(
        &self,
        project: &ComposeProject,
        sub: &[&str],
        progress: &mut ProgressSink,
    ) -> Result<(), DockerError> {
        for line in variable_banner(project) {
            progress.info(line);
        }
        let envs: Vec<(&str, &str)> = project
            .variables
            .iter()
            .map(|(k, v)| (k.as_str(), v.value.as_str()))
            .collect();
        let args = compose_args(&project.project_name, true, sub);
        self.stream(&args, Some(&project.definition), &envs, progress)
            .await
    }

    /// `docker compose down` needs only the project name.
    pub async fn down(
        &self,
        project_name: &str,
        progress: &mut ProgressSink,
    ) -> Result<(), DockerError> {
        let args = compose_args(project_name, false, &["down"]);
        self.stream(&args, None, &[], progress).await
    }

    /// Run to completion, forwarding every stdout and stderr line to `progress`.
    async fn stream(
        &self,
        args: &[String],
        stdin: Option<&str>,
        envs: &[(&str, &str)],
        progress: &mut ProgressSink,
    ) -> Result<(), DockerError> {
        let command = format!("{} {}", self.binary, args.join(" "));
        debug!(command = %command, "Running compose command");
        let spawn_err = |source| DockerError::Spawn {
            command: command.clone(),
            source,
        };

        let mut child = Command::new(&self.binary)
            .args(args)
            .envs(envs.iter().copied())
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(spawn_err)?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input.as_bytes()).await.map_err(spawn_err)?;
            // Closing stdin signals end of input.
            drop(pipe);
        }

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(DockerError::Failed {
                command,
                message: "output pipes unavailable".to_string(),
            });
        };
        let mut out = BufReader::new(stdout).lines();
        let mut err = BufReader::new(stderr).lines();
        let (mut out_done, mut err_done) = (false, false);
        while !(out_done && err_done) {
            tokio::select! {
                line = out.next_line(), if !out_done => match line {
                    Ok(Some(line)) => progress.info(line),
                    _ => out_done = true,
                },
                line = err.next_line(), if !err_done => match line {
                    Ok(Some(line)) => progress.info(line),
                    _ => err_done = true,
                },
            }
        }

        let status = child.wait().await.map_err(spawn_err)?;
        if !status.success() {
            return Err(DockerError::Failed {
                command,
                message: status.to_string(),
            });
        }
        Ok(())
    }
}

fn compose_args(project_name: &str, with_stdin_file: bool, sub: &[&str]) -> Vec<String> {
    let mut args = vec![
        "compose".to_string(),
        "--project-name".to_string(),
        project_name.to_string(),
    ];
    if with_stdin_file {
        args.push("--file".to_string());
        args.push("-".to_string());
    }
    args.extend(sub.iter().map(|s| s.to_string()));
    args
}

/// Progress lines listing the variables a compose command runs with, secrets masked.
fn variable_banner(project: &ComposeProject) -> Vec<String> {
    if project.variables.is_empty() {
        return Vec::new();
    }
    let mut lines = vec!["*** SETTING BELOW VARIABLES: ***".to_string()];
    for (key, var) in &project.variables {
        let value = if var.is_secret { "[SECRET]" } else { var.value.as_str() };
        lines.push(format!("{key}={value}"));
    }
    lines
}
