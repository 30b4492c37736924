//! Docker Compose backed implementation of the container runtime.
//!
//! Every operation shells out to the `docker` CLI. Child processes are
//! spawned with `kill_on_drop`, so a caller that gives up on a command (for
//! instance through `tokio::time::timeout`) also terminates it.

use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use std::task::{Context, Poll};

use async_trait::async_trait;
use llamactl_backend::{ContainerRuntime, LogStream};
use llamactl_common::{ContainerMetrics, ControlError, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio_stream::wrappers::LinesStream;
use tokio_stream::{Stream, StreamExt};

pub mod gpu;
pub mod health;

pub use gpu::NvidiaSmi;
#[cfg(feature = "nvidia")]
pub use gpu::NvmlGpu;
pub use health::HttpHealthProbe;

#[derive(Debug, Clone)]
pub struct DockerCompose {
    compose_file: PathBuf,
    env_file: PathBuf,
    service: String,
    log_tail: usize,
}

impl DockerCompose {
    pub fn new(compose_file: PathBuf, env_file: PathBuf, service: impl Into<String>, log_tail: usize) -> Self {
        Self { compose_file, env_file, service: service.into(), log_tail }
    }

    fn compose(&self) -> Command {
        let mut cmd = Command::new("docker");
        cmd.arg("compose")
            .arg("-f")
            .arg(&self.compose_file)
            .arg("--env-file")
            .arg(&self.env_file)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        cmd
    }
}

async fn run(mut cmd: Command, label: &str) -> Result<String> {
    tracing::debug!(target: "compose", "running {}", label);
    let output = cmd
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| ControlError::command(label, e.to_string()))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ControlError::command(label, format!("{}: {}", output.status, stderr.trim())));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[async_trait]
impl ContainerRuntime for DockerCompose {
    async fn stop(&self) -> Result<()> {
        let mut cmd = self.compose();
        cmd.arg("stop");
        run(cmd, "docker compose stop").await.map(|_| ())
    }

    async fn start(&self) -> Result<()> {
        let mut cmd = self.compose();
        cmd.args(["up", "-d"]);
        run(cmd, "docker compose up").await.map(|_| ())
    }

    async fn follow_logs(&self) -> Result<LogStream> {
        let mut cmd = self.compose();
        cmd.args(["logs", "-f"])
            .arg(format!("--tail={}", self.log_tail))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = cmd
            .spawn()
            .map_err(|e| ControlError::command("docker compose logs", e.to_string()))?;
        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(ControlError::command("docker compose logs", "output pipes unavailable"));
        };
        let out = LinesStream::new(BufReader::new(stdout).lines());
        let err = LinesStream::new(BufReader::new(stderr).lines());
        Ok(Box::pin(FollowedLogs { _child: child, lines: Box::pin(out.merge(err)) }))
    }

    async fn stats(&self) -> Option<ContainerMetrics> {
        let mut cmd = Command::new("docker");
        cmd.args(["stats", "--no-stream", "--format", "{{.CPUPerc}}|{{.MemUsage}}"])
            .arg(&self.service)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        let out = run(cmd, "docker stats").await.ok()?;
        parse_stats_line(&out)
    }
}

/// Keeps the `logs -f` child alive for as long as its output is consumed.
struct FollowedLogs {
    _child: Child,
    lines: LogStream,
}

impl Stream for FollowedLogs {
    type Item = std::io::Result<String>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.lines.as_mut().poll_next(cx)
    }
}

/// Parses `docker stats` output formatted as `{{.CPUPerc}}|{{.MemUsage}}`.
pub fn parse_stats_line(text: &str) -> Option<ContainerMetrics> {
    let line = text.lines().map(str::trim).find(|l| !l.is_empty())?;
    let (cpu, mem) = line.split_once('|').unwrap_or((line, ""));
    Some(ContainerMetrics {
        cpu_percent_text: cpu.trim().to_string(),
        mem_usage_text: mem.trim().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_line_splits_on_pipe() {
        let m = parse_stats_line("12.34%|1.2GiB / 62.7GiB\n").unwrap();
        assert_eq!(m.cpu_percent_text, "12.34%");
        assert_eq!(m.mem_usage_text, "1.2GiB / 62.7GiB");
    }

    #[test]
    fn stats_line_without_separator_keeps_cpu_only() {
        let m = parse_stats_line("0.00%").unwrap();
        assert_eq!(m.cpu_percent_text, "0.00%");
        assert!(m.mem_usage_text.is_empty());
    }

    #[test]
    fn empty_stats_means_not_running() {
        assert!(parse_stats_line("").is_none());
        assert!(parse_stats_line("  \n \n").is_none());
    }
}
