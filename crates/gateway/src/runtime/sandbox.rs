//! Host-process sandbox: runs scripts as subprocesses rooted in the
//! sandbox directory. The containerized variant implements the same
//! trait and is provisioned externally.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use ghost_domain::{Error, Result};
use ghost_tools::exec::Sandbox;
use tokio::process::Command;

pub struct HostSandbox {
    workdir: PathBuf,
}

impl HostSandbox {
    pub fn new(workdir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&workdir)
            .map_err(|e| Error::Fatal(format!("sandbox directory unavailable: {e}")))?;
        Ok(Self { workdir })
    }
}

#[async_trait]
impl Sandbox for HostSandbox {
    async fn execute(&self, command: &str, timeout: Duration) -> Result<(String, i32)> {
        tracing::debug!(command, "sandbox exec");
        let child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&self.workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Sandbox(format!("spawn failed: {e}")))?;

        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(Error::Sandbox(format!("wait failed: {e}"))),
            Err(_) => {
                return Ok((
                    format!("SYSTEM ERROR: command timed out after {}s", timeout.as_secs()),
                    124,
                ));
            }
        };

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.is_empty() {
            if !combined.is_empty() && !combined.ends_with('\n') {
                combined.push('\n');
            }
            combined.push_str(&stderr);
        }
        let exit_code = output.status.code().unwrap_or(-1);
        Ok((combined, exit_code))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = HostSandbox::new(dir.path().to_path_buf()).unwrap();
        let (out, code) = sandbox
            .execute("echo hello && exit 3", Duration::from_secs(5))
            .await
            .unwrap();
        assert!(out.contains("hello"));
        assert_eq!(code, 3);
    }

    #[tokio::test]
    async fn merges_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = HostSandbox::new(dir.path().to_path_buf()).unwrap();
        let (out, code) = sandbox
            .execute("echo out; echo err 1>&2", Duration::from_secs(5))
            .await
            .unwrap();
        assert!(out.contains("out"));
        assert!(out.contains("err"));
        assert_eq!(code, 0);
    }

    #[tokio::test]
    async fn timeout_reports_124() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = HostSandbox::new(dir.path().to_path_buf()).unwrap();
        let (out, code) = sandbox
            .execute("sleep 5", Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(code, 124);
        assert!(out.contains("timed out"));
    }

    #[tokio::test]
    async fn runs_in_the_sandbox_directory() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = HostSandbox::new(dir.path().to_path_buf()).unwrap();
        sandbox
            .execute("touch marker.txt", Duration::from_secs(5))
            .await
            .unwrap();
        assert!(dir.path().join("marker.txt").exists());
    }
}
