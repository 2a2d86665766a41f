use std::borrow::Cow;
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use ssh2::Session;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Error, Result};
use crate::jobs::Job;

#[derive(Debug, Clone)]
pub struct SshConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth: SshAuth,
    /// Bound on TCP connect + handshake + auth, in milliseconds.
    pub ready_timeout_ms: u64,
}

#[derive(Debug, Clone)]
pub enum SshAuth {
    Password(String),
    Key {
        private_key_path: PathBuf,
        passphrase: Option<String>,
    },
}

#[derive(Debug, Clone)]
pub struct RemoteConfig {
    pub ssh: SshConfig,
    /// Fallback when a job carries no `working_dir`; the final fallback
    /// is `/tmp`.
    pub working_dir: Option<String>,
    /// Exported into the remote shell before every command.
    pub env: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct ServerInfo {
    pub hostname: String,
    pub uptime: String,
}

#[derive(Debug, Clone)]
pub struct ExecResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

/// One streamed slice of remote output, in arrival order.
#[derive(Debug, Clone)]
pub enum OutputChunk {
    Stdout(String),
    Stderr(String),
}

/// The worker's seam to the remote host. Production uses [`SshExecutor`];
/// tests substitute a scripted stub.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    async fn connect(&self) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;

    /// Cheap reachability probe over the established session.
    async fn test_connection(&self) -> Result<bool>;

    async fn server_info(&self) -> Result<ServerInfo>;

    /// Run the job's command, streaming output chunks into `output` while
    /// it executes. `cancel` is honored between reads; the remote process
    /// itself is not killed.
    async fn execute(
        &self,
        job: &Job,
        output: UnboundedSender<OutputChunk>,
        cancel: CancellationToken,
    ) -> Result<ExecResult>;

    /// [`RemoteExecutor::execute`] bounded by the job's `timeout` option.
    /// On expiry the token is cancelled and the job fails with
    /// [`Error::Timeout`]; without a timeout this is a plain `execute`.
    async fn execute_with_timeout(
        &self,
        job: &Job,
        output: UnboundedSender<OutputChunk>,
        cancel: CancellationToken,
    ) -> Result<ExecResult> {
        match job.timeout {
            Some(secs) if secs > 0 => {
                tokio::select! {
                    result = self.execute(job, output, cancel.clone()) => result,
                    _ = tokio::time::sleep(Duration::from_secs(secs as u64)) => {
                        cancel.cancel();
                        Err(Error::Timeout(secs))
                    }
                }
            }
            _ => self.execute(job, output, cancel).await,
        }
    }
}

/// Remote execution over libssh2. A long-lived control session serves the
/// probe, info and upload calls; every executed job dials its own session
/// because libssh2 does not tolerate concurrent channel traffic on one
/// session and jobs run `concurrency`-wide in parallel.
pub struct SshExecutor {
    remote: RemoteConfig,
    control: Arc<Mutex<Option<Session>>>,
}

impl SshExecutor {
    pub fn new(remote: RemoteConfig) -> Self {
        Self {
            remote,
            control: Arc::new(Mutex::new(None)),
        }
    }

    /// SFTP put from the local filesystem onto the remote host.
    pub async fn upload_file(&self, local: &Path, remote: &Path) -> Result<()> {
        let control = Arc::clone(&self.control);
        let local = local.to_path_buf();
        let remote = remote.to_path_buf();

        tokio::task::spawn_blocking(move || {
            let guard = lock_control(&control);
            let session = guard.as_ref().ok_or(Error::NotConnected)?;

            let data = std::fs::read(&local)?;
            let sftp = session.sftp()?;
            let mut file = sftp.create(&remote)?;
            file.write_all(&data)?;
            Ok(())
        })
        .await?
    }

    fn resolved_working_dir<'j>(&'j self, job: &'j Job) -> &'j str {
        job.working_dir
            .as_deref()
            .or(self.remote.working_dir.as_deref())
            .unwrap_or("/tmp")
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    async fn connect(&self) -> Result<()> {
        let config = self.remote.ssh.clone();
        let control = Arc::clone(&self.control);

        tokio::task::spawn_blocking(move || {
            let mut guard = lock_control(&control);
            if guard.is_some() {
                return Ok(());
            }
            *guard = Some(open_session(&config)?);
            Ok(())
        })
        .await?
    }

    async fn disconnect(&self) -> Result<()> {
        let control = Arc::clone(&self.control);

        tokio::task::spawn_blocking(move || {
            let mut guard = lock_control(&control);
            if let Some(session) = guard.take() {
                let _ = session.disconnect(None, "sshflow disconnect", None);
            }
            Ok(())
        })
        .await?
    }

    async fn test_connection(&self) -> Result<bool> {
        let control = Arc::clone(&self.control);

        tokio::task::spawn_blocking(move || {
            let guard = lock_control(&control);
            let session = guard.as_ref().ok_or(Error::NotConnected)?;

            let (stdout, _, exit_code) = run_blocking_command(session, "echo sshflow")?;
            Ok(exit_code == 0 && stdout.trim() == "sshflow")
        })
        .await?
    }

    async fn server_info(&self) -> Result<ServerInfo> {
        let control = Arc::clone(&self.control);

        tokio::task::spawn_blocking(move || {
            let guard = lock_control(&control);
            let session = guard.as_ref().ok_or(Error::NotConnected)?;

            let (hostname, _, _) = run_blocking_command(session, "hostname")?;
            let (uptime, _, _) = run_blocking_command(session, "uptime")?;

            Ok(ServerInfo {
                hostname: hostname.trim().to_string(),
                uptime: uptime.trim().to_string(),
            })
        })
        .await?
    }

    async fn execute(
        &self,
        job: &Job,
        output: UnboundedSender<OutputChunk>,
        cancel: CancellationToken,
    ) -> Result<ExecResult> {
        let config = self.remote.ssh.clone();
        let command = shell_command(
            &job.command,
            &job.args,
            &self.remote.env,
            self.resolved_working_dir(job),
        );
        let job_id = job.id;

        tokio::task::spawn_blocking(move || {
            let started = Instant::now();

            let session = open_session(&config)?;
            debug!(job_id, "remote session opened");

            let result = stream_command(&session, &command, &output, &cancel);
            let _ = session.disconnect(None, "job finished", None);

            let mut exec = result?;
            exec.duration_ms = started.elapsed().as_millis() as u64;
            Ok(exec)
        })
        .await?
    }
}

// ----------------------------
// Blocking internals
// ----------------------------

fn lock_control(control: &Mutex<Option<Session>>) -> MutexGuard<'_, Option<Session>> {
    control.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn open_session(config: &SshConfig) -> Result<Session> {
    let address = (config.host.as_str(), config.port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| Error::Config(format!("cannot resolve ssh host {:?}", config.host)))?;

    let stream = TcpStream::connect_timeout(
        &address,
        Duration::from_millis(config.ready_timeout_ms.max(1)),
    )?;

    let mut session = Session::new()?;
    session.set_timeout(config.ready_timeout_ms as u32);
    session.set_tcp_stream(stream);
    session.handshake()?;

    match &config.auth {
        SshAuth::Password(password) => {
            session.userauth_password(&config.username, password)?;
        }
        SshAuth::Key {
            private_key_path,
            passphrase,
        } => {
            session.userauth_pubkey_file(
                &config.username,
                None,
                private_key_path,
                passphrase.as_deref(),
            )?;
        }
    }

    if !session.authenticated() {
        return Err(Error::AuthRejected(config.username.clone()));
    }

    // The ready timeout bounds the handshake, not command runtime.
    session.set_timeout(0);
    Ok(session)
}

/// Run a short command to completion over an existing session, capturing
/// both streams. Used for the probe and info calls; job execution goes
/// through [`stream_command`].
fn run_blocking_command(session: &Session, command: &str) -> Result<(String, String, i32)> {
    let mut channel = session.channel_session()?;
    channel.exec(command)?;

    let mut stdout = String::new();
    channel.read_to_string(&mut stdout)?;
    let mut stderr = String::new();
    channel.stderr().read_to_string(&mut stderr)?;

    channel.wait_close()?;
    let exit_code = channel.exit_status()?;

    Ok((stdout, stderr, exit_code))
}

/// Exec `command` and pump both streams until EOF, forwarding each chunk
/// as it arrives. The session is flipped to non-blocking so stdout and
/// stderr can be multiplexed on one thread and the cancellation token is
/// observed between reads.
fn stream_command(
    session: &Session,
    command: &str,
    output: &UnboundedSender<OutputChunk>,
    cancel: &CancellationToken,
) -> Result<ExecResult> {
    let mut channel = session.channel_session()?;
    channel.exec(command)?;
    session.set_blocking(false);

    let mut stdout = String::new();
    let mut stderr = String::new();
    let mut buf = [0u8; 8192];

    loop {
        if cancel.is_cancelled() {
            session.set_blocking(true);
            return Err(Error::Cancelled);
        }

        let mut progressed = false;

        match channel.read(&mut buf) {
            Ok(0) => {}
            Ok(n) => {
                progressed = true;
                let chunk = String::from_utf8_lossy(&buf[..n]).into_owned();
                stdout.push_str(&chunk);
                let _ = output.send(OutputChunk::Stdout(chunk));
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => {
                session.set_blocking(true);
                return Err(e.into());
            }
        }

        match channel.stderr().read(&mut buf) {
            Ok(0) => {}
            Ok(n) => {
                progressed = true;
                let chunk = String::from_utf8_lossy(&buf[..n]).into_owned();
                stderr.push_str(&chunk);
                let _ = output.send(OutputChunk::Stderr(chunk));
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => {
                session.set_blocking(true);
                return Err(e.into());
            }
        }

        if channel.eof() {
            break;
        }
        if !progressed {
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    session.set_blocking(true);
    channel.wait_close()?;
    let exit_code = channel.exit_status()?;

    Ok(ExecResult {
        exit_code,
        stdout,
        stderr,
        duration_ms: 0,
    })
}

/// Build the single shell invocation for a job: env exports, a `cd` into
/// the working directory, then the command. Every value that reaches the
/// remote shell is escaped; env keys are validated at config parse time.
fn shell_command(command: &str, args: &[String], env: &[(String, String)], dir: &str) -> String {
    let mut parts = Vec::with_capacity(env.len() + 2);

    for (key, value) in env {
        parts.push(format!("export {}={}", key, escape(value)));
    }
    parts.push(format!("cd {}", escape(dir)));

    let mut argv = Vec::with_capacity(args.len() + 1);
    argv.push(escape(command).into_owned());
    for arg in args {
        argv.push(escape(arg).into_owned());
    }
    parts.push(argv.join(" "));

    parts.join(" && ")
}

fn escape(value: &str) -> Cow<'_, str> {
    shell_escape::unix::escape(Cow::Borrowed(value))
}
