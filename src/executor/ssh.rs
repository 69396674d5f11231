// SSH sessions, connection pooling and single-shot command execution

use std::io::{self, ErrorKind, Read};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use ssh2::{KeyboardInteractivePrompt, Session};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use zeroize::Zeroizing;

use super::pool::{spawn_reaper, PoolHandle, PoolStats, PooledSession, SessionPool};
use super::{CommandResult, CommandRunner};
use crate::config::EngineConfig;
use crate::inventory::{AuthMethod, ResolvedHost};
use crate::output::errors::{BatchError, Result};

impl PooledSession for Session {
    fn is_alive(&self) -> bool {
        self.authenticated()
    }

    fn close(&self) {
        let _ = self.disconnect(None, "idle session closed", None);
    }
}

/// Pool of authenticated SSH sessions, keyed by connection fingerprint
pub struct ConnectionPool {
    sessions: Arc<SessionPool<Session>>,
    connect_timeout: Duration,
    default_user: Option<String>,
}

impl ConnectionPool {
    pub fn new(config: &EngineConfig) -> Self {
        ConnectionPool {
            sessions: Arc::new(SessionPool::new(
                config.max_sessions_per_host,
                config.idle_timeout(),
            )),
            connect_timeout: config.connect_timeout(),
            default_user: config.default_user.clone(),
        }
    }

    /// Get a ready session for a host (from pool or freshly connected)
    pub async fn acquire(&self, host: &ResolvedHost) -> Result<SshSession> {
        let key = host.params.fingerprint();
        let connect_timeout = self.connect_timeout;
        let default_user = self.default_user.clone();
        let target = host.clone();

        let handle = self
            .sessions
            .acquire_with(&key, move || async move {
                let name = target.name.clone();
                tokio::task::spawn_blocking(move || connect(&target, connect_timeout, default_user))
                    .await
                    .map_err(|e| BatchError::connection(name, format!("connect task failed: {}", e)))?
            })
            .await?;

        Ok(SshSession {
            handle,
            host_name: host.name.clone(),
        })
    }

    /// Return a session for reuse; the underlying connection stays open
    pub fn release(&self, session: SshSession) {
        self.sessions.release(session.handle);
    }

    /// Drop a session after a transport failure
    pub fn discard(&self, session: SshSession) {
        self.sessions.discard(session.handle);
    }

    /// Start background closing of idle sessions
    pub fn spawn_reaper(&self, every: Duration) -> JoinHandle<()> {
        spawn_reaper(&self.sessions, every)
    }

    pub fn stats(&self) -> PoolStats {
        self.sessions.stats()
    }

    /// Close all connections
    pub fn close_all(&self) {
        self.sessions.close_all();
    }
}

/// Establish and authenticate a new SSH session
fn connect(
    host: &ResolvedHost,
    connect_timeout: Duration,
    default_user: Option<String>,
) -> Result<Session> {
    let params = &host.params;
    let ssh_err = |message: String, suggestion: Option<&str>| BatchError::Connection {
        host: host.name.clone(),
        message,
        suggestion: suggestion.map(String::from),
    };

    let address = (params.address.as_str(), params.port)
        .to_socket_addrs()
        .map_err(|e| ssh_err(format!("Invalid address {}: {}", params.address, e), Some("Check the host address format")))?
        .next()
        .ok_or_else(|| ssh_err(format!("No address found for {}", params.address), None))?;

    // TCP connection with timeout
    let tcp = TcpStream::connect_timeout(&address, connect_timeout).map_err(|e| BatchError::Connection {
        host: host.name.clone(),
        message: format!("Connection failed: {}", e),
        suggestion: ssh_connection_suggestion(&e),
    })?;

    let mut session =
        Session::new().map_err(|e| ssh_err(format!("Failed to create SSH session: {}", e), None))?;
    session.set_tcp_stream(tcp);
    session.set_timeout(connect_timeout.as_millis() as u32);

    session.handshake().map_err(|e| {
        ssh_err(
            format!("SSH handshake failed: {}", e),
            Some("Check SSH service is running on the target"),
        )
    })?;

    let user = if params.username.is_empty() {
        default_user
            .or_else(|| std::env::var("USER").ok())
            .unwrap_or_else(|| "root".to_string())
    } else {
        params.username.clone()
    };

    authenticate(&session, &user, &params.auth);

    if !session.authenticated() {
        return Err(ssh_err(
            format!("Authentication failed for {}", user),
            Some("Check the stored credentials for this host"),
        ));
    }

    // Per-command timeouts are applied by `exec`
    session.set_timeout(0);
    debug!(host = %host.name, target = %params.ssh_target(), "SSH session established");

    Ok(session)
}

fn authenticate(session: &Session, user: &str, auth: &AuthMethod) {
    match auth {
        AuthMethod::Password { password } => {
            if session.userauth_password(user, password).is_err() {
                // Fall back to keyboard-interactive auth (used by some PAM configurations)
                let mut prompter = PasswordPrompter(Zeroizing::new(password.clone()));
                let _ = session.userauth_keyboard_interactive(user, &mut prompter);
            }
        }
        AuthMethod::PrivateKey { key, passphrase } => {
            let _ = session.userauth_pubkey_memory(user, None, key, passphrase.as_deref());
        }
        AuthMethod::KeyFile { path, passphrase } => {
            let _ = session.userauth_pubkey_file(user, None, Path::new(path), passphrase.as_deref());
        }
        AuthMethod::Agent => {
            if let Ok(mut agent) = session.agent() {
                if agent.connect().is_ok() {
                    agent.list_identities().ok();
                    for identity in agent.identities().unwrap_or_default() {
                        if agent.userauth(user, &identity).is_ok() {
                            break;
                        }
                    }
                }
            }
        }
    }
}

/// A pooled session checked out for one command
pub struct SshSession {
    handle: PoolHandle<Session>,
    host_name: String,
}

impl SshSession {
    /// Run one command with a hard wall-clock deadline. The channel is
    /// closed when the deadline passes or `abort` fires; the session stays
    /// usable either way.
    pub fn exec(&self, command: &str, timeout: Duration, abort: &CancellationToken) -> Result<CommandResult> {
        let session = self.handle.session();
        let deadline = Instant::now() + timeout;

        session.set_timeout(remaining_ms(deadline));
        let started = session
            .channel_session()
            .map_err(|e| self.transport_error("Failed to open channel", e.into()))
            .and_then(|mut channel| {
                channel
                    .exec(command)
                    .map_err(|e| self.transport_error("Failed to execute command", e.into()))?;
                Ok(channel)
            });
        session.set_timeout(0);
        let mut channel = started?;

        // The pool lends a session to one caller at a time, so switching the
        // whole session to non-blocking here cannot affect anyone else
        session.set_blocking(false);
        let output = collect_output(&mut channel, deadline, abort);
        session.set_blocking(true);

        let (stdout, stderr) = match output {
            Ok(output) => output,
            Err(stop) => {
                // Abort the remote side; the session itself remains reusable
                session.set_timeout(CLOSE_TIMEOUT_MS);
                let _ = channel.close();
                session.set_timeout(0);
                return Err(match stop {
                    ReadStop::Deadline => self.timeout_error(timeout),
                    ReadStop::Aborted => BatchError::Cancelled,
                    ReadStop::Io(e) => self.transport_error("Connection lost while reading output", e),
                });
            }
        };

        session.set_timeout(remaining_ms(deadline));
        channel.wait_close().ok();
        session.set_timeout(0);

        let exit_code = channel.exit_status().unwrap_or(-1);

        Ok(CommandResult {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_code,
        })
    }

    fn timeout_error(&self, timeout: Duration) -> BatchError {
        BatchError::CommandTimeout {
            host: self.host_name.clone(),
            timeout_secs: timeout.as_secs(),
        }
    }

    fn transport_error(&self, context: &str, e: std::io::Error) -> BatchError {
        BatchError::Connection {
            host: self.host_name.clone(),
            message: format!("{}: {}", context, e),
            suggestion: Some("Connection will be discarded due to error".to_string()),
        }
    }
}

fn remaining_ms(deadline: Instant) -> u32 {
    let ms = deadline.saturating_duration_since(Instant::now()).as_millis();
    // 0 would mean "no timeout" to libssh2
    ms.clamp(1, u32::MAX as u128) as u32
}

const CLOSE_TIMEOUT_MS: u32 = 2_000;
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Both output streams of a running command, read without blocking
trait OutputStreams {
    fn read_stdout(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn read_stderr(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn at_eof(&self) -> bool;
}

impl OutputStreams for ssh2::Channel {
    fn read_stdout(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Read::read(self, buf)
    }

    fn read_stderr(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stderr().read(buf)
    }

    fn at_eof(&self) -> bool {
        self.eof()
    }
}

/// Why output collection stopped before the remote side closed
#[derive(Debug)]
enum ReadStop {
    Deadline,
    Aborted,
    Io(io::Error),
}

/// Read stdout and stderr in turn until EOF. Draining both together keeps
/// a command that floods stderr from stalling on a full channel window.
fn collect_output(
    streams: &mut impl OutputStreams,
    deadline: Instant,
    abort: &CancellationToken,
) -> std::result::Result<(Vec<u8>, Vec<u8>), ReadStop> {
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut buf = [0u8; 8192];

    loop {
        if abort.is_cancelled() {
            return Err(ReadStop::Aborted);
        }
        if Instant::now() >= deadline {
            return Err(ReadStop::Deadline);
        }

        let read = streams.read_stdout(&mut buf);
        let mut activity = append_available(read, &buf, &mut stdout)?;
        let read = streams.read_stderr(&mut buf);
        activity |= append_available(read, &buf, &mut stderr)?;

        if !activity {
            if streams.at_eof() {
                break;
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    Ok((stdout, stderr))
}

fn append_available(
    read: io::Result<usize>,
    buf: &[u8],
    out: &mut Vec<u8>,
) -> std::result::Result<bool, ReadStop> {
    match read {
        Ok(0) => Ok(false),
        Ok(n) => {
            out.extend_from_slice(&buf[..n]);
            Ok(true)
        }
        Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(false),
        Err(e) => Err(ReadStop::Io(e)),
    }
}

/// Runs commands over pooled SSH sessions
pub struct SshCommandRunner {
    pool: Arc<ConnectionPool>,
}

impl SshCommandRunner {
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        SshCommandRunner { pool }
    }
}

#[async_trait]
impl CommandRunner for SshCommandRunner {
    async fn run(&self, host: &ResolvedHost, command: &str, timeout: Duration) -> Result<CommandResult> {
        let session = self.pool.acquire(host).await?;
        let pool = self.pool.clone();
        let command = command.to_string();
        let host_name = host.name.clone();

        // Dropping this future (the batch was cancelled) trips `abort`, which
        // makes the read loop close the channel and return the session
        let abort = CancellationToken::new();
        let _abort_on_drop = abort.clone().drop_guard();

        tokio::task::spawn_blocking(move || {
            let result = session.exec(&command, timeout, &abort);
            match &result {
                Err(BatchError::Connection { .. }) => pool.discard(session),
                _ => pool.release(session),
            }
            result
        })
        .await
        .map_err(|e| BatchError::connection(host_name, format!("command task failed: {}", e)))?
    }
}

fn ssh_connection_suggestion(e: &std::io::Error) -> Option<String> {
    match e.kind() {
        ErrorKind::ConnectionRefused => {
            Some("Ensure SSH service is running on the target host".to_string())
        }
        ErrorKind::TimedOut => Some("Check network connectivity and firewall rules".to_string()),
        ErrorKind::PermissionDenied => {
            Some("Check SSH key permissions and authentication".to_string())
        }
        _ => None,
    }
}

/// Helper for keyboard-interactive authentication
struct PasswordPrompter(Zeroizing<String>);

impl KeyboardInteractivePrompt for PasswordPrompter {
    fn prompt<'a>(
        &mut self,
        _username: &str,
        _instructions: &str,
        prompts: &[ssh2::Prompt<'a>],
    ) -> Vec<String> {
        // Return the password for each prompt (typically just one "Password:" prompt)
        prompts.iter().map(|_| self.0.to_string()).collect()
    }
}
