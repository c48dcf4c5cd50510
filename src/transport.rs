//! Live channels to connected servers.
//!
//! A transport is either a streamable HTTP endpoint or a child process spoken
//! to over stdin/stdout. Both publish their closure on a watch channel so the
//! connection table can react when a server goes away.

use std::collections::BTreeMap;
use std::fmt;
use std::process::Stdio;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{oneshot, watch, Mutex};

/// Protocol revision offered in the initialize request.
const PROTOCOL_VERSION: &str = "2025-06-18";

const SESSION_HEADER: &str = "mcp-session-id";

/// How long a child gets to exit after SIGTERM before it is killed.
const TERMINATE_GRACE: Duration = Duration::from_secs(3);

/// Variables passed through to child processes besides their own environment.
const BASELINE_ENV_VARS: [&str; 8] = [
    "PATH",
    "HOME",
    "USERPROFILE",
    "TMPDIR",
    "TEMP",
    "TMP",
    "SystemRoot",
    "SYSTEMROOT",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed on request.
    Closed,
    /// The child process exited on its own.
    Exited(Option<i32>),
    /// The channel failed.
    Failed(String),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Closed => write!(f, "closed"),
            CloseReason::Exited(Some(code)) => write!(f, "exited with code {}", code),
            CloseReason::Exited(None) => write!(f, "terminated by signal"),
            CloseReason::Failed(e) => write!(f, "failed: {}", e),
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Invalid header '{name}'")]
    InvalidHeader { name: String },
    #[error("Failed to build HTTP client: {0}")]
    Client(reqwest::Error),
    #[error("Request to {url} failed: {source}")]
    Request { url: String, source: reqwest::Error },
    #[error("{url} answered the initialize request with {status}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
    },
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("I/O error on {program}: {source}")]
    Io {
        program: String,
        source: std::io::Error,
    },
    #[error("Transport is closed")]
    Closed,
}

pub enum Transport {
    StreamableHttp(HttpTransport),
    Stdio(StdioTransport),
}

impl Transport {
    pub fn kind(&self) -> &'static str {
        match self {
            Transport::StreamableHttp(_) => "streamable-http",
            Transport::Stdio(_) => "stdio",
        }
    }

    pub fn is_closed(&self) -> bool {
        self.receiver().borrow().is_some()
    }

    /// Resolves once the transport has closed, for whatever reason.
    pub async fn closed(&self) -> CloseReason {
        wait_closed(self.receiver().clone()).await
    }

    /// Watch handle that outlives borrows of the transport.
    pub fn close_watch(&self) -> watch::Receiver<Option<CloseReason>> {
        self.receiver().clone()
    }

    pub async fn close(&self) {
        match self {
            Transport::StreamableHttp(t) => t.close(),
            Transport::Stdio(t) => t.close().await,
        }
    }

    fn receiver(&self) -> &watch::Receiver<Option<CloseReason>> {
        match self {
            Transport::StreamableHttp(t) => &t.closed_rx,
            Transport::Stdio(t) => &t.exit_rx,
        }
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::StreamableHttp(t) => f.debug_tuple("StreamableHttp").field(&t.url).finish(),
            Transport::Stdio(t) => f.debug_tuple("Stdio").field(&t.program).field(&t.pid).finish(),
        }
    }
}

pub(crate) async fn wait_closed(mut rx: watch::Receiver<Option<CloseReason>>) -> CloseReason {
    match rx.wait_for(Option::is_some).await {
        Ok(reason) => reason.clone().unwrap_or(CloseReason::Closed),
        Err(_) => CloseReason::Closed,
    }
}

/// Streamable HTTP endpoint with fixed request headers.
pub struct HttpTransport {
    url: String,
    client: reqwest::Client,
    header_names: Vec<String>,
    session_id: Option<HeaderValue>,
    closed_tx: watch::Sender<Option<CloseReason>>,
    closed_rx: watch::Receiver<Option<CloseReason>>,
}

impl HttpTransport {
    /// Open the endpoint and run the initialize handshake.
    ///
    /// Fails when the server cannot be reached or rejects the request, so a
    /// returned transport has spoken to its server at least once.
    pub async fn connect(
        url: &str,
        headers: &BTreeMap<String, String>,
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        let mut transport = Self::new(url, headers, timeout)?;
        let response = transport.post(&initialize_request()).await?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status {
                url: transport.url.clone(),
                status,
            });
        }
        transport.session_id = response.headers().get(SESSION_HEADER).cloned();
        tracing::debug!(
            url = %transport.url,
            session = transport.session_id.is_some(),
            "remote initialized"
        );

        let initialized = serde_json::json!({
            "jsonrpc": "2.0",
            "method": "notifications/initialized",
        });
        transport.post(&initialized).await?;
        Ok(transport)
    }

    /// Prepare a client for the endpoint without contacting it.
    pub fn new(
        url: &str,
        headers: &BTreeMap<String, String>,
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        let mut default_headers = HeaderMap::new();
        default_headers.insert(
            ACCEPT,
            HeaderValue::from_static("application/json, text/event-stream"),
        );
        for (name, value) in headers {
            let invalid = || TransportError::InvalidHeader { name: name.clone() };
            let header_name = HeaderName::from_bytes(name.as_bytes()).map_err(|_| invalid())?;
            let mut header_value = HeaderValue::from_str(value).map_err(|_| invalid())?;
            header_value.set_sensitive(true);
            default_headers.insert(header_name, header_value);
        }

        let client = reqwest::Client::builder()
            .user_agent(concat!("mcpreg/", env!("CARGO_PKG_VERSION")))
            .default_headers(default_headers)
            .connect_timeout(timeout)
            .build()
            .map_err(TransportError::Client)?;

        let (closed_tx, closed_rx) = watch::channel(None);
        Ok(Self {
            url: url.to_string(),
            client,
            header_names: headers.keys().cloned().collect(),
            session_id: None,
            closed_tx,
            closed_rx,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Names of the headers sent with every request. Values are never exposed.
    pub fn header_names(&self) -> &[String] {
        &self.header_names
    }

    /// POST a JSON message to the endpoint.
    ///
    /// A connection-level failure closes the transport.
    pub async fn post(&self, body: &serde_json::Value) -> Result<reqwest::Response, TransportError> {
        if self.closed_rx.borrow().is_some() {
            return Err(TransportError::Closed);
        }
        let mut request = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, "application/json")
            .json(body);
        if let Some(session) = &self.session_id {
            request = request.header(SESSION_HEADER, session.clone());
        }
        let result = request.send().await;
        match result {
            Ok(response) => Ok(response),
            Err(source) => {
                if source.is_connect() {
                    self.closed_tx
                        .send_replace(Some(CloseReason::Failed(source.to_string())));
                }
                Err(TransportError::Request {
                    url: self.url.clone(),
                    source,
                })
            }
        }
    }

    fn close(&self) {
        self.closed_tx.send_if_modified(|state| {
            if state.is_none() {
                *state = Some(CloseReason::Closed);
                true
            } else {
                false
            }
        });
    }
}

fn initialize_request() -> serde_json::Value {
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": 0,
        "method": "initialize",
        "params": {
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {"name": "mcpreg", "version": env!("CARGO_PKG_VERSION")},
        },
    })
}

/// What to run for a stdio transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Launch {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
}

/// A child process owned by a watcher task.
///
/// The child is terminated when the transport is closed or dropped, and its
/// exit is published whether it was asked to stop or not.
pub struct StdioTransport {
    program: String,
    pid: Option<u32>,
    stdin: Mutex<Option<ChildStdin>>,
    stdout: Mutex<BufReader<ChildStdout>>,
    shutdown: std::sync::Mutex<Option<oneshot::Sender<()>>>,
    exit_rx: watch::Receiver<Option<CloseReason>>,
}

impl StdioTransport {
    pub fn spawn(launch: &Launch) -> Result<Self, TransportError> {
        let mut cmd = Command::new(&launch.program);
        cmd.args(&launch.args);
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::inherit());
        cmd.env_clear();
        for key in BASELINE_ENV_VARS {
            if let Some(value) = std::env::var_os(key) {
                cmd.env(key, value);
            }
        }
        cmd.envs(&launch.env);
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| TransportError::Spawn {
            program: launch.program.clone(),
            source,
        })?;

        let io_error = |what: &str| TransportError::Io {
            program: launch.program.clone(),
            source: std::io::Error::new(std::io::ErrorKind::BrokenPipe, format!("{} not captured", what)),
        };
        let stdin = child.stdin.take().ok_or_else(|| io_error("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| io_error("stdout"))?;
        let pid = child.id();

        tracing::debug!(
            program = %launch.program,
            argc = launch.args.len(),
            env = launch.env.len(),
            pid = ?pid,
            "spawned stdio server"
        );

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = watch::channel(None);
        tokio::spawn(watch_child(child, launch.program.clone(), shutdown_rx, exit_tx));

        Ok(Self {
            program: launch.program.clone(),
            pid,
            stdin: Mutex::new(Some(stdin)),
            stdout: Mutex::new(BufReader::new(stdout)),
            shutdown: std::sync::Mutex::new(Some(shutdown_tx)),
            exit_rx,
        })
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Write one newline-terminated message to the child's stdin.
    pub async fn send_line(&self, line: &str) -> Result<(), TransportError> {
        let mut guard = self.stdin.lock().await;
        let stdin = guard.as_mut().ok_or(TransportError::Closed)?;
        let io = |source| TransportError::Io {
            program: self.program.clone(),
            source,
        };
        stdin.write_all(line.as_bytes()).await.map_err(io)?;
        stdin.write_all(b"\n").await.map_err(io)?;
        stdin.flush().await.map_err(io)
    }

    /// Read one line from the child's stdout, without the line terminator.
    ///
    /// Returns `None` at end of stream.
    pub async fn read_line(&self) -> Result<Option<String>, TransportError> {
        let mut stdout = self.stdout.lock().await;
        let mut line = String::new();
        let n = stdout
            .read_line(&mut line)
            .await
            .map_err(|source| TransportError::Io {
                program: self.program.clone(),
                source,
            })?;
        if n == 0 {
            return Ok(None);
        }
        let trimmed = line.trim_end_matches(['\r', '\n']).len();
        line.truncate(trimmed);
        Ok(Some(line))
    }

    async fn close(&self) {
        self.stdin.lock().await.take();
        let shutdown = match self.shutdown.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(tx) = shutdown {
            let _ = tx.send(());
        }
        wait_closed(self.exit_rx.clone()).await;
    }
}

async fn watch_child(
    mut child: Child,
    program: String,
    shutdown: oneshot::Receiver<()>,
    exit_tx: watch::Sender<Option<CloseReason>>,
) {
    let reason = tokio::select! {
        status = child.wait() => match status {
            Ok(status) => CloseReason::Exited(status.code()),
            Err(e) => CloseReason::Failed(e.to_string()),
        },
        // Explicit close, or the transport was dropped.
        _ = shutdown => {
            terminate(&mut child, &program).await;
            CloseReason::Closed
        }
    };
    tracing::debug!(program = %program, reason = %reason, "stdio server closed");
    exit_tx.send_replace(Some(reason));
}

async fn terminate(child: &mut Child, program: &str) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        if let Ok(raw) = i32::try_from(pid) {
            if kill(Pid::from_raw(raw), Signal::SIGTERM).is_ok()
                && tokio::time::timeout(TERMINATE_GRACE, child.wait()).await.is_ok()
            {
                return;
            }
        }
    }
    if let Err(e) = child.kill().await {
        tracing::warn!(program = %program, error = %e, "failed to kill stdio server");
    }
}
