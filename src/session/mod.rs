//! Interactive sessions to hosts and consoles
//!
//! A [`Session`] owns a transport (ssh, a local shell, or a console process)
//! and remembers which prompt marks "the shell is ready". A
//! [`NestedSession`] reaches a further host by running `ssh` inside another
//! session. Both implement [`Shell`], the small core every command helper in
//! [`CommandRunner`](crate::runner::CommandRunner) is built on.

mod builder;
mod nested;
pub mod prompt;

pub use builder::SessionBuilder;
pub use nested::{GuestCredentials, NestedSession};

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::pattern::{Pattern, PatternSet};
use crate::result::{Error, MatchResult, Result};
use crate::terminal::{CommandLine, Spawner, Terminal, Transcript};

/// Options passed to every `ssh` spawned by this crate.
pub const SSH_OPTIONS: [&str; 6] = [
    "-o",
    "PubkeyAuthentication=no",
    "-o",
    "StrictHostKeyChecking=no",
    "-o",
    "UserKnownHostsFile=/dev/null",
];

/// How long a liveness probe waits for the prompt.
pub(crate) const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Upper bound on draining stale prompts after a login.
const DRAIN_LIMIT: Duration = Duration::from_secs(20);

/// Where a session connects to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Password-authenticated ssh.
    Ssh {
        /// Address or name of the host
        host: String,
        /// Login user
        user: String,
        /// Login password
        password: String,
        /// Port, when not 22
        port: Option<u16>,
    },
    /// A local interactive shell; the prompt is verified after spawning.
    Shell {
        /// Shell command line
        command: CommandLine,
    },
    /// Any other process. Connecting only spawns it; nothing is verified,
    /// which suits consoles of nodes that may not have booted yet.
    Process {
        /// Process command line
        command: CommandLine,
    },
}

impl Target {
    /// The command spawned to reach this target.
    pub fn command_line(&self) -> CommandLine {
        match self {
            Target::Ssh {
                host, user, port, ..
            } => {
                let mut cmd = CommandLine::new("ssh").args(SSH_OPTIONS);
                if let Some(port) = port {
                    cmd = cmd.arg("-p").arg(port.to_string());
                }
                cmd.arg(format!("{user}@{host}"))
            }
            Target::Shell { command } | Target::Process { command } => command.clone(),
        }
    }
}

/// Lifecycle of a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Never connected, or the transport was lost.
    Unconnected,
    /// A connect attempt is in progress.
    Connecting,
    /// Logged in and verified.
    Connected,
    /// Closed on request.
    Closed,
}

/// Options for [`Session::connect`] and [`NestedSession::connect`].
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Retry failed attempts until `retry_timeout` elapses.
    pub retry: bool,
    /// Pause between attempts.
    pub retry_interval: Duration,
    /// Total budget for retrying.
    pub retry_timeout: Duration,
    /// Prompt to expect after login; defaults to the session's initial prompt.
    pub prompt: Option<Pattern>,
    /// Keep a healthy existing connection instead of reconnecting.
    pub reuse_if_alive: bool,
    /// Login timeout; defaults to the session timeout.
    pub timeout: Option<Duration>,
    /// Whether a nested login answers a password prompt (false for key-based guests).
    pub use_password: bool,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            retry: false,
            retry_interval: Duration::from_secs(3),
            retry_timeout: Duration::from_secs(300),
            prompt: None,
            reuse_if_alive: true,
            timeout: None,
            use_password: true,
        }
    }
}

impl ConnectOptions {
    /// Enable or disable retrying.
    pub fn retry(mut self, retry: bool) -> Self {
        self.retry = retry;
        self
    }

    /// Set the pause between attempts.
    pub fn retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// Set the retry budget.
    pub fn retry_timeout(mut self, timeout: Duration) -> Self {
        self.retry_timeout = timeout;
        self
    }

    /// Expect `prompt` after login instead of the initial prompt.
    pub fn prompt(mut self, prompt: Pattern) -> Self {
        self.prompt = Some(prompt);
        self
    }

    /// Reuse a healthy connection (the default) or always reconnect.
    pub fn reuse_if_alive(mut self, reuse: bool) -> Self {
        self.reuse_if_alive = reuse;
        self
    }

    /// Set the login timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Whether to answer a password prompt on nested logins.
    pub fn use_password(mut self, use_password: bool) -> Self {
        self.use_password = use_password;
        self
    }
}

/// Options for [`Shell::send_with`].
#[derive(Debug, Clone, Copy)]
pub struct SendOptions {
    /// On a write failure, reconnect and send once more.
    pub reconnect: bool,
    /// Retry budget of that reconnect.
    pub reconnect_timeout: Duration,
    /// Drop unread output before sending.
    pub flush: bool,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            reconnect: false,
            reconnect_timeout: Duration::from_secs(300),
            flush: false,
        }
    }
}

/// The core every interactive shell provides.
///
/// Implementors track the prompt of the shell they drive and capture the
/// output of the last command. Everything higher level lives in
/// [`CommandRunner`](crate::runner::CommandRunner), which is implemented for
/// every `Shell`.
pub trait Shell: Send {
    /// Logical name, used in logs.
    fn name(&self) -> &str;

    /// Host this shell runs on.
    fn host(&self) -> &str;

    /// Login user.
    fn user(&self) -> &str;

    /// Login password, if the shell has one.
    fn password(&self) -> Option<&str>;

    /// Prompt of the shell currently driven.
    fn prompt(&self) -> &Pattern;

    /// Replace the current prompt, e.g. after `sudo su -`.
    fn set_prompt(&mut self, prompt: Pattern);

    /// Default timeout for expects.
    fn timeout(&self) -> Duration;

    /// Output captured by the last successful expect.
    ///
    /// When a non-empty command was sent before that expect, the first line
    /// (the command's echo) is removed.
    fn last_output(&self) -> &str;

    /// Text matched by the last successful expect.
    fn last_match(&self) -> &str;

    /// Send `command` followed by a newline. An empty command sends a bare newline.
    fn send_with(
        &mut self,
        command: &str,
        opts: SendOptions,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Send raw bytes, e.g. control characters or escape sequences.
    fn send_raw(&mut self, data: &[u8]) -> Result<()>;

    /// Wait until one of `patterns` matches and return its index.
    ///
    /// An empty set means the current prompt.
    fn expect_any(
        &mut self,
        patterns: PatternSet,
        timeout: Duration,
    ) -> impl Future<Output = Result<usize>> + Send;

    /// Drop unread output without waiting. Returns the number of bytes dropped.
    fn discard_pending(&mut self) -> usize;
}

/// An interactive connection to one target.
///
/// A session is bound to its target for life. `connect` may be called again
/// at any time: a healthy connection is kept, a dead one replaced.
///
/// # Examples
///
/// ```no_run
/// use stxauto::prelude::*;
///
/// # async fn example() -> stxauto::Result<()> {
/// let mut session = Session::ssh("10.10.10.3", "sysadmin", "Li69nux*");
/// session.connect(ConnectOptions::default().retry(true)).await?;
///
/// let (code, output) = session.exec_cmd("system host-list", ExecOptions::default()).await?;
/// println!("{code}: {output}");
/// session.close();
/// # Ok(())
/// # }
/// ```
pub struct Session {
    name: String,
    target: Target,
    initial_prompt: Pattern,
    prompt: Pattern,
    spawner: Arc<dyn Spawner>,
    terminal: Option<Terminal>,
    state: SessionState,
    last_sent: Option<String>,
    last_output: String,
    last_match: String,
    timeout: Duration,
    max_buffer_size: usize,
    strip_ansi: bool,
    log_dir: Option<PathBuf>,
}

impl Session {
    /// Create a new session builder.
    pub fn builder() -> SessionBuilder {
        SessionBuilder::new()
    }

    /// A password-authenticated ssh session with default settings.
    pub fn ssh(
        host: impl Into<String>,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        SessionBuilder::new().ssh(host, user, password)
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_parts(
        name: String,
        target: Target,
        prompt: Pattern,
        spawner: Arc<dyn Spawner>,
        timeout: Duration,
        max_buffer_size: usize,
        strip_ansi: bool,
        log_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            name,
            target,
            initial_prompt: prompt.clone(),
            prompt,
            spawner,
            terminal: None,
            state: SessionState::Unconnected,
            last_sent: None,
            last_output: String::new(),
            last_match: String::new(),
            timeout,
            max_buffer_size,
            strip_ansi,
            log_dir,
        }
    }

    /// Target of this session.
    pub fn target(&self) -> &Target {
        &self.target
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Whether the transport is up and the session considers itself connected.
    ///
    /// This does not talk to the remote end; `connect` does a full probe.
    pub fn is_alive(&mut self) -> bool {
        self.state == SessionState::Connected
            && self.terminal.as_mut().is_some_and(Terminal::is_alive)
    }

    /// Exit code of the spawned process, once it has exited.
    pub fn exit_code(&mut self) -> Option<u32> {
        self.terminal.as_mut().and_then(Terminal::exit_code)
    }

    /// Connect to the target.
    ///
    /// With `reuse_if_alive`, a live session whose prompt answers a newline
    /// is kept as is. Otherwise the transport is spawned, logged into and
    /// verified with a newline round trip. With `retry`, transient failures
    /// are retried every `retry_interval` until `retry_timeout` elapses;
    /// rejected credentials are never retried.
    ///
    /// # Errors
    ///
    /// - [`Error::PermissionDenied`] when the credentials are rejected
    /// - [`Error::RetryTimeout`] when retrying ran out of time
    /// - the error of the failed attempt when `retry` is off
    pub async fn connect(&mut self, opts: ConnectOptions) -> Result<()> {
        if opts.reuse_if_alive && self.is_alive() {
            let prompt = self.prompt.clone();
            if self.probe(&prompt).await {
                debug!("Already connected to {}. Do nothing.", self.host());
                return Ok(());
            }
        }

        let prompt = opts
            .prompt
            .clone()
            .unwrap_or_else(|| self.initial_prompt.clone());
        let timeout = opts.timeout.unwrap_or(self.timeout);
        let deadline = Instant::now() + opts.retry_timeout;

        loop {
            info!("Attempt to connect to host - {}", self.host());
            self.state = SessionState::Connecting;

            match self.attempt(&prompt, timeout).await {
                Ok(()) => {
                    self.state = SessionState::Connected;
                    info!("Login successful!");
                    return Ok(());
                }
                Err(e) => {
                    self.close();
                    self.state = SessionState::Unconnected;

                    if !opts.retry {
                        return Err(e);
                    }
                    if e.is_credential() {
                        error!(
                            "Login credentials denied by {}. User: {}",
                            self.host(),
                            self.user()
                        );
                        return Err(e);
                    }
                    if !e.is_retryable() {
                        error!("Login failed due to unexpected error: {e}");
                        return Err(e);
                    }
                    info!("Login failed due to error: {e}");
                }
            }

            debug!("Retry in {:?}", opts.retry_interval);
            tokio::time::sleep(opts.retry_interval).await;
            if Instant::now() >= deadline {
                return Err(Error::RetryTimeout {
                    host: self.host().to_owned(),
                    user: self.user().to_owned(),
                });
            }
        }
    }

    /// Terminate the transport. The session can be connected again later.
    pub fn close(&mut self) {
        if let Some(mut terminal) = self.terminal.take() {
            terminal.close();
            info!("session closed. host: {}, user: {}", self.host(), self.user());
        }
        self.state = SessionState::Closed;
    }

    fn terminal_mut(&mut self) -> Result<&mut Terminal> {
        match self.terminal.as_mut() {
            Some(terminal) => Ok(terminal),
            None => Err(Error::NotConnected {
                host: self.name.clone(),
            }),
        }
    }

    async fn attempt(&mut self, prompt: &Pattern, timeout: Duration) -> Result<()> {
        let command = self.target.command_line();
        debug!("Spawning {command}");
        let channel = self.spawner.spawn(&command)?;

        let mut terminal = Terminal::new(channel, self.max_buffer_size, self.strip_ansi);
        if let Some(dir) = &self.log_dir {
            terminal.set_transcript(Transcript::create(dir, &self.name)?);
        }
        self.terminal = Some(terminal);
        self.last_sent = None;
        self.last_output.clear();
        self.last_match.clear();
        self.prompt = prompt.clone();

        match &self.target {
            Target::Process { .. } => return Ok(()),
            Target::Ssh { .. } => self.login(prompt, timeout).await?,
            Target::Shell { .. } => {}
        }

        // A login can look fine while no usable shell is behind it.
        if !self.probe(prompt).await {
            return Err(Error::Connection {
                host: self.host().to_owned(),
                reason: "prompt not found after login".to_string(),
            });
        }
        self.drain_prompts(prompt).await;
        Ok(())
    }

    async fn login(&mut self, prompt: &Pattern, timeout: Duration) -> Result<()> {
        let Target::Ssh {
            host,
            user,
            password,
            ..
        } = self.target.clone()
        else {
            return Ok(());
        };

        let set: PatternSet = [
            prompt::PASSWORD.clone(),
            prompt::ADD_HOST.clone(),
            prompt::PERMISSION_DENIED.clone(),
            prompt::CONNECTION_REFUSED.clone(),
            prompt::SSH_FAILURE.clone(),
            prompt.clone(),
        ]
        .into();

        let terminal = self.terminal_mut()?;
        let mut password_sent = false;
        loop {
            let m = terminal.expect_any(&set, Some(timeout)).await?;
            match m.pattern_index {
                0 if password_sent => return Err(Error::PermissionDenied { host, user }),
                0 => {
                    terminal.send_line(&password)?;
                    password_sent = true;
                }
                1 => terminal.send_line("yes")?,
                2 => return Err(Error::PermissionDenied { host, user }),
                3 => return Err(Error::ConnectionRefused { host }),
                4 => {
                    return Err(Error::Connection {
                        host,
                        reason: m.matched.trim().to_string(),
                    })
                }
                _ => return Ok(()),
            }
        }
    }

    /// Newline round trip; healthy only if `prompt` answers.
    async fn probe(&mut self, prompt: &Pattern) -> bool {
        let Some(terminal) = self.terminal.as_mut() else {
            return false;
        };
        if terminal.send_line("").is_err() {
            return false;
        }
        let set: PatternSet = [prompt.clone(), Pattern::Timeout].into();
        matches!(
            terminal.expect_any(&set, Some(PROBE_TIMEOUT)).await,
            Ok(m) if m.pattern_index == 0
        )
    }

    async fn drain_prompts(&mut self, prompt: &Pattern) {
        let Some(terminal) = self.terminal.as_mut() else {
            return;
        };
        if terminal.send_line("").is_err() {
            return;
        }

        let set: PatternSet = [prompt.clone(), Pattern::Timeout].into();
        let end = Instant::now() + DRAIN_LIMIT;
        while Instant::now() < end {
            match terminal.expect_any(&set, Some(PROBE_TIMEOUT)).await {
                Ok(m) if m.pattern_index == 0 => continue,
                _ => return,
            }
        }
        warn!("Still getting prompt from the buffer. Buffer might not be cleared yet.");
    }

    fn capture(&mut self, m: &MatchResult) {
        let text = m.full_text().replace("\r\n", "\n");
        self.last_output = match self.last_sent.take() {
            Some(cmd) if !cmd.is_empty() => text
                .split_once('\n')
                .map(|(_, rest)| rest.to_owned())
                .unwrap_or_default(),
            _ => text,
        };
        self.last_match = m.matched.clone();
    }
}

impl Shell for Session {
    fn name(&self) -> &str {
        &self.name
    }

    fn host(&self) -> &str {
        match &self.target {
            Target::Ssh { host, .. } => host,
            _ => &self.name,
        }
    }

    fn user(&self) -> &str {
        match &self.target {
            Target::Ssh { user, .. } => user,
            _ => "",
        }
    }

    fn password(&self) -> Option<&str> {
        match &self.target {
            Target::Ssh { password, .. } => Some(password),
            _ => None,
        }
    }

    fn prompt(&self) -> &Pattern {
        &self.prompt
    }

    fn set_prompt(&mut self, prompt: Pattern) {
        self.prompt = prompt;
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn last_output(&self) -> &str {
        &self.last_output
    }

    fn last_match(&self) -> &str {
        &self.last_match
    }

    async fn send_with(&mut self, command: &str, opts: SendOptions) -> Result<()> {
        if opts.flush {
            let dropped = self.discard_pending();
            if dropped > 0 {
                debug!("Discarded {dropped} bytes of unread output");
            }
        }

        debug!("Sending command: '{command}'");
        if let Err(e) = self.terminal_mut().and_then(|t| t.send_line(command)) {
            self.state = SessionState::Unconnected;
            if !opts.reconnect {
                return Err(e);
            }
            warn!("Failed to send line to {}: {e}. Reconnecting", self.name);
            self.close();
            self.connect(
                ConnectOptions::default()
                    .retry(true)
                    .retry_timeout(opts.reconnect_timeout)
                    .reuse_if_alive(false),
            )
            .await?;
            self.terminal_mut()?.send_line(command)?;
        }

        self.last_sent = Some(command.to_owned());
        Ok(())
    }

    fn send_raw(&mut self, data: &[u8]) -> Result<()> {
        self.terminal_mut()?.send(data)
    }

    async fn expect_any(&mut self, patterns: PatternSet, timeout: Duration) -> Result<usize> {
        let patterns = if patterns.is_empty() {
            PatternSet::from(&self.prompt)
        } else {
            patterns
        };
        debug!("Expecting: {patterns}...");

        match self.terminal_mut()?.expect_any(&patterns, Some(timeout)).await {
            Ok(m) => {
                self.capture(&m);
                if patterns.len() > 1 {
                    debug!(
                        "Found match for {}: {}",
                        patterns.get(m.pattern_index).map(ToString::to_string).unwrap_or_default(),
                        self.last_output
                    );
                } else {
                    debug!("Found match: {}", self.last_output);
                }
                Ok(m.pattern_index)
            }
            Err(e) => {
                if matches!(e, Error::Eof { .. }) {
                    self.state = SessionState::Unconnected;
                }
                Err(e)
            }
        }
    }

    fn discard_pending(&mut self) -> usize {
        self.terminal.as_mut().map_or(0, Terminal::discard_pending)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(terminal) = self.terminal.as_mut() {
            terminal.close();
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("name", &self.name)
            .field("target", &self.target)
            .field("state", &self.state)
            .field("prompt", &self.prompt.to_string())
            .finish_non_exhaustive()
    }
}
