//! ssh hops from inside another shell

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::{prompt, ConnectOptions, SendOptions, Shell, PROBE_TIMEOUT, SSH_OPTIONS};
use crate::pattern::{Pattern, PatternSet};
use crate::result::{Error, Result};
use crate::runner::{CommandRunner, ExecOptions};

/// Default expect timeout of a nested shell.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// ssh options of key-based hops; public keys must stay allowed.
const KEY_SSH_OPTIONS: [&str; 4] = [
    "-o",
    "StrictHostKeyChecking=no",
    "-o",
    "UserKnownHostsFile=/dev/null",
];

/// Login of a guest image, looked up by image or VM name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestCredentials {
    /// Login user
    pub user: String,
    /// Password, or `None` for key-based images
    pub password: Option<String>,
}

impl GuestCredentials {
    const KNOWN: [(&'static str, &'static str, Option<&'static str>); 5] = [
        ("tis-centos-guest", "root", Some("root")),
        ("cgcs-guest", "root", Some("root")),
        ("ubuntu", "ubuntu", None),
        ("centos_6", "centos", None),
        ("centos_7", "centos", None),
    ];

    /// Credentials for a guest, falling back to root/root for unknown images.
    pub fn for_guest(image: &str, vm_name: &str) -> Self {
        let image = image.trim().to_lowercase();
        let vm_name = vm_name.to_lowercase();

        for (key, user, password) in Self::KNOWN {
            if image.contains(key) || vm_name.contains(key) {
                return Self {
                    user: user.to_string(),
                    password: password.map(str::to_string),
                };
            }
        }

        let known: Vec<&str> = Self::KNOWN.iter().map(|(key, ..)| *key).collect();
        warn!(
            "User/password are not provided, and VM image type is not in the list: {known:?}. \
             Use root/root to login."
        );
        Self {
            user: "root".to_string(),
            password: Some("root".to_string()),
        }
    }
}

/// A shell on another host, reached by running `ssh` inside `parent`.
///
/// The nested session borrows its parent for its whole life and does all I/O
/// through it. After [`NestedSession::close`] the parent is back at its own
/// prompt and can be used again.
///
/// ```no_run
/// use stxauto::prelude::*;
/// use stxauto::session::prompt;
///
/// # async fn example(controller: &mut Session) -> stxauto::Result<()> {
/// let mut compute = NestedSession::new(
///     controller,
///     "compute-0",
///     "sysadmin",
///     Some("Li69nux*".into()),
///     prompt::COMPUTE.clone(),
/// );
/// compute.connect(ConnectOptions::default().retry(true)).await?;
/// compute.exec_cmd("uptime", ExecOptions::default()).await?;
/// compute.close().await?;
/// # Ok(())
/// # }
/// ```
pub struct NestedSession<'p, P: Shell> {
    parent: &'p mut P,
    host: String,
    user: String,
    password: Option<String>,
    initial_prompt: Pattern,
    prompt: Pattern,
    ssh_command: String,
    timeout: Duration,
    connected: bool,
    last_output: String,
    last_match: String,
}

impl<'p, P: Shell> NestedSession<'p, P> {
    /// Describe a hop to `user@host`; nothing is sent until [`connect`](Self::connect).
    pub fn new(
        parent: &'p mut P,
        host: impl Into<String>,
        user: impl Into<String>,
        password: Option<String>,
        initial_prompt: Pattern,
    ) -> Self {
        let host = host.into();
        let user = user.into();
        let ssh_command = format!("/usr/bin/ssh {} {user}@{host}", SSH_OPTIONS.join(" "));
        Self {
            parent,
            host,
            user,
            password,
            initial_prompt: initial_prompt.clone(),
            prompt: initial_prompt,
            ssh_command,
            timeout: DEFAULT_TIMEOUT,
            connected: false,
            last_output: String::new(),
            last_match: String::new(),
        }
    }

    /// Set the default expect timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Log in with a key instead of a password.
    ///
    /// Without `key_path` the parent's ssh offers its default identities.
    pub fn with_key_auth(mut self, key_path: Option<&str>) -> Self {
        let identity = key_path.map(|key| format!("-i {key} ")).unwrap_or_default();
        self.ssh_command = format!(
            "/usr/bin/ssh {identity}{} {}@{}",
            KEY_SSH_OPTIONS.join(" "),
            self.user,
            self.host
        );
        self
    }

    /// The command sent to the parent to open the hop.
    pub fn ssh_command(&self) -> &str {
        &self.ssh_command
    }

    /// The shell this hop runs inside.
    pub fn parent(&mut self) -> &mut P {
        &mut *self.parent
    }

    /// Whether the last connect succeeded and no close happened since.
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Open the hop.
    ///
    /// Sends the ssh command to the parent and answers the host key and
    /// password prompts. Seeing the parent's prompt again means the login
    /// failed. A timeout interrupts the half-open ssh with Ctrl-C before the
    /// next attempt.
    pub async fn connect(&mut self, opts: ConnectOptions) -> Result<()> {
        let prompt = opts
            .prompt
            .clone()
            .unwrap_or_else(|| self.initial_prompt.clone());
        let timeout = opts.timeout.unwrap_or(self.timeout);

        if opts.reuse_if_alive && self.probe().await {
            info!(
                "Already connected to {} from {}. Do nothing.",
                self.host,
                self.parent.host()
            );
            return Ok(());
        }

        info!("Attempt to connect to {} from {}...", self.host, self.parent.host());
        let deadline = Instant::now() + opts.retry_timeout;
        loop {
            let command = self.ssh_command.clone();
            self.parent
                .send_with(&command, SendOptions::default())
                .await?;

            match self.login(&prompt, timeout, opts.use_password).await {
                Ok(()) => {
                    self.prompt = prompt;
                    self.connected = true;
                    info!(
                        "Successfully connected to {} from {}!",
                        self.host,
                        self.parent.host()
                    );
                    return Ok(());
                }
                Err(e) => {
                    info!("Exception caught when attempt to ssh to {}: {e}", self.host);
                    if matches!(e, Error::Timeout { .. } | Error::PermissionDenied { .. }) {
                        self.parent.send_control('c')?;
                        self.parent.flush(PROBE_TIMEOUT).await?;
                    }
                    if !opts.retry {
                        return Err(e);
                    }
                    if e.is_credential() {
                        error!(
                            "Login credentials denied by {}. User: {}",
                            self.host, self.user
                        );
                        return Err(e);
                    }
                    if !e.is_retryable() {
                        return Err(e);
                    }
                }
            }

            info!("Retry in {:?}", opts.retry_interval);
            tokio::time::sleep(opts.retry_interval).await;
            if Instant::now() >= deadline {
                if let Err(e) = self.parent.flush(PROBE_TIMEOUT).await {
                    debug!("flush after retry timeout failed: {e}");
                }
                return Err(Error::RetryTimeout {
                    host: self.host.clone(),
                    user: self.user.clone(),
                });
            }
        }
    }

    /// Leave the nested shell and return to the parent's prompt.
    ///
    /// If the hop is not open, only the parent's buffer is flushed.
    pub async fn close(&mut self) -> Result<()> {
        if self.connected && self.probe().await {
            self.parent.send_with("exit", SendOptions::default()).await?;
            let parent_prompt = self.parent.prompt().clone();
            let timeout = self.parent.timeout();
            self.parent.expect_any(parent_prompt.into(), timeout).await?;
            info!(
                "ssh session to {} is closed and returned to parent session {}",
                self.host,
                self.parent.host()
            );
        } else {
            info!(
                "ssh session to {} is not open. Flushing the buffer for parent session.",
                self.host
            );
            self.parent.flush(PROBE_TIMEOUT).await?;
        }
        self.connected = false;
        Ok(())
    }

    async fn login(&mut self, prompt: &Pattern, timeout: Duration, use_password: bool) -> Result<()> {
        let parent_prompt = self.parent.prompt().clone();

        if use_password {
            let set: PatternSet = [
                prompt::PASSWORD.clone(),
                prompt::ADD_HOST.clone(),
                parent_prompt,
            ]
            .into();
            match self.expect_any(set, timeout).await? {
                2 => return Err(self.unable_to_login()),
                1 => {
                    self.parent.send_with("yes", SendOptions::default()).await?;
                    self.expect_any(prompt::PASSWORD.clone().into(), timeout)
                        .await?;
                }
                _ => {}
            }

            let password = self.password.clone().unwrap_or_default();
            self.parent
                .send_with(&password, SendOptions::default())
                .await?;
            let set: PatternSet = [prompt.clone(), prompt::PERMISSION_DENIED.clone()].into();
            if self.expect_any(set, timeout).await? == 1 {
                return Err(Error::PermissionDenied {
                    host: self.host.clone(),
                    user: self.user.clone(),
                });
            }
        } else {
            let set: PatternSet = [prompt::ADD_HOST.clone(), prompt.clone(), parent_prompt].into();
            match self.expect_any(set, timeout).await? {
                2 => return Err(self.unable_to_login()),
                0 => {
                    self.parent.send_with("yes", SendOptions::default()).await?;
                    self.expect_any(prompt.into(), timeout).await?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn unable_to_login(&self) -> Error {
        Error::Connection {
            host: self.host.clone(),
            reason: format!("Unable to login to {}", self.host),
        }
    }

    /// Healthy only if the nested prompt, not the parent's, answers a newline.
    async fn probe(&mut self) -> bool {
        if self
            .parent
            .send_with("", SendOptions::default())
            .await
            .is_err()
        {
            return false;
        }
        let set: PatternSet = [
            self.prompt.clone(),
            self.parent.prompt().clone(),
            Pattern::Timeout,
        ]
        .into();
        matches!(self.parent.expect_any(set, PROBE_TIMEOUT).await, Ok(0))
    }

    /// Open a shell on a guest VM through `parent`, normally a NAT box.
    ///
    /// Credentials come from the image name unless given. Key-based images
    /// log in with `key_path`, or with the parent's default keys when it is
    /// `None`. The guest's idle logout is disabled.
    pub async fn vm(
        parent: &'p mut P,
        vm_ip: &str,
        credentials: GuestCredentials,
        key_path: Option<&str>,
    ) -> Result<Self> {
        let prompt = prompt::vm(&credentials.user);
        let use_password = credentials.password.is_some();
        let mut session = Self::new(
            parent,
            vm_ip,
            credentials.user,
            credentials.password,
            prompt,
        )
        .with_timeout(Duration::from_secs(20));
        if !use_password {
            session = session.with_key_auth(key_path);
        }

        session
            .connect(
                ConnectOptions::default()
                    .retry(true)
                    .retry_timeout(Duration::from_secs(120))
                    .use_password(use_password),
            )
            .await?;
        session.exec_cmd("TMOUT=0", ExecOptions::default()).await?;
        Ok(session)
    }

    /// Hop to controller-0, or stay put if `parent` already is controller-0.
    ///
    /// Returns `None` when no hop was needed.
    pub async fn controller0(parent: &'p mut P) -> Result<Option<Self>> {
        if parent.hostname().await? == "controller-0" {
            debug!("Already on controller-0");
            return Ok(None);
        }

        let user = parent.user().to_owned();
        let password = parent.password().map(str::to_owned);
        let mut session = Self::new(
            parent,
            "controller-0",
            user,
            password,
            prompt::CONTROLLER_0.clone(),
        );
        session.connect(ConnectOptions::default().retry(true)).await?;
        Ok(Some(session))
    }
}

impl<P: Shell> Shell for NestedSession<'_, P> {
    fn name(&self) -> &str {
        &self.host
    }

    fn host(&self) -> &str {
        &self.host
    }

    fn user(&self) -> &str {
        &self.user
    }

    fn password(&self) -> Option<&str> {
        self.password.as_deref()
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
        let inner = SendOptions {
            reconnect: false,
            ..opts
        };
        match self.parent.send_with(command, inner).await {
            Err(e) if opts.reconnect => {
                warn!("Failed to send line to {}: {e}. Reconnecting", self.host);
                self.connect(
                    ConnectOptions::default()
                        .retry(true)
                        .retry_timeout(opts.reconnect_timeout)
                        .reuse_if_alive(false),
                )
                .await?;
                self.parent.send_with(command, SendOptions::default()).await
            }
            other => other,
        }
    }

    fn send_raw(&mut self, data: &[u8]) -> Result<()> {
        self.parent.send_raw(data)
    }

    async fn expect_any(&mut self, patterns: PatternSet, timeout: Duration) -> Result<usize> {
        let patterns = if patterns.is_empty() {
            PatternSet::from(&self.prompt)
        } else {
            patterns
        };
        let index = self.parent.expect_any(patterns, timeout).await?;
        self.last_output = self.parent.last_output().to_owned();
        self.last_match = self.parent.last_match().to_owned();
        Ok(index)
    }

    fn discard_pending(&mut self) -> usize {
        self.parent.discard_pending()
    }
}
