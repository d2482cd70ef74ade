//! Session builder for configuration

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::pattern::Pattern;
use crate::session::{prompt, Session, Target};
use crate::terminal::{CommandLine, PtySpawner, Spawner};

/// Default timeout for expect operations (in seconds)
const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Default maximum buffer size (in bytes)
const DEFAULT_MAX_BUFFER_SIZE: usize = 64 * 1024;

/// Builder for configuring sessions before they connect.
///
/// The builder is cheap to clone, so one configured builder can stamp out
/// sessions for every node of a lab with the same spawner and log directory.
///
/// # Defaults
///
/// - Timeout: 60 seconds
/// - Max buffer size: 64 KiB
/// - ANSI stripping: disabled
/// - Spawner: [`PtySpawner`] with a 24 x 200 terminal
/// - No transcript directory
///
/// # Examples
///
/// ```no_run
/// use stxauto::Session;
/// use std::time::Duration;
///
/// let session = Session::builder()
///     .timeout(Duration::from_secs(30))
///     .log_dir("/tmp/stx-logs")
///     .ssh("10.10.10.3", "sysadmin", "Li69nux*");
/// ```
#[derive(Clone)]
pub struct SessionBuilder {
    timeout: Duration,
    max_buffer_size: usize,
    strip_ansi: bool,
    spawner: Arc<dyn Spawner>,
    log_dir: Option<PathBuf>,
    name: Option<String>,
    prompt: Option<Pattern>,
}

impl Default for SessionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SessionBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionBuilder")
            .field("timeout", &self.timeout)
            .field("max_buffer_size", &self.max_buffer_size)
            .field("strip_ansi", &self.strip_ansi)
            .field("log_dir", &self.log_dir)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl SessionBuilder {
    /// Create a new session builder with default configuration.
    pub fn new() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            max_buffer_size: DEFAULT_MAX_BUFFER_SIZE,
            strip_ansi: false,
            spawner: Arc::new(PtySpawner::default()),
            log_dir: None,
            name: None,
            prompt: None,
        }
    }

    /// Set the default timeout for expect operations and logins.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set maximum buffer size in bytes.
    ///
    /// When unmatched output exceeds this size the oldest third is discarded.
    pub fn max_buffer_size(mut self, size: usize) -> Self {
        self.max_buffer_size = size;
        self
    }

    /// Enable or disable ANSI escape sequence stripping.
    ///
    /// Consoles that redraw the screen (boot menus, `watch`) want this on.
    pub fn strip_ansi(mut self, strip: bool) -> Self {
        self.strip_ansi = strip;
        self
    }

    /// Set PTY (terminal) size of the default spawner.
    pub fn pty_size(mut self, rows: u16, cols: u16) -> Self {
        self.spawner = Arc::new(PtySpawner::new(rows, cols));
        self
    }

    /// Use a custom transport spawner.
    pub fn spawner(mut self, spawner: Arc<dyn Spawner>) -> Self {
        self.spawner = spawner;
        self
    }

    /// Write a transcript for every connect to `dir/ssh_<name>.log`.
    pub fn log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = Some(dir.into());
        self
    }

    /// Logical name of the session, used for logs and the transcript file.
    ///
    /// Defaults to the host for ssh targets and the program otherwise.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Override the initial prompt.
    pub fn prompt(mut self, prompt: Pattern) -> Self {
        self.prompt = Some(prompt);
        self
    }

    /// Build a session for an arbitrary target.
    ///
    /// Without an explicit prompt, ssh targets expect the controller prompt
    /// and everything else a `$ `/`# ` shell prompt.
    pub fn build(self, target: Target) -> Session {
        let name = self.name.unwrap_or_else(|| match &target {
            Target::Ssh { host, .. } => host.clone(),
            Target::Shell { command } | Target::Process { command } => command.program.clone(),
        });
        let prompt = self.prompt.unwrap_or_else(|| match &target {
            Target::Ssh { .. } => prompt::CONTROLLER.clone(),
            Target::Shell { .. } => prompt::SHELL.clone(),
            Target::Process { .. } => prompt::CONSOLE_SHELL.clone(),
        });

        Session::from_parts(
            name,
            target,
            prompt,
            self.spawner,
            self.timeout,
            self.max_buffer_size,
            self.strip_ansi,
            self.log_dir,
        )
    }

    /// A password-authenticated ssh session.
    pub fn ssh(
        self,
        host: impl Into<String>,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Session {
        self.build(Target::Ssh {
            host: host.into(),
            user: user.into(),
            password: password.into(),
            port: None,
        })
    }

    /// A local interactive shell, verified like an ssh login.
    pub fn shell(self, command: CommandLine) -> Session {
        self.build(Target::Shell { command })
    }

    /// A plain process; connecting only spawns it.
    pub fn process(self, command: CommandLine) -> Session {
        self.build(Target::Process { command })
    }

    /// The serial console of a libvirt domain.
    pub fn console(self, domain: &str) -> Session {
        let builder = if self.name.is_some() {
            self
        } else {
            self.name(domain)
        };
        builder.process(CommandLine::new("virsh").args(["console", domain]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Shell;

    #[test]
    fn test_builder_defaults() {
        let builder = SessionBuilder::new();
        assert_eq!(builder.timeout, Duration::from_secs(DEFAULT_TIMEOUT_SECS));
        assert_eq!(builder.max_buffer_size, DEFAULT_MAX_BUFFER_SIZE);
        assert!(!builder.strip_ansi);
        assert!(builder.log_dir.is_none());
    }

    #[test]
    fn test_ssh_session_naming() {
        let session = SessionBuilder::new().ssh("10.10.10.3", "sysadmin", "pw");
        assert_eq!(session.name(), "10.10.10.3");
        assert_eq!(session.host(), "10.10.10.3");
        assert_eq!(session.user(), "sysadmin");
        assert_eq!(session.password(), Some("pw"));
    }

    #[test]
    fn test_console_named_after_domain() {
        let session = SessionBuilder::new().console("controller-0");
        assert_eq!(session.name(), "controller-0");
        assert_eq!(session.prompt().to_string(), "':~$'");
    }

    #[test]
    fn test_explicit_name_wins() {
        let session = SessionBuilder::new().name("primary").console("controller-0");
        assert_eq!(session.name(), "primary");
    }
}
