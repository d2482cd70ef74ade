//! Command execution on top of any [`Shell`]
//!
//! [`CommandRunner`] is implemented for every shell, so a [`Session`], a
//! [`NestedSession`] and a nested session inside a nested session all get
//! `exec_cmd` and friends for free.
//!
//! [`Session`]: crate::session::Session
//! [`NestedSession`]: crate::session::NestedSession

use std::future::Future;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::pattern::{Pattern, PatternSet};
use crate::result::{Error, PatternError, Result};
use crate::session::{prompt, SendOptions, Shell};

/// Command used to read the exit code of the previous command.
pub const EXIT_CODE_CMD: &str = "echo $?";

/// Timeout for reading an exit code.
const EXIT_CODE_TIMEOUT: Duration = Duration::from_secs(30);

/// Keys file [`CommandRunner::deploy_ssh_key`] appends to.
pub const AUTHORIZED_KEYS: &str = "~/.ssh/authorized_keys";

/// ssh options of the transfers started from a remote shell.
const TRANSFER_SSH_OPTIONS: &str = "-o StrictHostKeyChecking=no -o UserKnownHostsFile=/dev/null";

/// A trailing `date` line such as `Tue Oct 18 10:00:00 UTC 2026`.
static DATE_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[0-2]\d:[0-5]\d:[0-5]\d\s[A-Z]{3,}\s\d{4}$").expect("date pattern is a valid regex")
});

/// Options for [`CommandRunner::exec_cmd`].
#[derive(Debug, Clone, Copy)]
pub struct ExecOptions {
    /// How long to wait for the prompt after the command.
    pub timeout: Duration,
    /// Reconnect and resend once if sending fails.
    pub reconnect: bool,
    /// Retry budget of that reconnect.
    pub reconnect_timeout: Duration,
    /// Discard stdout, keep only stderr.
    pub stderr_only: bool,
    /// Return non-zero exit codes and prompt timeouts instead of failing.
    pub fail_ok: bool,
    /// Read the exit code with `echo $?`; when off the code is reported as `-1`.
    pub get_exit_code: bool,
    /// Drop a `date` line printed last, e.g. by a login banner or profile hook.
    pub rm_date: bool,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            reconnect: false,
            reconnect_timeout: Duration::from_secs(300),
            stderr_only: false,
            fail_ok: true,
            get_exit_code: true,
            rm_date: true,
        }
    }
}

impl ExecOptions {
    /// Set the prompt timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Fail on non-zero exit codes and timeouts.
    pub fn strict(mut self) -> Self {
        self.fail_ok = false;
        self
    }

    /// Reconnect on send failures.
    pub fn reconnect(mut self, timeout: Duration) -> Self {
        self.reconnect = true;
        self.reconnect_timeout = timeout;
        self
    }

    /// Keep only stderr in the output.
    pub fn stderr_only(mut self) -> Self {
        self.stderr_only = true;
        self
    }

    /// Skip the `echo $?` round trip.
    pub fn without_exit_code(mut self) -> Self {
        self.get_exit_code = false;
        self
    }

    /// Keep a trailing `date` line in the output.
    pub fn keep_date(mut self) -> Self {
        self.rm_date = false;
        self
    }
}

/// Options for [`CommandRunner::rsync`].
#[derive(Debug, Clone)]
pub struct RsyncOptions {
    /// User on the destination server
    pub dest_user: String,
    /// Extra rsync options, placed before the source
    pub extra_opts: Vec<String>,
    /// Prefix of the command line, e.g. `sudo` or environment settings
    pub pre_opts: String,
    /// Wait for the password prompt and for the transfer
    pub timeout: Duration,
    /// Return a non-zero exit code instead of failing
    pub fail_ok: bool,
}

impl Default for RsyncOptions {
    fn default() -> Self {
        Self {
            dest_user: "sysadmin".to_string(),
            extra_opts: Vec::new(),
            pre_opts: String::new(),
            timeout: Duration::from_secs(60),
            fail_ok: false,
        }
    }
}

/// Options for the `wait_for_cmd_output*` helpers.
#[derive(Debug, Clone, Copy)]
pub struct WaitOptions {
    /// Overall budget.
    pub timeout: Duration,
    /// Whole output must match instead of containing `content`.
    pub strict: bool,
    /// `content` is a regex instead of a case-insensitive substring.
    pub regex: bool,
    /// Prompt timeout of each run of the command.
    pub exec_timeout: Duration,
    /// Pause between runs.
    pub check_interval: Duration,
    /// Wait for `content` to be absent rather than present.
    pub absent: bool,
    /// Accept non-zero exit codes of the command.
    pub non_zero_ok: bool,
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            strict: false,
            regex: false,
            exec_timeout: Duration::from_secs(10),
            check_interval: Duration::from_secs(3),
            absent: false,
            non_zero_ok: false,
        }
    }
}

/// Does `output` contain (or, when strict, equal) `content`?
///
/// Plain comparisons ignore case. Strict regexes must match at the start.
pub fn content_matches(output: &str, content: &str, strict: bool, regex: bool) -> Result<bool> {
    if regex {
        let re = Regex::new(content).map_err(PatternError::from)?;
        return Ok(if strict {
            re.find(output).is_some_and(|m| m.start() == 0)
        } else {
            re.is_match(output)
        });
    }

    let output = output.to_lowercase();
    let content = content.to_lowercase();
    Ok(if strict {
        output == content
    } else {
        output.contains(&content)
    })
}

/// Output of an exec without the trailing prompt line (and date line), trimmed.
fn exec_output(output: &str, rm_date: bool) -> String {
    let mut lines: Vec<&str> = output.split('\n').collect();
    lines.pop();
    if rm_date && lines.last().is_some_and(|line| DATE_LINE.is_match(line.trim_end())) {
        lines.pop();
    }
    lines.join("\n").trim().to_string()
}

async fn finish_exec<S: Shell + ?Sized>(
    shell: &mut S,
    command: &str,
    get_exit_code: bool,
    rm_date: bool,
) -> Result<(i32, String)> {
    let output = exec_output(shell.last_output(), rm_date);

    let code = if get_exit_code {
        let code = shell.get_exit_code().await?;
        if code != 0 {
            warn!("Issue occurred when executing '{command}'. Exit_code: {code}. Output: {output}");
        }
        code
    } else {
        info!("Actual exit code for following cmd is unknown: {command}");
        -1
    };
    Ok((code, output))
}

fn own_password<S: Shell + ?Sized>(shell: &S, asker: &str) -> Result<String> {
    shell.password().map(str::to_owned).ok_or_else(|| Error::Connection {
        host: shell.host().to_owned(),
        reason: format!("{asker} asked for a password but none is known"),
    })
}

/// Answer the host key and password questions of an scp or rsync started in
/// `shell`, up to its prompt. A second password request means the password
/// was rejected; the transfer is then interrupted.
async fn transfer_dialog<S: Shell + ?Sized>(
    shell: &mut S,
    password: &str,
    dest_host: &str,
    dest_user: &str,
    timeout: Duration,
) -> Result<()> {
    let set: PatternSet = [
        shell.prompt().clone(),
        prompt::PASSWORD.clone(),
        prompt::ADD_HOST.clone(),
    ]
    .into();
    let mut index = shell.expect(set, timeout).await?;
    if index == 2 {
        shell.send("yes").await?;
        let set: PatternSet = [shell.prompt().clone(), prompt::PASSWORD.clone()].into();
        index = shell.expect(set, timeout).await?;
    }
    if index == 1 {
        shell.send(password).await?;
        let set: PatternSet = [shell.prompt().clone(), prompt::PASSWORD.clone()].into();
        if shell.expect(set, timeout).await? == 1 {
            shell.send_control('c')?;
            shell.flush(Duration::from_secs(10)).await?;
            return Err(Error::PermissionDenied {
                host: dest_host.to_string(),
                user: dest_user.to_string(),
            });
        }
    }
    Ok(())
}

/// Everything built from send and expect: commands, exit codes, polling.
///
/// Implemented for every [`Shell`]; import it (or [`crate::prelude`]) to call
/// these methods on a session.
pub trait CommandRunner: Shell {
    /// Send a command line.
    fn send(&mut self, command: &str) -> impl Future<Output = Result<()>> + Send {
        self.send_with(command, SendOptions::default())
    }

    /// Wait for any of `patterns`; fails on timeout or EOF.
    fn expect<P: Into<PatternSet>>(
        &mut self,
        patterns: P,
        timeout: Duration,
    ) -> impl Future<Output = Result<usize>> + Send {
        let patterns = patterns.into();
        async move {
            let shown = patterns.to_string();
            self.expect_any(patterns, timeout).await.inspect_err(|e| {
                if let Error::Timeout { pending, .. } = e {
                    warn!("No match found for {shown}. expect timeout. Unconsumed: {pending:?}");
                } else {
                    warn!("No match found for {shown}! {e}");
                }
            })
        }
    }

    /// Wait for any of `patterns`; `None` when nothing matched in time or the stream ended.
    fn try_expect<P: Into<PatternSet>>(
        &mut self,
        patterns: P,
        timeout: Duration,
    ) -> impl Future<Output = Result<Option<usize>>> + Send {
        let patterns = patterns.into();
        async move {
            match self.expect_any(patterns, timeout).await {
                Ok(index) => Ok(Some(index)),
                Err(Error::Timeout { .. } | Error::Eof { .. }) => Ok(None),
                Err(e) => Err(e),
            }
        }
    }

    /// Wait for the current prompt.
    fn expect_prompt(&mut self, timeout: Duration) -> impl Future<Output = Result<usize>> + Send {
        self.expect(PatternSet::default(), timeout)
    }

    /// Read out whatever is left up to the next prompt, waiting at most `timeout`.
    fn flush(&mut self, timeout: Duration) -> impl Future<Output = Result<()>> + Send {
        async move {
            self.try_expect(PatternSet::default(), timeout).await?;
            debug!("Buffer is flushed by reading out the rest of the output");
            Ok(())
        }
    }

    /// Send Ctrl-`key`, e.g. `'c'` to interrupt.
    fn send_control(&mut self, key: char) -> Result<()> {
        debug!("Sending ctrl+{key}");
        let code = (key.to_ascii_lowercase() as u8) & 0x1f;
        self.send_raw(&[code])
    }

    /// Exit code of the previous command.
    fn get_exit_code(&mut self) -> impl Future<Output = Result<i32>> + Send {
        async move {
            self.send(EXIT_CODE_CMD).await?;
            self.expect_prompt(EXIT_CODE_TIMEOUT).await?;
            let output = self.last_output();
            let first = output.lines().next().unwrap_or_default().trim();
            first.parse().map_err(|_| Error::UnexpectedOutput {
                command: EXIT_CODE_CMD.to_string(),
                output: output.to_string(),
            })
        }
    }

    /// Run a command and return its exit code and output.
    ///
    /// The echo and the trailing prompt line are removed from the output. If
    /// the prompt does not come back in time the command is interrupted with
    /// Ctrl-C; with `fail_ok` the run then carries on with whatever was
    /// captured.
    ///
    /// # Errors
    ///
    /// With `fail_ok` off: [`Error::Timeout`] when the prompt does not return
    /// and [`Error::CommandFailed`] for a non-zero exit code.
    fn exec_cmd(
        &mut self,
        command: &str,
        opts: ExecOptions,
    ) -> impl Future<Output = Result<(i32, String)>> + Send {
        async move {
            debug!("Executing command...");
            let command = if opts.stderr_only {
                format!("{command} 1> /dev/null")
            } else {
                command.to_string()
            };

            let send_opts = SendOptions {
                reconnect: opts.reconnect,
                reconnect_timeout: opts.reconnect_timeout,
                flush: false,
            };
            self.send_with(&command, send_opts).await?;

            if let Err(e) = self.expect_any(PatternSet::default(), opts.timeout).await {
                if !matches!(e, Error::Timeout { .. }) {
                    return Err(e);
                }
                self.send_control('c')?;
                self.flush(Duration::from_secs(10)).await?;
                if !opts.fail_ok {
                    return Err(e);
                }
                warn!("{e}");
            }

            let (code, output) =
                finish_exec(self, &command, opts.get_exit_code, opts.rm_date).await?;
            if code != 0 && !opts.fail_ok {
                return Err(Error::CommandFailed { command, code });
            }
            Ok((code, output))
        }
    }

    /// Run a command with `sudo`, answering the password prompt if one appears.
    fn exec_sudo_cmd(
        &mut self,
        command: &str,
        opts: ExecOptions,
    ) -> impl Future<Output = Result<(i32, String)>> + Send {
        async move {
            let command = format!("sudo {command}");
            info!("Executing sudo command: {command}");
            self.send(&command).await?;

            let set: PatternSet = [self.prompt().clone(), prompt::PASSWORD.clone()].into();
            if self.expect(set, opts.timeout).await? == 1 {
                let password = own_password(self, "sudo")?;
                self.send(&password).await?;
                self.expect_prompt(opts.timeout).await?;
            }

            let (code, output) =
                finish_exec(self, &command, opts.get_exit_code, opts.rm_date).await?;
            if code != 0 && !opts.fail_ok {
                return Err(Error::CommandFailed { command, code });
            }
            Ok((code, output))
        }
    }

    /// Host name as reported by the remote shell.
    fn hostname(&mut self) -> impl Future<Output = Result<String>> + Send {
        async move {
            let (_, output) = self.exec_cmd("hostname", ExecOptions::default()).await?;
            Ok(output.lines().next().unwrap_or_default().trim().to_string())
        }
    }

    /// User the shell currently runs as.
    fn current_user(&mut self) -> impl Future<Output = Result<String>> + Send {
        async move {
            let (_, output) = self.exec_cmd("whoami", ExecOptions::default()).await?;
            Ok(output.lines().next().unwrap_or_default().trim().to_string())
        }
    }

    /// Whether `path` exists on the remote host.
    fn file_exists(&mut self, path: &str) -> impl Future<Output = Result<bool>> + Send {
        async move {
            let (code, _) = self
                .exec_cmd(&format!("stat {path}"), ExecOptions::default())
                .await?;
            Ok(code == 0)
        }
    }

    /// Set the shell's idle logout, `0` disables it.
    fn set_session_timeout(&mut self, seconds: u64) -> impl Future<Output = Result<()>> + Send {
        async move {
            self.send(&format!("TMOUT={seconds}")).await?;
            let timeout = self.timeout();
            self.expect_prompt(timeout).await?;
            Ok(())
        }
    }

    /// Re-run `command` until `content` shows up (or disappears, with `absent`).
    ///
    /// Returns `false` when the budget runs out.
    fn wait_for_cmd_output(
        &mut self,
        command: &str,
        content: &str,
        opts: WaitOptions,
    ) -> impl Future<Output = Result<bool>> + Send {
        async move {
            let end = Instant::now() + opts.timeout;
            let exec = ExecOptions::default().timeout(opts.exec_timeout);
            while Instant::now() < end {
                let (code, output) = self.exec_cmd(command, exec).await?;
                if !opts.non_zero_ok && code > 0 {
                    return Err(Error::CommandFailed {
                        command: command.to_string(),
                        code,
                    });
                }

                let exists = content_matches(&output, content, opts.strict, opts.regex)?;
                if exists != opts.absent {
                    return Ok(true);
                }
                tokio::time::sleep(opts.check_interval).await;
            }
            Ok(false)
        }
    }

    /// Like [`wait_for_cmd_output`](Self::wait_for_cmd_output), but the
    /// condition has to hold continuously for `time_to_stay`.
    fn wait_for_cmd_output_persists(
        &mut self,
        command: &str,
        content: &str,
        time_to_stay: Duration,
        opts: WaitOptions,
    ) -> impl Future<Output = Result<bool>> + Send {
        async move {
            let end = Instant::now() + opts.timeout;
            let exec = ExecOptions::default().timeout(opts.exec_timeout);
            while Instant::now() < end {
                let stay_end = Instant::now() + time_to_stay;
                let mut held = true;
                while Instant::now() < stay_end {
                    let (code, output) = self.exec_cmd(command, exec).await?;
                    if !opts.non_zero_ok && code > 0 {
                        return Err(Error::CommandFailed {
                            command: command.to_string(),
                            code,
                        });
                    }

                    let exists = content_matches(&output, content, opts.strict, opts.regex)?;
                    if exists == opts.absent {
                        debug!("Reset stay start time");
                        held = false;
                        break;
                    }
                    tokio::time::sleep(opts.check_interval).await;
                }
                if held {
                    return Ok(true);
                }
            }
            Ok(false)
        }
    }

    /// Copy `source` to `dest_user@dest_server:dest` with rsync over ssh.
    ///
    /// The password prompt is answered with this shell's own password.
    ///
    /// # Errors
    ///
    /// [`Error::PermissionDenied`] if the password is rejected, and
    /// [`Error::CommandFailed`] for a non-zero exit code unless `fail_ok`.
    fn rsync(
        &mut self,
        source: &str,
        dest_server: &str,
        dest: &str,
        opts: RsyncOptions,
    ) -> impl Future<Output = Result<(i32, String)>> + Send {
        async move {
            let extra: String = opts.extra_opts.iter().map(|opt| format!("{opt} ")).collect();
            let command = format!(
                "{} rsync -avre \"ssh {TRANSFER_SSH_OPTIONS}\" {extra}{source} {}@{dest_server}:{dest}",
                opts.pre_opts, opts.dest_user
            )
            .trim()
            .to_string();
            self.send(&command).await?;

            let password = self.password().unwrap_or_default().to_owned();
            transfer_dialog(self, &password, dest_server, &opts.dest_user, opts.timeout).await?;

            let (code, output) = finish_exec(self, &command, true, true).await?;
            if code != 0 && !opts.fail_ok {
                return Err(Error::CommandFailed { command, code });
            }
            Ok((code, output))
        }
    }

    /// Copy `source` (recursively) to `destination`, given as `user@host:path`.
    ///
    /// Answers the host key question and the password prompt on the way.
    ///
    /// # Errors
    ///
    /// [`Error::PermissionDenied`] if `password` is rejected and
    /// [`Error::CommandFailed`] if scp exits non-zero.
    fn scp_files_to(
        &mut self,
        source: &str,
        destination: &str,
        password: &str,
        timeout: Duration,
    ) -> impl Future<Output = Result<()>> + Send {
        async move {
            let command = format!("scp {TRANSFER_SSH_OPTIONS} -r {source} {destination}");
            info!("Copying files from {}: {command}", self.host());
            self.send(&command).await?;

            let (user, host) = destination.split_once('@').unwrap_or(("", destination));
            let host = host.split(':').next().unwrap_or_default();
            transfer_dialog(self, password, host, user, timeout).await?;

            let code = self.get_exit_code().await?;
            if code != 0 {
                return Err(Error::CommandFailed { command, code });
            }
            Ok(())
        }
    }

    /// Add `public_key` to [`AUTHORIZED_KEYS`] unless it is there already.
    ///
    /// Returns whether the key was added.
    fn deploy_ssh_key(&mut self, public_key: &str) -> impl Future<Output = Result<bool>> + Send {
        async move {
            self.exec_cmd("mkdir -p ~/.ssh/", ExecOptions::default()).await?;
            let (code, _) = self
                .exec_cmd(
                    &format!("grep -q \"{public_key}\" {AUTHORIZED_KEYS}"),
                    ExecOptions::default(),
                )
                .await?;
            if code == 0 {
                debug!("Public key already in {AUTHORIZED_KEYS}");
                return Ok(false);
            }

            info!("Adding public key to {AUTHORIZED_KEYS}");
            self.exec_cmd(
                &format!("echo -e \"{public_key}\\n\" >> {AUTHORIZED_KEYS}"),
                ExecOptions::default().strict(),
            )
            .await?;
            self.exec_cmd(
                &format!("chmod 700 ~/.ssh/ && chmod 644 {AUTHORIZED_KEYS}"),
                ExecOptions::default().strict(),
            )
            .await?;
            Ok(true)
        }
    }

    /// Become root with `sudo su -` and switch to the root prompt.
    ///
    /// Returns the previous prompt, to be handed to
    /// [`exit_root`](Self::exit_root).
    fn login_as_root(&mut self, timeout: Duration) -> impl Future<Output = Result<Pattern>> + Send {
        async move {
            self.send("sudo su -").await?;
            let set: PatternSet = [prompt::ROOT.clone(), prompt::PASSWORD.clone()].into();
            if self.expect(set, timeout).await? == 1 {
                let password = self.password().unwrap_or_default().to_owned();
                self.send(&password).await?;
                self.expect(prompt::ROOT.clone(), timeout).await?;
            }
            let original = self.prompt().clone();
            self.set_prompt(prompt::ROOT.clone());
            self.set_session_timeout(0).await?;
            Ok(original)
        }
    }

    /// Leave a root shell opened by [`login_as_root`](Self::login_as_root).
    fn exit_root(&mut self, original: Pattern) -> impl Future<Output = Result<()>> + Send {
        async move {
            if self.current_user().await? == "root" {
                self.set_prompt(original);
                self.send("exit").await?;
                let timeout = self.timeout();
                self.expect_prompt(timeout).await?;
            }
            Ok(())
        }
    }
}

impl<S: Shell + ?Sized> CommandRunner for S {}
