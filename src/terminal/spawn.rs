//! Process spawning utilities

use std::any::Any;
use std::fmt;
use std::io::{Read, Write};

use portable_pty::{native_pty_system, Child, CommandBuilder, PtyPair, PtySize};
use tokio::sync::mpsc;

use crate::result::{Error, Result};

/// Default PTY rows
const DEFAULT_PTY_ROWS: u16 = 24;

/// Default PTY columns. Wide enough that long commands are not wrapped by
/// the remote line discipline, which would split the echo across lines.
const DEFAULT_PTY_COLS: u16 = 200;

/// A program and its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    /// Program to run
    pub program: String,
    /// Arguments, passed verbatim
    pub args: Vec<String>,
    /// Extra environment variables
    pub env: Vec<(String, String)>,
}

impl CommandLine {
    /// A program with no arguments.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    /// Split a command string on whitespace.
    ///
    /// No shell quoting is interpreted.
    pub fn parse(command: &str) -> Result<Self> {
        let mut parts = command.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| Error::SpawnError("Empty command".to_string()))?;
        Ok(Self::new(program).args(parts))
    }

    /// Append one argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set an environment variable for the child.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// The byte streams of one spawned transport.
///
/// Output arrives as chunks on an unbounded channel; when every sender is gone
/// the stream has reached EOF. Input is a plain blocking writer, which for a
/// PTY never blocks for the short commands sent here.
pub struct Channel {
    pub(crate) output: mpsc::UnboundedReceiver<Vec<u8>>,
    pub(crate) input: Box<dyn Write + Send>,
    pub(crate) child: Option<Box<dyn Child + Send + Sync>>,
    _keepalive: Option<Box<dyn Any + Send>>,
}

impl Channel {
    /// Wrap an output receiver and an input writer.
    ///
    /// Anything can stand behind the two ends; a scripted console in a test
    /// is as good a transport as a PTY.
    pub fn new(output: mpsc::UnboundedReceiver<Vec<u8>>, input: Box<dyn Write + Send>) -> Self {
        Self {
            output,
            input,
            child: None,
            _keepalive: None,
        }
    }

    /// Attach the child process driving this channel.
    pub fn with_child(mut self, child: Box<dyn Child + Send + Sync>) -> Self {
        self.child = Some(child);
        self
    }

    /// Keep `value` alive for as long as the channel is.
    pub fn with_keepalive(mut self, value: Box<dyn Any + Send>) -> Self {
        self._keepalive = Some(value);
        self
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("has_child", &self.child.is_some())
            .finish()
    }
}

/// Opens transports for sessions.
///
/// Every connect attempt calls [`Spawner::spawn`] exactly once.
pub trait Spawner: Send + Sync {
    /// Start `command` and return its byte streams.
    fn spawn(&self, command: &CommandLine) -> Result<Channel>;
}

/// Spawns commands on a native pseudo-terminal.
#[derive(Debug, Clone, Copy)]
pub struct PtySpawner {
    size: PtySize,
}

impl Default for PtySpawner {
    fn default() -> Self {
        Self::new(DEFAULT_PTY_ROWS, DEFAULT_PTY_COLS)
    }
}

impl PtySpawner {
    /// A spawner whose terminals have the given dimensions.
    pub fn new(rows: u16, cols: u16) -> Self {
        Self {
            size: PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            },
        }
    }
}

impl Spawner for PtySpawner {
    fn spawn(&self, command: &CommandLine) -> Result<Channel> {
        let pty_system = native_pty_system();

        let PtyPair { master, slave } = pty_system
            .openpty(self.size)
            .map_err(|e| Error::PtyError(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&command.program);
        cmd.args(&command.args);
        for (key, value) in &command.env {
            cmd.env(key, value);
        }

        let child = slave
            .spawn_command(cmd)
            .map_err(|e| Error::SpawnError(format!("{command}: {e}")))?;
        // Only the child may hold the slave side, or EOF is never seen.
        drop(slave);

        let reader = master
            .try_clone_reader()
            .map_err(|e| Error::PtyError(e.to_string()))?;
        let writer = master
            .take_writer()
            .map_err(|e| Error::PtyError(e.to_string()))?;

        Ok(Channel::new(pump(reader)?, writer)
            .with_child(child)
            .with_keepalive(Box::new(master)))
    }
}

/// Move everything `reader` produces onto a channel from a dedicated thread.
///
/// Reads are never cancelled, so no output is lost when an expect times out.
fn pump(mut reader: Box<dyn Read + Send>) -> Result<mpsc::UnboundedReceiver<Vec<u8>>> {
    let (tx, rx) = mpsc::unbounded_channel();

    std::thread::Builder::new()
        .name("pty-reader".to_string())
        .spawn(move || {
            let mut buf = [0u8; 4096];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    // Linux reports EIO once the child side is closed.
                    Err(_) => break,
                }
            }
        })?;

    Ok(rx)
}

/// Check if a child process is still alive
pub(crate) fn is_alive(child: &mut Box<dyn Child + Send + Sync>) -> bool {
    matches!(child.try_wait(), Ok(None))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_command_line() {
        let cmd = CommandLine::parse("virsh -c qemu:///system console controller-0").unwrap();
        assert_eq!(cmd.program, "virsh");
        assert_eq!(cmd.args, ["-c", "qemu:///system", "console", "controller-0"]);
        assert_eq!(
            cmd.to_string(),
            "virsh -c qemu:///system console controller-0"
        );
    }

    #[test]
    fn test_parse_empty_command() {
        assert!(matches!(
            CommandLine::parse("   "),
            Err(Error::SpawnError(_))
        ));
    }

    #[test]
    fn test_builder_style() {
        let cmd = CommandLine::new("ssh")
            .args(["-o", "StrictHostKeyChecking=no"])
            .arg("sysadmin@10.10.10.3")
            .env("LANG", "C");
        assert_eq!(cmd.args.len(), 3);
        assert_eq!(cmd.env, [("LANG".to_string(), "C".to_string())]);
    }
}
