//! Raw expect engine over a spawned transport
//!
//! A [`Terminal`] owns one [`Channel`] and the buffer of output that has not
//! been matched yet. It knows nothing about prompts, logins or commands; that
//! is the job of [`Session`](crate::session::Session).

mod spawn;
mod transcript;

pub use spawn::{Channel, CommandLine, PtySpawner, Spawner};
pub use transcript::Transcript;

use std::io::Write;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, trace};

use crate::buffer::BufferManager;
use crate::pattern::{Matcher, Pattern, PatternSet};
use crate::result::{Error, MatchResult, Result};

/// How much unmatched output is attached to a timeout error
const PENDING_TAIL: usize = 512;

/// An expect engine bound to one live transport.
pub struct Terminal {
    channel: Channel,
    buffer: BufferManager,
    eof_reached: bool,
    transcript: Option<Transcript>,
}

impl Terminal {
    /// Wrap a freshly spawned channel.
    pub fn new(channel: Channel, max_buffer_size: usize, strip_ansi: bool) -> Self {
        Self {
            channel,
            buffer: BufferManager::new(max_buffer_size, strip_ansi),
            eof_reached: false,
            transcript: None,
        }
    }

    /// Record all traffic to `transcript` from now on.
    pub fn set_transcript(&mut self, transcript: Transcript) {
        self.transcript = Some(transcript);
    }

    /// Write raw bytes to the transport.
    pub fn send(&mut self, data: &[u8]) -> Result<()> {
        if let Some(t) = self.transcript.as_mut() {
            t.record(data);
        }
        self.channel.input.write_all(data)?;
        self.channel.input.flush()?;
        Ok(())
    }

    /// Write `line` followed by a newline.
    pub fn send_line(&mut self, line: &str) -> Result<()> {
        let mut data = Vec::with_capacity(line.len() + 1);
        data.extend_from_slice(line.as_bytes());
        data.push(b'\n');
        self.send(&data)
    }

    /// Wait until one of `patterns` matches the output.
    ///
    /// Among all patterns the match starting earliest in the stream wins; ties
    /// go to the lower index. Everything up to the end of the match is
    /// consumed, so `before` only ever holds output that arrived after the
    /// previous match.
    ///
    /// Without a `Pattern::Timeout`/`Pattern::Eof` in the set, running out of
    /// time or hitting EOF is an error.
    pub async fn expect_any(
        &mut self,
        patterns: &PatternSet,
        timeout: Option<Duration>,
    ) -> Result<MatchResult> {
        let mut matchers: Vec<(usize, Box<dyn Matcher>)> = Vec::with_capacity(patterns.len());
        for (idx, pattern) in patterns.patterns().iter().enumerate() {
            if !pattern.is_special() {
                matchers.push((idx, pattern.to_matcher()?));
            }
        }

        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            if let Some(result) = self.find_match(&matchers) {
                return Ok(result);
            }

            if self.eof_reached {
                return match patterns.position_of(&Pattern::Eof) {
                    Some(idx) => Ok(self.special_match(idx, true)),
                    None => Err(Error::Eof {
                        patterns: patterns.to_string(),
                    }),
                };
            }

            let chunk = match deadline {
                Some(deadline) => {
                    match tokio::time::timeout_at(deadline, self.channel.output.recv()).await {
                        Ok(chunk) => chunk,
                        Err(_) => return self.timed_out(patterns, timeout.unwrap_or_default()),
                    }
                }
                None => self.channel.output.recv().await,
            };

            match chunk {
                Some(data) => self.ingest(&data),
                None => {
                    debug!("EOF on terminal");
                    self.eof_reached = true;
                }
            }
        }
    }

    /// Drop all output that has been received but not matched.
    ///
    /// Never waits; returns the number of bytes dropped.
    pub fn discard_pending(&mut self) -> usize {
        loop {
            match self.channel.output.try_recv() {
                Ok(data) => self.ingest(&data),
                Err(tokio::sync::mpsc::error::TryRecvError::Empty) => break,
                Err(tokio::sync::mpsc::error::TryRecvError::Disconnected) => {
                    self.eof_reached = true;
                    break;
                }
            }
        }
        self.buffer.clear()
    }

    /// Whether the transport is still up.
    pub fn is_alive(&mut self) -> bool {
        if self.eof_reached {
            return false;
        }
        match self.channel.child.as_mut() {
            Some(child) => spawn::is_alive(child),
            None => true,
        }
    }

    /// Exit code of the child, if it has exited.
    pub fn exit_code(&mut self) -> Option<u32> {
        let child = self.channel.child.as_mut()?;
        match child.try_wait() {
            Ok(Some(status)) => Some(status.exit_code()),
            _ => None,
        }
    }

    /// Terminate the transport.
    pub fn close(&mut self) {
        if let Some(child) = self.channel.child.as_mut() {
            if spawn::is_alive(child) {
                if let Err(e) = child.kill() {
                    debug!("failed to kill child: {e}");
                }
            }
        }
        self.eof_reached = true;
    }

    fn ingest(&mut self, data: &[u8]) {
        trace!("received {} bytes", data.len());
        if let Some(t) = self.transcript.as_mut() {
            t.record(data);
        }
        self.buffer.append(data);
    }

    fn find_match(&mut self, matchers: &[(usize, Box<dyn Matcher>)]) -> Option<MatchResult> {
        let pending = self.buffer.pending();
        let (idx, m) = matchers
            .iter()
            .filter_map(|(idx, matcher)| matcher.find(pending).map(|m| (*idx, m)))
            .min_by_key(|(idx, m)| (m.start, *idx))?;

        let consumed = self.buffer.consume(m.end);
        Some(MatchResult {
            pattern_index: idx,
            matched: String::from_utf8_lossy(&consumed[m.start..]).into_owned(),
            before: String::from_utf8_lossy(&consumed[..m.start]).into_owned(),
            captures: m.captures,
        })
    }

    fn special_match(&mut self, idx: usize, consume: bool) -> MatchResult {
        let before = if consume {
            let all = self.buffer.len();
            String::from_utf8_lossy(&self.buffer.consume(all)).into_owned()
        } else {
            String::from_utf8_lossy(self.buffer.pending()).into_owned()
        };
        MatchResult {
            pattern_index: idx,
            matched: String::new(),
            before,
            captures: Vec::new(),
        }
    }

    fn timed_out(&mut self, patterns: &PatternSet, duration: Duration) -> Result<MatchResult> {
        match patterns.position_of(&Pattern::Timeout) {
            Some(idx) => Ok(self.special_match(idx, false)),
            None => Err(Error::Timeout {
                patterns: patterns.to_string(),
                duration,
                pending: self.buffer.tail(PENDING_TAIL),
            }),
        }
    }
}

impl std::fmt::Debug for Terminal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Terminal")
            .field("pending", &self.buffer.len())
            .field("eof_reached", &self.eof_reached)
            .finish()
    }
}
