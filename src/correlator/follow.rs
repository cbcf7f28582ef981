// Log follower - tails the upstream fetch log of an external tile server
//
// The file is reopened on every poll, so both in-place truncation and
// rename-based rotation are picked up: a file shorter than the read offset
// restarts from the beginning. A file present at startup is followed from
// its current end; history is never replayed.

use regex::Regex;
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::watch;

use super::UpstreamLogCorrelator;
use crate::config::UpstreamLogConfig;

/// Read position inside the followed file
#[derive(Debug, Default)]
pub struct FollowState {
    offset: u64,
    // Bytes after the last newline, completed by a later poll
    partial: Vec<u8>,
    started: bool,
}

pub struct LogFollower {
    path: PathBuf,
    poll_interval: Duration,
    message_pattern: Option<Regex>,
    correlator: Arc<UpstreamLogCorrelator>,
}

impl LogFollower {
    pub fn new(
        path: impl Into<PathBuf>,
        poll_interval: Duration,
        message_pattern: Option<Regex>,
        correlator: Arc<UpstreamLogCorrelator>,
    ) -> Self {
        Self {
            path: path.into(),
            poll_interval,
            message_pattern,
            correlator,
        }
    }

    /// Build from validated configuration
    pub fn from_config(
        config: &UpstreamLogConfig,
        correlator: Arc<UpstreamLogCorrelator>,
    ) -> Result<Self, regex::Error> {
        let pattern = config
            .message_pattern
            .as_deref()
            .map(Regex::new)
            .transpose()?;
        Ok(Self::new(
            &config.path,
            Duration::from_millis(config.poll_interval_ms),
            pattern,
            correlator,
        ))
    }

    /// Follow the file until `shutdown` flips to true
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(path = %self.path.display(), "Following upstream fetch log");
        let mut state = FollowState::default();
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.poll(&mut state).await {
                        tracing::debug!(
                            path = %self.path.display(),
                            error = %e,
                            "Upstream log poll failed"
                        );
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::debug!(
                            path = %self.path.display(),
                            "Upstream log follower stopped"
                        );
                        return;
                    }
                }
            }
        }
    }

    /// Read whatever was appended since the last poll.
    ///
    /// Returns the number of complete lines handed to the correlator.
    pub async fn poll(&self, state: &mut FollowState) -> std::io::Result<usize> {
        let mut file = match tokio::fs::File::open(&self.path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // A file created later is read from its start
                state.started = true;
                state.offset = 0;
                state.partial.clear();
                return Ok(0);
            }
            Err(e) => return Err(e),
        };
        let len = file.metadata().await?.len();

        if !state.started {
            state.started = true;
            state.offset = len;
            return Ok(0);
        }
        if len < state.offset {
            tracing::debug!(path = %self.path.display(), "Upstream log truncated, rereading");
            state.offset = 0;
            state.partial.clear();
        }
        if len == state.offset {
            return Ok(0);
        }

        file.seek(SeekFrom::Start(state.offset)).await?;
        let mut appended = Vec::with_capacity((len - state.offset) as usize);
        let read = file.read_to_end(&mut appended).await?;
        state.offset += read as u64;

        state.partial.extend_from_slice(&appended);
        let Some(last_newline) = state.partial.iter().rposition(|b| *b == b'\n') else {
            return Ok(0);
        };
        let complete: Vec<u8> = state.partial.drain(..=last_newline).collect();

        let mut handled = 0;
        for line in String::from_utf8_lossy(&complete).lines() {
            if self.handle(line) {
                handled += 1;
            }
        }
        Ok(handled)
    }

    fn handle(&self, line: &str) -> bool {
        match &self.message_pattern {
            Some(pattern) => match pattern.captures(line).and_then(|c| c.name("message")) {
                Some(message) => self.correlator.handle_line(message.as_str()),
                None => false,
            },
            None => self.correlator.handle_line(line),
        }
    }
}
