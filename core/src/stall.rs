use std::io::{self, Read};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use thiserror::Error;

/// Abort when throughput stays below this many bytes per second...
pub const LOW_SPEED_LIMIT: u64 = 1024;
/// ...for this long.
pub const LOW_SPEED_TIME: Duration = Duration::from_secs(10);

const PUMP_CHUNK: usize = 64 * 1024;
const PUMP_DEPTH: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StallPolicy {
    pub min_bytes_per_sec: u64,
    pub window: Duration,
}

impl Default for StallPolicy {
    fn default() -> Self {
        Self {
            min_bytes_per_sec: LOW_SPEED_LIMIT,
            window: LOW_SPEED_TIME,
        }
    }
}

#[derive(Error, Debug)]
#[error("below {min_bytes_per_sec} bytes/sec for {window_ms}ms")]
pub struct StallError {
    pub min_bytes_per_sec: u64,
    pub window_ms: u64,
}

impl StallError {
    fn from_policy(policy: StallPolicy) -> io::Error {
        io::Error::new(
            io::ErrorKind::TimedOut,
            StallError {
                min_bytes_per_sec: policy.min_bytes_per_sec,
                window_ms: policy.window.as_millis() as u64,
            },
        )
    }

    /// True when `err` was raised by a [`StallGuard`].
    pub fn is_stall(err: &io::Error) -> bool {
        err.get_ref()
            .map(|inner| inner.is::<StallError>())
            .unwrap_or(false)
    }
}

#[derive(Debug)]
struct StallWindow {
    start: Instant,
    bytes: u64,
    policy: StallPolicy,
}

impl StallWindow {
    fn new(policy: StallPolicy, now: Instant) -> Self {
        Self {
            start: now,
            bytes: 0,
            policy,
        }
    }

    fn enabled(&self) -> bool {
        self.policy.min_bytes_per_sec > 0
    }

    /// Time left before the current window closes.
    fn remaining(&self, now: Instant) -> Duration {
        self.policy
            .window
            .saturating_sub(now.saturating_duration_since(self.start))
    }

    /// Accounts `bytes` received at `now`; true once a full window has
    /// elapsed with less than the required throughput.
    fn record(&mut self, bytes: u64, now: Instant) -> bool {
        self.bytes = self.bytes.saturating_add(bytes);
        if !self.enabled() {
            return false;
        }
        let elapsed = now.saturating_duration_since(self.start);
        if elapsed < self.policy.window {
            return false;
        }
        let required = (self.policy.min_bytes_per_sec as f64 * elapsed.as_secs_f64()) as u64;
        if self.bytes < required {
            return true;
        }
        self.start = now;
        self.bytes = 0;
        false
    }
}

/// Reader adapter that fails with [`StallError`] when the wrapped body
/// trickles in slower than the policy allows, including when it goes
/// silent. The body is pumped on its own thread so a blocked read cannot
/// hold the caller past the window; a pump stuck on a dead peer exits once
/// its read returns and the guard is gone.
pub struct StallGuard {
    chunks: Receiver<io::Result<Vec<u8>>>,
    pending: Vec<u8>,
    offset: usize,
    finished: bool,
    window: StallWindow,
}

impl StallGuard {
    pub fn spawn<R>(inner: R, policy: StallPolicy) -> io::Result<Self>
    where
        R: Read + Send + 'static,
    {
        let (tx, chunks) = bounded(PUMP_DEPTH);
        thread::Builder::new()
            .name("body-pump".to_string())
            .spawn(move || {
                let mut inner = inner;
                loop {
                    let mut buffer = vec![0u8; PUMP_CHUNK];
                    let message = match inner.read(&mut buffer) {
                        Ok(0) => break,
                        Ok(read) => {
                            buffer.truncate(read);
                            Ok(buffer)
                        }
                        Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                        Err(err) => Err(err),
                    };
                    let failed = message.is_err();
                    if tx.send(message).is_err() || failed {
                        break;
                    }
                }
            })?;
        Ok(Self {
            chunks,
            pending: Vec::new(),
            offset: 0,
            finished: false,
            window: StallWindow::new(policy, Instant::now()),
        })
    }

    fn next_chunk(&mut self) -> io::Result<()> {
        loop {
            let received = if self.window.enabled() {
                self.chunks
                    .recv_timeout(self.window.remaining(Instant::now()))
            } else {
                self.chunks.recv().map_err(|_| RecvTimeoutError::Disconnected)
            };
            match received {
                Ok(Ok(chunk)) => {
                    if self.window.record(chunk.len() as u64, Instant::now()) {
                        return Err(StallError::from_policy(self.window.policy));
                    }
                    self.pending = chunk;
                    self.offset = 0;
                    return Ok(());
                }
                Ok(Err(err)) => {
                    self.finished = true;
                    return Err(err);
                }
                Err(RecvTimeoutError::Timeout) => {
                    if self.window.record(0, Instant::now()) {
                        return Err(StallError::from_policy(self.window.policy));
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    self.finished = true;
                    return Ok(());
                }
            }
        }
    }
}

impl Read for StallGuard {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        while self.offset >= self.pending.len() {
            if self.finished {
                return Ok(0);
            }
            self.next_chunk()?;
        }
        let available = &self.pending[self.offset..];
        let count = available.len().min(buf.len());
        buf[..count].copy_from_slice(&available[..count]);
        self.offset += count;
        Ok(count)
    }
}
