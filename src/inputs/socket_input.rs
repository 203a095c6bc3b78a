//! Newline-delimited text over a TCP connection.

use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use tokio::io::AsyncBufRead;
use tokio::io::AsyncBufReadExt;
use tokio::io::BufReader;
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::errors::PipelineResult;
use crate::pipeline::SourceEndpoint;

use super::InputBuilder;
use super::InputReader;
use super::SourceError;

/// How the socket reader reconnects.
///
/// After a failed connection attempt or a dropped connection, wait
/// `base * 2^(failures - 1)`, capped at `max_delay`, with ±20% jitter.
/// Give up after `max_attempts` consecutive failures.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            max_attempts: 30,
        }
    }
}

impl RetryPolicy {
    /// Delay before the next attempt, after `failures` consecutive
    /// failures.
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(31);
        let delay = self
            .base
            .checked_mul(1 << exp)
            .unwrap_or(self.max_delay)
            .min(self.max_delay);
        let jitter = 0.8 + fastrand::f64() * 0.4;
        delay.mul_f64(jitter)
    }
}

/// Connection status published by the reader task.
#[derive(Debug, Clone, PartialEq, Eq)]
enum LinkState {
    Connecting,
    Connected,
    Retrying { attempt: u32, reason: String },
    GaveUp { reason: String },
}

/// Read lines from a TCP socket.
///
/// Builds [`SocketInput`]s whose background tasks run on the given
/// tokio runtime.
#[derive(Debug, Clone)]
pub struct SocketInputConfig {
    rt: Handle,
    retry: RetryPolicy,
}

impl SocketInputConfig {
    pub fn new(rt: Handle, retry: RetryPolicy) -> Self {
        Self { rt, retry }
    }
}

impl InputBuilder for SocketInputConfig {
    fn build(&self, endpoint: &SourceEndpoint) -> PipelineResult<Box<dyn InputReader>> {
        Ok(Box::new(SocketInput::connect(
            &self.rt,
            endpoint.clone(),
            self.retry,
        )))
    }
}

/// Drains lines buffered by a background connection task.
pub struct SocketInput {
    lines_rx: mpsc::UnboundedReceiver<String>,
    state_rx: watch::Receiver<LinkState>,
    task: JoinHandle<()>,
}

impl SocketInput {
    /// Start connecting in the background; returns immediately.
    pub fn connect(rt: &Handle, endpoint: SourceEndpoint, retry: RetryPolicy) -> Self {
        let (lines_tx, lines_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(LinkState::Connecting);
        let task = rt.spawn(read_lines(endpoint, retry, lines_tx, state_tx));
        Self {
            lines_rx,
            state_rx,
            task,
        }
    }
}

impl InputReader for SocketInput {
    fn next_batch(&mut self, _since: DateTime<Utc>) -> Result<Vec<String>, SourceError> {
        // Read the state before draining. The task sends every line
        // before publishing a new state, so a drain after seeing
        // `GaveUp` can't miss anything.
        let state = self.state_rx.borrow().clone();
        let mut batch = Vec::new();
        while let Ok(line) = self.lines_rx.try_recv() {
            batch.push(line);
        }
        // Buffered lines are delivered before any error.
        if !batch.is_empty() {
            return Ok(batch);
        }

        match state {
            LinkState::Connected => Ok(batch),
            LinkState::Connecting => Err(SourceError::Transient("connecting".into())),
            LinkState::Retrying { attempt, reason } => Err(SourceError::Transient(format!(
                "attempt {attempt} failed: {reason}"
            ))),
            LinkState::GaveUp { reason } => Err(SourceError::Unavailable(reason)),
        }
    }
}

impl Drop for SocketInput {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[tracing::instrument(name = "socket_input", skip_all, fields(endpoint = %endpoint))]
async fn read_lines(
    endpoint: SourceEndpoint,
    retry: RetryPolicy,
    lines_tx: mpsc::UnboundedSender<String>,
    state_tx: watch::Sender<LinkState>,
) {
    let mut failures = 0;
    loop {
        let reason = match TcpStream::connect((endpoint.host.clone(), endpoint.port)).await {
            Ok(stream) => {
                tracing::info!("Connected to source {endpoint}");
                failures = 0;
                state_tx.send_replace(LinkState::Connected);

                let mut reader = BufReader::new(stream);
                loop {
                    match next_line(&mut reader).await {
                        Ok(Some(line)) => {
                            tracing::trace!("Received {line:?}");
                            if lines_tx.send(line).is_err() {
                                // Reader was dropped.
                                return;
                            }
                        }
                        Ok(None) => break "connection closed by source".to_string(),
                        Err(err) => break format!("read error: {err}"),
                    }
                }
            }
            Err(err) => format!("connect error: {err}"),
        };

        failures += 1;
        if failures >= retry.max_attempts {
            tracing::error!("Giving up on source {endpoint} after {failures} attempts: {reason}");
            state_tx.send_replace(LinkState::GaveUp { reason });
            return;
        }

        let delay = retry.delay_for(failures);
        tracing::warn!("Source {endpoint} attempt {failures} failed: {reason}; retrying in {delay:?}");
        state_tx.send_replace(LinkState::Retrying {
            attempt: failures,
            reason,
        });
        tokio::time::sleep(delay).await;
    }
}

/// Read one line, without its `\n` or `\r\n`. Bytes that aren't
/// UTF-8 become U+FFFD. A last line without a newline still counts.
async fn next_line<R>(reader: &mut R) -> std::io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    if reader.read_until(b'\n', &mut buf).await? == 0 {
        return Ok(None);
    }
    if buf.last() == Some(&b'\n') {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
    }
    Ok(Some(String::from_utf8_lossy(&buf).into_owned()))
}
