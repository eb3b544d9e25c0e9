//! Deadline-bounded transport over an exclusively owned serial stream.
//!
//! `TimedTransport` layers the actuator's protocol timing on top of the raw
//! primitives in [`act_core::serial`]:
//!
//! - every write completes fully (`write_all` + `flush`) or fails the link
//! - every command in a multi-frame exchange is followed by the inter-frame delay
//! - reads give up at a deadline; an empty read is a normal outcome, not an error
//! - stale input can be drained before a read-sensitive exchange
//!
//! The transport is moved, never shared. Dropping or [`TimedTransport::close`]-ing it
//! closes the port.

use std::time::Duration;

use act_core::serial::{drain_until_quiet, read_some_until, BoundedRead, DynSerial};
use act_core::ActResult;
use tokio::io::AsyncWriteExt;
use tokio::time::{sleep, Instant};

use crate::drivers::modbus_frame::{parse_response, ResponseFrame};

/// Protocol timing used by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameTiming {
    /// Pause after every command of a multi-frame exchange
    pub inter_frame_delay: Duration,
    /// Pause between writing a request and reading its response
    pub probe_delay: Duration,
    /// Deadline for a complete response (header and tail)
    pub response_timeout: Duration,
    /// Quiet window that ends a drain
    pub drain_window: Duration,
    /// Length of each bounded read inside a drain
    pub drain_slice: Duration,
}

impl Default for FrameTiming {
    fn default() -> Self {
        Self {
            inter_frame_delay: Duration::from_millis(100),
            probe_delay: Duration::from_millis(50),
            response_timeout: Duration::from_millis(500),
            drain_window: Duration::from_millis(60),
            drain_slice: Duration::from_millis(20),
        }
    }
}

/// An open link to one endpoint.
pub struct TimedTransport {
    port: DynSerial,
    endpoint: String,
    timing: FrameTiming,
}

impl std::fmt::Debug for TimedTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimedTransport")
            .field("endpoint", &self.endpoint)
            .field("timing", &self.timing)
            .finish_non_exhaustive()
    }
}

impl TimedTransport {
    /// Wrap an open port.
    pub fn new(port: DynSerial, endpoint: impl Into<String>, timing: FrameTiming) -> Self {
        Self {
            port,
            endpoint: endpoint.into(),
            timing,
        }
    }

    /// Name of the endpoint this transport is bound to.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Timing in effect.
    pub fn timing(&self) -> &FrameTiming {
        &self.timing
    }

    /// Write a whole frame and flush it.
    ///
    /// Short writes are retried by `write_all`; an I/O error here is link-fatal.
    pub async fn write_frame(&mut self, frame: &[u8]) -> ActResult<()> {
        tracing::trace!(endpoint = %self.endpoint, tx = ?frame, "TX");
        self.port.write_all(frame).await?;
        self.port.flush().await?;
        Ok(())
    }

    /// Write a frame, then wait out the inter-frame delay.
    pub async fn send_command(&mut self, frame: &[u8]) -> ActResult<()> {
        self.write_frame(frame).await?;
        sleep(self.timing.inter_frame_delay).await;
        Ok(())
    }

    /// Send an ordered list of frames, each followed by the inter-frame delay.
    pub async fn send_sequence(&mut self, frames: &[Vec<u8>]) -> ActResult<()> {
        for frame in frames {
            self.send_command(frame).await?;
        }
        Ok(())
    }

    /// One bounded read. Returns no bytes if nothing arrives before `deadline`.
    pub async fn read_some_until(&mut self, deadline: Instant) -> ActResult<Vec<u8>> {
        let mut buf = [0u8; 64];
        let outcome = read_some_until(&mut self.port, &mut buf, deadline).await?;
        if let BoundedRead::Data(n) = outcome {
            tracing::trace!(endpoint = %self.endpoint, rx = ?&buf[..n], "RX");
            return Ok(buf[..n].to_vec());
        }
        Ok(Vec::new())
    }

    /// Best-effort read of trailing acknowledgements, bounded by `window`.
    ///
    /// A read error is logged and swallowed: the command frames are already on the
    /// wire, and a dead port shows up on the next write. Returns how many bytes
    /// were consumed.
    pub async fn consume_ack(&mut self, window: Duration) -> usize {
        match self.read_some_until(Instant::now() + window).await {
            Ok(bytes) => bytes.len(),
            Err(e) => {
                tracing::debug!(endpoint = %self.endpoint, error = %e, "Ack read failed, ignoring");
                0
            }
        }
    }

    /// Discard input until the line has been quiet for `window`.
    pub async fn drain_for(&mut self, window: Duration) -> usize {
        let discarded = drain_until_quiet(&mut self.port, window, self.timing.drain_slice).await;
        if discarded > 0 {
            tracing::debug!(endpoint = %self.endpoint, bytes = discarded, "Discarded stale bytes");
        }
        discarded
    }

    /// Drain with the configured quiet window.
    pub async fn drain(&mut self) -> usize {
        self.drain_for(self.timing.drain_window).await
    }

    /// Read one response frame within the response timeout.
    pub async fn read_response(&mut self) -> ActResult<ResponseFrame> {
        let deadline = Instant::now() + self.timing.response_timeout;
        let frame = parse_response(&mut self.port, deadline).await?;
        tracing::trace!(endpoint = %self.endpoint, rx = ?frame.as_bytes(), "RX frame");
        Ok(frame)
    }

    /// Write `request`, wait the probe delay, read one response.
    ///
    /// The CRC of the response is not checked here.
    pub async fn transact(&mut self, request: &[u8]) -> ActResult<ResponseFrame> {
        self.write_frame(request).await?;
        sleep(self.timing.probe_delay).await;
        self.read_response().await
    }

    /// Close the port.
    pub async fn close(mut self) {
        if let Err(e) = self.port.shutdown().await {
            tracing::debug!(endpoint = %self.endpoint, error = %e, "Error while closing port");
        }
    }
}
