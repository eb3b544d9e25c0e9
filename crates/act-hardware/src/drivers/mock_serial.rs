//! Scripted serial port for byte-exact transport tests.
//!
//! [`new`] returns a connected pair:
//! - [`MockSerialPort`] goes to the code under test as its `DynSerial`
//! - [`MockDeviceHarness`] stays in the test, asserts on written frames and plays
//!   the device side: replies, read faults, or silence
//!
//! Dropping the harness unplugs the port: writes fail with `BrokenPipe` and reads
//! return end-of-file.
//!
//! # Example
//!
//! ```rust,ignore
//! let (port, mut harness) = mock_serial::new();
//! let mut transport = TimedTransport::new(Box::new(port), "mock0", FrameTiming::default());
//!
//! let (frame, ()) = tokio::join!(
//!     transport.transact(&probe),
//!     harness.expect_and_respond(&probe, &read_holding_response(&[0u8; 32])),
//! );
//! ```

use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// How long [`MockDeviceHarness::expect_frame`] waits for bytes.
const EXPECT_TIMEOUT: Duration = Duration::from_secs(2);

/// What the device side delivers to the next read.
type Delivery = io::Result<Vec<u8>>;

/// Port side of the pair.
#[derive(Debug)]
pub struct MockSerialPort {
    tx_frames: UnboundedSender<Vec<u8>>,
    rx_deliveries: UnboundedReceiver<Delivery>,
    pending: VecDeque<u8>,
}

/// Device side of the pair.
#[derive(Debug)]
pub struct MockDeviceHarness {
    rx_frames: UnboundedReceiver<Vec<u8>>,
    tx_deliveries: UnboundedSender<Delivery>,
    unasserted: Vec<u8>,
}

/// Build a connected port and harness.
pub fn new() -> (MockSerialPort, MockDeviceHarness) {
    let (tx_frames, rx_frames) = mpsc::unbounded_channel();
    let (tx_deliveries, rx_deliveries) = mpsc::unbounded_channel();

    (
        MockSerialPort {
            tx_frames,
            rx_deliveries,
            pending: VecDeque::new(),
        },
        MockDeviceHarness {
            rx_frames,
            tx_deliveries,
            unasserted: Vec::new(),
        },
    )
}

impl MockSerialPort {
    fn copy_pending(&mut self, buf: &mut ReadBuf<'_>) {
        let n = buf.remaining().min(self.pending.len());
        let (head, tail) = self.pending.as_slices();
        if n <= head.len() {
            buf.put_slice(&head[..n]);
        } else {
            buf.put_slice(head);
            buf.put_slice(&tail[..n - head.len()]);
        }
        self.pending.drain(..n);
    }
}

impl AsyncRead for MockSerialPort {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.pending.is_empty() {
            match self.rx_deliveries.poll_recv(cx) {
                Poll::Ready(Some(Ok(bytes))) => self.pending.extend(bytes),
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Err(e)),
                // Harness gone: end-of-file
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
        self.copy_pending(buf);
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for MockSerialPort {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let sent = self.tx_frames.send(buf.to_vec());
        Poll::Ready(
            sent.map(|()| buf.len())
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "mock harness dropped")),
        )
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl MockDeviceHarness {
    /// Queue bytes for the port to read, as if the device had sent them.
    ///
    /// # Errors
    /// Returns error if the port has been dropped.
    pub fn send_frame(&self, data: &[u8]) -> Result<(), &'static str> {
        self.tx_deliveries
            .send(Ok(data.to_vec()))
            .map_err(|_| "mock port dropped")
    }

    /// Make the next read on the port fail with `kind`.
    ///
    /// # Errors
    /// Returns error if the port has been dropped.
    pub fn send_read_error(&self, kind: io::ErrorKind) -> Result<(), &'static str> {
        self.tx_deliveries
            .send(Err(io::Error::new(kind, "injected read fault")))
            .map_err(|_| "mock port dropped")
    }

    /// Wait for the port to write `expected` and assert it byte for byte.
    ///
    /// Extra bytes stay buffered for the next call.
    ///
    /// # Panics
    /// If the bytes do not arrive within two seconds or do not match.
    pub async fn expect_frame(&mut self, expected: &[u8]) {
        while self.unasserted.len() < expected.len() {
            match tokio::time::timeout(EXPECT_TIMEOUT, self.rx_frames.recv()).await {
                Ok(Some(chunk)) => self.unasserted.extend_from_slice(&chunk),
                Ok(None) => panic!("port dropped while expecting {expected:02x?}"),
                Err(_) => panic!(
                    "timed out waiting for {expected:02x?}, have {:02x?}",
                    self.unasserted
                ),
            }
        }

        let written: Vec<u8> = self.unasserted.drain(..expected.len()).collect();
        assert_eq!(written, expected, "unexpected frame on the wire");
    }

    /// Wait for `request`, then queue `reply`.
    pub async fn expect_and_respond(&mut self, request: &[u8], reply: &[u8]) {
        self.expect_frame(request).await;
        self.send_frame(reply).expect("port dropped before reply");
    }

    /// Everything written so far that has not been asserted, without waiting.
    pub fn take_writes(&mut self) -> Vec<u8> {
        while let Ok(chunk) = self.rx_frames.try_recv() {
            self.unasserted.extend_from_slice(&chunk);
        }
        std::mem::take(&mut self.unasserted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn split_writes_are_reassembled() {
        let (mut port, mut harness) = new();
        port.write_all(&[0x01, 0x05]).await.unwrap();
        port.write_all(&[0x00, 0x1a]).await.unwrap();

        harness.expect_frame(&[0x01, 0x05, 0x00]).await;
        assert_eq!(harness.take_writes(), vec![0x1a]);
    }

    #[tokio::test]
    async fn replies_are_read_in_pieces() {
        let (mut port, harness) = new();
        harness.send_frame(&[0x01, 0x03, 0x02]).unwrap();

        let mut first = [0u8; 2];
        port.read_exact(&mut first).await.unwrap();
        let mut rest = [0u8; 1];
        port.read_exact(&mut rest).await.unwrap();
        assert_eq!((first, rest), ([0x01, 0x03], [0x02]));
    }

    #[tokio::test]
    async fn injected_read_error_surfaces_once() {
        let (mut port, harness) = new();
        harness.send_read_error(io::ErrorKind::InvalidData).unwrap();
        harness.send_frame(&[0xAA]).unwrap();

        let mut buf = [0u8; 4];
        let err = port.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert_eq!(port.read(&mut buf).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn dropped_harness_reads_as_eof() {
        let (mut port, harness) = new();
        drop(harness);

        let mut buf = [0u8; 4];
        assert_eq!(port.read(&mut buf).await.unwrap(), 0);
        assert!(port.write_all(&[0x01]).await.is_err());
    }
}
