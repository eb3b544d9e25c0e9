//! Serial port abstractions and deadline-bounded I/O primitives.
//!
//! Every read on the actuator link is bounded by an absolute deadline
//! (`tokio::time::Instant`), never by a retry count. The helpers here work on any
//! `AsyncRead`, so the same code drives a real `tokio_serial::SerialStream`, a
//! `tokio::io::DuplexStream` in tests, or a scripted mock.
//!
//! # Types
//!
//! - [`SerialPortIO`]: trait alias combining AsyncRead + AsyncWrite for serial ports
//! - [`DynSerial`]: type-erased boxed serial port
//! - [`BoundedRead`]: outcome of a single deadline-bounded read
//!
//! # Utilities
//!
//! - [`open_serial_async`]: open a port at 8N1 with spawn_blocking
//! - [`read_some_until`]: one read, or nothing once the deadline passes
//! - [`read_exact_until`]: fill a buffer completely before the deadline
//! - [`drain_until_quiet`]: discard input until the line has been quiet for a window

use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::time::Instant;

use crate::error::ActError;

/// Trait alias for async serial port I/O.
///
/// Any type implementing `AsyncRead + AsyncWrite + Unpin + Send` can be used
/// as a serial port. This includes:
/// - `tokio_serial::SerialStream` (real hardware)
/// - `tokio::io::DuplexStream` (testing)
/// - Any mock implementing the async I/O traits
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialPortIO for T {}

/// Type-erased boxed serial port.
///
/// The link owns exactly one of these at a time; it is moved, never shared.
pub type DynSerial = Box<dyn SerialPortIO>;

/// Outcome of a single deadline-bounded read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundedRead {
    /// `n` bytes were read (always > 0)
    Data(usize),
    /// The deadline passed with nothing to read
    Quiet,
    /// The stream reported end-of-file
    Closed,
}

impl BoundedRead {
    /// Number of bytes read, zero for `Quiet` and `Closed`.
    pub fn len(&self) -> usize {
        match self {
            BoundedRead::Data(n) => *n,
            _ => 0,
        }
    }

    /// True when no bytes were read.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Open a serial port asynchronously using spawn_blocking.
///
/// Line settings are fixed at 8 data bits, no parity, one stop bit and no flow
/// control. Only the baud rate varies.
///
/// # Errors
///
/// Returns [`ActError::Serial`] if the port cannot be opened, or [`ActError::Io`]
/// if the blocking task itself fails.
#[cfg(feature = "serial")]
pub async fn open_serial_async(
    port_path: &str,
    baud_rate: u32,
    device_name: &str,
) -> Result<tokio_serial::SerialStream, ActError> {
    use tokio::task::spawn_blocking;
    use tokio_serial::SerialPortBuilderExt;

    let port_path_owned = port_path.to_string();

    let stream = spawn_blocking(move || {
        tokio_serial::new(&port_path_owned, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
    })
    .await
    .map_err(|e| io::Error::other(format!("spawn_blocking for serial port opening failed: {e}")))?
    .map_err(|e| {
        tracing::debug!(device = device_name, port = port_path, error = %e, "Serial open failed");
        ActError::Serial(e)
    })?;

    tracing::debug!(device = device_name, port = port_path, baud_rate, "Serial port opened");
    Ok(stream)
}

/// Perform at most one read, giving up at `deadline`.
///
/// A passed deadline is not an error: it yields [`BoundedRead::Quiet`].
pub async fn read_some_until<R: AsyncRead + Unpin + ?Sized>(
    port: &mut R,
    buf: &mut [u8],
    deadline: Instant,
) -> io::Result<BoundedRead> {
    loop {
        match tokio::time::timeout_at(deadline, port.read(buf)).await {
            Ok(Ok(0)) => return Ok(BoundedRead::Closed),
            Ok(Ok(n)) => return Ok(BoundedRead::Data(n)),
            Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => continue,
            Ok(Err(e)) if e.kind() == io::ErrorKind::WouldBlock => {
                return Ok(BoundedRead::Quiet)
            }
            Ok(Err(e)) => return Err(e),
            Err(_elapsed) => return Ok(BoundedRead::Quiet),
        }
    }
}

/// Fill `buf` completely before `deadline`.
///
/// # Errors
///
/// [`ActError::ShortRead`] if the deadline passes or the stream closes first,
/// [`ActError::Io`] if the stream itself fails.
pub async fn read_exact_until<R: AsyncRead + Unpin + ?Sized>(
    port: &mut R,
    buf: &mut [u8],
    deadline: Instant,
) -> Result<(), ActError> {
    let expected = buf.len();
    let mut filled = 0usize;

    while filled < expected {
        match read_some_until(port, &mut buf[filled..], deadline).await? {
            BoundedRead::Data(n) => filled += n,
            BoundedRead::Quiet | BoundedRead::Closed => {
                return Err(ActError::ShortRead {
                    expected,
                    received: filled,
                });
            }
        }
    }

    Ok(())
}

/// Discard input until the line has been quiet for `window`.
///
/// Reads are issued in `slice`-sized steps. Every chunk that arrives pushes the
/// quiet deadline out to `now + window`, so a device that is still talking keeps
/// the drain going. Stops early on end-of-file or a read error.
///
/// Returns the number of bytes discarded.
pub async fn drain_until_quiet<R: AsyncRead + Unpin + ?Sized>(
    port: &mut R,
    window: Duration,
    slice: Duration,
) -> usize {
    let mut discard = [0u8; 256];
    let mut quiet_deadline = Instant::now() + window;
    let mut total_discarded = 0usize;

    loop {
        let now = Instant::now();
        if now >= quiet_deadline {
            break;
        }

        let slice_end = (now + slice).min(quiet_deadline);
        match read_some_until(port, &mut discard, slice_end).await {
            Ok(BoundedRead::Data(n)) => {
                total_discarded += n;
                quiet_deadline = Instant::now() + window;
            }
            Ok(BoundedRead::Quiet) => {}
            Ok(BoundedRead::Closed) | Err(_) => break,
        }
    }

    if total_discarded > 0 {
        tracing::trace!(bytes = total_discarded, "Drained stale input");
    }
    total_discarded
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_dyn_serial_with_duplex() {
        let (mut host, device) = tokio::io::duplex(64);
        let mut port: DynSerial = Box::new(device);

        host.write_all(b"\x01\x03\x02").await.unwrap();

        let mut buf = [0u8; 3];
        let deadline = Instant::now() + Duration::from_millis(100);
        read_exact_until(&mut port, &mut buf, deadline).await.unwrap();
        assert_eq!(buf, [0x01, 0x03, 0x02]);
    }

    #[tokio::test(start_paused = true)]
    async fn read_some_is_quiet_on_silent_line() {
        let (_host, mut device) = tokio::io::duplex(64);
        let mut buf = [0u8; 8];

        let start = Instant::now();
        let outcome = read_some_until(&mut device, &mut buf, start + Duration::from_millis(300))
            .await
            .unwrap();

        assert_eq!(outcome, BoundedRead::Quiet);
        assert!(outcome.is_empty());
        assert!(start.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn read_exact_reports_partial_count_on_deadline() {
        let (mut host, mut device) = tokio::io::duplex(64);
        host.write_all(&[0x01, 0x03]).await.unwrap();

        let mut buf = [0u8; 5];
        let err = read_exact_until(&mut device, &mut buf, Instant::now() + Duration::from_millis(500))
            .await
            .unwrap_err();

        match err {
            ActError::ShortRead { expected, received } => {
                assert_eq!(expected, 5);
                assert_eq!(received, 2);
            }
            other => panic!("expected ShortRead, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn read_exact_reports_short_read_on_eof() {
        let (mut host, mut device) = tokio::io::duplex(64);
        host.write_all(&[0xAA]).await.unwrap();
        drop(host);

        let mut buf = [0u8; 3];
        let err = read_exact_until(&mut device, &mut buf, Instant::now() + Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ActError::ShortRead {
                expected: 3,
                received: 1
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_discards_stale_bytes() {
        let (mut host, mut device) = tokio::io::duplex(64);
        host.write_all(b"stale data 12345").await.unwrap();

        let discarded = drain_until_quiet(
            &mut device,
            Duration::from_millis(60),
            Duration::from_millis(20),
        )
        .await;
        assert_eq!(discarded, 16);

        let mut buf = [0u8; 1];
        let outcome = read_some_until(&mut device, &mut buf, Instant::now() + Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(outcome, BoundedRead::Quiet);
    }

    #[tokio::test(start_paused = true)]
    async fn drain_window_extends_while_device_talks() {
        let (mut host, mut device) = tokio::io::duplex(64);

        let talker = tokio::spawn(async move {
            for _ in 0..3 {
                host.write_all(b"xx").await.unwrap();
                tokio::time::sleep(Duration::from_millis(40)).await;
            }
            host
        });

        let start = Instant::now();
        let discarded = drain_until_quiet(
            &mut device,
            Duration::from_millis(60),
            Duration::from_millis(20),
        )
        .await;

        assert_eq!(discarded, 6);
        // Last chunk lands at ~80 ms, so the drain cannot end before ~140 ms.
        assert!(start.elapsed() >= Duration::from_millis(140));
        let _host = talker.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn drain_on_silent_line_takes_one_window() {
        let (_host, mut device) = tokio::io::duplex(64);
        let start = Instant::now();
        let discarded = drain_until_quiet(
            &mut device,
            Duration::from_millis(60),
            Duration::from_millis(20),
        )
        .await;
        assert_eq!(discarded, 0);
        assert!(start.elapsed() >= Duration::from_millis(60));
        assert!(start.elapsed() < Duration::from_millis(80));
    }
}
