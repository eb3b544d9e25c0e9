//! Link discovery: probe the preferred endpoint, then scan.
//!
//! An endpoint only counts as connected once it has answered the position probe
//! with a CRC-valid frame. Opening a port is not enough: a machine with several
//! virtual serial ports would otherwise bind to whichever mute one opens first.
//!
//! # Algorithm
//!
//! 1. Try the caller's endpoint, or the platform default when none is given.
//! 2. On any failure (open error, silence, short frame, bad CRC), close it and scan
//!    the candidate list in order, pausing briefly after each failure.
//! 3. The first endpoint that validates gets the initialization sequence and
//!    becomes the [`ModbusLink`].
//! 4. If nothing validates, return [`ActError::NoResponsiveDevice`].

use std::time::Duration;

use act_core::serial::DynSerial;
use act_core::{ActError, ActResult};
use async_trait::async_trait;
use tokio::time::sleep;
use tracing::{debug, info, instrument, warn};

use crate::config::ActuatorConfig;
use crate::port_resolver;
use crate::transport::{FrameTiming, TimedTransport};

/// Opens endpoints by name.
///
/// The seam between discovery and the OS. Tests substitute
/// [`crate::drivers::mock::MockPortOpener`].
#[async_trait]
pub trait PortOpener: Send + Sync {
    /// Open and configure `endpoint` at `baud_rate`, 8-N-1, no flow control.
    async fn open(&self, endpoint: &str, baud_rate: u32) -> ActResult<DynSerial>;
}

/// Opens real serial ports via `tokio-serial`.
///
/// By-id names are resolved to their device node first.
#[cfg(feature = "serial")]
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeSerialOpener;

#[cfg(feature = "serial")]
#[async_trait]
impl PortOpener for NativeSerialOpener {
    async fn open(&self, endpoint: &str, baud_rate: u32) -> ActResult<DynSerial> {
        let device = port_resolver::resolve_endpoint(endpoint);
        let stream = act_core::serial::open_serial_async(&device, baud_rate, "actuator").await?;
        Ok(Box::new(stream))
    }
}

/// A validated, initialized link to the actuator.
///
/// Move-only: exactly one owner at a time. Closing consumes it.
#[derive(Debug)]
pub struct ModbusLink {
    transport: TimedTransport,
    requested: Option<String>,
}

impl ModbusLink {
    /// Endpoint the link is bound to.
    pub fn port_name(&self) -> &str {
        self.transport.endpoint()
    }

    /// Endpoint the caller asked for, if any.
    pub fn requested(&self) -> Option<&str> {
        self.requested.as_deref()
    }

    /// Set when the caller asked for one endpoint and discovery bound another.
    pub fn fallback_notice(&self) -> Option<String> {
        match &self.requested {
            Some(requested) if requested != self.port_name() => Some(format!(
                "Requested {} not responsive, using {}",
                requested,
                self.port_name()
            )),
            _ => None,
        }
    }

    /// The underlying transport.
    pub fn transport(&mut self) -> &mut TimedTransport {
        &mut self.transport
    }

    /// Close the port.
    pub async fn close(self) {
        self.transport.close().await;
    }
}

/// Finds and initializes the actuator.
pub struct LinkDiscovery {
    opener: Box<dyn PortOpener>,
    baud_rate: u32,
    timing: FrameTiming,
    scan_settle: Duration,
    candidates: Vec<String>,
    probe: Vec<u8>,
    init: Vec<Vec<u8>>,
}

impl std::fmt::Debug for LinkDiscovery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkDiscovery")
            .field("baud_rate", &self.baud_rate)
            .field("candidates", &self.candidates.len())
            .finish_non_exhaustive()
    }
}

impl LinkDiscovery {
    /// Build from configuration. Fails if a command literal does not decode.
    pub fn new(opener: Box<dyn PortOpener>, config: &ActuatorConfig) -> ActResult<Self> {
        let frames = config.commands.frames()?;
        Ok(Self {
            opener,
            baud_rate: config.connection.baud_rate,
            timing: config.frame_timing(),
            scan_settle: Duration::from_millis(config.connection.scan_settle_ms),
            candidates: config.candidates(),
            probe: frames.probe,
            init: frames.init,
        })
    }

    /// Scan list in order.
    pub fn candidates(&self) -> &[String] {
        &self.candidates
    }

    /// Find a responsive endpoint, initialize it and hand back the link.
    ///
    /// `preferred` is tried first; `None` or an empty name means the platform
    /// default. The preferred endpoint is not probed a second time during the scan.
    #[instrument(skip(self), err)]
    pub async fn discover(&self, preferred: Option<&str>) -> ActResult<ModbusLink> {
        let requested = preferred.filter(|p| !p.is_empty()).map(str::to_string);
        let first = requested
            .clone()
            .unwrap_or_else(|| port_resolver::default_port().to_string());

        let mut tried = 1usize;
        match self.try_endpoint(&first).await {
            Ok(transport) => return Ok(self.bind(transport, requested)),
            Err(e) => debug!(endpoint = %first, error = %e, "Preferred endpoint unusable, scanning"),
        }

        for candidate in self.candidates.iter().filter(|c| **c != first) {
            tried += 1;
            match self.try_endpoint(candidate).await {
                Ok(transport) => return Ok(self.bind(transport, requested)),
                Err(e) => {
                    debug!(endpoint = %candidate, error = %e, "Candidate unusable");
                    sleep(self.scan_settle).await;
                }
            }
        }

        if let Some(requested) = &requested {
            warn!("Requested {} not found or unresponsive.", requested);
        }
        Err(ActError::NoResponsiveDevice { tried })
    }

    /// Open, probe and initialize one endpoint. The port is closed on failure.
    async fn try_endpoint(&self, endpoint: &str) -> ActResult<TimedTransport> {
        let port = self.opener.open(endpoint, self.baud_rate).await?;
        let mut transport = TimedTransport::new(port, endpoint, self.timing);

        match self.probe_and_init(&mut transport).await {
            Ok(()) => Ok(transport),
            Err(e) => {
                transport.close().await;
                Err(e)
            }
        }
    }

    async fn probe_and_init(&self, transport: &mut TimedTransport) -> ActResult<()> {
        let response = transport.transact(&self.probe).await?;
        response.verify()?;
        debug!(endpoint = %transport.endpoint(), "Probe answered");

        transport.send_sequence(&self.init).await?;
        // The init reads leave their replies queued; clear them.
        transport.drain().await;
        Ok(())
    }

    fn bind(&self, transport: TimedTransport, requested: Option<String>) -> ModbusLink {
        let link = ModbusLink {
            transport,
            requested,
        };
        if let Some(notice) = link.fallback_notice() {
            info!("{}", notice);
        }
        info!(port = %link.port_name(), "Actuator connected");
        link
    }
}
