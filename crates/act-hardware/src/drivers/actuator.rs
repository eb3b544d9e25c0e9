//! Motion controller for the Modbus-RTU linear actuator.
//!
//! Converts logical positions and speeds into device frames, sends them over the
//! exclusively owned [`ModbusLink`], and confirms blocking moves by polling the
//! position block until it settles within tolerance or the deadline passes.
//!
//! # Units
//!
//! Positions are in external units. The device counts in raw units 100x finer;
//! readback is rounded half away from zero.
//!
//! # Speed clamping
//!
//! Non-blocking relative moves clamp speed to `1..=motion.max_relative_speed`.
//! Blocking relative moves and all absolute moves only enforce the lower bound
//! (and saturate at the 16-bit register width).
//!
//! # Failure handling
//!
//! - Every operation on a closed link fails with [`ActError::NotConnected`] before
//!   any I/O.
//! - A transport fault during any operation drops the link; `is_connected` then
//!   reports `false` and the caller must reconnect.
//! - Position reads come in two forms. [`ActuatorController::read_position`]
//!   reports checksum and framing faults. [`ActuatorController::get_current_position`]
//!   degrades them to `0` with a warning.

use std::time::Duration;

use act_core::{ActError, ActResult};
use tokio::time::{sleep, Instant};
use tracing::{debug, info, instrument, warn};

use crate::config::{ActuatorConfig, CommandFrames, MotionConfig};
use crate::discovery::{LinkDiscovery, ModbusLink, PortOpener};
use crate::drivers::modbus_frame::{
    absolute_speed_frame, absolute_target_frame, raw_to_external, relative_move_frame,
    RAW_PER_UNIT,
};
use crate::transport::TimedTransport;

/// Frame offset of the signed position word in the position-block response.
const POSITION_OFFSET: usize = 5;

/// Whether a move is a displacement or a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotionMode {
    /// Move by a signed displacement
    Relative,
    /// Move to an absolute position
    Absolute,
}

/// One blocking move, built per call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MotionRequest {
    /// Relative or absolute
    pub mode: MotionMode,
    /// Displacement or target, in external units
    pub value: i32,
    /// Requested speed before clamping
    pub speed: i32,
    /// Allowed |actual - expected|
    pub tolerance: u32,
    /// Settle deadline, measured from the end of the command exchange
    pub timeout: Duration,
}

impl MotionRequest {
    /// Relative move by `delta`.
    pub fn relative(delta: i32, speed: i32, timeout: Duration, tolerance: u32) -> Self {
        Self {
            mode: MotionMode::Relative,
            value: delta,
            speed,
            tolerance,
            timeout,
        }
    }

    /// Absolute move to `target`.
    pub fn absolute(target: i32, speed: i32, timeout: Duration, tolerance: u32) -> Self {
        Self {
            mode: MotionMode::Absolute,
            value: target,
            speed,
            tolerance,
            timeout,
        }
    }
}

/// Speed written by a relative move.
pub fn relative_speed(speed: i32, max: i32) -> u16 {
    let max = max.clamp(1, i32::from(u16::MAX));
    speed.clamp(1, max) as u16
}

/// Speed written by an absolute move. No upper clamp beyond the register width.
pub fn absolute_speed(speed: i32) -> u16 {
    speed.clamp(1, i32::from(u16::MAX)) as u16
}

/// Absolute target in device units, clamped to `0..=0xFFFF`.
pub fn absolute_target_raw(target: i32) -> u16 {
    (i64::from(target) * i64::from(RAW_PER_UNIT)).clamp(0, 0xFFFF) as u16
}

/// Position an absolute move to `target` is expected to settle at.
pub fn expected_absolute(target: i32) -> i32 {
    (i32::from(absolute_target_raw(target)) + RAW_PER_UNIT / 2) / RAW_PER_UNIT
}

/// Position a relative move by `delta` from `start` is expected to settle at.
pub fn expected_relative(start: i32, delta: i32) -> i32 {
    start.saturating_add(delta).max(0)
}

fn connected(link: &mut Option<ModbusLink>) -> ActResult<&mut TimedTransport> {
    link.as_mut()
        .map(ModbusLink::transport)
        .ok_or(ActError::NotConnected)
}

/// Controller for one actuator.
///
/// Holds at most one [`ModbusLink`]. All operations take `&mut self`, so the link
/// can never be driven by two callers at once.
#[derive(Debug)]
pub struct ActuatorController {
    discovery: LinkDiscovery,
    frames: CommandFrames,
    motion: MotionConfig,
    ack_window: Duration,
    reset_ack_window: Duration,
    poll_interval: Duration,
    link: Option<ModbusLink>,
}

impl ActuatorController {
    /// Build a disconnected controller. Validates `config`.
    pub fn new(config: &ActuatorConfig, opener: Box<dyn PortOpener>) -> ActResult<Self> {
        config.validate()?;
        Ok(Self {
            discovery: LinkDiscovery::new(opener, config)?,
            frames: config.commands.frames()?,
            motion: config.motion.clone(),
            ack_window: Duration::from_millis(config.timing.ack_window_ms),
            reset_ack_window: Duration::from_millis(config.timing.reset_ack_window_ms),
            poll_interval: Duration::from_millis(config.timing.poll_interval_ms),
            link: None,
        })
    }

    /// Controller that opens real serial ports.
    #[cfg(feature = "serial")]
    pub fn with_native_serial(config: &ActuatorConfig) -> ActResult<Self> {
        Self::new(config, Box::new(crate::discovery::NativeSerialOpener))
    }

    /// Motion defaults and limits in effect.
    pub fn motion_config(&self) -> &MotionConfig {
        &self.motion
    }

    /// Discover and initialize the actuator.
    ///
    /// Returns immediately, without any I/O, if already connected.
    #[instrument(skip(self), err)]
    pub async fn connect(&mut self, preferred: Option<&str>) -> ActResult<()> {
        if self.link.is_some() {
            debug!("Already connected");
            return Ok(());
        }
        let link = self.discovery.discover(preferred).await?;
        self.link = Some(link);
        Ok(())
    }

    /// Close the link. A no-op when disconnected.
    pub async fn disconnect(&mut self) {
        if let Some(link) = self.link.take() {
            info!(port = %link.port_name(), "Disconnecting");
            link.close().await;
        }
    }

    /// True while a link is held.
    pub fn is_connected(&self) -> bool {
        self.link.is_some()
    }

    /// Endpoint of the open link.
    pub fn port_name(&self) -> Option<&str> {
        self.link.as_ref().map(ModbusLink::port_name)
    }

    /// Discrepancy notice from the last discovery, if the requested endpoint was not used.
    pub fn fallback_notice(&self) -> Option<String> {
        self.link.as_ref().and_then(ModbusLink::fallback_notice)
    }

    /// Send the reset sequence, then consume trailing acknowledgements.
    #[instrument(skip(self), err)]
    pub async fn reset(&mut self) -> ActResult<()> {
        let transport = connected(&mut self.link)?;
        let reset = &self.frames.reset;
        let ack_window = self.reset_ack_window;
        let result: ActResult<()> = async {
            transport.send_sequence(reset).await?;
            transport.consume_ack(ack_window).await;
            Ok(())
        }
        .await;
        self.check_link(result).await
    }

    /// Start a relative move. Returns once the command exchange is done.
    ///
    /// Speed is clamped to `1..=motion.max_relative_speed`. A zero delta sends nothing.
    #[instrument(skip(self), err)]
    pub async fn move_relative(&mut self, delta: i32, speed: i32) -> ActResult<()> {
        let speed = relative_speed(speed, self.motion.max_relative_speed);
        self.send_relative(delta, speed).await
    }

    async fn send_relative(&mut self, delta: i32, speed: u16) -> ActResult<()> {
        let transport = connected(&mut self.link)?;
        if delta == 0 {
            return Ok(());
        }

        let frames = &self.frames;
        let ack_window = self.ack_window;
        let result: ActResult<()> = async {
            transport.send_command(&relative_move_frame(speed, delta)).await?;
            transport.send_command(&frames.trigger).await?;
            if delta < 0 {
                transport.send_command(&frames.negative_ack).await?;
            }
            transport.consume_ack(ack_window).await;
            Ok(())
        }
        .await;
        self.check_link(result).await
    }

    /// Start an absolute move. Returns once the command exchange is done.
    #[instrument(skip(self), err)]
    pub async fn move_absolute(&mut self, target: i32, speed: i32) -> ActResult<()> {
        let speed = absolute_speed(speed);
        let target_raw = absolute_target_raw(target);
        let transport = connected(&mut self.link)?;

        let frames = &self.frames;
        let ack_window = self.ack_window;
        let result: ActResult<()> = async {
            transport.send_command(&absolute_speed_frame(speed)).await?;
            transport.send_command(&absolute_target_frame(target_raw)).await?;
            transport.send_sequence(&frames.absolute_tail).await?;
            transport.consume_ack(ack_window).await;
            Ok(())
        }
        .await;
        self.check_link(result).await
    }

    /// Absolute move to position 0.
    pub async fn move_to_origin(&mut self, speed: i32) -> ActResult<()> {
        self.move_absolute(0, speed).await
    }

    /// Read the live position, reporting any fault.
    #[instrument(skip(self), err)]
    pub async fn read_position(&mut self) -> ActResult<i32> {
        let transport = connected(&mut self.link)?;
        let probe = &self.frames.probe;
        let result: ActResult<i32> = async {
            transport.drain().await;
            let response = transport.transact(probe).await?;
            response.verify()?;
            let raw = response.i16_be_at(POSITION_OFFSET).ok_or_else(|| {
                ActError::MalformedResponse(format!(
                    "{}-byte response has no position word",
                    response.len()
                ))
            })?;
            Ok(raw_to_external(raw))
        }
        .await;
        self.check_link(result).await
    }

    /// Read the live position, degrading every fault to `0`.
    pub async fn get_current_position(&mut self) -> i32 {
        match self.read_position().await {
            Ok(position) => position,
            Err(ActError::NotConnected) => 0,
            Err(e) => {
                warn!(error = %e, "Position read failed, reporting 0");
                0
            }
        }
    }

    /// Relative move that waits until the position settles.
    ///
    /// The expected position is `max(0, start + delta)` with `start` read first.
    /// Only the lower speed bound applies here; `max_relative_speed` does not.
    /// Returns the settled position.
    #[instrument(skip(self), err)]
    pub async fn move_relative_blocking(
        &mut self,
        delta: i32,
        speed: i32,
        timeout: Duration,
        tolerance: u32,
    ) -> ActResult<i32> {
        self.check_blocking(timeout)?;
        if delta == 0 {
            return Err(ActError::InvalidParameter(
                "relative move of zero".to_string(),
            ));
        }

        let start = self.poll_position().await?;
        let expected = expected_relative(start, delta);
        self.send_relative(delta, absolute_speed(speed)).await?;
        self.wait_settled(expected, tolerance, timeout).await
    }

    /// Absolute move that waits until the position settles.
    ///
    /// The expected position is the clamped target rounded back to external units.
    /// Returns the settled position.
    #[instrument(skip(self), err)]
    pub async fn move_absolute_blocking(
        &mut self,
        target: i32,
        speed: i32,
        timeout: Duration,
        tolerance: u32,
    ) -> ActResult<i32> {
        self.check_blocking(timeout)?;

        let expected = expected_absolute(target);
        self.move_absolute(target, speed).await?;
        self.wait_settled(expected, tolerance, timeout).await
    }

    /// Run a blocking move described by `request`.
    pub async fn execute(&mut self, request: &MotionRequest) -> ActResult<i32> {
        match request.mode {
            MotionMode::Relative => {
                self.move_relative_blocking(
                    request.value,
                    request.speed,
                    request.timeout,
                    request.tolerance,
                )
                .await
            }
            MotionMode::Absolute => {
                self.move_absolute_blocking(
                    request.value,
                    request.speed,
                    request.timeout,
                    request.tolerance,
                )
                .await
            }
        }
    }

    fn check_blocking(&self, timeout: Duration) -> ActResult<()> {
        if self.link.is_none() {
            return Err(ActError::NotConnected);
        }
        if timeout.is_zero() {
            return Err(ActError::InvalidParameter(
                "settle timeout must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Position for the settle loop: framing faults read as `0`, link faults propagate.
    async fn poll_position(&mut self) -> ActResult<i32> {
        match self.read_position().await {
            Ok(position) => Ok(position),
            Err(e) if e.is_link_fatal() || matches!(e, ActError::NotConnected) => Err(e),
            Err(e) => {
                warn!(error = %e, "Position read failed, reporting 0");
                Ok(0)
            }
        }
    }

    async fn wait_settled(
        &mut self,
        expected: i32,
        tolerance: u32,
        timeout: Duration,
    ) -> ActResult<i32> {
        let deadline = Instant::now() + timeout;

        loop {
            sleep(self.poll_interval).await;
            let actual = self.poll_position().await?;
            if actual.abs_diff(expected) <= tolerance {
                debug!(expected, actual, "Motion settled");
                return Ok(actual);
            }
            if Instant::now() >= deadline {
                return Err(ActError::SettleTimeout {
                    expected,
                    actual,
                    timeout,
                });
            }
        }
    }

    /// Drop the link if `result` carries a transport fault.
    async fn check_link<T>(&mut self, result: ActResult<T>) -> ActResult<T> {
        if let Err(e) = &result {
            if e.is_link_fatal() {
                if let Some(link) = self.link.take() {
                    warn!(port = %link.port_name(), error = %e, "Transport fault, dropping link");
                    link.close().await;
                }
            }
        }
        result
    }
}
