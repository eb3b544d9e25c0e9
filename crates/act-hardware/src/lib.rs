//! Serial link to a Modbus-RTU linear actuator.
//!
//! - [`drivers::modbus_frame`]: frame hex decoding, CRC-16/MODBUS, response parsing
//! - [`transport`]: deadline-bounded reads and paced writes over an owned port
//! - [`discovery`]: probe-validated endpoint selection and device initialization
//! - [`drivers::actuator`]: relative, absolute and blocking moves, position reads
//!
//! # Example
//! ```no_run
//! use std::time::Duration;
//! use act_hardware::{ActuatorConfig, ActuatorController};
//!
//! # async fn run() -> act_core::ActResult<()> {
//! let config = ActuatorConfig::load()?;
//! let mut actuator = ActuatorController::with_native_serial(&config)?;
//! actuator.connect(config.connection.port.as_deref()).await?;
//! let settled = actuator
//!     .move_absolute_blocking(25, 10, Duration::from_secs(30), 1)
//!     .await?;
//! println!("settled at {settled}");
//! actuator.disconnect().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod discovery;
pub mod drivers;
pub mod port_resolver;
pub mod transport;

pub use config::{ActuatorConfig, CommandFrames, CommandTable};
#[cfg(feature = "serial")]
pub use discovery::NativeSerialOpener;
pub use discovery::{LinkDiscovery, ModbusLink, PortOpener};
pub use drivers::actuator::{ActuatorController, MotionMode, MotionRequest};
pub use drivers::mock::{MockPortOpener, SimBehavior, SimulatedActuator};
pub use transport::{FrameTiming, TimedTransport};
