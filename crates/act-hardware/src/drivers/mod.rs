//! Device-level code: the Modbus-RTU frame codec, the motion controller, and the
//! simulated devices used by tests and dry runs.

pub mod actuator;
pub mod mock;
#[cfg(test)]
pub mod mock_serial;
pub mod modbus_frame;
