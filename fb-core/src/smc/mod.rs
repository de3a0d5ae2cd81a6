//! Controller access: keys, wire codec, drivers and the session

pub mod codec;
pub mod driver;
pub mod key;
#[cfg(unix)]
pub mod port;
pub mod session;
pub mod simulated;

pub use codec::{DataType, FixedPoint};
pub use driver::{LinkError, SmcDriver, SmcLink};
pub use key::{ControllerKey, KeyInfo};
#[cfg(unix)]
pub use port::PortIoDriver;
pub use session::{ConnectionState, ControllerSession, RawTransaction, SessionHandle, SessionStatus};
pub use simulated::{ConnectFault, SimulatedDriver};
