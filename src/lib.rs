//! Hardware telemetry for Macs: temperatures, fans, power and voltages read from the System
//! Management Controller, with IOHID sensors and IOReport energy counters as fallbacks on Apple
//! silicon.
//!
//! ```no_run
//! # #[cfg(target_os = "macos")]
//! # fn main() -> Result<(), macstats::SmcError> {
//! let session = macstats::Session::system(macstats::Config::default());
//! if let Some(celsius) = session.temperature()? {
//!     println!("{} CPU: {:.1} °C", session.model_name(), celsius);
//! }
//! # Ok(())
//! # }
//! # #[cfg(not(target_os = "macos"))]
//! # fn main() {}
//! ```

pub mod chip;
pub mod config;
pub mod error;
pub mod sensors;
pub mod smc;
pub mod telemetry;

#[cfg(target_os = "macos")]
mod iokit;
#[cfg(target_os = "macos")]
mod utils;

#[cfg(test)]
mod test_utils;

pub use chip::{ChipGeneration, ChipTier, Classification, Confidence, CpuIdentity, classify};
pub use config::Config;
pub use error::{ConfigError, DecodeError, SmcError, TelemetryError};
pub use sensors::{KeyDump, Reading, Session, Snapshot};
pub use smc::{Connector, RawValue, SmcChannel, SmcKey};
pub use telemetry::{HidSensor, HidSensorKind, Telemetry};

#[cfg(target_os = "macos")]
pub use iokit::SystemTelemetry;
