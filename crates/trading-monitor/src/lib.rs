//! Logging setup and alert delivery.

mod alerts;
mod logging;

pub use alerts::{ChannelAlertSink, LogAlertSink};
pub use logging::{setup_logging, LoggingError};
