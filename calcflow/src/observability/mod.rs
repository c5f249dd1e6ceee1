//! Logging setup and timing helpers.

mod logging;
mod timing;

pub use logging::{init_logging, LogConfig};
pub use timing::SpanTimer;
