//! Utility functions and helpers.

mod call_id;
mod cancel;
mod logging;
mod shutdown;

pub use call_id::CallId;
pub use cancel::CancelToken;
pub use logging::init_logging;
pub use shutdown::ShutdownSignal;
