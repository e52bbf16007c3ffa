//! Fatal, process-terminating error reporting.
//!
//! A failed topology declaration and a failed close are never recovered. They
//! are logged and handed to a [`FatalHook`]; the default hook terminates the
//! process. Construction errors are returned instead, see
//! `BusClient::connect_or_exit` for the terminating variant.

use std::fmt;
use std::sync::Arc;

use crate::BusError;

pub type FatalHook = Arc<dyn Fn(&BusError) + Send + Sync>;

/// The default hook. The error has already been logged when a hook runs.
pub fn exit_hook() -> FatalHook {
    Arc::new(|_: &BusError| terminate())
}

/// Logs `msg` at error level, flushes the logger and exits with code 1.
pub fn exit<M: fmt::Display>(msg: M) -> ! {
    log::error!("{msg}");
    terminate()
}

fn terminate() -> ! {
    log::logger().flush();
    crate::logger::flush();
    std::process::exit(1)
}

/// Logs a fatal error, passes it to `hook` and hands it back for propagation.
#[inline]
pub(crate) fn report(hook: &FatalHook, e: BusError) -> BusError {
    log::error!("{e}");
    hook(&e);
    e
}
