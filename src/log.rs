use std::sync::atomic::{AtomicBool, Ordering};

/// Global flag to control raw protocol frame logging
pub static PROTOCOL_DEBUG_ENABLED: AtomicBool = AtomicBool::new(false);

/// Set protocol frame logging on/off
pub fn set_protocol_debug(enabled: bool) {
    PROTOCOL_DEBUG_ENABLED.store(enabled, Ordering::Relaxed);
    tracing::info!(
        "Protocol frame logging {}",
        if enabled { "ENABLED" } else { "DISABLED" }
    );
}

/// Check if protocol frame logging is enabled
pub fn is_protocol_debug_enabled() -> bool {
    PROTOCOL_DEBUG_ENABLED.load(Ordering::Relaxed)
}

/// Protocol debug macro - only logs if protocol debug is enabled
#[macro_export]
macro_rules! protocol_debug {
    ($($arg:tt)*) => {
        if $crate::log::PROTOCOL_DEBUG_ENABLED.load(std::sync::atomic::Ordering::Relaxed) {
            tracing::debug!($($arg)*);
        }
    };
}
