//! Metrics and observability.
//!
//! - `events`: internal event types and the `InternalEvent` trait
//! - `server`: Prometheus HTTP server and initialization

pub mod events;
pub mod server;

pub use server::init;

/// Emit an internal event.
///
/// This macro calls the `InternalEvent::emit()` method on the given event,
/// which records the corresponding metric.
///
/// # Example
///
/// ```ignore
/// use gnss_logger::metrics::events::{EntriesDrained, FixBuffered};
///
/// emit!(FixBuffered);
/// emit!(EntriesDrained { count: 12 });
/// ```
#[macro_export]
macro_rules! emit {
    ($event:expr) => {
        $crate::metrics::events::InternalEvent::emit($event)
    };
}
