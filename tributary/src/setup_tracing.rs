use std::any::Any;
use std::panic::PanicHookInfo;

use tracing_subscriber::filter::{EnvFilter, LevelFilter};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{Layer, fmt};

/// Installs the global subscriber.
///
/// Lines are flattened JSON carrying the fields of the enclosing `stream` span (`topic`,
/// `partition`, `client_id`). `TRIBUTARY_DEBUG=true` switches to human readable text at `debug`
/// level. `RUST_LOG` overrides the level either way.
pub(super) fn register() {
    let debug_mode =
        std::env::var("TRIBUTARY_DEBUG").is_ok_and(|v| v.eq_ignore_ascii_case("true"));
    let default_level = if debug_mode {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    let filter = EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env_lossy();

    let layer = if debug_mode {
        fmt::layer().with_target(false).boxed()
    } else {
        fmt::layer()
            .with_ansi(false)
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_span_list(false)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(layer)
        .init();

    std::panic::set_hook(Box::new(log_panic));
}

/// Emits panics as a single structured log line.
fn log_panic(info: &PanicHookInfo<'_>) {
    let message = panic_message(info.payload());
    match info.location() {
        Some(location) => tracing::error!(
            file = location.file(),
            line = location.line(),
            panic = message,
            "Panicked"
        ),
        None => tracing::error!(panic = message, "Panicked"),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}
