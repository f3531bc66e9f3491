//! Tracing subscriber bootstrap for hosts and examples that want console
//! output. Library code only emits `tracing` events; installing a
//! subscriber stays the embedder's call.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Initialize a fmt subscriber. `RUST_LOG` wins when set; otherwise
/// verbosity maps 0 -> info, 1 -> debug, 2+ -> trace for this crate.
pub fn init_tracing(verbosity: u8) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let local = match verbosity {
            0 => "info",
            1 => "debug",
            _ => "trace",
        };
        EnvFilter::new(format!("warn,stratum={local}"))
    });
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
