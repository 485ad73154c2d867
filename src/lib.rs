//! Screen recorder - display and audio capture encoded into a single MP4.
//!
//! Capture sources feed one encoder thread per stream; both write into a
//! shared container that starts once every track has announced its format.

pub mod capture;
pub mod container;
pub mod encoder;
pub mod recorder;
pub mod utils;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub use recorder::{Capabilities, PipelineController, PipelineState, ResultCallback};
pub use utils::error::{PipelineError, PipelineResult};

/// Install the global tracing subscriber. `RUST_LOG` overrides the default
/// filter.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "screen_recorder=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
