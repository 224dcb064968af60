//! Actuator sink: pushes output vectors to Submarine
//!
//! The scheduler hands each tick's vector over a bounded queue; this task
//! POSTs them as JSON. Sink failures are logged and counted, never
//! propagated back to the scheduler: the next tick always proceeds.

use tokio::sync::mpsc;
use tracing::{debug, warn};

use kaleidoscope_host::OutputFrame;

use crate::metrics::{SINK_ERRORS, SINK_QUEUE_DEPTH};

/// Consume frames until the queue closes.
///
/// Addresses absent from a frame were not driven that tick; Submarine holds
/// its last value for them.
pub async fn run_sink(url: String, mut frames: mpsc::Receiver<OutputFrame>) {
    let client = reqwest::Client::new();
    debug!("actuator sink targeting {}", url);

    while let Some(frame) = frames.recv().await {
        SINK_QUEUE_DEPTH.set(frames.len() as i64);

        match client.post(&url).json(&frame).send().await {
            Ok(response) if response.status().is_success() => {}
            Ok(response) => {
                SINK_ERRORS.inc();
                warn!("actuator sink returned {}", response.status());
            }
            Err(err) => {
                SINK_ERRORS.inc();
                warn!("unable to push frame to actuator sink: {}", err);
            }
        }
    }

    debug!("actuator sink shutting down");
}
