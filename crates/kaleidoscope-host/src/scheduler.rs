//! Fixed-rate tick loop on a dedicated thread
//!
//! Per tick: drain control commands, drain and route input events, run the
//! engine pipeline, hand the output vector to the sink queue, sleep to the
//! next boundary. An overrun is recorded and the deadline re-based, so
//! catch-up is capped at one tick and debt never accumulates.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::Timelike;
use crossbeam_channel::Receiver;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use kaleidoscope_core::{Address, Event, Value};

use crate::control::ControlCommand;
use crate::engine::Engine;
use crate::metrics;
use crate::program::TickContext;

/// One emitted output vector.
pub type OutputFrame = HashMap<Address, Value>;

/// Seconds since local midnight.
pub fn local_time_of_day() -> u32 {
    let now = chrono::Local::now().time();
    now.hour() * 60 * 60 + now.minute() * 60 + now.second()
}

/// The fixed-rate scheduler. Owns the engine; everything else talks to it
/// through channels.
pub struct Scheduler {
    engine: Engine,
    period: Duration,
    commands: Receiver<ControlCommand>,
    events: Receiver<Event>,
    frames: mpsc::Sender<OutputFrame>,
    epoch: Instant,
}

impl Scheduler {
    /// Build a scheduler around a finalized engine.
    pub fn new(
        engine: Engine,
        tick_rate_hz: u32,
        commands: Receiver<ControlCommand>,
        events: Receiver<Event>,
        frames: mpsc::Sender<OutputFrame>,
    ) -> Scheduler {
        let period = Duration::from_secs_f64(1.0 / f64::from(tick_rate_hz.max(1)));
        Scheduler {
            engine,
            period,
            commands,
            events,
            frames,
            epoch: Instant::now(),
        }
    }

    /// Run the loop forever. Call from a dedicated thread.
    pub fn run(mut self) {
        info!(
            "tick loop starting at {:.0} Hz ({:?} period)",
            1.0 / self.period.as_secs_f64(),
            self.period
        );
        let mut deadline = Instant::now() + self.period;
        loop {
            self.run_tick();

            let now = Instant::now();
            if now < deadline {
                std::thread::sleep(deadline - now);
                deadline += self.period;
            } else {
                // Overrun: proceed immediately and re-base the deadline so
                // at most one tick of catch-up is attempted.
                metrics::TICK_OVERRUNS.inc();
                debug!("tick overran its period by {:?}", now - deadline);
                deadline = now + self.period;
            }
        }
    }

    /// Execute exactly one tick. Exposed for integration tests.
    pub fn run_tick(&mut self) {
        // Control mutations apply at the tick boundary.
        while let Ok(command) = self.commands.try_recv() {
            self.engine.apply_command(command);
        }

        // Everything the input side produced since the last boundary.
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        if !events.is_empty() {
            metrics::EVENTS_RECEIVED.inc_by(events.len() as u64);
        }

        let ctx = TickContext {
            now: self.epoch.elapsed().as_secs_f64(),
            time_of_day: local_time_of_day(),
        };

        let started = Instant::now();
        let report = self.engine.tick(&ctx, events);
        metrics::TICKS.inc();
        metrics::TICK_DURATION.observe(started.elapsed().as_micros() as f64);

        if !report.frame.is_empty() {
            match self.frames.try_send(report.frame) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    metrics::FRAMES_DROPPED.inc();
                    warn!("sink queue full, dropping output frame");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!("sink queue closed, dropping output frame");
                }
            }
        }
    }

    /// Read access to the engine, for tests.
    pub fn engine(&self) -> &Engine {
        &self.engine
    }
}
