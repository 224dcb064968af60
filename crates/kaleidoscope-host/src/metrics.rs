//! Prometheus metrics for the scheduler and program evaluation
//!
//! Everything registers into the default registry; the control crate serves
//! the gathered families on its metrics listener.

use lazy_static::lazy_static;
use prometheus::{
    exponential_buckets, register_histogram, register_histogram_vec, register_int_counter,
    register_int_counter_vec, register_int_gauge, register_int_gauge_vec, Histogram, HistogramVec,
    IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
};

lazy_static! {
    /// Total ticks executed.
    pub static ref TICKS: IntCounter =
        register_int_counter!("kaleidoscope_ticks_total", "number of scheduler ticks executed")
            .unwrap();

    /// Full tick duration (evaluate + merge), microseconds.
    pub static ref TICK_DURATION: Histogram = register_histogram!(
        "kaleidoscope_tick_duration_us",
        "duration of one full tick, in microseconds",
        exponential_buckets(10.0, 1.5_f64.sqrt(), 16).unwrap()
    )
    .unwrap();

    /// Ticks that exceeded their period.
    pub static ref TICK_OVERRUNS: IntCounter = register_int_counter!(
        "kaleidoscope_tick_overruns_total",
        "number of ticks that exceeded the tick period"
    )
    .unwrap();

    /// Per-program evaluation duration, microseconds.
    pub static ref PROGRAM_TICK_DURATION: HistogramVec = register_histogram_vec!(
        "kaleidoscope_program_tick_duration_us",
        "per-program evaluation duration, in microseconds",
        &["program"],
        exponential_buckets(5.0, 1.5_f64.sqrt(), 16).unwrap()
    )
    .unwrap();

    /// Per-program soft budget overruns.
    pub static ref PROGRAM_BUDGET_OVERRUNS: IntCounterVec = register_int_counter_vec!(
        "kaleidoscope_program_budget_overruns_total",
        "evaluations that exceeded the per-program soft budget",
        &["program"]
    )
    .unwrap();

    /// Per-program consecutive failure counter.
    pub static ref PROGRAM_FAILURES: IntGaugeVec = register_int_gauge_vec!(
        "kaleidoscope_program_consecutive_failures",
        "consecutive script failures per program",
        &["program"]
    )
    .unwrap();

    /// Input events received from the control plane.
    pub static ref EVENTS_RECEIVED: IntCounter = register_int_counter!(
        "kaleidoscope_events_received_total",
        "input events received"
    )
    .unwrap();

    /// Events currently queued across all programs.
    pub static ref EVENT_QUEUE_DEPTH: IntGauge = register_int_gauge!(
        "kaleidoscope_event_queue_depth",
        "events queued across all program queues"
    )
    .unwrap();

    /// Number of programs loaded at startup.
    pub static ref LOADED_PROGRAMS: IntGauge =
        register_int_gauge!("kaleidoscope_loaded_programs", "number of programs loaded").unwrap();

    /// Number of currently enabled programs.
    pub static ref ACTIVE_PROGRAMS: IntGauge = register_int_gauge!(
        "kaleidoscope_active_programs",
        "number of programs currently enabled"
    )
    .unwrap();

    /// Output frames dropped because the sink queue was full.
    pub static ref FRAMES_DROPPED: IntCounter = register_int_counter!(
        "kaleidoscope_frames_dropped_total",
        "output frames dropped because the actuator sink fell behind"
    )
    .unwrap();
}
