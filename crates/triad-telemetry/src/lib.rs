//! Telemetry bootstrap for triad services.

pub mod logging;
