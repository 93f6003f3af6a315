// Common library: broker bridge components shared by the relay binary and tests

pub mod broker;
pub mod config;
pub mod emitter;
pub mod errors;
pub mod queue;
pub mod scheduler;
pub mod telemetry;
