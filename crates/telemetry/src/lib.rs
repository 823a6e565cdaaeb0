//! Telemetry - logging setup and orchestration metrics

mod logging;
mod recorder;

pub use crate::logging::{init_tracing, LogFormat};
pub use crate::recorder::{
    install_prometheus, record_engine_invocation, record_job_finished, record_queue_depth,
    record_unit_dispatched, record_unit_finished, record_unit_retry,
};
