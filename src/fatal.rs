//! Unrecoverable failures: a panicking task body or a transport error inside the
//! dependency protocol. The process cannot continue consistently after either.
use crate::tasking::task::current_task;
use crate::trace::Tracer;
use crate::transport::{Comm, CommShutdown};

use std::any::Any;

/// Log `msg` with the unit and the running task, flush the trace and abort the process
pub(crate) fn abort(unit: usize, comm: &Comm, tracer: Option<&Tracer>, msg: &str) -> ! {
    let task = match current_task() {
        Some(task) => format!("{task:?}"),
        None => "outside of any task".to_owned(),
    };
    tracing::error!("unit {unit} fatal error {task}: {msg}");
    eprintln!("[DART] unit {unit} fatal error {task}: {msg}");
    if let Some(tracer) = tracer {
        let _ = tracer.write_files();
    }
    comm.abort();
    std::process::abort()
}

/// Best effort text of a panic payload
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}
