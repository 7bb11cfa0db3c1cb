//! Canonical subject and queue-group naming.
//!
//! Identifiers are used literally; callers must choose subject-safe
//! versions, service names and action names.

/// Canonical subject of an action: `v{version}.{service}.{action}`.
///
/// ```
/// assert_eq!(nats_service::service_subject("1", "svc", "echo"), "v1.svc.echo");
/// ```
pub fn service_subject(version: &str, service: &str, action: &str) -> String {
    format!("v{version}.{service}.{action}")
}

/// Queue-group key for one worker index: `{subject}-{worker_index}`.
///
/// Each worker index forms its own group, so load balancing happens between
/// processes that registered the same worker index, not between the workers
/// of one process.
pub fn queue_group(subject: &str, worker_index: usize) -> String {
    format!("{subject}-{worker_index}")
}
