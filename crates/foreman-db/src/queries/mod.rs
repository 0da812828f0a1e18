//! Flat parameterized query functions, one module per table.

pub mod agents;
pub mod approvals;
pub mod documents;
pub mod goals;
pub mod organizations;
pub mod projects;
pub mod pull_requests;
pub mod roles;
pub mod task_events;
pub mod tasks;
pub mod teams;
