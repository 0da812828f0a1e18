//! Entity models, connection pooling, and flat data-access functions for
//! the foreman orchestrator.
//!
//! Entity access is a flat API of parameterized queries grouped by table
//! under [`queries`]; no repository objects. All state transitions go
//! through compare-and-set updates so concurrent orchestrators observe
//! linearizable claims.

pub mod config;
pub mod models;
pub mod pool;
pub mod queries;
