//! Repository functions — one function per database operation.
//!
//! Every function takes a `&DbPool` and returns a `Result<T, DbError>`.
//! No business logic, no domain decisions — pure SQL.

pub mod executions;
pub mod idempotency;
pub mod runs;
pub mod workflows;
