//! Purpose: Library crate behind the `cloudmediator` CLI and its tests.
//! Exports: `api` (mediator, operations, value types), `core` (queues, session, errors).
//! Role: Client-side mediator between application code and a cloud record backend.
//! Invariants: Application code talks to the backend only through `api::Mediator`.
pub mod api;
pub mod core;
