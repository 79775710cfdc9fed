//! Purpose: uProtocol-style transport adapter over a pluggable pub/sub + query substrate.
//! Exports: `api` (stable surface), `core` (value types and collaborator seams), `local`.
//! Role: Library backing the `ulink` CLI and any embedding application.
//! Invariants: No process-global state; every transport is an explicit handle.
//! Invariants: Nothing panics across the `api` boundary; failures are `api::Error` values.
pub mod api;
pub mod core;
pub mod local;
