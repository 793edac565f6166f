//! Purpose: Library crate behind the `imathics` kernel binary and its tests.
//! Exports: `core` (session, completeness, MIME, execution, inspection), `protocol`,
//! `kernel`, `kernel_stdio`, `engine_echo`.
//! Role: Notebook kernel adapter between a front-end and an external evaluation engine.
//! Invariants: Requests are handled one at a time; nothing here spawns threads.
pub mod core;
pub mod engine_echo;
pub mod kernel;
pub mod kernel_stdio;
pub mod protocol;
