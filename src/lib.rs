#![doc = include_str!("../README.md")]

/// Hand-defined NT and ETW structures, constants and layouts.
pub mod data;

mod error;
pub use error::R0akError;

// Completion detection for hijacked work items.
pub mod etw;

// The dispatch-hijack execution engine.
pub mod exec;

// User-writable buffers at known kernel addresses.
pub mod pool;

// The read, write and execute primitives.
pub mod read;
pub mod run;
pub mod write;

/// Symbol resolution against the running kernel.
pub mod sym;

/// Hex dump, elevation and other shared helpers.
pub mod util;
