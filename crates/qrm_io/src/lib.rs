//! I/O utilities for workload scripts and measurement outcome files.
//!
//! Provides the text format that drives the interpreter in `qrm_core::vm`
//! and the packed binary format decoded outcomes are written in.

/// Packed `.b8` outcome files.
///
/// Writes decoded measurement vectors one bit per qubit, reads them back,
/// and splits a file into fixed-width records.
pub mod loader;

/// Parser for workload scripts.
///
/// Turns the line-oriented script format into `Instruction` values,
/// reporting the line and column of the first syntax error.
pub mod parser;

pub use loader::{load_b8_file, slice_outcomes, write_b8_file};
pub use parser::{load_script_file, parse_script};
