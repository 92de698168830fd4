//! Integration tests for the link layer.
//!
//! All scenarios run against the scriptable mock bridge and a virtual
//! clock on a single-threaded local executor: no radios, no real time.

mod harness;

mod connect_tests;
mod notify_tests;
mod scan_tests;
mod shell_tests;
