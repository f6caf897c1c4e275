//! Integration tests for the processor module
//!
//! Tests the complete staging pipeline against small instrument trees
//! built in temporary directories.
