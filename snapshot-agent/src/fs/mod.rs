//! File system access to the backed-up data.

pub mod sources;
