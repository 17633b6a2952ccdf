//! CLI command implementations.

pub mod link;
pub mod recover;
pub mod run;
