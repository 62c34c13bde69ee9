//! Core building blocks: data handles, provenance, command formatting and tasks.

pub mod audit;
pub mod format;
pub mod packet;
pub mod task;
pub mod types;
