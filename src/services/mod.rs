pub mod challenge;
pub mod log;
