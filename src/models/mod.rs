pub mod file;
pub mod job;
pub mod preview;
