pub mod converter;
pub mod files;
pub mod pipeline;
pub mod previews;
pub mod queue;
pub mod replay;
pub mod retry;
pub mod storage;
pub mod sweep;
pub mod token;
pub mod worker;
