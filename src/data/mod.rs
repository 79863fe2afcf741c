//! Sample distribution and run persistence.
pub mod sample_channel;
pub mod storage;
