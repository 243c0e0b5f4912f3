pub mod gate;
pub mod pipeline;
pub mod storage;
