pub mod batch_assembler;
pub mod dedup;
pub mod frame_queue;
pub mod lifecycle;
pub mod pipeline;
pub mod tracker;
