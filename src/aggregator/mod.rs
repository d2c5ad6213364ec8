/// Line-to-chunk segmentation with overlap
pub mod chunk_accumulator;

pub use chunk_accumulator::{ChunkAccumulator, ChunkKey, ChunkSink, DEFAULT_OVERLAP};
