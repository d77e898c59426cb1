//! Chunked upload assembly.
//!
//! Multi-GB source files arrive as fixed-size chunks that are staged on disk
//! per session and concatenated on completion, so no request ever buffers
//! the whole body in memory.

mod assembler;

pub use assembler::{
    AssembledUpload, ChunkReceipt, UploadAssembler, UploadSessionInfo, CHUNK_SIZE,
    SUPPORTED_EXTENSIONS,
};
