pub mod handler;

pub use handler::{consume_chunk_stream, StreamEnd};
