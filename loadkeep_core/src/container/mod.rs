//! Chunked, randomly addressable multi-file containers.
//!
//! A container is written once by [`ContainerWriter::pack`] and never
//! modified afterwards. Readers open it with [`Container::open`] and address
//! single entries through [`ChunkedReadable`]; see [`format`] for the layout.

mod compression;
pub mod format;
mod reader;
mod writer;

pub use compression::{CompressionMethod, compress_zstd_all, decompress_zstd_all};
pub use format::{CONTAINER_EXTENSION, ContainerHeader, EntryRecord, TEMP_EXTENSION};
pub use reader::{ChunkedReadable, Container, EntryChunks, EntryReader};
pub use writer::{ContainerWriter, EntrySource, PackOptions, PackedContainer, temp_path_for};
