//! Storage adapters
//!
//! An adapter reads files of one kind into tables (whole or chunked) and
//! writes tables or chunk streams back out. Declared artifact schemas are
//! checked by the adapter while loading.

mod csv_file;

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use indexmap::IndexMap;

use crate::artifact::ArtifactSpec;
use crate::error::TraktError;
use crate::table::Table;
use crate::value::{ChunkStream, Metadata};

pub use self::csv_file::CsvAdapter;

pub trait Adapter: Send + Sync {
    /// Extension (with dot) used to filter directory listings and name outputs
    fn file_extension(&self) -> Option<&str> {
        None
    }

    /// Column names of a file, without reading its rows
    fn read_columns(&self, path: &Path, artifact: &ArtifactSpec) -> Result<Vec<String>, TraktError>;

    /// Load a whole file
    fn load(&self, path: &Path, artifact: &ArtifactSpec) -> Result<Table, TraktError>;

    /// Load a file lazily in chunks of at most `chunk_size` rows
    fn load_stream(
        &self,
        path: &Path,
        artifact: &ArtifactSpec,
        chunk_size: usize,
    ) -> Result<ChunkStream, TraktError>;

    fn write(&self, table: &Table, path: &Path, metadata: &Metadata) -> Result<(), TraktError>;

    /// Write chunks as they arrive. `on_chunk` sees the row count of each written chunk.
    fn write_stream(
        &self,
        stream: ChunkStream,
        path: &Path,
        metadata: &Metadata,
        on_chunk: &mut dyn FnMut(usize),
    ) -> Result<(), TraktError>;
}

/// Kind name -> adapter (names are case-insensitive)
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: IndexMap<String, Arc<dyn Adapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in CSV adapter
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("csv", CsvAdapter::default());
        registry
    }

    pub fn register(&mut self, kind: &str, adapter: impl Adapter + 'static) -> &mut Self {
        self.adapters
            .insert(kind.trim().to_ascii_lowercase(), Arc::new(adapter));
        self
    }

    pub fn get(&self, kind: &str) -> Result<Arc<dyn Adapter>, TraktError> {
        self.adapters
            .get(&kind.trim().to_ascii_lowercase())
            .cloned()
            .ok_or_else(|| TraktError::UnknownAdapter {
                kind: kind.to_string(),
                available: self.adapters.keys().cloned().collect(),
            })
    }

    pub fn kinds(&self) -> Vec<String> {
        self.adapters.keys().cloned().collect()
    }
}

impl fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}
