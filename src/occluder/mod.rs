/// Occluder mesh files (OCM): wire format, legacy migration and the
/// decoded per-level store.
pub mod format;
pub mod migrate;
pub mod store;

pub use format::{ByteOrder, OcmHeader, OcmVersion, OcmWriter};
pub use migrate::{expanded_vertex_count, migrate_legacy};
pub use store::{InstanceRecord, MeshRecord, OcclusionMeshStore};

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};

/// Name of the occluder file inside a level folder.
pub const OCCLUDER_FILE_NAME: &str = "occluder.ocm";

/// File access used for level data, so hosts can redirect reads into packs.
pub trait LevelFileSystem: Send + Sync {
    fn open(&self, path: &Path) -> io::Result<Box<dyn Read + Send>>;
    fn file_size(&self, path: &Path) -> io::Result<u64>;
}

/// Plain `std::fs` access.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdFileSystem;

impl LevelFileSystem for StdFileSystem {
    fn open(&self, path: &Path) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(BufReader::new(File::open(path)?)))
    }

    fn file_size(&self, path: &Path) -> io::Result<u64> {
        Ok(std::fs::metadata(path)?.len())
    }
}

pub fn occluder_path(level_folder: &Path) -> PathBuf {
    level_folder.join(OCCLUDER_FILE_NAME)
}
