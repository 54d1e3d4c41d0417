/// Error type shared by the occluder loader, configuration and pipeline.
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CullError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Version word was neither the legacy nor the current marker.
    #[error("unsupported occluder mesh version word {0:#010x}")]
    UnsupportedVersion(u32),

    /// An instance references a mesh at an offset that is not 4-byte aligned
    /// or lies outside the buffer.
    #[error("instance {instance} references mesh at invalid offset {offset}")]
    MisalignedMeshOffset { instance: usize, offset: u32 },

    #[error("occluder data truncated: needed {needed} bytes at offset {offset}, buffer has {len}")]
    Truncated {
        offset: usize,
        needed: usize,
        len: usize,
    },

    #[error("invalid mesh at offset {offset}: {reason}")]
    InvalidMesh { offset: u32, reason: &'static str },

    #[error("invalid resolution {width}x{height}: {reason}")]
    InvalidResolution {
        width: usize,
        height: usize,
        reason: &'static str,
    },

    #[error("config error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("failed to start cull workers: {0}")]
    JobSystem(#[from] rayon::ThreadPoolBuildError),
}

pub type Result<T> = std::result::Result<T, CullError>;

impl CullError {
    /// True for errors caused by the occluder file contents rather than by I/O.
    #[inline]
    pub fn is_format_error(&self) -> bool {
        matches!(
            self,
            CullError::UnsupportedVersion(_)
                | CullError::MisalignedMeshOffset { .. }
                | CullError::Truncated { .. }
                | CullError::InvalidMesh { .. }
        )
    }
}
