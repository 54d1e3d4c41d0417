/// Decoded occluder meshes and instances, backed by a 16-byte aligned
/// current-format buffer.
use std::collections::HashMap;
use std::io::Read;
use std::path::Path;

use bytemuck::{Pod, Zeroable};
use glam::{Affine3A, Vec4};

use super::format::{
    read_transform, transform_to_affine, ByteOrder, OcmHeader, OcmVersion, WordReader,
    HEADER_SIZE, INSTANCE_RECORD_SIZE, MESH_HEADER_SIZE, VERTEX_SIZE,
};
use super::migrate::migrate_legacy;
use super::LevelFileSystem;
use crate::error::{CullError, Result};
use crate::geometry::Aabb;

/// Files above this size are read header first, then in chunks.
pub const STREAMING_THRESHOLD: u64 = 1 << 20;
const STREAM_CHUNK: usize = 256 * 1024;

#[repr(C, align(16))]
#[derive(Clone, Copy, Pod, Zeroable)]
struct Block16([u8; 16]);

/// Byte buffer whose start is 16-byte aligned.
#[derive(Clone, Default)]
pub struct AlignedBytes {
    blocks: Vec<Block16>,
    len: usize,
}

impl AlignedBytes {
    pub fn zeroed(len: usize) -> Self {
        Self {
            blocks: vec![Block16([0; 16]); (len + 15) / 16],
            len,
        }
    }

    pub fn from_slice(bytes: &[u8]) -> Self {
        let mut out = Self::zeroed(bytes.len());
        out.as_mut_bytes().copy_from_slice(bytes);
        out
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &bytemuck::cast_slice(&self.blocks)[..self.len]
    }

    #[inline]
    pub fn as_mut_bytes(&mut self) -> &mut [u8] {
        let len = self.len;
        &mut bytemuck::cast_slice_mut(&mut self.blocks)[..len]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[derive(Debug, Clone)]
pub struct MeshRecord {
    /// Byte offset of the mesh header in the current-format buffer
    pub offset: u32,
    pub vertex_count: u32,
    /// Index of the first vertex in the store's vertex array
    pub first_vertex: usize,
    pub local_bounds: Aabb,
}

impl MeshRecord {
    #[inline]
    pub fn triangle_count(&self) -> usize {
        self.vertex_count as usize / 3
    }
}

#[derive(Debug, Clone)]
pub struct InstanceRecord {
    pub mesh_offset: u32,
    pub mesh: usize,
    pub transform: Affine3A,
    pub world_bounds: Aabb,
}

/// Occluder geometry for one level. Immutable once built.
#[derive(Default)]
pub struct OcclusionMeshStore {
    buffer: AlignedBytes,
    mesh_count: u32,
    instance_table_offset: u32,
    meshes: Vec<MeshRecord>,
    vertices: Vec<Vec4>,
    instances: Vec<InstanceRecord>,
}

impl OcclusionMeshStore {
    /// Parses a buffer of either version. Legacy input is migrated first.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let header = OcmHeader::parse(bytes)?;
        match header.version {
            OcmVersion::Current => Self::from_current(AlignedBytes::from_slice(bytes)),
            OcmVersion::Legacy => {
                let migrated = migrate_legacy(bytes)?;
                Self::from_current(AlignedBytes::from_slice(&migrated))
            }
        }
    }

    /// Reads `path` through `fs`. Large files are streamed in chunks after the
    /// header has been validated.
    pub fn load(fs: &dyn LevelFileSystem, path: &Path) -> Result<Self> {
        let size = fs.file_size(path)?;
        let mut reader = fs.open(path)?;

        if size <= STREAMING_THRESHOLD {
            let mut bytes = Vec::with_capacity(size as usize);
            reader.read_to_end(&mut bytes)?;
            return Self::parse(&bytes);
        }

        let mut buffer = AlignedBytes::zeroed(size as usize);
        {
            let bytes = buffer.as_mut_bytes();
            reader.read_exact(&mut bytes[..HEADER_SIZE])?;
            let header = OcmHeader::parse(&bytes[..HEADER_SIZE])?;
            log::debug!(
                "streaming {} ({} bytes, {:?})",
                path.display(),
                size,
                header.version
            );
            for chunk in bytes[HEADER_SIZE..].chunks_mut(STREAM_CHUNK) {
                reader.read_exact(chunk)?;
            }
        }

        match OcmHeader::parse(buffer.as_bytes())?.version {
            OcmVersion::Current => Self::from_current(buffer),
            OcmVersion::Legacy => {
                let migrated = migrate_legacy(buffer.as_bytes())?;
                Self::from_current(AlignedBytes::from_slice(&migrated))
            }
        }
    }

    /// Validates and decodes a current-format buffer. Any misaligned or
    /// out-of-range mesh reference rejects the whole buffer.
    fn from_current(buffer: AlignedBytes) -> Result<Self> {
        let bytes = buffer.as_bytes();
        let header = OcmHeader::parse(bytes)?;
        let reader = WordReader::new(bytes, ByteOrder::Little);

        let table = header.instance_table_offset as usize;
        let instance_count = header.instance_count as usize;
        if table % 4 != 0 {
            return Err(CullError::InvalidMesh {
                offset: header.instance_table_offset,
                reason: "instance table is not 4-byte aligned",
            });
        }
        reader.check(table, instance_count * INSTANCE_RECORD_SIZE)?;

        let mut meshes: Vec<MeshRecord> = Vec::new();
        let mut vertices = Vec::new();
        let mut instances = Vec::with_capacity(instance_count);
        let mut by_offset: HashMap<u32, usize> = HashMap::new();

        for instance in 0..instance_count {
            let record = table + instance * INSTANCE_RECORD_SIZE;
            let mesh_offset = reader.u32_at(record)?;
            if mesh_offset % 4 != 0
                || (mesh_offset as usize) < HEADER_SIZE
                || mesh_offset as usize >= bytes.len()
            {
                return Err(CullError::MisalignedMeshOffset {
                    instance,
                    offset: mesh_offset,
                });
            }

            let mesh = match by_offset.get(&mesh_offset) {
                Some(&index) => index,
                None => {
                    let record = decode_mesh(&reader, mesh_offset, &mut vertices)?;
                    meshes.push(record);
                    by_offset.insert(mesh_offset, meshes.len() - 1);
                    meshes.len() - 1
                }
            };

            let transform = transform_to_affine(&read_transform(&reader, record + 4)?);
            let world_bounds = meshes[mesh].local_bounds.transformed(&transform);
            instances.push(InstanceRecord {
                mesh_offset,
                mesh,
                transform,
                world_bounds,
            });
        }

        Ok(Self {
            mesh_count: header.mesh_count,
            instance_table_offset: header.instance_table_offset,
            buffer,
            meshes,
            vertices,
            instances,
        })
    }

    /// Mesh count as recorded in the header
    #[inline]
    pub fn mesh_count(&self) -> u32 {
        self.mesh_count
    }

    #[inline]
    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    #[inline]
    pub fn instance_table_offset(&self) -> u32 {
        self.instance_table_offset
    }

    /// The current-format buffer the records were decoded from.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        self.buffer.as_bytes()
    }

    #[inline]
    pub fn meshes(&self) -> &[MeshRecord] {
        &self.meshes
    }

    #[inline]
    pub fn instances(&self) -> &[InstanceRecord] {
        &self.instances
    }

    #[inline]
    pub fn mesh_vertices(&self, mesh: &MeshRecord) -> &[Vec4] {
        &self.vertices[mesh.first_vertex..mesh.first_vertex + mesh.vertex_count as usize]
    }

    #[inline]
    pub fn total_vertex_count(&self) -> usize {
        self.vertices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}

fn decode_mesh(reader: &WordReader<'_>, offset: u32, vertices: &mut Vec<Vec4>) -> Result<MeshRecord> {
    let base = offset as usize;
    let vertex_count = reader.u32_at(base)?;
    if vertex_count % 3 != 0 {
        return Err(CullError::InvalidMesh {
            offset,
            reason: "vertex count is not a multiple of 3",
        });
    }
    let data = base + MESH_HEADER_SIZE;
    reader.check(data, vertex_count as usize * VERTEX_SIZE)?;

    let first_vertex = vertices.len();
    let mut bounds = Aabb::EMPTY;
    for i in 0..vertex_count as usize {
        let v = reader.vec4_at(data + i * VERTEX_SIZE)?;
        bounds.extend(v.truncate());
        vertices.push(v.truncate().extend(1.0));
    }
    if vertex_count == 0 {
        bounds = Aabb::new(glam::Vec3::ZERO, glam::Vec3::ZERO);
    }

    Ok(MeshRecord {
        offset,
        vertex_count,
        first_vertex,
        local_bounds: bounds,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aligned_bytes_start_on_16_byte_boundary() {
        let buffer = AlignedBytes::from_slice(&[1, 2, 3, 4, 5]);
        assert_eq!(buffer.as_bytes().as_ptr() as usize % 16, 0);
        assert_eq!(buffer.as_bytes(), &[1, 2, 3, 4, 5]);
    }

    #[test]
    fn empty_mesh_gets_point_bounds() {
        let mut writer = super::super::format::OcmWriter::current();
        let mesh = writer.add_mesh(&[]);
        writer.add_instance(mesh, &Affine3A::IDENTITY);
        let store = OcclusionMeshStore::parse(&writer.finish()).unwrap();
        assert_eq!(store.meshes()[0].triangle_count(), 0);
        assert!(!store.meshes()[0].local_bounds.is_empty());
    }
}
