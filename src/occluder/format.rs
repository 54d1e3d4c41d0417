/// OCM wire format: header, mesh blobs and instance records.
///
/// ```text
/// 0   version word       !3 legacy (big-endian words) / !4 current (little-endian)
/// 4   mesh count
/// 8   instance count
/// 12  instance table byte offset
/// 16  mesh blobs, each 16-byte aligned: 16-byte header + 16 bytes per vertex
/// ..  instance records: mesh offset + 3x4 row-major world transform (52 bytes)
/// ```
use glam::{Affine3A, Vec3, Vec4};

use crate::error::{CullError, Result};

pub const VERSION_LEGACY: u32 = !3;
pub const VERSION_CURRENT: u32 = !4;

pub const HEADER_SIZE: usize = 16;
pub const MESH_HEADER_SIZE: usize = 16;
pub const VERTEX_SIZE: usize = 16;
pub const INSTANCE_RECORD_SIZE: usize = 52;
pub const MESH_ALIGNMENT: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    Little,
    Big,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OcmVersion {
    /// Triangles and quads stored separately per mesh
    Legacy,
    /// Triangles only
    Current,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OcmHeader {
    pub version: OcmVersion,
    pub byte_order: ByteOrder,
    pub mesh_count: u32,
    pub instance_count: u32,
    pub instance_table_offset: u32,
}

/// Bounds-checked 4-byte word access in a given byte order.
#[derive(Clone, Copy)]
pub struct WordReader<'a> {
    bytes: &'a [u8],
    order: ByteOrder,
}

impl<'a> WordReader<'a> {
    pub fn new(bytes: &'a [u8], order: ByteOrder) -> Self {
        Self { bytes, order }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    #[inline]
    pub fn check(&self, offset: usize, needed: usize) -> Result<()> {
        match offset.checked_add(needed) {
            Some(end) if end <= self.bytes.len() => Ok(()),
            _ => Err(CullError::Truncated {
                offset,
                needed,
                len: self.bytes.len(),
            }),
        }
    }

    #[inline]
    pub fn u32_at(&self, offset: usize) -> Result<u32> {
        self.check(offset, 4)?;
        let word: [u8; 4] = [
            self.bytes[offset],
            self.bytes[offset + 1],
            self.bytes[offset + 2],
            self.bytes[offset + 3],
        ];
        Ok(match self.order {
            ByteOrder::Little => u32::from_le_bytes(word),
            ByteOrder::Big => u32::from_be_bytes(word),
        })
    }

    #[inline]
    pub fn f32_at(&self, offset: usize) -> Result<f32> {
        self.u32_at(offset).map(f32::from_bits)
    }

    pub fn vec4_at(&self, offset: usize) -> Result<Vec4> {
        self.check(offset, VERTEX_SIZE)?;
        Ok(Vec4::new(
            self.f32_at(offset)?,
            self.f32_at(offset + 4)?,
            self.f32_at(offset + 8)?,
            self.f32_at(offset + 12)?,
        ))
    }
}

impl OcmHeader {
    /// Detects the version word in either byte order. Only legacy files may be big-endian.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let words = WordReader::new(bytes, ByteOrder::Little);
        words.check(0, HEADER_SIZE)?;
        let le = words.u32_at(0)?;

        let (version, byte_order) = if le == VERSION_CURRENT {
            (OcmVersion::Current, ByteOrder::Little)
        } else if le == VERSION_LEGACY {
            (OcmVersion::Legacy, ByteOrder::Little)
        } else if le.swap_bytes() == VERSION_LEGACY {
            (OcmVersion::Legacy, ByteOrder::Big)
        } else {
            return Err(CullError::UnsupportedVersion(le));
        };

        let reader = WordReader::new(bytes, byte_order);
        Ok(Self {
            version,
            byte_order,
            mesh_count: reader.u32_at(4)?,
            instance_count: reader.u32_at(8)?,
            instance_table_offset: reader.u32_at(12)?,
        })
    }
}

/// Instance transform as stored on disk: three rows of a 3x4 matrix.
pub fn read_transform(reader: &WordReader<'_>, offset: usize) -> Result<[f32; 12]> {
    reader.check(offset, 48)?;
    let mut m = [0.0f32; 12];
    for (i, v) in m.iter_mut().enumerate() {
        *v = reader.f32_at(offset + i * 4)?;
    }
    Ok(m)
}

pub fn transform_to_affine(rows: &[f32; 12]) -> Affine3A {
    let r = rows;
    Affine3A::from_cols(
        Vec3::new(r[0], r[4], r[8]).into(),
        Vec3::new(r[1], r[5], r[9]).into(),
        Vec3::new(r[2], r[6], r[10]).into(),
        Vec3::new(r[3], r[7], r[11]).into(),
    )
}

pub fn affine_to_transform(t: &Affine3A) -> [f32; 12] {
    let c = t.to_cols_array_2d();
    [
        c[0][0], c[1][0], c[2][0], c[3][0], //
        c[0][1], c[1][1], c[2][1], c[3][1], //
        c[0][2], c[1][2], c[2][2], c[3][2],
    ]
}

#[inline]
pub fn align_up(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) / alignment * alignment
}

/// Builds OCM buffers in either version and byte order.
/// The current version is always written little-endian by the loader;
/// other combinations exist for producing legacy input.
pub struct OcmWriter {
    version: OcmVersion,
    order: ByteOrder,
    bytes: Vec<u8>,
    mesh_count: u32,
    instances: Vec<(u32, [f32; 12])>,
}

impl OcmWriter {
    pub fn new(version: OcmVersion, order: ByteOrder) -> Self {
        Self {
            version,
            order,
            bytes: vec![0; HEADER_SIZE],
            mesh_count: 0,
            instances: Vec::new(),
        }
    }

    pub fn current() -> Self {
        Self::new(OcmVersion::Current, ByteOrder::Little)
    }

    fn push_u32(&mut self, value: u32) {
        let word = match self.order {
            ByteOrder::Little => value.to_le_bytes(),
            ByteOrder::Big => value.to_be_bytes(),
        };
        self.bytes.extend_from_slice(&word);
    }

    fn push_vertex(&mut self, v: Vec4) {
        for c in v.to_array() {
            self.push_u32(c.to_bits());
        }
    }

    fn begin_mesh(&mut self) -> u32 {
        let aligned = align_up(self.bytes.len(), MESH_ALIGNMENT);
        self.bytes.resize(aligned, 0);
        self.mesh_count += 1;
        aligned as u32
    }

    /// Adds a current-format mesh; `vertices.len()` must be a multiple of 3.
    pub fn add_mesh(&mut self, vertices: &[Vec4]) -> u32 {
        debug_assert_eq!(self.version, OcmVersion::Current);
        let offset = self.begin_mesh();
        self.push_u32(vertices.len() as u32);
        for _ in 0..3 {
            self.push_u32(0);
        }
        for &v in vertices {
            self.push_vertex(v);
        }
        offset
    }

    /// Adds a legacy mesh with separate triangle and quad vertex lists.
    pub fn add_legacy_mesh(&mut self, triangles: &[Vec4], quads: &[Vec4]) -> u32 {
        debug_assert_eq!(self.version, OcmVersion::Legacy);
        let offset = self.begin_mesh();
        self.push_u32(triangles.len() as u32);
        self.push_u32(quads.len() as u32);
        self.push_u32(0);
        self.push_u32(0);
        for &v in triangles.iter().chain(quads) {
            self.push_vertex(v);
        }
        offset
    }

    pub fn add_instance(&mut self, mesh_offset: u32, transform: &Affine3A) {
        self.add_instance_raw(mesh_offset, affine_to_transform(transform));
    }

    pub fn add_instance_raw(&mut self, mesh_offset: u32, rows: [f32; 12]) {
        self.instances.push((mesh_offset, rows));
    }

    pub fn finish(mut self) -> Vec<u8> {
        let table = align_up(self.bytes.len(), MESH_ALIGNMENT);
        self.bytes.resize(table, 0);

        let instances = std::mem::take(&mut self.instances);
        for (mesh_offset, rows) in &instances {
            self.push_u32(*mesh_offset);
            for v in rows {
                self.push_u32(v.to_bits());
            }
        }

        let version = match self.version {
            OcmVersion::Legacy => VERSION_LEGACY,
            OcmVersion::Current => VERSION_CURRENT,
        };
        let header = [version, self.mesh_count, instances.len() as u32, table as u32];
        for (i, word) in header.iter().enumerate() {
            let bytes = match self.order {
                ByteOrder::Little => word.to_le_bytes(),
                ByteOrder::Big => word.to_be_bytes(),
            };
            self.bytes[i * 4..i * 4 + 4].copy_from_slice(&bytes);
        }
        self.bytes
    }
}
