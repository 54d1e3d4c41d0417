/// Legacy (triangle + quad) to current (triangle only) conversion.
use std::collections::HashMap;

use glam::Vec4;

use super::format::{
    ByteOrder, OcmHeader, OcmVersion, OcmWriter, WordReader, INSTANCE_RECORD_SIZE,
    MESH_HEADER_SIZE, VERTEX_SIZE,
};
use crate::error::{CullError, Result};

/// Rewrites a legacy OCM buffer in the current format.
///
/// Every quad `(v0, v1, v2, v3)` becomes triangles `(v0, v1, v2)` and
/// `(v0, v2, v3)`. Each referenced mesh is written once at a fresh 16-byte
/// aligned offset and all instances sharing it are patched to that offset.
pub fn migrate_legacy(bytes: &[u8]) -> Result<Vec<u8>> {
    let header = OcmHeader::parse(bytes)?;
    if header.version != OcmVersion::Legacy {
        return Ok(bytes.to_vec());
    }
    let reader = WordReader::new(bytes, header.byte_order);

    let table = header.instance_table_offset as usize;
    let instance_count = header.instance_count as usize;
    reader.check(table, instance_count * INSTANCE_RECORD_SIZE)?;

    let mut writer = OcmWriter::current();
    let mut remap: HashMap<u32, u32> = HashMap::new();
    let mut vertices = Vec::new();

    for instance in 0..instance_count {
        let record = table + instance * INSTANCE_RECORD_SIZE;
        let old_offset = reader.u32_at(record)?;
        if old_offset % 4 != 0 || old_offset as usize >= reader.len() {
            return Err(CullError::MisalignedMeshOffset {
                instance,
                offset: old_offset,
            });
        }

        let new_offset = match remap.get(&old_offset) {
            Some(&offset) => offset,
            None => {
                vertices.clear();
                expand_legacy_mesh(&reader, old_offset, &mut vertices)?;
                let offset = writer.add_mesh(&vertices);
                remap.insert(old_offset, offset);
                offset
            }
        };

        let rows = super::format::read_transform(&reader, record + 4)?;
        writer.add_instance_raw(new_offset, rows);
    }

    log::debug!(
        "migrated legacy occluders: {} instances, {} unique meshes ({})",
        instance_count,
        remap.len(),
        match header.byte_order {
            ByteOrder::Little => "little-endian",
            ByteOrder::Big => "big-endian",
        }
    );
    Ok(writer.finish())
}

/// Number of triangle vertices a legacy mesh expands to.
#[inline]
pub fn expanded_vertex_count(tri_vertices: u32, quad_vertices: u32) -> u32 {
    tri_vertices + quad_vertices / 4 * 6
}

fn expand_legacy_mesh(reader: &WordReader<'_>, offset: u32, out: &mut Vec<Vec4>) -> Result<()> {
    let base = offset as usize;
    let tri_count = reader.u32_at(base)?;
    let quad_count = reader.u32_at(base + 4)?;
    if tri_count % 3 != 0 {
        return Err(CullError::InvalidMesh {
            offset,
            reason: "triangle vertex count is not a multiple of 3",
        });
    }
    if quad_count % 4 != 0 {
        return Err(CullError::InvalidMesh {
            offset,
            reason: "quad vertex count is not a multiple of 4",
        });
    }

    let data = base + MESH_HEADER_SIZE;
    let total = (tri_count as usize + quad_count as usize) * VERTEX_SIZE;
    reader.check(data, total)?;

    out.reserve(expanded_vertex_count(tri_count, quad_count) as usize);
    for i in 0..tri_count as usize {
        out.push(reader.vec4_at(data + i * VERTEX_SIZE)?);
    }

    let quads = data + tri_count as usize * VERTEX_SIZE;
    for q in 0..quad_count as usize / 4 {
        let at = |k: usize| reader.vec4_at(quads + (q * 4 + k) * VERTEX_SIZE);
        let (v0, v1, v2, v3) = (at(0)?, at(1)?, at(2)?, at(3)?);
        out.extend_from_slice(&[v0, v1, v2, v0, v2, v3]);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::occluder::format::MESH_ALIGNMENT;
    use glam::Affine3A;

    fn v(x: f32, y: f32) -> Vec4 {
        Vec4::new(x, y, 0.0, 1.0)
    }

    #[test]
    fn quad_expands_to_two_triangles() {
        let mut legacy = OcmWriter::new(OcmVersion::Legacy, ByteOrder::Big);
        let quad = [v(0.0, 0.0), v(1.0, 0.0), v(1.0, 1.0), v(0.0, 1.0)];
        let mesh = legacy.add_legacy_mesh(&[], &quad);
        legacy.add_instance(mesh, &Affine3A::IDENTITY);
        let migrated = migrate_legacy(&legacy.finish()).unwrap();

        let header = OcmHeader::parse(&migrated).unwrap();
        assert_eq!(header.version, OcmVersion::Current);
        assert_eq!(header.byte_order, ByteOrder::Little);

        let reader = WordReader::new(&migrated, ByteOrder::Little);
        let offset = reader.u32_at(header.instance_table_offset as usize).unwrap() as usize;
        assert_eq!(offset % MESH_ALIGNMENT, 0);
        assert_eq!(reader.u32_at(offset).unwrap(), 6);

        let got: Vec<Vec4> = (0..6)
            .map(|i| reader.vec4_at(offset + MESH_HEADER_SIZE + i * VERTEX_SIZE).unwrap())
            .collect();
        assert_eq!(got, vec![quad[0], quad[1], quad[2], quad[0], quad[2], quad[3]]);
    }

    #[test]
    fn odd_quad_count_is_rejected() {
        let mut legacy = OcmWriter::new(OcmVersion::Legacy, ByteOrder::Little);
        let mesh = legacy.add_legacy_mesh(&[], &[v(0.0, 0.0), v(1.0, 0.0), v(1.0, 1.0)]);
        legacy.add_instance(mesh, &Affine3A::IDENTITY);
        assert!(matches!(
            migrate_legacy(&legacy.finish()),
            Err(CullError::InvalidMesh { .. })
        ));
    }
}
