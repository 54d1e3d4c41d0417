/// Occluder file loading: version detection, legacy migration, validation
/// and the streaming path for large files.
use glam::{Affine3A, Vec3, Vec4};
use occlusion_culler::occluder::format::{MESH_ALIGNMENT, VERSION_CURRENT};
use occlusion_culler::occluder::store::STREAMING_THRESHOLD;
use occlusion_culler::occluder::{
    expanded_vertex_count, migrate_legacy, occluder_path, ByteOrder, OcmHeader, OcmVersion, OcmWriter,
    OcclusionMeshStore, StdFileSystem,
};
use occlusion_culler::{Aabb, Camera, CullConfig, CullError, CullPipeline};

fn v(x: f32, y: f32, z: f32) -> Vec4 {
    Vec4::new(x, y, z, 1.0)
}

fn one_triangle() -> Vec<Vec4> {
    vec![v(0.0, 0.0, 0.0), v(1.0, 0.0, 0.0), v(0.0, 1.0, 0.0)]
}

fn two_quads() -> Vec<Vec4> {
    vec![
        v(0.0, 0.0, 1.0),
        v(1.0, 0.0, 1.0),
        v(1.0, 1.0, 1.0),
        v(0.0, 1.0, 1.0),
        v(0.0, 0.0, 2.0),
        v(2.0, 0.0, 2.0),
        v(2.0, 2.0, 2.0),
        v(0.0, 2.0, 2.0),
    ]
}

fn legacy_file(order: ByteOrder) -> Vec<u8> {
    let mut writer = OcmWriter::new(OcmVersion::Legacy, order);
    let mesh = writer.add_legacy_mesh(&one_triangle(), &two_quads());
    writer.add_instance(mesh, &Affine3A::IDENTITY);
    writer.add_instance(mesh, &Affine3A::from_translation(Vec3::new(10.0, 0.0, 0.0)));
    writer.finish()
}

#[test]
fn legacy_quads_become_triangle_pairs() {
    let store = OcclusionMeshStore::parse(&legacy_file(ByteOrder::Little)).unwrap();

    assert_eq!(store.instance_count(), 2);
    assert_eq!(store.meshes().len(), 1, "instances sharing a mesh keep sharing it");
    let mesh = &store.meshes()[0];
    assert_eq!(mesh.vertex_count, expanded_vertex_count(3, 8));
    assert_eq!(mesh.vertex_count, 15);
    assert_eq!(mesh.offset as usize % MESH_ALIGNMENT, 0);

    let vertices = store.mesh_vertices(mesh);
    let quads = two_quads();
    // First quad (v0, v1, v2, v3) -> (v0, v1, v2), (v0, v2, v3)
    assert_eq!(&vertices[3..9], &[quads[0], quads[1], quads[2], quads[0], quads[2], quads[3]]);
    assert!(vertices.iter().all(|p| p.w == 1.0));
}

#[test]
fn big_endian_legacy_matches_little_endian() {
    let little = OcclusionMeshStore::parse(&legacy_file(ByteOrder::Little)).unwrap();
    let big = OcclusionMeshStore::parse(&legacy_file(ByteOrder::Big)).unwrap();

    assert_eq!(little.instance_count(), big.instance_count());
    let (ml, mb) = (&little.meshes()[0], &big.meshes()[0]);
    assert_eq!(little.mesh_vertices(ml), big.mesh_vertices(mb));
    assert_eq!(little.instances()[1].world_bounds, big.instances()[1].world_bounds);
}

#[test]
fn migrated_output_is_current_and_aligned() {
    let migrated = migrate_legacy(&legacy_file(ByteOrder::Big)).unwrap();
    let header = OcmHeader::parse(&migrated).unwrap();
    assert_eq!(header.version, OcmVersion::Current);
    assert_eq!(header.byte_order, ByteOrder::Little);
    assert_eq!(header.instance_count, 2);
    assert_eq!(&migrated[0..4], &VERSION_CURRENT.to_le_bytes());

    let store = OcclusionMeshStore::parse(&migrated).unwrap();
    for instance in store.instances() {
        assert_eq!(instance.mesh_offset as usize % MESH_ALIGNMENT, 0);
    }
    // Second instance is translated by +10 on x
    let moved = store.instances()[1].world_bounds;
    assert_eq!(moved.min, Vec3::new(10.0, 0.0, 0.0));
    assert_eq!(moved.max, Vec3::new(12.0, 2.0, 2.0));
}

#[test]
fn migrating_current_data_is_a_copy() {
    let mut writer = OcmWriter::current();
    let mesh = writer.add_mesh(&one_triangle());
    writer.add_instance(mesh, &Affine3A::IDENTITY);
    let bytes = writer.finish();
    assert_eq!(migrate_legacy(&bytes).unwrap(), bytes);
}

#[test]
fn header_only_file_has_no_instances() {
    let bytes = OcmWriter::current().finish();
    let store = OcclusionMeshStore::parse(&bytes).unwrap();
    assert_eq!(store.instance_count(), 0);
    assert!(store.is_empty());
}

#[test]
fn header_only_level_loads_and_hides_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let bytes = OcmWriter::current().finish();
    assert_eq!(bytes.len(), 16);
    std::fs::write(occluder_path(dir.path()), &bytes).unwrap();

    let pipeline = CullPipeline::new(CullConfig::default(), None).unwrap();
    pipeline.load_level(&StdFileSystem, dir.path()).unwrap();
    assert_eq!(pipeline.instance_count(), 0);

    pipeline.prepare_cullbuffer_async(&Camera::new(Vec3::ZERO, 2.0));
    pipeline.cull_end(true);

    assert!(pipeline.is_buffer_valid());
    assert!(pipeline.stats().no_occluder_data);
    let far_box = Aabb::new(Vec3::new(-1.0, -1.0, -30.0), Vec3::new(1.0, 1.0, -28.0));
    assert!(pipeline.test_aabb(&far_box, 28.0, 0.0));
    assert!(pipeline.test_aabb(&far_box, 28.0, 5.0));
    assert!(pipeline.test_quad(Vec3::new(0.0, 0.0, -20.0), Vec3::X, Vec3::Y));
}

#[test]
fn misaligned_mesh_offset_rejects_the_file() {
    let mut writer = OcmWriter::current();
    let mesh = writer.add_mesh(&one_triangle());
    writer.add_instance(mesh, &Affine3A::IDENTITY);
    writer.add_instance(mesh + 2, &Affine3A::IDENTITY);

    match OcclusionMeshStore::parse(&writer.finish()) {
        Err(CullError::MisalignedMeshOffset { instance, offset }) => {
            assert_eq!(instance, 1);
            assert_eq!(offset, mesh + 2);
        }
        other => panic!("expected a misaligned offset error, got {:?}", other.map(|s| s.instance_count())),
    }
}

#[test]
fn out_of_range_mesh_offset_rejects_the_file() {
    let mut writer = OcmWriter::current();
    writer.add_mesh(&one_triangle());
    writer.add_instance(1 << 20, &Affine3A::IDENTITY);
    let err = OcclusionMeshStore::parse(&writer.finish()).err().unwrap();
    assert!(matches!(err, CullError::MisalignedMeshOffset { .. }));
    assert!(err.is_format_error());
}

#[test]
fn truncated_mesh_data_is_rejected() {
    let mut writer = OcmWriter::current();
    let mesh = writer.add_mesh(&one_triangle());
    writer.add_instance(mesh, &Affine3A::IDENTITY);
    let bytes = writer.finish();
    // Claim more vertices than the buffer holds
    let mut corrupt = bytes.clone();
    let at = mesh as usize;
    corrupt[at..at + 4].copy_from_slice(&3000u32.to_le_bytes());
    assert!(matches!(
        OcclusionMeshStore::parse(&corrupt),
        Err(CullError::Truncated { .. })
    ));
}

#[test]
fn large_file_is_streamed_from_disk() {
    // Enough vertices to push the file past the streaming threshold
    let count = (STREAMING_THRESHOLD as usize / 16 / 3 + 100) * 3;
    let vertices: Vec<Vec4> = (0..count).map(|i| v(i as f32, (i % 7) as f32, -5.0)).collect();
    let mut writer = OcmWriter::current();
    let mesh = writer.add_mesh(&vertices);
    writer.add_instance(mesh, &Affine3A::IDENTITY);
    let bytes = writer.finish();
    assert!(bytes.len() as u64 > STREAMING_THRESHOLD);

    let dir = tempfile::tempdir().unwrap();
    let path = occluder_path(dir.path());
    std::fs::write(&path, &bytes).unwrap();

    let streamed = OcclusionMeshStore::load(&StdFileSystem, &path).unwrap();
    let parsed = OcclusionMeshStore::parse(&bytes).unwrap();
    assert_eq!(streamed.total_vertex_count(), count);
    assert_eq!(streamed.as_bytes(), parsed.as_bytes());
    assert_eq!(streamed.instances()[0].world_bounds, parsed.instances()[0].world_bounds);
}

#[test]
fn pipeline_level_load_and_failure() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = CullPipeline::new(CullConfig::default(), None).unwrap();

    std::fs::write(occluder_path(dir.path()), legacy_file(ByteOrder::Little)).unwrap();
    pipeline.load_level(&StdFileSystem, dir.path()).unwrap();
    assert_eq!(pipeline.instance_count(), 2);

    // A file with an unknown version word replaces the level with nothing
    let mut bad = vec![0u8; 16];
    bad[0..4].copy_from_slice(&0x1234_5678u32.to_le_bytes());
    std::fs::write(occluder_path(dir.path()), bad).unwrap();
    let err = pipeline.load_level(&StdFileSystem, dir.path()).unwrap_err();
    assert!(matches!(err, CullError::UnsupportedVersion(0x1234_5678)));
    assert_eq!(pipeline.instance_count(), 0);

    let missing = tempfile::tempdir().unwrap();
    assert!(matches!(
        pipeline.load_level(&StdFileSystem, missing.path()),
        Err(CullError::Io(_))
    ));
    assert_eq!(pipeline.instance_count(), 0);
}
