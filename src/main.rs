/// ocm-tool: inspect occluder mesh files and migrate legacy ones
use clap::{Parser, Subcommand};
use occlusion_culler::geometry::Aabb;
use occlusion_culler::occluder::{migrate_legacy, OcmHeader, OcmVersion, OcclusionMeshStore};
use occlusion_culler::Result;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(name = "ocm-tool", version)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, PartialEq)]
enum Command {
    /// Print the header and mesh counts of an occluder file
    Info { file: PathBuf },
    /// Rewrite a legacy occluder file in the current format
    Migrate { input: PathBuf, output: PathBuf },
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let result = match &args.command {
        Command::Info { file } => info(file),
        Command::Migrate { input, output } => migrate(input, output),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

fn info(path: &Path) -> Result<()> {
    let bytes = std::fs::read(path)?;
    let header = OcmHeader::parse(&bytes)?;
    let store = OcclusionMeshStore::parse(&bytes)?;

    let triangles: usize = store.meshes().iter().map(|m| m.triangle_count()).sum();
    let mut bounds = Aabb::EMPTY;
    for instance in store.instances() {
        bounds.extend(instance.world_bounds.min);
        bounds.extend(instance.world_bounds.max);
    }

    println!("=== {} ===", path.display());
    println!("  version:        {:?} ({:?} endian)", header.version, header.byte_order);
    println!("  file size:      {} bytes", bytes.len());
    println!("  meshes:         {}", header.mesh_count);
    println!("  instances:      {}", header.instance_count);
    println!("  instance table: offset {}", header.instance_table_offset);
    println!("  vertices:       {}", store.total_vertex_count());
    println!("  triangles:      {}", triangles);
    if !bounds.is_empty() {
        println!("  world bounds:   {:?} .. {:?}", bounds.min, bounds.max);
    }
    Ok(())
}

fn migrate(input: &Path, output: &Path) -> Result<()> {
    let bytes = std::fs::read(input)?;
    let header = OcmHeader::parse(&bytes)?;
    if header.version == OcmVersion::Current {
        log::info!("{} is already current, copying unchanged", input.display());
        std::fs::write(output, &bytes)?;
        return Ok(());
    }

    let migrated = migrate_legacy(&bytes)?;
    // Reject output the loader would not accept
    let store = OcclusionMeshStore::parse(&migrated)?;
    std::fs::write(output, &migrated)?;
    log::info!(
        "migrated {} -> {}: {} meshes, {} instances, {} bytes",
        input.display(),
        output.display(),
        store.mesh_count(),
        store.instance_count(),
        migrated.len()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn command_line_is_well_formed() {
        Args::command().debug_assert();
    }

    #[test]
    fn subcommands_parse_their_paths() {
        let args = Args::try_parse_from(["ocm-tool", "info", "level/occluder.ocm"]).unwrap();
        assert_eq!(
            args.command,
            Command::Info {
                file: PathBuf::from("level/occluder.ocm")
            }
        );

        let args = Args::try_parse_from(["ocm-tool", "migrate", "old.ocm", "new.ocm"]).unwrap();
        assert_eq!(
            args.command,
            Command::Migrate {
                input: PathBuf::from("old.ocm"),
                output: PathBuf::from("new.ocm")
            }
        );
    }

    #[test]
    fn missing_arguments_are_rejected() {
        assert!(Args::try_parse_from(["ocm-tool"]).is_err());
        assert!(Args::try_parse_from(["ocm-tool", "migrate", "old.ocm"]).is_err());
        assert!(Args::try_parse_from(["ocm-tool", "convert", "a", "b"]).is_err());
    }

    #[test]
    fn migrate_copies_current_files() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.ocm");
        let output = dir.path().join("out.ocm");
        let bytes = occlusion_culler::occluder::OcmWriter::current().finish();
        std::fs::write(&input, &bytes).unwrap();

        migrate(&input, &output).unwrap();
        assert_eq!(std::fs::read(&output).unwrap(), bytes);
        assert!(info(&output).is_ok());
    }
}
