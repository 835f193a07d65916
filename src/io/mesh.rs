//! Triangle meshes from Wavefront OBJ files.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{Context, Result, bail};
use nalgebra::Vector3;
use tracing::info;

use crate::config::TrackerConfig;
use crate::geometry::TriangleMesh;
use crate::tracking::ObjectModel;

/// Load an OBJ file, merging all of its objects into one triangulated mesh.
pub fn load_obj_mesh<P: AsRef<Path>>(path: P) -> Result<TriangleMesh> {
    let path = path.as_ref();
    let file = File::open(path).with_context(|| format!("Failed to open mesh {}", path.display()))?;
    parse_obj(&mut BufReader::new(file))
        .with_context(|| format!("Failed to load mesh {}", path.display()))
}

pub fn parse_obj<R: BufRead>(reader: &mut R) -> Result<TriangleMesh> {
    // Materials are irrelevant for silhouettes.
    let (models, _materials) = tobj::load_obj_buf(
        reader,
        &tobj::LoadOptions {
            single_index: true,
            triangulate: true,
            ..Default::default()
        },
        |_material_path| Err(tobj::LoadError::MaterialParseError),
    )
    .context("failed loading obj")?;

    let mut mesh = TriangleMesh::default();
    for model in &models {
        let offset = u32::try_from(mesh.vertices.len()).context("mesh too large")?;
        mesh.vertices.extend(
            model
                .mesh
                .positions
                .chunks_exact(3)
                .map(|p| Vector3::new(f64::from(p[0]), f64::from(p[1]), f64::from(p[2]))),
        );
        mesh.triangles.extend(
            model
                .mesh
                .indices
                .chunks_exact(3)
                .map(|t| [t[0] + offset, t[1] + offset, t[2] + offset]),
        );
    }

    if mesh.triangles.is_empty() {
        bail!("mesh has no faces");
    }
    Ok(mesh)
}

/// Load `<mesh_dir>/<name>.obj` for every configured model.
pub fn load_models(config: &TrackerConfig) -> Result<Vec<ObjectModel>> {
    config
        .models
        .iter()
        .map(|name| {
            let mesh = load_obj_mesh(config.mesh_path(name))?;
            info!(
                model = %name,
                vertices = mesh.vertices.len(),
                triangles = mesh.num_triangles(),
                "Loaded mesh"
            );
            Ok(ObjectModel::new(name.clone(), mesh))
        })
        .collect()
}
