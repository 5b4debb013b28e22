use std::collections::BTreeSet;
use std::path::Path;

use comfyctl_spec::ResolvedModel;

/// Subdirectory names the engine looks up out of the box.
const ENGINE_SUBDIRS: &[&str] = &[
    "checkpoints",
    "clip",
    "clip_vision",
    "controlnet",
    "diffusion_models",
    "embeddings",
    "loras",
    "unet",
    "upscale_models",
    "vae",
];

/// Render `extra_model_paths.yaml` for an engine home.
///
/// Maps the engine's conventional subdirectory names, plus the leading
/// directory of every custom target path, to locations under the shared
/// models dir. The document is a fixed two-level mapping, emitted literally.
pub fn render_extra_model_paths(models_dir: &Path, models: &[ResolvedModel]) -> String {
    let mut subdirs: BTreeSet<String> = ENGINE_SUBDIRS
        .iter()
        .map(|&subdir| subdir.to_string())
        .collect();
    for model in models {
        let target = Path::new(&model.target_path);
        if target.is_absolute() {
            continue;
        }
        if let Some(first) = target.components().next() {
            let first = first.as_os_str().to_string_lossy().into_owned();
            // A bare file at the models root maps no subdirectory.
            if target.components().count() > 1 && !first.is_empty() {
                subdirs.insert(first);
            }
        }
    }

    let mut doc = String::from("comfyctl:\n");
    doc.push_str(&format!("  base_path: {}\n", models_dir.display()));
    for subdir in subdirs {
        doc.push_str(&format!("  {subdir}: {subdir}\n"));
    }
    doc
}

/// Write the mapping into the engine home.
pub fn write_extra_model_paths(
    engine_home: &Path,
    models_dir: &Path,
    models: &[ResolvedModel],
) -> std::io::Result<()> {
    fs_err::write(
        engine_home.join("extra_model_paths.yaml"),
        render_extra_model_paths(models_dir, models),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model(target_path: &str) -> ResolvedModel {
        ResolvedModel {
            source: "https://example.com/m.bin".to_string(),
            name: "m.bin".to_string(),
            target_subdir: None,
            target_path: target_path.to_string(),
            checksum: None,
        }
    }

    #[test]
    fn includes_engine_and_custom_subdirs() {
        let doc = render_extra_model_paths(
            Path::new("/volume/models"),
            &[model("animatediff_models/mm.ckpt"), model("rootfile.bin")],
        );
        assert!(doc.starts_with("comfyctl:\n  base_path: /volume/models\n"));
        assert!(doc.contains("  checkpoints: checkpoints\n"));
        assert!(doc.contains("  vae: vae\n"));
        assert!(doc.contains("  animatediff_models: animatediff_models\n"));
        assert!(!doc.contains("rootfile.bin"));
    }
}
