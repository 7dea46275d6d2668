//! Model file provisioning: resolve from the per-user data directory,
//! downloading on first use.

use anyhow::{anyhow, Result};
use std::path::PathBuf;

/// Get the models directory path.
fn models_dir() -> Result<PathBuf> {
    let data_dir =
        dirs::data_local_dir().ok_or_else(|| anyhow!("could not find local data directory"))?;
    let models_dir = data_dir.join("facesort").join("models");
    std::fs::create_dir_all(&models_dir)?;
    Ok(models_dir)
}

/// Download a model file if it doesn't exist yet.
///
/// Writes through a `.part` file and renames, so an interrupted download
/// never looks like a complete model.
pub(crate) fn ensure_model(filename: &str, url: &str) -> Result<PathBuf> {
    let models_dir = models_dir()?;
    let model_path = models_dir.join(filename);

    if !model_path.exists() {
        tracing::info!(model = %filename, "downloading model...");
        let response = ureq::get(url)
            .call()
            .map_err(|e| anyhow!("failed to download {}: {}", filename, e))?;

        let partial_path = model_path.with_extension("part");
        let mut file = std::fs::File::create(&partial_path)?;
        std::io::copy(&mut response.into_reader(), &mut file)?;
        std::fs::rename(&partial_path, &model_path)?;
        tracing::info!(model = %filename, path = ?model_path, "model downloaded");
    }

    Ok(model_path)
}
