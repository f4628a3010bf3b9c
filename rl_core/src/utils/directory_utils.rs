// Directory utilities - validation of run directories before training starts
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::TrainingError;

/// Refuses to overwrite an existing run unless `resume` or `force` is set,
/// and refuses to resume a run that does not exist.
pub fn validate_existing_directories(
    model_path: &Path,
    resume: bool,
    force: bool,
    init_path: Option<&PathBuf>,
) -> Result<(), TrainingError> {
    if model_path.is_dir() {
        if !resume && !force {
            return Err(TrainingError::ExistingRun(
                "previous data from this run id was found; either specify a new run id, \
                 use --resume to resume this run, or use --force to overwrite existing data"
                    .to_string(),
            ));
        }
    } else if resume {
        return Err(TrainingError::ExistingRun(
            "previous data from this run id was not found; train a new run by removing --resume"
                .to_string(),
        ));
    }

    if let Some(init_path) = init_path {
        if !init_path.is_dir() {
            return Err(TrainingError::ExistingRun(format!(
                "could not initialize from {}; make sure models have already been saved with that run id",
                init_path.display()
            )));
        }
    }
    Ok(())
}

pub fn create_directory_if_not_exists(path: &Path) -> Result<(), TrainingError> {
    if !path.exists() {
        fs::create_dir_all(path).map_err(|_| TrainingError::ModelPath(path.to_path_buf()))?;
    }
    Ok(())
}
