use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread;

use anyhow::{anyhow, Context, Result};
use image::codecs::hdr::HdrDecoder;
use parking_lot::RwLock;
use thiserror::Error;

use crate::car::{CarModel, EnvironmentMap};

/// Number of tracked resources: the environment image and the model.
pub const ITEMS_TOTAL: u32 = 2;

#[derive(Debug, Default, Clone, Copy)]
struct ProgressState {
    loaded: u32,
    failed: bool,
}

/// Load progress shared between the loader threads and the UI thread.
///
/// The fraction only ever reaches 1.0 when both resources decoded; a failed
/// load pins the indicator below completion forever.
#[derive(Debug, Default)]
pub struct LoadProgress {
    state: RwLock<ProgressState>,
}

impl LoadProgress {
    pub fn new() -> Self {
        Self::default()
    }

    fn mark_loaded(&self) {
        self.state.write().loaded += 1;
    }

    fn mark_failed(&self) {
        self.state.write().failed = true;
    }

    /// Fraction of tracked resources that finished decoding.
    pub fn fraction(&self) -> f32 {
        self.state.read().loaded as f32 / ITEMS_TOTAL as f32
    }

    pub fn is_complete(&self) -> bool {
        let state = *self.state.read();
        !state.failed && state.loaded == ITEMS_TOTAL
    }

    pub fn has_failed(&self) -> bool {
        self.state.read().failed
    }
}

/// Asset load failure, carrying the identifier of the failing resource.
/// There is no retry and no fallback asset.
#[derive(Debug, Error)]
pub enum AssetError {
    #[error("failed to load environment map {path}")]
    Environment {
        path: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("failed to load model {path}")]
    Model {
        path: String,
        #[source]
        source: anyhow::Error,
    },
}

impl AssetError {
    /// Path of the resource that failed to load.
    pub fn path(&self) -> &str {
        match self {
            Self::Environment { path, .. } | Self::Model { path, .. } => path,
        }
    }
}

/// Both decoded resources, handed to the scene composer in one piece.
#[derive(Debug)]
pub struct LoadedAssets {
    pub environment: Arc<EnvironmentMap>,
    pub model: CarModel,
}

/// Fetches both resources concurrently on background threads.
///
/// The returned channel yields exactly one message, and only after both
/// loads finished (join semantics, never first-resolved). Any failure is
/// reported through the message; the progress counter never completes.
pub fn spawn_loader(
    model_path: PathBuf,
    env_path: PathBuf,
    progress: Arc<LoadProgress>,
) -> Receiver<Result<LoadedAssets, AssetError>> {
    let (sender, receiver) = mpsc::channel();
    thread::spawn(move || {
        let env_progress = Arc::clone(&progress);
        let env_display = env_path.display().to_string();
        let env_thread = thread::spawn({
            let env_path = env_path.clone();
            move || {
                let result = load_environment(&env_path);
                match &result {
                    Ok(_) => env_progress.mark_loaded(),
                    Err(_) => env_progress.mark_failed(),
                }
                result.map_err(|source| AssetError::Environment {
                    path: env_path.display().to_string(),
                    source,
                })
            }
        });

        let model_result = load_model(&model_path);
        match &model_result {
            Ok(_) => progress.mark_loaded(),
            Err(_) => progress.mark_failed(),
        }
        let model_result = model_result.map_err(|source| AssetError::Model {
            path: model_path.display().to_string(),
            source,
        });

        let env_result = env_thread.join().unwrap_or_else(|_| {
            Err(AssetError::Environment {
                path: env_display,
                source: anyhow!("environment loader thread panicked"),
            })
        });

        let message = match (env_result, model_result) {
            (Ok(environment), Ok(model)) => Ok(LoadedAssets {
                environment: Arc::new(environment),
                model,
            }),
            (Err(err), _) | (_, Err(err)) => Err(err),
        };
        let _ = sender.send(message);
    });
    receiver
}

fn load_environment(path: &Path) -> Result<EnvironmentMap> {
    let file =
        File::open(path).with_context(|| format!("unable to open {}", path.display()))?;
    let decoder = HdrDecoder::new(BufReader::new(file)).context("invalid HDR header")?;
    let metadata = decoder.metadata();
    let texels = decoder
        .read_image_hdr()
        .context("failed to decode HDR image")?;

    let mut pixels = Vec::with_capacity(texels.len() * 3);
    for texel in &texels {
        pixels.extend_from_slice(&texel.0);
    }
    Ok(EnvironmentMap {
        width: metadata.width,
        height: metadata.height,
        pixels,
    })
}

fn load_model(path: &Path) -> Result<CarModel> {
    let (document, buffers, _images) =
        gltf::import(path).with_context(|| format!("unable to import {}", path.display()))?;
    CarModel::from_gltf(&document, &buffers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn progress_advances_per_resource() {
        let progress = LoadProgress::new();
        assert_eq!(progress.fraction(), 0.0);
        progress.mark_loaded();
        assert_eq!(progress.fraction(), 0.5);
        progress.mark_loaded();
        assert_eq!(progress.fraction(), 1.0);
        assert!(progress.is_complete());
    }

    #[test]
    fn failed_progress_never_completes() {
        let progress = LoadProgress::new();
        progress.mark_loaded();
        progress.mark_failed();
        assert!(!progress.is_complete());
        assert!(progress.has_failed());
        assert_eq!(progress.fraction(), 0.5);
    }

    #[test]
    fn error_reports_the_failing_resource() {
        let err = AssetError::Model {
            path: "missing.glb".into(),
            source: anyhow!("no such file"),
        };
        assert_eq!(err.path(), "missing.glb");
        assert!(err.to_string().contains("missing.glb"));
    }

    #[test]
    fn loader_joins_both_results_and_fails_fast() {
        let progress = Arc::new(LoadProgress::new());
        let receiver = spawn_loader(
            PathBuf::from("does-not-exist.glb"),
            PathBuf::from("does-not-exist.hdr"),
            Arc::clone(&progress),
        );
        let message = receiver
            .recv_timeout(Duration::from_secs(10))
            .expect("loader sends exactly one message");
        let err = message.expect_err("both fetches must fail");
        assert!(err.path().contains("does-not-exist"));
        assert!(progress.has_failed());
        assert!(!progress.is_complete());
        // Exactly one message, then the channel closes.
        assert!(receiver.recv_timeout(Duration::from_secs(10)).is_err());
    }
}
