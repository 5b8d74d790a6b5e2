use std::collections::HashMap;
use std::path::Path;

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{conv2d, Conv2d, Conv2dConfig, VarBuilder};

use crate::models::error::AppError;
use crate::models::manifest::FeatureModelManifest;

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Frozen scoring network whose intermediate activations drive the dream.
///
/// Implementations are shared read-only between concurrent runs.
pub trait FeatureExtractor: Send + Sync {
    /// Model identifier, for logs.
    fn id(&self) -> &str;

    /// Maps an NHWC batch (`[n, h, w, 3]`) to the tapped activations.
    fn activations(&self, batch: &Tensor) -> candle_core::Result<Vec<Tensor>>;
}

// ---------------------------------------------------------------------------
// ConvFeatureModel
// ---------------------------------------------------------------------------

struct Stage {
    conv: Conv2d,
    pool: Option<usize>,
    tapped: bool,
}

/// Plain conv/ReLU/max-pool stack described by a [`FeatureModelManifest`].
pub struct ConvFeatureModel {
    id: String,
    stages: Vec<Stage>,
}

impl ConvFeatureModel {
    pub fn new(manifest: &FeatureModelManifest, vb: VarBuilder) -> Result<Self, AppError> {
        validate_manifest(manifest)?;

        let mut stages = Vec::with_capacity(manifest.stages.len());
        for layer in &manifest.stages {
            let cfg = Conv2dConfig {
                padding: layer.padding,
                stride: layer.stride,
                ..Default::default()
            };
            let conv = conv2d(
                layer.in_channels,
                layer.out_channels,
                layer.kernel,
                cfg,
                vb.pp(&layer.name),
            )
            .map_err(|e| AppError::ModelLoad(format!("stage '{}': {}", layer.name, e)))?;

            stages.push(Stage {
                conv,
                pool: layer.pool.filter(|&k| k > 1),
                tapped: manifest.taps.iter().any(|t| t == &layer.name),
            });
        }

        Ok(Self {
            id: manifest.id.clone(),
            stages,
        })
    }

    /// Loads weights from the manifest's safetensors file.
    pub fn load(
        manifest: &FeatureModelManifest,
        models_dir: &Path,
        device: &Device,
    ) -> Result<Self, AppError> {
        let weights_path = models_dir.join(&manifest.file);
        if !weights_path.exists() {
            return Err(AppError::ModelLoad(format!(
                "weights file '{}' not found",
                manifest.file
            )));
        }

        // SAFETY: the weight file is not modified while the process runs.
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[weights_path], DType::F32, device)
                .map_err(|e| AppError::ModelLoad(format!("Failed to load weights: {}", e)))?
        };
        Self::new(manifest, vb)
    }

    /// Builds a model from in-memory weights keyed `<stage>.weight` / `<stage>.bias`.
    pub fn from_tensors(
        manifest: &FeatureModelManifest,
        weights: HashMap<String, Tensor>,
        device: &Device,
    ) -> Result<Self, AppError> {
        let vb = VarBuilder::from_tensors(weights, DType::F32, device);
        Self::new(manifest, vb)
    }

    pub fn num_taps(&self) -> usize {
        self.stages.iter().filter(|s| s.tapped).count()
    }
}

impl FeatureExtractor for ConvFeatureModel {
    fn id(&self) -> &str {
        &self.id
    }

    fn activations(&self, batch: &Tensor) -> candle_core::Result<Vec<Tensor>> {
        let mut x = batch.permute((0, 3, 1, 2))?.contiguous()?;
        let mut taps = Vec::with_capacity(self.num_taps());

        for stage in &self.stages {
            x = stage.conv.forward(&x)?.relu()?;
            if let Some(k) = stage.pool {
                let (_, _, h, w) = x.dims4()?;
                // Small tiles keep their resolution rather than pooling to nothing.
                if h >= k && w >= k {
                    x = x.max_pool2d(k)?;
                }
            }
            if stage.tapped {
                taps.push(x.clone());
            }
        }

        Ok(taps)
    }
}

fn validate_manifest(manifest: &FeatureModelManifest) -> Result<(), AppError> {
    let first = manifest.stages.first().ok_or_else(|| {
        AppError::Manifest(format!("feature model '{}' has no stages", manifest.id))
    })?;
    if first.in_channels != 3 {
        return Err(AppError::Manifest(format!(
            "first stage '{}' must take 3 channels, got {}",
            first.name, first.in_channels
        )));
    }

    for pair in manifest.stages.windows(2) {
        if pair[0].out_channels != pair[1].in_channels {
            return Err(AppError::Manifest(format!(
                "stage '{}' outputs {} channels but '{}' expects {}",
                pair[0].name, pair[0].out_channels, pair[1].name, pair[1].in_channels
            )));
        }
    }

    if manifest.stages.iter().any(|s| s.kernel == 0 || s.stride == 0) {
        return Err(AppError::Manifest(
            "kernel and stride must be positive".to_string(),
        ));
    }

    if manifest.taps.is_empty() {
        return Err(AppError::Manifest(format!(
            "feature model '{}' taps no stage",
            manifest.id
        )));
    }
    for tap in &manifest.taps {
        if !manifest.stages.iter().any(|s| &s.name == tap) {
            return Err(AppError::Manifest(format!("unknown tap '{}'", tap)));
        }
    }

    Ok(())
}
