use serde::{Deserialize, Serialize};

pub const ADAPTER_CONV_FEATURES: &str = "conv_features";
pub const ADAPTER_VAE_DECODER: &str = "vae_decoder";

pub const KNOWN_ADAPTERS: &[&str] = &[ADAPTER_CONV_FEATURES, ADAPTER_VAE_DECODER];

/// Fields shared by every model manifest; read first to dispatch on `adapter`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestHeader {
    pub id: String,
    pub name: String,
    pub adapter: String,
    pub file: String,
}

/// Convolutional feature extractor used as the dream model.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureModelManifest {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub adapter: String,
    /// Safetensors weight file, relative to the models directory.
    pub file: String,
    pub stages: Vec<StageSpec>,
    /// Stage names whose activations make up the dream loss.
    pub taps: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageSpec {
    pub name: String,
    pub in_channels: usize,
    pub out_channels: usize,
    pub kernel: usize,
    #[serde(default = "default_stride")]
    pub stride: usize,
    #[serde(default)]
    pub padding: usize,
    /// Max-pool window applied after the activation.
    #[serde(default)]
    pub pool: Option<usize>,
}

fn default_stride() -> usize {
    1
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum TensorLayout {
    #[default]
    Nchw,
    Nhwc,
}

/// Value range of the decoder output.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum OutputRange {
    /// [0, 1]
    #[default]
    Unit,
    /// [-1, 1]
    Signed,
}

/// VAE decoder exported to ONNX: `[1, latent_dim]` in, one image out.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LatentModelManifest {
    pub id: String,
    pub name: String,
    pub adapter: String,
    pub file: String,
    pub latent_dim: usize,
    pub height: u32,
    pub width: u32,
    #[serde(default = "default_channels")]
    pub channels: usize,
    #[serde(default)]
    pub layout: TensorLayout,
    #[serde(default)]
    pub range: OutputRange,
}

fn default_channels() -> usize {
    3
}

/// Status of a model slot, as reported by the `models` command.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelStatus {
    pub id: String,
    pub name: String,
    pub adapter: String,
    pub available: bool,
    pub file_size_mb: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feature_manifest_fills_stage_defaults() {
        let json = r#"{
            "id": "dream-small",
            "name": "Small Dream",
            "adapter": "conv_features",
            "file": "dream.safetensors",
            "stages": [
                {"name": "conv1", "inChannels": 3, "outChannels": 8, "kernel": 3, "padding": 1, "pool": 2},
                {"name": "conv2", "inChannels": 8, "outChannels": 16, "kernel": 3}
            ],
            "taps": ["conv1", "conv2"]
        }"#;
        let manifest: FeatureModelManifest = serde_json::from_str(json).unwrap();
        assert_eq!(manifest.stages.len(), 2);
        assert_eq!(manifest.stages[0].pool, Some(2));
        assert_eq!(manifest.stages[1].stride, 1);
        assert_eq!(manifest.stages[1].padding, 0);
        assert!(manifest.description.is_empty());
    }

    #[test]
    fn latent_manifest_defaults_to_unit_nchw_rgb() {
        let json = r#"{
            "id": "faces-vae",
            "name": "Faces VAE",
            "adapter": "vae_decoder",
            "file": "decoder.onnx",
            "latentDim": 32,
            "height": 64,
            "width": 64
        }"#;
        let manifest: LatentModelManifest = serde_json::from_str(json).unwrap();
        assert_eq!(manifest.channels, 3);
        assert_eq!(manifest.layout, TensorLayout::Nchw);
        assert_eq!(manifest.range, OutputRange::Unit);
    }

    #[test]
    fn latent_manifest_reads_layout_and_range() {
        let json = r#"{
            "id": "v", "name": "v", "adapter": "vae_decoder", "file": "d.onnx",
            "latentDim": 2, "height": 28, "width": 28, "channels": 1,
            "layout": "nhwc", "range": "signed"
        }"#;
        let manifest: LatentModelManifest = serde_json::from_str(json).unwrap();
        assert_eq!(manifest.layout, TensorLayout::Nhwc);
        assert_eq!(manifest.range, OutputRange::Signed);
        assert_eq!(manifest.channels, 1);
    }
}
