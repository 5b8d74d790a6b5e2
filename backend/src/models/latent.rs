use serde::{Deserialize, Serialize};

/// Latent render request. `z` wins over `seed`; without either a fresh
/// vector is sampled.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LatentRequest {
    pub z: Option<Vec<f32>>,
    pub seed: Option<u64>,
    pub grid: Option<LatentGrid>,
}

/// Sweep of two latent dimensions around the base vector.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LatentGrid {
    pub cells: usize,
    pub dims: (usize, usize),
    #[serde(default = "default_span")]
    pub span: f32,
}

fn default_span() -> f32 {
    3.0
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LatentSummary {
    pub model_id: String,
    pub width: u32,
    pub height: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cells: Option<usize>,
}
