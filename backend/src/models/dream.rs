use serde::{Deserialize, Serialize};

use super::config::AppConfig;
use super::error::AppError;

pub const OCTAVE_SCALE_RANGE: (f32, f32) = (1.2, 3.0);
pub const OCTAVE_EXPONENT_RANGE: (i32, i32) = (-3, 3);
pub const STEPS_PER_OCTAVE_RANGE: (usize, usize) = (1, 200);
pub const TILE_SIZE_RANGE: (usize, usize) = (1, 8192);

/// Dream run request; absent fields fall back to the configured defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DreamRequest {
    pub step_size: Option<f32>,
    pub octaves: Option<Vec<i32>>,
    pub octave_scale: Option<f32>,
    pub steps_per_octave: Option<usize>,
    pub tile_size: Option<usize>,
    pub seed: Option<u64>,
}

/// Hyperparameters of one DeepDream run.
#[derive(Debug, Clone, PartialEq)]
pub struct DreamParams {
    /// Adam learning rate, in normalized pixel units.
    pub step_size: f32,
    /// Octave exponents, visited in this order.
    pub octaves: Vec<i32>,
    pub octave_scale: f32,
    pub steps_per_octave: usize,
    /// Tile edge length in pixels.
    pub tile_size: usize,
    /// Seed for the per-step tiling shift. `None` draws from entropy.
    pub seed: Option<u64>,
    /// Evaluate the tiles of one step on the rayon pool.
    pub parallel_tiles: bool,
}

impl Default for DreamParams {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for DreamParams {
    fn from(config: &AppConfig) -> Self {
        Self {
            step_size: config.step_size,
            octaves: config.octaves.clone(),
            octave_scale: config.octave_scale,
            steps_per_octave: config.steps_per_octave,
            tile_size: config.tile_size,
            seed: config.seed,
            parallel_tiles: config.parallel_tiles,
        }
    }
}

impl DreamParams {
    pub fn from_request(req: &DreamRequest, config: &AppConfig) -> Self {
        let defaults = Self::from(config);
        Self {
            step_size: req.step_size.unwrap_or(defaults.step_size),
            octaves: req.octaves.clone().unwrap_or(defaults.octaves),
            octave_scale: req.octave_scale.unwrap_or(defaults.octave_scale),
            steps_per_octave: req.steps_per_octave.unwrap_or(defaults.steps_per_octave),
            tile_size: req.tile_size.unwrap_or(defaults.tile_size),
            seed: req.seed.or(defaults.seed),
            parallel_tiles: defaults.parallel_tiles,
        }
    }

    /// Checks the ranges accepted from callers. `run_deepdream` itself
    /// trusts its inputs.
    pub fn validate(&self) -> Result<(), AppError> {
        let (min_scale, max_scale) = OCTAVE_SCALE_RANGE;
        if !(min_scale..=max_scale).contains(&self.octave_scale) {
            return Err(AppError::ValidationError(format!(
                "octaveScale must be between {} and {}",
                min_scale, max_scale
            )));
        }

        if self.octaves.is_empty() {
            return Err(AppError::ValidationError(
                "octaves must not be empty".to_string(),
            ));
        }
        let (min_exp, max_exp) = OCTAVE_EXPONENT_RANGE;
        if let Some(bad) = self.octaves.iter().find(|o| !(min_exp..=max_exp).contains(*o)) {
            return Err(AppError::ValidationError(format!(
                "octave exponent {} outside [{}, {}]",
                bad, min_exp, max_exp
            )));
        }

        let (min_steps, max_steps) = STEPS_PER_OCTAVE_RANGE;
        if !(min_steps..=max_steps).contains(&self.steps_per_octave) {
            return Err(AppError::ValidationError(format!(
                "stepsPerOctave must be between {} and {}",
                min_steps, max_steps
            )));
        }

        if !(self.step_size.is_finite() && self.step_size > 0.0) {
            return Err(AppError::ValidationError(
                "stepSize must be a positive number".to_string(),
            ));
        }

        let (min_tile, max_tile) = TILE_SIZE_RANGE;
        if !(min_tile..=max_tile).contains(&self.tile_size) {
            return Err(AppError::ValidationError(format!(
                "tileSize must be between {} and {}",
                min_tile, max_tile
            )));
        }

        Ok(())
    }
}

/// Events emitted while a run progresses.
#[derive(Debug, Clone, PartialEq)]
pub enum DreamProgress {
    /// The working image was resized for a new octave.
    OctaveStarted {
        octave: usize,
        exponent: i32,
        height: usize,
        width: usize,
    },
    /// One Adam step finished; `t` is the bias-correction step it used.
    StepCompleted {
        octave: usize,
        step: usize,
        t: u32,
    },
}

/// Serializable summary stored on a finished dream job.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DreamSummary {
    pub width: u32,
    pub height: u32,
    pub octaves: Vec<i32>,
    pub octave_scale: f32,
    pub steps_per_octave: usize,
    pub elapsed_ms: u64,
}
