use std::sync::Arc;

use candle_core::{Tensor, Var};
use rand::Rng;
use rayon::prelude::*;

use crate::models::error::AppError;
use crate::services::dream_loss::calc_loss;
use crate::services::feature_model::FeatureExtractor;

pub const DEFAULT_TILE_SIZE: usize = 512;

/// Added to the gradient's standard deviation before normalizing.
pub const GRADIENT_EPSILON: f64 = 1e-8;

// ---------------------------------------------------------------------------
// Tiling
// ---------------------------------------------------------------------------

/// One tile of the shifted image, in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tile {
    pub row: usize,
    pub col: usize,
    pub height: usize,
    pub width: usize,
}

/// Tile origins along one axis of length `extent`.
///
/// Origins step by `tile_size`; the last origin is dropped so no partial
/// tile is evaluated, unless it is the only one.
pub fn tile_origins(extent: usize, tile_size: usize) -> Vec<usize> {
    let mut origins: Vec<usize> = (0..extent).step_by(tile_size.max(1)).collect();
    origins.pop();
    if origins.is_empty() {
        // Axis shorter than two tiles: one tile at offset 0.
        origins.push(0);
    }
    origins
}

/// Row-major tile grid over an `height` x `width` image.
pub fn tile_grid(height: usize, width: usize, tile_size: usize) -> Vec<Tile> {
    let rows = tile_origins(height, tile_size);
    let cols = tile_origins(width, tile_size);

    let mut tiles = Vec::with_capacity(rows.len() * cols.len());
    for &row in &rows {
        for &col in &cols {
            tiles.push(Tile {
                row,
                col,
                height: tile_size.min(height - row),
                width: tile_size.min(width - col),
            });
        }
    }
    tiles
}

/// Draws the (row, column) shift for one step, each in `[-tile_size, tile_size)`.
pub fn random_shift<R: Rng + ?Sized>(
    rng: &mut R,
    tile_size: usize,
) -> Result<(i32, i32), AppError> {
    let max = i32::try_from(tile_size)
        .ok()
        .filter(|&m| m > 0)
        .ok_or_else(|| {
            AppError::ShapeMismatch(format!("tile size {} cannot be shifted", tile_size))
        })?;
    let dy = rng.gen_range(-max..max);
    let dx = rng.gen_range(-max..max);
    Ok((dy, dx))
}

/// Circularly shifts an `[h, w, c]` tensor along its two spatial axes.
pub fn roll(img: &Tensor, (dy, dx): (i32, i32)) -> candle_core::Result<Tensor> {
    img.roll(dy, 0)?.roll(dx, 1)
}

/// Divides by the population standard deviation of all values plus
/// [`GRADIENT_EPSILON`].
pub fn normalize_gradient(gradients: &Tensor) -> Result<Tensor, AppError> {
    let mean = gradients.mean_all()?;
    let variance = gradients.broadcast_sub(&mean)?.sqr()?.mean_all()?;
    let std = variance.sqrt()?.to_scalar::<f32>()?;
    if !std.is_finite() {
        return Err(AppError::NonFiniteGradient);
    }
    Ok(gradients.affine(1.0 / (std as f64 + GRADIENT_EPSILON), 0.0)?)
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Computes dream-loss gradients for a whole image, tile by tile.
pub struct TiledGradients {
    model: Arc<dyn FeatureExtractor>,
    parallel: bool,
}

impl TiledGradients {
    pub fn new(model: Arc<dyn FeatureExtractor>) -> Self {
        Self {
            model,
            parallel: false,
        }
    }

    /// Evaluate the tiles of a step concurrently. Tile gradients are placed
    /// in row-major order, so they match the sequential path bit for bit.
    pub fn with_parallel_tiles(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn model(&self) -> &Arc<dyn FeatureExtractor> {
        &self.model
    }

    /// Normalized gradient of the dream loss for an `[h, w, 3]` image, with
    /// a fresh random shift drawn from `rng`.
    pub fn compute<R: Rng + ?Sized>(
        &self,
        img: &Tensor,
        tile_size: usize,
        rng: &mut R,
    ) -> Result<Tensor, AppError> {
        let shift = random_shift(rng, tile_size)?;
        self.compute_with_shift(img, tile_size, shift)
    }

    pub fn compute_with_shift(
        &self,
        img: &Tensor,
        tile_size: usize,
        shift: (i32, i32),
    ) -> Result<Tensor, AppError> {
        let (height, width) = check_image_shape(img)?;
        if tile_size == 0 {
            return Err(AppError::ShapeMismatch("tile size must be positive".to_string()));
        }

        let rolled = roll(img, shift)?;
        let tiles = tile_grid(height, width, tile_size);

        let per_tile = if self.parallel {
            tiles
                .par_iter()
                .map(|tile| self.tile_gradient(&rolled, tile))
                .collect::<Result<Vec<_>, _>>()?
        } else {
            tiles
                .iter()
                .map(|tile| self.tile_gradient(&rolled, tile))
                .collect::<Result<Vec<_>, _>>()?
        };

        let gradients = assemble_tiles(&tiles, per_tile, height, width)?;
        let gradients = roll(&gradients, (-shift.0, -shift.1))?;
        normalize_gradient(&gradients)
    }

    /// Gradient of one tile's loss with respect to that tile's pixels.
    fn tile_gradient(&self, rolled: &Tensor, tile: &Tile) -> Result<Tensor, AppError> {
        let patch = Var::from_tensor(
            &rolled
                .narrow(0, tile.row, tile.height)?
                .narrow(1, tile.col, tile.width)?,
        )?;
        let loss = calc_loss(patch.as_tensor(), self.model.as_ref())?;
        let grads = loss.backward()?;

        match grads.get(patch.as_tensor()) {
            Some(g) => Ok(g.detach()),
            None => Ok(patch.zeros_like()?),
        }
    }
}

/// Stitches row-major tile gradients from [`tile_grid`] into an
/// `[height, width, c]` tensor. Pixels outside every tile get zero.
pub fn assemble_tiles(
    tiles: &[Tile],
    gradients: Vec<Tensor>,
    height: usize,
    width: usize,
) -> Result<Tensor, AppError> {
    let first = gradients
        .first()
        .ok_or_else(|| AppError::ShapeMismatch("no tile gradients".to_string()))?;
    if tiles.len() != gradients.len() {
        return Err(AppError::ShapeMismatch(format!(
            "{} tiles but {} gradients",
            tiles.len(),
            gradients.len()
        )));
    }
    let (dtype, device) = (first.dtype(), first.device().clone());
    let channels = first.dim(2)?;

    let mut rows: Vec<Tensor> = Vec::new();
    let mut covered_height = 0;
    let mut i = 0;
    while i < tiles.len() {
        let row = tiles[i].row;
        let tile_height = tiles[i].height;
        let mut parts = Vec::new();
        let mut covered_width = 0;
        while i < tiles.len() && tiles[i].row == row {
            parts.push(gradients[i].clone());
            covered_width = tiles[i].col + tiles[i].width;
            i += 1;
        }
        if covered_width < width {
            parts.push(Tensor::zeros(
                (tile_height, width - covered_width, channels),
                dtype,
                &device,
            )?);
        }
        rows.push(Tensor::cat(&parts, 1)?);
        covered_height = row + tile_height;
    }
    if covered_height < height {
        rows.push(Tensor::zeros(
            (height - covered_height, width, channels),
            dtype,
            &device,
        )?);
    }

    Ok(Tensor::cat(&rows, 0)?)
}

fn check_image_shape(img: &Tensor) -> Result<(usize, usize), AppError> {
    match img.dims() {
        &[h, w, 3] if h > 0 && w > 0 => Ok((h, w)),
        dims => Err(AppError::ShapeMismatch(format!(
            "expected a non-empty [h, w, 3] image, got {:?}",
            dims
        ))),
    }
}
