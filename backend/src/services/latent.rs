use std::path::Path;

use image::{imageops, DynamicImage, RgbImage};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

use crate::models::error::AppError;
use crate::models::latent::{LatentGrid, LatentRequest};
use crate::models::manifest::{LatentModelManifest, OutputRange, TensorLayout};

/// Largest latent grid edge accepted from callers.
pub const MAX_GRID_CELLS: usize = 16;

/// VAE decoder that turns latent vectors into images.
pub struct LatentRenderer {
    session: Mutex<ort::session::Session>,
    manifest: LatentModelManifest,
}

impl LatentRenderer {
    pub fn load(manifest: LatentModelManifest, models_dir: &Path) -> Result<Self, AppError> {
        if !matches!(manifest.channels, 1 | 3) {
            return Err(AppError::Manifest(format!(
                "decoder '{}' must output 1 or 3 channels, got {}",
                manifest.id, manifest.channels
            )));
        }
        if manifest.latent_dim == 0 || manifest.height == 0 || manifest.width == 0 {
            return Err(AppError::Manifest(format!(
                "decoder '{}' has an empty latent or output shape",
                manifest.id
            )));
        }

        let onnx_path = models_dir.join(&manifest.file);
        if !onnx_path.exists() {
            return Err(AppError::ModelLoad(format!(
                "ONNX file '{}' not found",
                manifest.file
            )));
        }

        let session = ort::session::Session::builder()
            .and_then(|b| b.with_intra_threads(2))
            .and_then(|b| b.commit_from_file(&onnx_path))
            .map_err(|e| AppError::ModelLoad(format!("ONNX session load error: {}", e)))?;

        tracing::info!("Loaded latent decoder '{}' from {:?}", manifest.id, onnx_path);

        Ok(Self {
            session: Mutex::new(session),
            manifest,
        })
    }

    pub fn manifest(&self) -> &LatentModelManifest {
        &self.manifest
    }

    pub fn latent_dim(&self) -> usize {
        self.manifest.latent_dim
    }

    /// Decodes one latent vector.
    pub fn render(&self, z: &[f32]) -> Result<DynamicImage, AppError> {
        let dim = self.manifest.latent_dim;
        if z.len() != dim {
            return Err(AppError::ValidationError(format!(
                "latent vector has {} values, decoder expects {}",
                z.len(),
                dim
            )));
        }

        let input = ndarray::Array2::<f32>::from_shape_vec((1, dim), z.to_vec())
            .map_err(|e| AppError::Inference(format!("Latent tensor: {}", e)))?;
        let input_tensor = ort::value::Tensor::from_array(input)
            .map_err(|e| AppError::Inference(format!("Latent tensor: {}", e)))?;

        let mut session = self.session.lock();
        let outputs = session
            .run(ort::inputs![input_tensor])
            .map_err(|e| AppError::Inference(format!("Decoder inference: {}", e)))?;

        let (_shape, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| AppError::Inference(format!("Extract decoder output: {}", e)))?;

        decoded_to_image(data, &self.manifest).map(DynamicImage::ImageRgb8)
    }

    /// Sweeps two latent dimensions of `base` over `[-span, span]` and tiles
    /// the decoded images into a `cells` x `cells` mosaic.
    pub fn render_grid(
        &self,
        base: &[f32],
        dims: (usize, usize),
        span: f32,
        cells: usize,
    ) -> Result<DynamicImage, AppError> {
        let latents = grid_latents(base, dims, span, cells)?;
        let mut tiles = Vec::with_capacity(latents.len());
        for z in &latents {
            tiles.push(self.render(z)?.to_rgb8());
        }
        compose_grid(&tiles, cells).map(DynamicImage::ImageRgb8)
    }

    /// Renders a request: `z` if given, else a vector sampled from `seed`,
    /// swept over a grid when one is requested.
    pub fn render_request(&self, request: &LatentRequest) -> Result<DynamicImage, AppError> {
        let z = request
            .z
            .clone()
            .unwrap_or_else(|| sample_latent(self.latent_dim(), request.seed));
        match &request.grid {
            Some(grid) => {
                validate_grid(grid)?;
                self.render_grid(&z, grid.dims, grid.span, grid.cells)
            }
            None => self.render(&z),
        }
    }
}

pub fn validate_grid(grid: &LatentGrid) -> Result<(), AppError> {
    if !(1..=MAX_GRID_CELLS).contains(&grid.cells) {
        return Err(AppError::ValidationError(format!(
            "grid cells must be between 1 and {}",
            MAX_GRID_CELLS
        )));
    }
    if !(grid.span.is_finite() && grid.span >= 0.0) {
        return Err(AppError::ValidationError(
            "grid span must be a non-negative number".to_string(),
        ));
    }
    Ok(())
}

/// Draws `z ~ N(0, I)`.
pub fn sample_latent(dim: usize, seed: Option<u64>) -> Vec<f32> {
    let mut rng = match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    (0..dim).map(|_| rng.sample::<f32, _>(StandardNormal)).collect()
}

/// Latent vectors of a grid, row-major. Columns sweep `dims.0` from `-span`
/// to `span`; rows sweep `dims.1` from `span` down to `-span`.
pub fn grid_latents(
    base: &[f32],
    dims: (usize, usize),
    span: f32,
    cells: usize,
) -> Result<Vec<Vec<f32>>, AppError> {
    if cells == 0 {
        return Err(AppError::ValidationError("grid needs at least one cell".to_string()));
    }
    if dims.0 >= base.len() || dims.1 >= base.len() || dims.0 == dims.1 {
        return Err(AppError::ValidationError(format!(
            "grid dimensions {:?} invalid for a {}-dimensional latent",
            dims,
            base.len()
        )));
    }

    let coord = |i: usize| -> f32 {
        if cells == 1 {
            0.0
        } else {
            -span + 2.0 * span * i as f32 / (cells - 1) as f32
        }
    };

    let mut latents = Vec::with_capacity(cells * cells);
    for row in 0..cells {
        for col in 0..cells {
            let mut z = base.to_vec();
            z[dims.0] = coord(col);
            z[dims.1] = -coord(row);
            latents.push(z);
        }
    }
    Ok(latents)
}

/// Converts raw decoder output into an RGB image.
pub fn decoded_to_image(data: &[f32], manifest: &LatentModelManifest) -> Result<RgbImage, AppError> {
    let (w, h, c) = (
        manifest.width as usize,
        manifest.height as usize,
        manifest.channels,
    );
    if data.len() != w * h * c {
        return Err(AppError::ShapeMismatch(format!(
            "decoder produced {} values, expected {}x{}x{}",
            data.len(),
            h,
            w,
            c
        )));
    }

    let index = |x: usize, y: usize, ch: usize| match manifest.layout {
        TensorLayout::Nchw => ch * h * w + y * w + x,
        TensorLayout::Nhwc => (y * w + x) * c + ch,
    };
    let to_byte = |v: f32| {
        let unit = match manifest.range {
            OutputRange::Unit => v,
            OutputRange::Signed => (v + 1.0) / 2.0,
        };
        (unit.clamp(0.0, 1.0) * 255.0).round() as u8
    };

    let img = RgbImage::from_fn(manifest.width, manifest.height, |x, y| {
        let (x, y) = (x as usize, y as usize);
        let mut px = [0u8; 3];
        for (ch, out) in px.iter_mut().enumerate() {
            // Single-channel decoders are replicated to gray RGB.
            let src = if c == 1 { 0 } else { ch };
            *out = to_byte(data[index(x, y, src)]);
        }
        image::Rgb(px)
    });
    Ok(img)
}

/// Lays equally sized tiles out row-major on a `cells` x `cells` canvas.
pub fn compose_grid(tiles: &[RgbImage], cells: usize) -> Result<RgbImage, AppError> {
    if cells == 0 || tiles.len() != cells * cells {
        return Err(AppError::Internal(format!(
            "{} tiles do not fill a {}x{} grid",
            tiles.len(),
            cells,
            cells
        )));
    }
    let (tw, th) = tiles[0].dimensions();
    if tiles.iter().any(|t| t.dimensions() != (tw, th)) {
        return Err(AppError::Internal("grid tiles differ in size".to_string()));
    }

    let mut canvas = RgbImage::new(tw * cells as u32, th * cells as u32);
    for (i, tile) in tiles.iter().enumerate() {
        let (row, col) = ((i / cells) as u32, (i % cells) as u32);
        imageops::replace(&mut canvas, tile, (col * tw) as i64, (row * th) as i64);
    }
    Ok(canvas)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::manifest::ADAPTER_VAE_DECODER;

    fn manifest(w: u32, h: u32, channels: usize, layout: TensorLayout, range: OutputRange) -> LatentModelManifest {
        LatentModelManifest {
            id: "vae".to_string(),
            name: "VAE".to_string(),
            adapter: ADAPTER_VAE_DECODER.to_string(),
            file: "decoder.onnx".to_string(),
            latent_dim: 2,
            height: h,
            width: w,
            channels,
            layout,
            range,
        }
    }

    #[test]
    fn nchw_unit_output_maps_channels_to_planes() {
        let m = manifest(2, 1, 3, TensorLayout::Nchw, OutputRange::Unit);
        // planes: R = [0, 1], G = [1, 0], B = [0.5, 0.5]
        let data = [0.0, 1.0, 1.0, 0.0, 0.5, 0.5];
        let img = decoded_to_image(&data, &m).unwrap();
        assert_eq!(img.get_pixel(0, 0).0, [0, 255, 128]);
        assert_eq!(img.get_pixel(1, 0).0, [255, 0, 128]);
    }

    #[test]
    fn nhwc_signed_output_is_rescaled() {
        let m = manifest(1, 2, 3, TensorLayout::Nhwc, OutputRange::Signed);
        let data = [-1.0, 0.0, 1.0, 1.0, 1.0, -1.0];
        let img = decoded_to_image(&data, &m).unwrap();
        assert_eq!(img.get_pixel(0, 0).0, [0, 128, 255]);
        assert_eq!(img.get_pixel(0, 1).0, [255, 255, 0]);
    }

    #[test]
    fn single_channel_output_becomes_gray() {
        let m = manifest(2, 2, 1, TensorLayout::Nchw, OutputRange::Unit);
        let img = decoded_to_image(&[0.0, 0.25, 2.0, -3.0], &m).unwrap();
        assert_eq!(img.get_pixel(1, 0).0, [64, 64, 64]);
        assert_eq!(img.get_pixel(0, 1).0, [255, 255, 255]);
        assert_eq!(img.get_pixel(1, 1).0, [0, 0, 0]);
    }

    #[test]
    fn wrong_output_length_is_a_shape_mismatch() {
        let m = manifest(2, 2, 3, TensorLayout::Nchw, OutputRange::Unit);
        assert!(matches!(
            decoded_to_image(&[0.0; 5], &m),
            Err(AppError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn grid_sweeps_two_dimensions() {
        let base = vec![0.3, 0.0, 0.0];
        let latents = grid_latents(&base, (1, 2), 2.0, 3).unwrap();
        assert_eq!(latents.len(), 9);
        assert_eq!(latents[0], vec![0.3, -2.0, 2.0]);
        assert_eq!(latents[2], vec![0.3, 2.0, 2.0]);
        assert_eq!(latents[4], vec![0.3, 0.0, 0.0]);
        assert_eq!(latents[8], vec![0.3, 2.0, -2.0]);
    }

    #[test]
    fn single_cell_grid_sits_at_the_origin() {
        let latents = grid_latents(&[5.0, 5.0], (0, 1), 3.0, 1).unwrap();
        assert_eq!(latents, vec![vec![0.0, 0.0]]);
    }

    #[test]
    fn grid_rejects_bad_dimensions() {
        assert!(grid_latents(&[0.0, 0.0], (0, 2), 1.0, 2).is_err());
        assert!(grid_latents(&[0.0, 0.0], (1, 1), 1.0, 2).is_err());
        assert!(grid_latents(&[0.0, 0.0], (0, 1), 1.0, 0).is_err());
    }

    #[test]
    fn compose_places_tiles_row_major() {
        let tiles: Vec<RgbImage> = (0..4u8)
            .map(|i| RgbImage::from_pixel(2, 3, image::Rgb([i * 10, 0, 0])))
            .collect();
        let canvas = compose_grid(&tiles, 2).unwrap();
        assert_eq!(canvas.dimensions(), (4, 6));
        assert_eq!(canvas.get_pixel(0, 0).0[0], 0);
        assert_eq!(canvas.get_pixel(3, 0).0[0], 10);
        assert_eq!(canvas.get_pixel(0, 5).0[0], 20);
        assert_eq!(canvas.get_pixel(3, 5).0[0], 30);
    }

    #[test]
    fn grid_requests_are_bounded() {
        let grid = |cells, span| LatentGrid { cells, dims: (0, 1), span };
        assert!(validate_grid(&grid(1, 3.0)).is_ok());
        assert!(validate_grid(&grid(MAX_GRID_CELLS, 0.0)).is_ok());
        for bad in [grid(0, 3.0), grid(MAX_GRID_CELLS + 1, 3.0), grid(3, f32::NAN), grid(3, -1.0)] {
            assert!(matches!(validate_grid(&bad), Err(AppError::ValidationError(_))));
        }
    }

    #[test]
    fn seeded_latents_repeat() {
        let a = sample_latent(16, Some(9));
        let b = sample_latent(16, Some(9));
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
        assert!(a.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn missing_decoder_file_fails_to_load() {
        let dir = tempfile::tempdir().unwrap();
        let m = manifest(4, 4, 3, TensorLayout::Nchw, OutputRange::Unit);
        assert!(matches!(
            LatentRenderer::load(m, dir.path()),
            Err(AppError::ModelLoad(_))
        ));
    }

    #[test]
    fn unsupported_channel_count_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let m = manifest(4, 4, 4, TensorLayout::Nchw, OutputRange::Unit);
        assert!(matches!(
            LatentRenderer::load(m, dir.path()),
            Err(AppError::Manifest(_))
        ));
    }
}
