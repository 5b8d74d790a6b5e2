use candle_core::{Device, Tensor};
use image::{DynamicImage, GenericImageView, Rgb, Rgb32FImage, RgbImage};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::models::dream::{DreamParams, DreamProgress};
use crate::models::error::AppError;
use crate::services::tiled_gradients::TiledGradients;

pub const BETA1: f64 = 0.9;
pub const BETA2: f64 = 0.999;
pub const ADAM_EPSILON: f64 = 1e-8;

// ---------------------------------------------------------------------------
// Adam
// ---------------------------------------------------------------------------

/// Moment estimates for one octave.
pub struct AdamState {
    m: Tensor,
    v: Tensor,
    t: u32,
}

impl AdamState {
    /// Zero moments shaped like `like`, step counter at 1.
    pub fn new(like: &Tensor) -> candle_core::Result<Self> {
        Ok(Self {
            m: like.zeros_like()?,
            v: like.zeros_like()?,
            t: 1,
        })
    }

    /// Step counter the next update will use for bias correction.
    pub fn t(&self) -> u32 {
        self.t
    }

    pub fn first_moment(&self) -> &Tensor {
        &self.m
    }

    pub fn second_moment(&self) -> &Tensor {
        &self.v
    }

    /// Folds `grad` into the moments and returns the step to add to the image.
    pub fn update(&mut self, grad: &Tensor, lr: f64) -> candle_core::Result<Tensor> {
        self.m = self.m.affine(BETA1, 0.0)?.add(&grad.affine(1.0 - BETA1, 0.0)?)?;
        self.v = self
            .v
            .affine(BETA2, 0.0)?
            .add(&grad.sqr()?.affine(1.0 - BETA2, 0.0)?)?;

        let t = self.t as i32;
        let m_hat = self.m.affine(1.0 / (1.0 - BETA1.powi(t)), 0.0)?;
        let v_hat = self.v.affine(1.0 / (1.0 - BETA2.powi(t)), 0.0)?;
        let denom = v_hat.sqrt()?.affine(1.0, ADAM_EPSILON)?;

        self.t += 1;
        m_hat.affine(lr, 0.0)?.div(&denom)
    }
}

// ---------------------------------------------------------------------------
// Octaves
// ---------------------------------------------------------------------------

/// Working size `(height, width)` of an octave: `base * scale^exponent`, truncated.
pub fn octave_shape(base: (usize, usize), scale: f32, exponent: i32) -> (usize, usize) {
    let factor = (scale as f64).powi(exponent) as f32;
    (
        (base.0 as f32 * factor) as usize,
        (base.1 as f32 * factor) as usize,
    )
}

/// Working sizes of every octave, in visiting order.
pub fn octave_plan(base: (usize, usize), scale: f32, octaves: &[i32]) -> Vec<(usize, usize)> {
    octaves
        .iter()
        .map(|&exponent| octave_shape(base, scale, exponent))
        .collect()
}

// ---------------------------------------------------------------------------
// Pre/post processing
// ---------------------------------------------------------------------------

// The working image between octaves is kept in [0, 1]; the signed form only
// exists as a tensor inside an octave.

fn preprocess(img: &DynamicImage) -> Result<Rgb32FImage, AppError> {
    let (w, h) = img.dimensions();
    if w == 0 || h == 0 {
        return Err(AppError::InvalidImage("image has no pixels".to_string()));
    }
    // Drops alpha; grayscale is expanded to three channels.
    Ok(img.to_rgb32f())
}

/// Source neighbours and blend weight for output index `dst`, with
/// half-pixel centers.
fn bilinear_taps(dst: usize, src_len: usize, dst_len: usize) -> (u32, u32, f32) {
    let scale = src_len as f32 / dst_len as f32;
    let pos = ((dst as f32 + 0.5) * scale - 0.5).max(0.0);
    let lo = (pos.floor() as usize).min(src_len - 1);
    let hi = (lo + 1).min(src_len - 1);
    (lo as u32, hi as u32, pos - lo as f32)
}

/// Plain bilinear resample: every output pixel blends the 2x2 source pixels
/// around its center, without an antialiasing prefilter on downscale.
fn resize(img: &Rgb32FImage, height: usize, width: usize) -> Rgb32FImage {
    let (src_w, src_h) = img.dimensions();
    if (src_w, src_h) == (width as u32, height as u32) {
        return img.clone();
    }

    let xs: Vec<_> = (0..width)
        .map(|x| bilinear_taps(x, src_w as usize, width))
        .collect();
    let ys: Vec<_> = (0..height)
        .map(|y| bilinear_taps(y, src_h as usize, height))
        .collect();

    Rgb32FImage::from_fn(width as u32, height as u32, |x, y| {
        let (x0, x1, fx) = xs[x as usize];
        let (y0, y1, fy) = ys[y as usize];
        let (a, b) = (img.get_pixel(x0, y0).0, img.get_pixel(x1, y0).0);
        let (c, d) = (img.get_pixel(x0, y1).0, img.get_pixel(x1, y1).0);
        let mut px = [0f32; 3];
        for ch in 0..3 {
            let top = a[ch] + (b[ch] - a[ch]) * fx;
            let bottom = c[ch] + (d[ch] - c[ch]) * fx;
            px[ch] = top + (bottom - top) * fy;
        }
        Rgb(px)
    })
}

/// [0, 1] image to a [-1, 1] `[h, w, 3]` tensor.
fn to_signed_tensor(img: &Rgb32FImage, device: &Device) -> candle_core::Result<Tensor> {
    let (w, h) = img.dimensions();
    Tensor::from_vec(img.as_raw().clone(), (h as usize, w as usize, 3), device)?.affine(2.0, -1.0)
}

fn from_signed_tensor(t: &Tensor) -> Result<Rgb32FImage, AppError> {
    let (h, w, _) = t.dims3()?;
    let data = t.affine(0.5, 0.5)?.flatten_all()?.to_vec1::<f32>()?;
    Rgb32FImage::from_raw(w as u32, h as u32, data)
        .ok_or_else(|| AppError::Internal("tensor does not match image size".to_string()))
}

fn postprocess(img: &Rgb32FImage) -> Result<DynamicImage, AppError> {
    let (w, h) = img.dimensions();
    let bytes: Vec<u8> = img.as_raw().iter().map(|&v| (255.0 * v) as u8).collect();
    let rgb = RgbImage::from_raw(w, h, bytes)
        .ok_or_else(|| AppError::Internal("Failed to create output image".to_string()))?;
    Ok(DynamicImage::ImageRgb8(rgb))
}

// ---------------------------------------------------------------------------
// run_deepdream
// ---------------------------------------------------------------------------

/// Multi-octave gradient ascent on the dream loss.
///
/// Each octave resizes the previous octave's result to
/// `source size * octave_scale^exponent`, resets Adam, and runs
/// `steps_per_octave` steps, clipping pixels to [-1, 1] after each one.
pub fn run_deepdream(
    img: &DynamicImage,
    params: &DreamParams,
    gradients: &TiledGradients,
    progress: &dyn Fn(DreamProgress),
) -> Result<DynamicImage, AppError> {
    let device = Device::Cpu;
    let mut rng = match params.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let lr = params.step_size as f64;

    let (w, h) = img.dimensions();
    let base = (h as usize, w as usize);
    let mut current = resize(&preprocess(img)?, base.0, base.1);

    for (octave, &exponent) in params.octaves.iter().enumerate() {
        let (height, width) = octave_shape(base, params.octave_scale, exponent);
        if height == 0 || width == 0 {
            return Err(AppError::DegenerateOctave { exponent, height, width });
        }
        current = resize(&current, height, width);
        progress(DreamProgress::OctaveStarted { octave, exponent, height, width });
        tracing::debug!(
            octave,
            exponent,
            height,
            width,
            steps = params.steps_per_octave,
            "dream octave"
        );

        let mut image = to_signed_tensor(&current, &device)?;
        let mut adam = AdamState::new(&image)?;

        for step in 0..params.steps_per_octave {
            let grad = gradients.compute(&image, params.tile_size, &mut rng)?;
            let t = adam.t();
            let update = adam.update(&grad, lr)?;
            image = image.add(&update)?.clamp(-1f32, 1f32)?;
            progress(DreamProgress::StepCompleted { octave, step, t });
        }

        current = from_signed_tensor(&image)?;
    }

    postprocess(&current)
}
