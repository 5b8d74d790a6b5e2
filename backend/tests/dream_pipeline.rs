use std::sync::Arc;

use candle_core::Tensor;
use image::{DynamicImage, GenericImageView, Rgb, RgbImage};
use parking_lot::Mutex;

use dreamlens_backend::models::dream::{DreamParams, DreamProgress};
use dreamlens_backend::services::deepdream::run_deepdream;
use dreamlens_backend::services::feature_model::FeatureExtractor;
use dreamlens_backend::services::tiled_gradients::TiledGradients;

/// Scores an image by its mean value, so every step brightens it uniformly.
struct Brightness;

impl FeatureExtractor for Brightness {
    fn id(&self) -> &str {
        "brightness"
    }

    fn activations(&self, batch: &Tensor) -> candle_core::Result<Vec<Tensor>> {
        Ok(vec![batch.clone()])
    }
}

fn params(octaves: Vec<i32>, steps: usize, step_size: f32) -> DreamParams {
    DreamParams {
        step_size,
        octaves,
        octave_scale: 1.5,
        steps_per_octave: steps,
        tile_size: 512,
        seed: Some(1),
        parallel_tiles: false,
    }
}

#[test]
fn custom_extractor_drives_the_ascent() {
    let gradients = TiledGradients::new(Arc::new(Brightness));
    let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(16, 16, Rgb([100, 100, 100])));

    // Five Adam steps of ~0.1 in [-1, 1] units: +0.25 in [0, 1], about 64 levels.
    let out = run_deepdream(&img, &params(vec![0], 5, 0.1), &gradients, &|_| {}).unwrap();

    for px in out.to_rgb8().pixels() {
        for &c in &px.0 {
            assert!((160..=167).contains(&c), "pixel channel {}", c);
        }
    }
}

#[test]
fn progress_reports_every_octave_and_step() {
    let gradients = TiledGradients::new(Arc::new(Brightness));
    let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(30, 20, Rgb([10, 20, 30])));
    let events = Mutex::new(Vec::new());

    let out = run_deepdream(&img, &params(vec![-1, 0, 1], 2, 0.01), &gradients, &|e| {
        events.lock().push(e)
    })
    .unwrap();

    assert_eq!(out.dimensions(), (45, 30));
    let events = events.into_inner();
    assert_eq!(events.len(), 3 * (1 + 2));
    assert_eq!(
        events[0],
        DreamProgress::OctaveStarted { octave: 0, exponent: -1, height: 13, width: 20 }
    );
    assert_eq!(
        events[8],
        DreamProgress::StepCompleted { octave: 2, step: 1, t: 2 }
    );
}
