use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use candle_core::{Device, Tensor};
use image::{DynamicImage, GenericImageView, Rgb, RgbImage};

use dreamlens_backend::models::config::AppConfig;
use dreamlens_backend::models::dream::DreamParams;
use dreamlens_backend::models::error::AppError;
use dreamlens_backend::services::dream_service::{scan_model_statuses, DreamService};

const FEATURE_MANIFEST: &str = r#"{
    "id": "dream-tiny",
    "name": "Tiny Dream",
    "adapter": "conv_features",
    "file": "dream-tiny.safetensors",
    "stages": [
        {"name": "conv1", "inChannels": 3, "outChannels": 4, "kernel": 3, "padding": 1, "pool": 2},
        {"name": "conv2", "inChannels": 4, "outChannels": 4, "kernel": 3, "padding": 1}
    ],
    "taps": ["conv1", "conv2"]
}"#;

const DECODER_MANIFEST: &str = r#"{
    "id": "vae-faces",
    "name": "Face VAE",
    "adapter": "vae_decoder",
    "file": "vae-faces.onnx",
    "latentDim": 16,
    "height": 32,
    "width": 32
}"#;

fn write_weights(dir: &Path) {
    let device = Device::Cpu;
    let conv = |cout: usize, cin: usize| {
        let n = cout * cin * 9;
        let data: Vec<f32> = (0..n).map(|i| 0.01 * ((i % 5) as f32 + 1.0)).collect();
        Tensor::from_vec(data, (cout, cin, 3, 3), &device).unwrap()
    };
    let bias = |c: usize| Tensor::from_vec(vec![0.1f32; c], c, &device).unwrap();

    let mut tensors = HashMap::new();
    tensors.insert("conv1.weight".to_string(), conv(4, 3));
    tensors.insert("conv1.bias".to_string(), bias(4));
    tensors.insert("conv2.weight".to_string(), conv(4, 4));
    tensors.insert("conv2.bias".to_string(), bias(4));
    candle_core::safetensors::save(&tensors, dir.join("dream-tiny.safetensors")).unwrap();
}

fn config_for(dir: &Path) -> Arc<AppConfig> {
    Arc::new(AppConfig {
        models_dir: dir.to_string_lossy().into_owned(),
        tile_size: 32,
        steps_per_octave: 2,
        octaves: vec![-1, 0],
        seed: Some(11),
        ..AppConfig::default()
    })
}

#[test]
fn missing_feature_model_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("dream-tiny.json"), FEATURE_MANIFEST).unwrap();

    let err = DreamService::new(config_for(dir.path())).err().unwrap();
    assert!(matches!(err, AppError::ModelUnavailable(_)));

    let statuses = scan_model_statuses(dir.path());
    assert_eq!(statuses.len(), 1);
    assert!(!statuses[0].available);
    assert!(statuses[0].file_size_mb.is_none());
}

#[test]
fn scanning_ignores_unrelated_json() {
    let dir = tempfile::tempdir().unwrap();
    write_weights(dir.path());
    std::fs::write(dir.path().join("dream-tiny.json"), FEATURE_MANIFEST).unwrap();
    std::fs::write(dir.path().join("notes.json"), r#"{"hello": "world"}"#).unwrap();
    std::fs::write(
        dir.path().join("other.json"),
        r#"{"id": "x", "name": "X", "adapter": "nafnet", "file": "x.onnx"}"#,
    )
    .unwrap();

    let statuses = scan_model_statuses(dir.path());
    assert_eq!(statuses.len(), 1);
    assert_eq!(statuses[0].id, "dream-tiny");
    assert!(statuses[0].available);
}

#[tokio::test]
async fn loads_manifest_and_dreams() {
    let dir = tempfile::tempdir().unwrap();
    write_weights(dir.path());
    std::fs::write(dir.path().join("dream-tiny.json"), FEATURE_MANIFEST).unwrap();
    std::fs::write(dir.path().join("vae-faces.json"), DECODER_MANIFEST).unwrap();

    let config = config_for(dir.path());
    let service = DreamService::new(config.clone()).unwrap();

    let statuses = service.available_models();
    assert_eq!(statuses.len(), 2);
    let feature = statuses.iter().find(|s| s.id == "dream-tiny").unwrap();
    assert!(feature.available);
    assert!(feature.file_size_mb.unwrap() > 0.0);
    // The decoder manifest has no ONNX file next to it.
    let decoder = statuses.iter().find(|s| s.id == "vae-faces").unwrap();
    assert!(!decoder.available);
    assert!(!service.has_latent_decoder());

    let img = DynamicImage::ImageRgb8(RgbImage::from_fn(40, 24, |x, y| {
        Rgb([(x * 6) as u8, (y * 10) as u8, 128])
    }));
    let params = DreamParams::from(config.as_ref());
    let out = service.run_dream(img.clone(), params, |_| {}).await.unwrap();

    assert_eq!(out.dimensions(), (40, 24));
    assert_ne!(out.to_rgb8().into_raw(), img.to_rgb8().into_raw());
}
