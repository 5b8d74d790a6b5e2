use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use candle_core::Device;
use image::{imageops::FilterType, DynamicImage, GenericImageView};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::models::config::AppConfig;
use crate::models::dream::{DreamParams, DreamProgress, DreamRequest, DreamSummary};
use crate::models::error::AppError;
use crate::models::jobs::{Job, JobKind};
use crate::models::latent::{LatentRequest, LatentSummary};
use crate::models::manifest::*;
use crate::services::deepdream::run_deepdream;
use crate::services::feature_model::{ConvFeatureModel, FeatureExtractor};
use crate::services::job_manager::JobManager;
use crate::services::latent::{validate_grid, LatentRenderer};
use crate::services::tiled_gradients::TiledGradients;

// ---------------------------------------------------------------------------
// DreamService
// ---------------------------------------------------------------------------

/// Owns the loaded models and runs dreams under the configured concurrency
/// and time limits.
pub struct DreamService {
    config: Arc<AppConfig>,
    gradients: Arc<TiledGradients>,
    latent: Option<Arc<LatentRenderer>>,
    model_statuses: Vec<ModelStatus>,
    run_slots: Arc<Semaphore>,
    jobs: JobManager,
}

impl DreamService {
    /// Scans `models_dir` for manifests. The first loadable feature model
    /// becomes the dream model; a missing one is fatal.
    pub fn new(config: Arc<AppConfig>) -> Result<Self, AppError> {
        let models_path = Path::new(&config.models_dir);
        let mut feature: Option<Arc<dyn FeatureExtractor>> = None;
        let mut latent = None;
        let mut model_statuses = Vec::new();

        for (path, json) in read_manifests(models_path) {
            let header = match serde_json::from_str::<ManifestHeader>(&json) {
                Ok(h) => h,
                Err(e) => {
                    tracing::debug!("Skipping {:?}: {}", path, e);
                    continue;
                }
            };
            if !KNOWN_ADAPTERS.contains(&header.adapter.as_str()) {
                continue;
            }

            let artifact = models_path.join(&header.file);
            let file_size_mb = std::fs::metadata(&artifact)
                .ok()
                .map(|m| m.len() as f64 / 1_048_576.0);

            let loaded = if !artifact.exists() {
                tracing::debug!("Model '{}' file not found: {:?}", header.id, artifact);
                false
            } else {
                match header.adapter.as_str() {
                    ADAPTER_CONV_FEATURES if feature.is_none() => {
                        match load_feature_model(&json, models_path) {
                            Ok(model) => {
                                tracing::info!("Loaded feature model '{}' from {:?}", header.id, artifact);
                                feature = Some(model);
                                true
                            }
                            Err(e) => {
                                tracing::warn!("Failed to load feature model '{}': {}", header.id, e);
                                false
                            }
                        }
                    }
                    ADAPTER_VAE_DECODER if latent.is_none() => {
                        match load_latent_renderer(&json, models_path) {
                            Ok(renderer) => {
                                latent = Some(Arc::new(renderer));
                                true
                            }
                            Err(e) => {
                                tracing::warn!("Failed to load latent decoder '{}': {}", header.id, e);
                                false
                            }
                        }
                    }
                    _ => {
                        tracing::debug!("Model '{}' shadowed by an earlier {} model", header.id, header.adapter);
                        false
                    }
                }
            };

            model_statuses.push(ModelStatus {
                id: header.id,
                name: header.name,
                adapter: header.adapter,
                available: loaded,
                file_size_mb,
            });
        }

        let feature = feature.ok_or_else(|| {
            tracing::warn!("No loadable feature model in {}", config.models_dir);
            AppError::ModelUnavailable(ADAPTER_CONV_FEATURES.to_string())
        })?;

        let mut service = Self::with_models(config, feature, latent);
        service.model_statuses = model_statuses;
        Ok(service)
    }

    /// Builds a service around already loaded models.
    pub fn with_models(
        config: Arc<AppConfig>,
        feature: Arc<dyn FeatureExtractor>,
        latent: Option<Arc<LatentRenderer>>,
    ) -> Self {
        let gradients = TiledGradients::new(feature).with_parallel_tiles(config.parallel_tiles);
        Self {
            run_slots: Arc::new(Semaphore::new(config.max_parallel_runs.max(1))),
            jobs: JobManager::new(config.job_ttl_secs, config.idempotency_ttl_secs),
            gradients: Arc::new(gradients),
            latent,
            model_statuses: Vec::new(),
            config,
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn available_models(&self) -> &[ModelStatus] {
        &self.model_statuses
    }

    pub fn has_latent_decoder(&self) -> bool {
        self.latent.is_some()
    }

    pub fn get_job(&self, job_id: &str) -> Option<Arc<Job>> {
        self.jobs.get_job(job_id)
    }

    pub fn cleanup(&self) {
        self.jobs.cleanup_old_jobs();
    }

    // -----------------------------------------------------------------------
    // Dream runs
    // -----------------------------------------------------------------------

    /// Runs one dream on the blocking pool once a run slot is free.
    pub async fn run_dream<F>(
        &self,
        img: DynamicImage,
        params: DreamParams,
        progress: F,
    ) -> Result<DynamicImage, AppError>
    where
        F: Fn(DreamProgress) + Send + 'static,
    {
        params.validate()?;
        let permit = self.acquire_run_slot().await?;
        self.run_admitted(permit, img, params, progress).await
    }

    async fn acquire_run_slot(&self) -> Result<OwnedSemaphorePermit, AppError> {
        self.run_slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| AppError::Internal(format!("Run slots closed: {}", e)))
    }

    /// Runs a dream that already holds a slot. The slot is released when the
    /// computation actually ends, even when the caller gave up on a timeout.
    async fn run_admitted<F>(
        &self,
        permit: OwnedSemaphorePermit,
        img: DynamicImage,
        params: DreamParams,
        progress: F,
    ) -> Result<DynamicImage, AppError>
    where
        F: Fn(DreamProgress) + Send + 'static,
    {
        let img = limit_input_edge(img, self.config.max_input_edge);
        let gradients = self.gradients.clone();
        let task = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            run_deepdream(&img, &params, &gradients, &progress)
        });

        let limit = Duration::from_secs(self.config.run_timeout_secs);
        match tokio::time::timeout(limit, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(AppError::Internal(format!("Task panicked: {}", e))),
            Err(_) => Err(AppError::RunTimeout),
        }
    }

    /// Validates the request and starts a background dream job. Must be
    /// called from within a Tokio runtime.
    pub fn submit_dream(
        self: &Arc<Self>,
        img: DynamicImage,
        request: &DreamRequest,
        idempotency_key: Option<&str>,
    ) -> Result<String, AppError> {
        let params = DreamParams::from_request(request, &self.config);
        params.validate()?;

        let (job_id, job, created) = self.jobs.create_job(JobKind::Dream, idempotency_key);
        if !created {
            return Ok(job_id);
        }

        let service = self.clone();
        let jid = job_id.clone();
        tokio::spawn(async move {
            // Stays PENDING while queued behind other runs.
            let permit = match service.acquire_run_slot().await {
                Ok(permit) => permit,
                Err(e) => {
                    job.set_failed(e.to_problem_detail(&jid));
                    return;
                }
            };
            job.set_processing();
            tracing::info!(job_id = %jid, octaves = ?params.octaves, "Dream job started");

            let started = Instant::now();
            let total_steps = (params.octaves.len() * params.steps_per_octave).max(1) as f64;
            let steps_per_octave = params.steps_per_octave;
            let job_ref = job.clone();
            let on_progress = move |event: DreamProgress| {
                if let DreamProgress::StepCompleted { octave, step, .. } = event {
                    let done = (octave * steps_per_octave + step + 1) as f64;
                    job_ref.set_progress(done / total_steps);
                }
            };

            let summary_params = params.clone();
            match service.run_admitted(permit, img, params, on_progress).await {
                Ok(output) => {
                    let (width, height) = output.dimensions();
                    let summary = DreamSummary {
                        width,
                        height,
                        octaves: summary_params.octaves,
                        octave_scale: summary_params.octave_scale,
                        steps_per_octave: summary_params.steps_per_octave,
                        elapsed_ms: started.elapsed().as_millis() as u64,
                    };
                    let json = serde_json::to_value(&summary).unwrap_or_default();
                    job.set_complete(json, output);
                    tracing::info!(job_id = %jid, elapsed_ms = summary.elapsed_ms, "Dream job complete");
                }
                Err(e) => {
                    tracing::warn!(job_id = %jid, error = %e, "Dream job failed");
                    job.set_failed(e.to_problem_detail(&jid));
                }
            }
        });

        Ok(job_id)
    }

    // -----------------------------------------------------------------------
    // Latent renders
    // -----------------------------------------------------------------------

    /// Decodes one latent vector, or a grid sweep around it.
    pub async fn render_latent(&self, request: LatentRequest) -> Result<DynamicImage, AppError> {
        let renderer = self.latent.clone().ok_or_else(|| {
            AppError::ModelUnavailable(ADAPTER_VAE_DECODER.to_string())
        })?;
        if let Some(grid) = &request.grid {
            validate_grid(grid)?;
        }

        tokio::task::spawn_blocking(move || renderer.render_request(&request))
            .await
            .map_err(|e| AppError::Internal(format!("Task panicked: {}", e)))?
    }

    /// Starts a background latent render job.
    pub fn submit_latent(
        self: &Arc<Self>,
        request: LatentRequest,
        idempotency_key: Option<&str>,
    ) -> Result<String, AppError> {
        if !self.has_latent_decoder() {
            return Err(AppError::ModelUnavailable(ADAPTER_VAE_DECODER.to_string()));
        }

        let (job_id, job, created) = self.jobs.create_job(JobKind::LatentRender, idempotency_key);
        if !created {
            return Ok(job_id);
        }

        let service = self.clone();
        let jid = job_id.clone();
        tokio::spawn(async move {
            job.set_processing();
            let cells = request.grid.as_ref().map(|g| g.cells);
            match service.render_latent(request).await {
                Ok(output) => {
                    let (width, height) = output.dimensions();
                    let summary = LatentSummary {
                        model_id: service
                            .latent
                            .as_ref()
                            .map(|r| r.manifest().id.clone())
                            .unwrap_or_default(),
                        width,
                        height,
                        cells,
                    };
                    let json = serde_json::to_value(&summary).unwrap_or_default();
                    job.set_complete(json, output);
                }
                Err(e) => {
                    tracing::warn!(job_id = %jid, error = %e, "Latent render job failed");
                    job.set_failed(e.to_problem_detail(&jid));
                }
            }
        });

        Ok(job_id)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Lists the known models under `models_dir` without loading them;
/// `available` only reports whether the artifact file exists.
pub fn scan_model_statuses(models_dir: &Path) -> Vec<ModelStatus> {
    read_manifests(models_dir)
        .into_iter()
        .filter_map(|(_, json)| serde_json::from_str::<ManifestHeader>(&json).ok())
        .filter(|h| KNOWN_ADAPTERS.contains(&h.adapter.as_str()))
        .map(|h| {
            let artifact = models_dir.join(&h.file);
            let metadata = std::fs::metadata(&artifact).ok();
            ModelStatus {
                available: metadata.is_some(),
                file_size_mb: metadata.map(|m| m.len() as f64 / 1_048_576.0),
                id: h.id,
                name: h.name,
                adapter: h.adapter,
            }
        })
        .collect()
}

/// `*.json` files of `dir` with their contents, in path order.
fn read_manifests(dir: &Path) -> Vec<(PathBuf, String)> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => {
            tracing::debug!("Models directory {:?} not found", dir);
            return Vec::new();
        }
    };

    let mut paths: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.extension().map_or(false, |e| e == "json"))
        .collect();
    paths.sort();

    paths
        .into_iter()
        .filter_map(|p| std::fs::read_to_string(&p).ok().map(|json| (p, json)))
        .collect()
}

fn load_feature_model(json: &str, models_dir: &Path) -> Result<Arc<dyn FeatureExtractor>, AppError> {
    let manifest: FeatureModelManifest =
        serde_json::from_str(json).map_err(|e| AppError::Manifest(e.to_string()))?;
    let model = ConvFeatureModel::load(&manifest, models_dir, &Device::Cpu)?;
    Ok(Arc::new(model))
}

/// Loads the first usable latent decoder under `models_dir`. Needs no
/// feature model.
pub fn find_latent_renderer(models_dir: &Path) -> Result<LatentRenderer, AppError> {
    for (path, json) in read_manifests(models_dir) {
        let is_decoder = serde_json::from_str::<ManifestHeader>(&json)
            .map_or(false, |h| h.adapter == ADAPTER_VAE_DECODER);
        if !is_decoder {
            continue;
        }
        match load_latent_renderer(&json, models_dir) {
            Ok(renderer) => return Ok(renderer),
            Err(e) => tracing::warn!("Skipping latent decoder {:?}: {}", path, e),
        }
    }
    Err(AppError::ModelUnavailable(ADAPTER_VAE_DECODER.to_string()))
}

fn load_latent_renderer(json: &str, models_dir: &Path) -> Result<LatentRenderer, AppError> {
    let manifest: LatentModelManifest =
        serde_json::from_str(json).map_err(|e| AppError::Manifest(e.to_string()))?;
    LatentRenderer::load(manifest, models_dir)
}

/// Downscales so the longest edge is at most `max_edge`, keeping the aspect ratio.
pub fn limit_input_edge(img: DynamicImage, max_edge: u32) -> DynamicImage {
    let (w, h) = img.dimensions();
    if max_edge == 0 || (w <= max_edge && h <= max_edge) {
        return img;
    }
    let scale = max_edge as f64 / w.max(h) as f64;
    let nw = ((w as f64 * scale) as u32).max(1);
    let nh = ((h as f64 * scale) as u32).max(1);
    img.resize_exact(nw, nh, FilterType::Triangle)
}

#[cfg(test)]
mod tests {
    use candle_core::Tensor;
    use image::{Rgb, RgbImage};

    use super::*;
    use crate::models::jobs::JobStatus;
    use crate::services::feature_model::test_support::tiny_model;

    fn config() -> AppConfig {
        AppConfig {
            tile_size: 16,
            steps_per_octave: 2,
            octaves: vec![0],
            seed: Some(3),
            ..AppConfig::default()
        }
    }

    fn service(config: AppConfig) -> Arc<DreamService> {
        Arc::new(DreamService::with_models(Arc::new(config), tiny_model(), None))
    }

    fn gray(w: u32, h: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_pixel(w, h, Rgb([120, 110, 100])))
    }

    async fn wait_for_finish(service: &DreamService, job_id: &str) -> Arc<Job> {
        for _ in 0..500 {
            let job = service.get_job(job_id).unwrap();
            if job.get_info().status.is_finished() {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {} did not finish", job_id);
    }

    /// Wraps a model and sleeps on every forward pass.
    struct SlowModel(Arc<dyn FeatureExtractor>);

    impl FeatureExtractor for SlowModel {
        fn id(&self) -> &str {
            "slow"
        }

        fn activations(&self, batch: &Tensor) -> candle_core::Result<Vec<Tensor>> {
            std::thread::sleep(Duration::from_millis(300));
            self.0.activations(batch)
        }
    }

    #[test]
    fn limit_input_edge_keeps_aspect_ratio() {
        let out = limit_input_edge(gray(400, 100), 200);
        assert_eq!(out.dimensions(), (200, 50));

        let small = limit_input_edge(gray(30, 20), 200);
        assert_eq!(small.dimensions(), (30, 20));
    }

    #[tokio::test]
    async fn run_dream_downsizes_large_inputs() {
        let service = service(AppConfig {
            max_input_edge: 24,
            ..config()
        });
        let params = DreamParams::from(service.config());
        let out = service.run_dream(gray(48, 32), params, |_| {}).await.unwrap();
        assert_eq!(out.dimensions(), (24, 16));
    }

    #[tokio::test]
    async fn run_dream_rejects_invalid_params() {
        let service = service(config());
        let params = DreamParams {
            steps_per_octave: 0,
            ..DreamParams::from(service.config())
        };
        let err = service.run_dream(gray(8, 8), params, |_| {}).await.unwrap_err();
        assert!(matches!(err, AppError::ValidationError(_)));
    }

    #[tokio::test]
    async fn run_dream_times_out() {
        let config = Arc::new(AppConfig {
            run_timeout_secs: 0,
            ..config()
        });
        let slow: Arc<dyn FeatureExtractor> = Arc::new(SlowModel(tiny_model()));
        let service = DreamService::with_models(config.clone(), slow, None);
        let params = DreamParams::from(config.as_ref());

        let err = service.run_dream(gray(8, 8), params, |_| {}).await.unwrap_err();
        assert!(matches!(err, AppError::RunTimeout));
    }

    #[tokio::test]
    async fn submitted_dream_completes_with_result_image() {
        let service = service(config());
        let request = DreamRequest {
            steps_per_octave: Some(3),
            ..DreamRequest::default()
        };
        let job_id = service.submit_dream(gray(20, 12), &request, None).unwrap();
        let job = wait_for_finish(&service, &job_id).await;

        let info = job.get_info();
        assert_eq!(info.status, JobStatus::Complete);
        assert_eq!(info.progress, Some(1.0));
        let result = info.result.unwrap();
        assert_eq!(result["width"], 20);
        assert_eq!(result["height"], 12);
        assert_eq!(result["stepsPerOctave"], 3);
        assert_eq!(job.output().unwrap().dimensions(), (20, 12));
    }

    #[tokio::test]
    async fn idempotent_submissions_share_a_job() {
        let service = service(config());
        let request = DreamRequest::default();
        let a = service.submit_dream(gray(8, 8), &request, Some("same")).unwrap();
        let b = service.submit_dream(gray(8, 8), &request, Some("same")).unwrap();
        assert_eq!(a, b);
        wait_for_finish(&service, &a).await;
    }

    #[tokio::test]
    async fn invalid_submission_creates_no_job() {
        let service = service(config());
        let request = DreamRequest {
            octave_scale: Some(5.0),
            ..DreamRequest::default()
        };
        let err = service.submit_dream(gray(8, 8), &request, Some("bad")).unwrap_err();
        assert!(matches!(err, AppError::ValidationError(_)));
        assert!(service.jobs.is_empty());
    }

    #[tokio::test]
    async fn degenerate_octave_fails_the_job() {
        let service = service(config());
        let request = DreamRequest {
            octaves: Some(vec![-3]),
            octave_scale: Some(3.0),
            ..DreamRequest::default()
        };
        let job_id = service.submit_dream(gray(8, 8), &request, None).unwrap();
        let job = wait_for_finish(&service, &job_id).await;

        let info = job.get_info();
        assert_eq!(info.status, JobStatus::Failed);
        assert_eq!(info.error.unwrap().code, "DEGENERATE_OCTAVE");
        assert!(job.output().is_none());
    }

    #[tokio::test]
    async fn cleanup_drops_finished_jobs_past_ttl() {
        let service = service(AppConfig {
            job_ttl_secs: 0,
            ..config()
        });
        let job_id = service.submit_dream(gray(8, 8), &DreamRequest::default(), None).unwrap();
        wait_for_finish(&service, &job_id).await;

        service.cleanup();
        assert!(service.get_job(&job_id).is_none());
    }

    #[tokio::test]
    async fn queued_jobs_stay_pending_until_a_slot_frees() {
        let service = service(AppConfig {
            max_parallel_runs: 1,
            ..config()
        });
        let held = service.acquire_run_slot().await.unwrap();

        let job_id = service.submit_dream(gray(8, 8), &DreamRequest::default(), None).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(service.get_job(&job_id).unwrap().get_info().status, JobStatus::Pending);

        drop(held);
        let job = wait_for_finish(&service, &job_id).await;
        assert_eq!(job.get_info().status, JobStatus::Complete);
    }

    #[test]
    fn latent_lookup_does_not_need_a_feature_model() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("vae.json"),
            r#"{"id": "vae", "name": "VAE", "adapter": "vae_decoder", "file": "vae.onnx",
                "latentDim": 8, "height": 16, "width": 16}"#,
        )
        .unwrap();

        // No conv_features manifest at all: the decoder is looked up on its
        // own and only its missing ONNX file is reported.
        match find_latent_renderer(dir.path()) {
            Err(AppError::ModelUnavailable(adapter)) => assert_eq!(adapter, ADAPTER_VAE_DECODER),
            Err(e) => panic!("unexpected error {}", e),
            Ok(_) => panic!("decoder without an ONNX file loaded"),
        }
    }

    #[tokio::test]
    async fn latent_requests_need_a_decoder() {
        let service = service(config());
        let err = service.render_latent(LatentRequest::default()).await.unwrap_err();
        assert!(matches!(err, AppError::ModelUnavailable(_)));
        assert!(service.submit_latent(LatentRequest::default(), None).is_err());
    }
}
