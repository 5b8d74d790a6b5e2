use std::env;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub models_dir: String,
    pub log_level: String,
    pub tile_size: usize,
    pub step_size: f32,
    pub steps_per_octave: usize,
    pub octave_scale: f32,
    pub octaves: Vec<i32>,
    pub parallel_tiles: bool,
    pub seed: Option<u64>,
    pub max_parallel_runs: usize,
    pub run_timeout_secs: u64,
    pub max_input_edge: u32,
    pub job_ttl_secs: u64,
    pub idempotency_ttl_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            models_dir: "./models".to_string(),
            log_level: "info".to_string(),
            tile_size: 512,
            step_size: 0.02,
            steps_per_octave: 100,
            octave_scale: 1.3,
            octaves: (-2..=2).collect(),
            parallel_tiles: false,
            seed: None,
            max_parallel_runs: 2,
            run_timeout_secs: 600,
            max_input_edge: 2560,
            job_ttl_secs: 3600,
            idempotency_ttl_secs: 600,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            models_dir: env::var("MODELS_DIR").unwrap_or(defaults.models_dir),
            log_level: env::var("LOG_LEVEL").unwrap_or(defaults.log_level),
            tile_size: parse_var("DREAM_TILE_SIZE").unwrap_or(defaults.tile_size),
            step_size: parse_var("DREAM_STEP_SIZE").unwrap_or(defaults.step_size),
            steps_per_octave: parse_var("DREAM_STEPS_PER_OCTAVE")
                .unwrap_or(defaults.steps_per_octave),
            octave_scale: parse_var("DREAM_OCTAVE_SCALE").unwrap_or(defaults.octave_scale),
            octaves: env::var("DREAM_OCTAVES")
                .ok()
                .and_then(|v| parse_octaves(&v))
                .unwrap_or(defaults.octaves),
            parallel_tiles: env::var("DREAM_PARALLEL_TILES")
                .ok()
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(defaults.parallel_tiles),
            seed: parse_var("DREAM_SEED"),
            max_parallel_runs: parse_var("MAX_PARALLEL_RUNS").unwrap_or(defaults.max_parallel_runs),
            run_timeout_secs: parse_var("RUN_TIMEOUT_SECS").unwrap_or(defaults.run_timeout_secs),
            max_input_edge: parse_var("MAX_INPUT_EDGE").unwrap_or(defaults.max_input_edge),
            job_ttl_secs: parse_var("JOB_TTL_SECS").unwrap_or(defaults.job_ttl_secs),
            idempotency_ttl_secs: parse_var("IDEMPOTENCY_TTL_SECS")
                .unwrap_or(defaults.idempotency_ttl_secs),
        }
    }
}

fn parse_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

/// Parses an octave list written either as an inclusive range (`-2..2`)
/// or as a comma-separated list (`-1,0,1`).
pub fn parse_octaves(raw: &str) -> Option<Vec<i32>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Some((start, end)) = raw.split_once("..") {
        let start: i32 = start.trim().parse().ok()?;
        let end: i32 = end.trim().trim_start_matches('=').parse().ok()?;
        if start > end {
            return None;
        }
        return Some((start..=end).collect());
    }

    raw.split(',')
        .map(|s| s.trim().parse().ok())
        .collect()
}
