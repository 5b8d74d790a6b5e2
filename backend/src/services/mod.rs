pub mod deepdream;
pub mod dream_loss;
pub mod dream_service;
pub mod feature_model;
pub mod job_manager;
pub mod latent;
pub mod tiled_gradients;
