use candle_core::Tensor;

use crate::models::error::AppError;
use crate::services::feature_model::FeatureExtractor;

/// Dream loss of an unbatched `[h, w, 3]` image: the sum over tapped
/// activations of each activation's mean.
pub fn calc_loss(img: &Tensor, model: &dyn FeatureExtractor) -> Result<Tensor, AppError> {
    let batch = img.unsqueeze(0)?;
    let activations = model.activations(&batch)?;

    let mut means = activations.iter().map(|act| act.mean_all());
    let mut loss = match means.next() {
        Some(first) => first?,
        None => {
            return Err(AppError::ShapeMismatch(format!(
                "feature model '{}' produced no activations",
                model.id()
            )))
        }
    };
    for mean in means {
        loss = loss.add(&mean?)?;
    }

    Ok(loss)
}
