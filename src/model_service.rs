use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PredictionError {
    #[error("Error decoding image: {0}")]
    Decode(#[from] image::ImageError),
    #[error("Inference failed: {0}")]
    Inference(String),
    #[error("Unexpected model output: {0}")]
    UnexpectedOutput(String),
}

/// Runs the classifier on raw encoded image bytes and returns the top label.
#[async_trait]
pub trait ModelService: Send + Sync + Clone + 'static {
    async fn predict(&self, image_data: Bytes) -> Result<String, PredictionError>;
}
