use crate::{
    config::ModelConfig,
    labels::ClassLabels,
    model_service::{ModelService, PredictionError},
};
use async_trait::async_trait;
use bytes::Bytes;
use image::imageops::FilterType;
use ndarray::{Array, Ix4};
use ort::{
    session::{builder::GraphOptimizationLevel, Session},
    value::TensorRef,
};
use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("{message}")]
    IncompatibleArtifact {
        message: String,
        #[source]
        source: ort::Error,
    },
    #[error("Failed to load model from {path:?}: {source}")]
    Load {
        path: PathBuf,
        #[source]
        source: ort::Error,
    },
    #[error("Model at {0:?} declares no outputs")]
    NoOutputs(PathBuf),
    #[error("Model warm-up failed: {0}")]
    WarmUp(#[source] PredictionError),
    #[error("Model produces {outputs} class scores but {labels} class labels are configured")]
    LabelMismatch { outputs: usize, labels: usize },
}

// Fragments of ONNX Runtime load errors raised for graphs built for another
// runtime version, or for files that are not ONNX graphs at all.
const INCOMPATIBLE_MARKERS: [&str; 4] = [
    "ir version",
    "opset",
    "protobuf parsing failed",
    "unsupported model",
];

fn is_incompatible(error: &ort::Error) -> bool {
    let message = error.to_string().to_lowercase();
    INCOMPATIBLE_MARKERS.iter().any(|m| message.contains(m))
}

fn incompatible_message(path: &Path, error: &ort::Error) -> String {
    format!(
        "The model artifact at {:?} cannot be loaded by this ONNX Runtime build ({}).\n\n\
         It was exported for an incompatible runtime version, or it is not an ONNX graph.\n\n\
         Export the trained model to ONNX again with an opset supported by ONNX Runtime, \
         point artifact.url at the new file and delete the cached copy so it is downloaded again.",
        path, error
    )
}

fn build_session(path: &Path) -> Result<Session, ort::Error> {
    let builder = Session::builder()?.with_optimization_level(GraphOptimizationLevel::Level3)?;

    #[cfg(feature = "cuda")]
    let builder = builder.with_execution_providers([
        ort::execution_providers::CUDAExecutionProvider::default().build(),
    ])?;

    builder.commit_from_file(path)
}

fn transform_image(
    image_data: &[u8],
    model_config: &ModelConfig,
) -> Result<Array<f32, Ix4>, PredictionError> {
    let image_reader = image::ImageReader::new(std::io::Cursor::new(image_data))
        .with_guessed_format()
        .map_err(image::ImageError::IoError)?;

    let original_img = image_reader.decode()?;

    let size = model_config.input_size;
    let img = original_img
        .resize_exact(size, size, FilterType::CatmullRom)
        .to_rgb8();

    let mut input = Array::zeros((1, 3, size as usize, size as usize));
    for (x, y, pixel) in img.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        for (channel, value) in pixel.0.iter().enumerate() {
            input[[0, channel, y, x]] = ((*value as f32) / 255. - model_config.mean[channel])
                / model_config.std[channel];
        }
    }

    Ok(input)
}

fn top_class(scores: &[f32]) -> Option<usize> {
    scores
        .iter()
        .enumerate()
        .reduce(|accum, item| if item.1 > accum.1 { item } else { accum })
        .map(|(index, _)| index)
}

fn top_label(scores: &[f32], labels: &ClassLabels) -> Result<String, PredictionError> {
    if scores.len() != labels.len() {
        return Err(PredictionError::UnexpectedOutput(format!(
            "got {} scores for {} labels",
            scores.len(),
            labels.len()
        )));
    }

    top_class(scores)
        .and_then(|index| labels.get(index))
        .map(str::to_string)
        .ok_or_else(|| PredictionError::UnexpectedOutput("empty score vector".to_string()))
}

#[derive(Clone)]
pub struct OrtModelService {
    sessions: Arc<Vec<Arc<Mutex<Session>>>>,
    counter: Arc<AtomicUsize>,
    output_name: Arc<str>,
    model_config: ModelConfig,
    labels: Arc<ClassLabels>,
}

impl OrtModelService {
    /// Loads the artifact into `num_instances` sessions and checks that the
    /// model's output width matches the label set before any request is served.
    pub fn new(
        model_path: &Path,
        model_config: &ModelConfig,
        labels: ClassLabels,
    ) -> Result<Self, ModelError> {
        let num_instances = model_config.num_instances.max(1);
        let sessions = (0..num_instances)
            .map(|_| build_session(model_path).map(|s| Arc::new(Mutex::new(s))))
            .collect::<Result<Vec<_>, ort::Error>>()
            .map_err(|source| {
                if is_incompatible(&source) {
                    ModelError::IncompatibleArtifact {
                        message: incompatible_message(model_path, &source),
                        source,
                    }
                } else {
                    ModelError::Load {
                        path: model_path.to_path_buf(),
                        source,
                    }
                }
            })?;

        let output_name = sessions
            .first()
            .and_then(|s| s.lock().ok()?.outputs.first().map(|o| o.name.clone()))
            .ok_or_else(|| ModelError::NoOutputs(model_path.to_path_buf()))?;

        tracing::info!(
            "Created {} ONNX sessions from {:?}, reading output {}",
            num_instances,
            model_path,
            output_name
        );

        let service = Self {
            sessions: Arc::new(sessions),
            counter: Arc::new(AtomicUsize::new(0)),
            output_name: output_name.into(),
            model_config: model_config.clone(),
            labels: Arc::new(labels),
        };
        service.warm_up()?;

        Ok(service)
    }

    fn warm_up(&self) -> Result<(), ModelError> {
        let size = self.model_config.input_size as usize;
        let input = Array::zeros((1, 3, size, size));
        let scores = self.run_inference(&input).map_err(ModelError::WarmUp)?;

        if scores.len() != self.labels.len() {
            return Err(ModelError::LabelMismatch {
                outputs: scores.len(),
                labels: self.labels.len(),
            });
        }

        tracing::debug!("Warm-up produced {} class scores", scores.len());
        Ok(())
    }

    pub fn run_inference(&self, input: &Array<f32, Ix4>) -> Result<Vec<f32>, PredictionError> {
        let index = self.counter.fetch_add(1, Ordering::SeqCst) % self.sessions.len();
        let mut session = self.sessions[index]
            .lock()
            .map_err(|e| PredictionError::Inference(format!("session mutex poisoned: {}", e)))?;

        tracing::debug!("Handling request with session {}", index);
        let tensor_ref = TensorRef::from_array_view(input.view())
            .map_err(|e| PredictionError::Inference(format!("failed to build tensor: {}", e)))?;

        let outputs = session
            .run(ort::inputs![tensor_ref])
            .map_err(|e| PredictionError::Inference(e.to_string()))?;

        let (_, scores) = outputs[&*self.output_name]
            .try_extract_tensor::<f32>()
            .map_err(|e| {
                PredictionError::UnexpectedOutput(format!("failed to extract tensor: {}", e))
            })?;

        Ok(scores.to_vec())
    }

    fn classify(&self, image_data: &[u8]) -> Result<String, PredictionError> {
        let input = transform_image(image_data, &self.model_config)?;
        let scores = self.run_inference(&input)?;
        top_label(&scores, &self.labels)
    }
}

#[async_trait]
impl ModelService for OrtModelService {
    async fn predict(&self, image_data: Bytes) -> Result<String, PredictionError> {
        let service = self.clone();
        tokio::task::spawn_blocking(move || service.classify(&image_data))
            .await
            .map_err(|e| PredictionError::Inference(format!("inference task failed: {}", e)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::LabelsConfig, labels::CLASS_LABELS};
    use image::{ImageBuffer, Rgb};
    use std::io::{Cursor, Write};

    // input [1, 3, 224, 224] -> GlobalAveragePool -> Flatten -> MatMul [3, 48] -> logits.
    // The red channel drives class 38, green class 0 and blue class 47.
    fn fixture_model() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("fixtures/tiny_classifier.onnx")
    }

    fn fixture_config(num_instances: usize) -> ModelConfig {
        ModelConfig {
            num_instances,
            ..ModelConfig::default()
        }
    }

    fn encode_png(width: u32, height: u32, color: [u8; 3]) -> Vec<u8> {
        let img = ImageBuffer::<Rgb<u8>, Vec<u8>>::from_pixel(width, height, Rgb(color));
        let mut cursor = Cursor::new(Vec::new());
        img.write_to(&mut cursor, image::ImageFormat::Png).unwrap();
        cursor.into_inner()
    }

    #[test]
    fn test_transform_image() {
        let model_config = ModelConfig::default();
        let input = transform_image(&encode_png(100, 60, [255, 0, 0]), &model_config).unwrap();

        assert_eq!(input.shape(), &[1, 3, 224, 224]);

        let red = (1.0 - model_config.mean[0]) / model_config.std[0];
        let green = (0.0 - model_config.mean[1]) / model_config.std[1];
        assert!((input[[0, 0, 10, 10]] - red).abs() < 1e-4);
        assert!((input[[0, 1, 200, 3]] - green).abs() < 1e-4);
    }

    #[test]
    fn test_transform_image_respects_input_size() {
        let model_config = ModelConfig {
            input_size: 32,
            mean: [0.0; 3],
            std: [1.0; 3],
            ..ModelConfig::default()
        };
        let input = transform_image(&encode_png(8, 8, [0, 0, 255]), &model_config).unwrap();

        assert_eq!(input.shape(), &[1, 3, 32, 32]);
        assert!((input[[0, 2, 31, 31]] - 1.0).abs() < 1e-4);
        assert!(input[[0, 0, 0, 0]].abs() < 1e-4);
    }

    #[test]
    fn test_transform_rejects_non_image_bytes() {
        let result = transform_image(b"definitely not an image", &ModelConfig::default());

        assert!(matches!(result, Err(PredictionError::Decode(_))));
    }

    #[test]
    fn test_top_class() {
        assert_eq!(top_class(&[0.1, 2.5, -1.0, 2.4]), Some(1));
        assert_eq!(top_class(&[-3.0]), Some(0));
        assert_eq!(top_class(&[]), None);
    }

    #[test]
    fn test_top_label_is_from_label_set() {
        let labels = ClassLabels::new(&LabelsConfig::default()).unwrap();
        let mut scores = vec![0.0; labels.len()];
        scores[38] = 9.0;

        let label = top_label(&scores, &labels).unwrap();

        assert_eq!(label, "44 Stock");
        assert!(CLASS_LABELS.contains(&label.as_str()));
    }

    #[test]
    fn test_top_label_rejects_wrong_width() {
        let labels = ClassLabels::new(&LabelsConfig::default()).unwrap();

        let result = top_label(&[1.0, 2.0], &labels);

        assert!(matches!(result, Err(PredictionError::UnexpectedOutput(_))));
    }

    #[test]
    fn test_non_onnx_artifact_is_reported_as_incompatible() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("export.pkl");
        std::fs::write(&path, b"\x80\x02}q\x00(X\x05\x00\x00\x00model").unwrap();

        let result = OrtModelService::new(
            &path,
            &ModelConfig {
                num_instances: 1,
                ..ModelConfig::default()
            },
            ClassLabels::default(),
        );

        match result {
            Err(ModelError::IncompatibleArtifact { message, .. }) => {
                assert!(message.contains("Export the trained model to ONNX again"))
            }
            Err(other) => panic!("expected incompatible artifact error, got {}", other),
            Ok(_) => panic!("garbage artifact loaded"),
        }
    }

    #[test]
    fn test_loads_fixture_model() {
        let service =
            OrtModelService::new(&fixture_model(), &fixture_config(2), ClassLabels::default())
                .unwrap();

        assert_eq!(&*service.output_name, "logits");
        assert_eq!(service.sessions.len(), 2);
    }

    #[tokio::test]
    async fn test_predict_returns_label_from_label_set() {
        let service =
            OrtModelService::new(&fixture_model(), &fixture_config(2), ClassLabels::default())
                .unwrap();

        let cases = [
            ([255, 0, 0], "44 Stock"),
            ([0, 255, 0], "01 Real Estate Agent"),
            ([0, 0, 255], "47 Trust Fund"),
        ];
        for (color, expected) in cases {
            let label = service
                .predict(Bytes::from(encode_png(120, 80, color)))
                .await
                .unwrap();

            assert_eq!(label, expected);
            assert!(CLASS_LABELS.contains(&label.as_str()));
        }
    }

    #[tokio::test]
    async fn test_predict_with_live_model_rejects_non_image_bytes() {
        let service =
            OrtModelService::new(&fixture_model(), &fixture_config(1), ClassLabels::default())
                .unwrap();

        let result = service
            .predict(Bytes::from_static(b"GIF89a but not really"))
            .await;

        assert!(matches!(result, Err(PredictionError::Decode(_))));
    }

    #[test]
    fn test_label_count_must_match_model_width() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "cat\ndog\nbird").unwrap();
        let labels = ClassLabels::new(&LabelsConfig {
            labels_file: Some(file.path().to_path_buf()),
        })
        .unwrap();

        let result = OrtModelService::new(&fixture_model(), &fixture_config(1), labels);

        assert!(matches!(
            result.err(),
            Some(ModelError::LabelMismatch {
                outputs: 48,
                labels: 3
            })
        ));
    }

    #[test]
    fn test_warm_up_fails_for_wrong_input_size() {
        let model_config = ModelConfig {
            input_size: 32,
            ..fixture_config(1)
        };

        let result = OrtModelService::new(&fixture_model(), &model_config, ClassLabels::default());

        assert!(matches!(result.err(), Some(ModelError::WarmUp(_))));
    }
}
