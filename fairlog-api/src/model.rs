use fairlog_core::error::{FairlogError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// A binary classifier the server can run behind `/predict`.
pub trait Predictor: Send + Sync {
    fn model_id(&self) -> u32;

    /// Expected feature vector length.
    fn input_len(&self) -> usize;

    /// Predicted label, `0.0` or `1.0`.
    fn predict(&self, features: &[f32]) -> Result<f32>;
}

/// Logistic regression with a decision threshold, loaded from JSON:
///
/// ```json
/// { "model_id": 1, "weights": [0.8, -0.3], "bias": 0.1, "threshold": 0.5 }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdModel {
    pub model_id: u32,
    pub weights: Vec<f32>,
    pub bias: f32,
    #[serde(default = "default_threshold")]
    pub threshold: f32,
}

fn default_threshold() -> f32 {
    0.5
}

impl ThresholdModel {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let model: Self = serde_json::from_str(&content)
            .map_err(|e| FairlogError::Config(format!("model {}: {e}", path.display())))?;
        model.validate()?;
        Ok(model)
    }

    /// Small built-in model for running the server without a model file.
    pub fn demo() -> Self {
        Self {
            model_id: 1,
            weights: vec![0.9, -0.4, 0.25, 0.6],
            bias: -0.2,
            threshold: 0.5,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.weights.is_empty() {
            return Err(FairlogError::Config("model has no weights".into()));
        }
        if !(0.0..=1.0).contains(&self.threshold) {
            return Err(FairlogError::Config(format!(
                "threshold {} outside [0, 1]",
                self.threshold
            )));
        }
        if self.weights.iter().any(|w| !w.is_finite()) || !self.bias.is_finite() {
            return Err(FairlogError::Config("model parameters must be finite".into()));
        }
        Ok(())
    }

    pub fn score(&self, features: &[f32]) -> f32 {
        let z: f32 = self
            .weights
            .iter()
            .zip(features)
            .map(|(w, x)| w * x)
            .sum::<f32>()
            + self.bias;
        1.0 / (1.0 + (-z).exp())
    }
}

impl Predictor for ThresholdModel {
    fn model_id(&self) -> u32 {
        self.model_id
    }

    fn input_len(&self) -> usize {
        self.weights.len()
    }

    fn predict(&self, features: &[f32]) -> Result<f32> {
        if features.len() != self.weights.len() {
            return Err(FairlogError::Malformed(format!(
                "model {} takes {} features, got {}",
                self.model_id,
                self.weights.len(),
                features.len()
            )));
        }
        if features.iter().any(|x| !x.is_finite()) {
            return Err(FairlogError::Malformed("features must be finite".into()));
        }
        Ok(if self.score(features) >= self.threshold { 1.0 } else { 0.0 })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn predicts_by_threshold() {
        let m = ThresholdModel {
            model_id: 3,
            weights: vec![1.0, -1.0],
            bias: 0.0,
            threshold: 0.5,
        };
        assert_eq!(m.predict(&[2.0, 0.0]).unwrap(), 1.0);
        assert_eq!(m.predict(&[0.0, 2.0]).unwrap(), 0.0);
        // sigmoid(0) sits exactly on the threshold
        assert_eq!(m.predict(&[1.0, 1.0]).unwrap(), 1.0);
    }

    #[test]
    fn rejects_bad_input() {
        let m = ThresholdModel::demo();
        assert!(matches!(m.predict(&[1.0]), Err(FairlogError::Malformed(_))));
        assert!(m.predict(&[f32::NAN, 0.0, 0.0, 0.0]).is_err());
    }

    #[test]
    fn loads_from_json() {
        let dir = std::env::temp_dir().join("fairlog-test-model-1");
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("model.json");

        std::fs::write(&path, r#"{"model_id": 9, "weights": [0.5, 0.5], "bias": 0.0}"#).unwrap();
        let m = ThresholdModel::from_file(&path).unwrap();
        assert_eq!((m.model_id, m.threshold), (9, 0.5));

        std::fs::write(&path, r#"{"model_id": 9, "weights": [], "bias": 0.0}"#).unwrap();
        assert!(matches!(ThresholdModel::from_file(&path), Err(FairlogError::Config(_))));

        let _ = std::fs::remove_dir_all(&dir);
    }
}
