//! Food / non-food gate applied to consolidated records.
//!
//! The pipeline only needs `predict(text) -> {label, confidence}`. Model
//! training and serving live elsewhere; [`HttpClassifier`] talks to such a
//! server, [`KeywordRules`] is a local stand-in driven by `rules/nonfood.yaml`.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// `label == true` means the text names a catalog food item.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub label: bool,
    pub confidence: f64,
}

#[derive(Debug, Error)]
pub enum ClassifierError {
    #[error("classifier request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("classifier answered with http status {0}")]
    Status(u16),
    #[error("reading classifier rules {path}: {reason}")]
    Rules { path: String, reason: String },
}

#[async_trait]
pub trait ProductClassifier: Send + Sync {
    fn name(&self) -> &'static str;

    async fn predict(&self, text: &str) -> Result<Prediction, ClassifierError>;
}

/// Used when no classifier is configured or the configured one cannot be built.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

#[async_trait]
impl ProductClassifier for AcceptAll {
    fn name(&self) -> &'static str {
        "accept_all"
    }

    async fn predict(&self, _text: &str) -> Result<Prediction, ClassifierError> {
        Ok(Prediction {
            label: true,
            confidence: 1.0,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
struct RulesFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    food_keywords: Vec<String>,
    #[serde(default)]
    nonfood_keywords: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct KeywordRules {
    food: Vec<String>,
    nonfood: Vec<String>,
}

impl KeywordRules {
    pub fn new(food: Vec<String>, nonfood: Vec<String>) -> Self {
        Self {
            food: food.iter().map(|k| fold(k)).collect(),
            nonfood: nonfood.iter().map(|k| fold(k)).collect(),
        }
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, serde_yaml::Error> {
        let file: RulesFile = serde_yaml::from_str(text)?;
        Ok(Self::new(file.food_keywords, file.nonfood_keywords))
    }

    pub async fn from_file(path: &Path) -> Result<Self, ClassifierError> {
        let rules_error = |reason: String| ClassifierError::Rules {
            path: path.display().to_string(),
            reason,
        };
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| rules_error(e.to_string()))?;
        Self::from_yaml_str(&text).map_err(|e| rules_error(e.to_string()))
    }

    pub fn classify(&self, text: &str) -> Prediction {
        let folded = fold(text);
        let food = self.food.iter().any(|k| folded.contains(k.as_str()));
        let nonfood = self.nonfood.iter().any(|k| folded.contains(k.as_str()));
        let (label, confidence) = match (food, nonfood) {
            (_, true) if food => (false, 0.6),
            (_, true) => (false, 0.9),
            (true, false) => (true, 0.9),
            (false, false) => (true, 0.5),
        };
        Prediction { label, confidence }
    }
}

#[async_trait]
impl ProductClassifier for KeywordRules {
    fn name(&self) -> &'static str {
        "keyword_rules"
    }

    async fn predict(&self, text: &str) -> Result<Prediction, ClassifierError> {
        Ok(self.classify(text))
    }
}

// Lowercasing `İ` leaves a combining dot behind; drop it so `İyi` matches `iyi`.
fn fold(text: &str) -> String {
    text.to_lowercase().replace('\u{307}', "")
}

#[derive(Debug, Serialize)]
struct PredictRequest<'a> {
    text: &'a str,
}

/// POSTs `{"text": ..}` and expects `{"label": bool, "confidence": f64}` back.
#[derive(Debug, Clone)]
pub struct HttpClassifier {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpClassifier {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, ClassifierError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl ProductClassifier for HttpClassifier {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn predict(&self, text: &str) -> Result<Prediction, ClassifierError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&PredictRequest { text })
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ClassifierError::Status(status.as_u16()));
        }
        Ok(response.json::<Prediction>().await?)
    }
}
