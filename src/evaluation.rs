use async_trait::async_trait;
use log::{debug, info, warn};
use reqwest::{Client, StatusCode};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::providers::{EvaluationContext, EvaluationOutcome, Evaluator};
use crate::types::{truncate_text, Evaluation};

/// Lyrics kept next to a cached verdict, shown as the history excerpt
pub const EXCERPT_CAP: usize = 280;

#[derive(Debug, Clone)]
pub struct CachedEvaluation {
    pub evaluation: Evaluation,
    pub lyrics_excerpt: Option<String>,
}

/// Only ready verdicts are stored
pub struct EvaluationCache {
    evaluator: Arc<dyn Evaluator>,
    entries: Mutex<HashMap<String, CachedEvaluation>>,
}

impl EvaluationCache {
    pub fn new(evaluator: Arc<dyn Evaluator>) -> Self {
        Self {
            evaluator,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub async fn cached(&self, item_id: &str) -> Option<CachedEvaluation> {
        self.entries.lock().await.get(item_id).cloned()
    }

    pub async fn evaluate(&self, item_id: &str, context: &EvaluationContext) -> EvaluationOutcome {
        if let Some(hit) = self.cached(item_id).await {
            return EvaluationOutcome::Ready(hit.evaluation);
        }

        let outcome = self.evaluator.evaluate(item_id, context).await;
        if let EvaluationOutcome::Ready(evaluation) = &outcome {
            let lyrics_excerpt = context
                .lyrics
                .as_deref()
                .map(str::trim)
                .filter(|text| !text.is_empty())
                .map(|text| truncate_text(text, EXCERPT_CAP));
            self.entries.lock().await.insert(
                item_id.to_string(),
                CachedEvaluation {
                    evaluation: evaluation.clone(),
                    lyrics_excerpt,
                },
            );
            debug!("Cached evaluation for '{}'", item_id);
        }
        outcome
    }
}

/// Posts the evaluation context to an HTTP scoring endpoint.
///
/// 200 carries a verdict, 202 means "still working on it".
pub struct HttpEvaluator {
    client: Client,
    endpoint: String,
    token: Option<String>,
}

impl HttpEvaluator {
    pub fn new(endpoint: String, token: Option<String>) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(Duration::from_secs(60)).build()?;
        Ok(Self {
            client,
            endpoint,
            token,
        })
    }
}

#[async_trait]
impl Evaluator for HttpEvaluator {
    async fn evaluate(&self, item_id: &str, context: &EvaluationContext) -> EvaluationOutcome {
        let payload = json!({
            "itemId": item_id,
            "context": context,
        });

        let mut request = self
            .client
            .post(&self.endpoint)
            .header("Content-Type", "application/json")
            .json(&payload);
        if let Some(token) = &self.token {
            request = request.header("Authorization", format!("Bearer {}", token));
        }

        match request.send().await {
            Ok(resp) if resp.status() == StatusCode::ACCEPTED => {
                debug!("Evaluation for '{}' is pending", item_id);
                EvaluationOutcome::Pending
            }
            Ok(resp) if resp.status().is_success() => match resp.json::<Evaluation>().await {
                Ok(evaluation) => {
                    info!(
                        "Evaluated '{}': {} (level {})",
                        context.title, evaluation.rating, evaluation.level
                    );
                    EvaluationOutcome::Ready(evaluation)
                }
                Err(e) => {
                    warn!("Unreadable evaluation for '{}': {}", item_id, e);
                    EvaluationOutcome::Unavailable
                }
            },
            Ok(resp) => {
                let status = resp.status();
                let error_text = resp
                    .text()
                    .await
                    .unwrap_or_else(|_| "Unknown error".to_string());
                warn!("Evaluator returned HTTP {}: {}", status, error_text);
                EvaluationOutcome::Unavailable
            }
            Err(e) => {
                warn!("Evaluator request failed: {}", e);
                EvaluationOutcome::Unavailable
            }
        }
    }
}
