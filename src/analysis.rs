//! ==============================================================================
//! analysis.rs - natural-language reports over rolled-up statistics
//! ==============================================================================
//!
//! purpose:
//!     turns a device's summary records into a prompt and hands it to an
//!     external text-generation service. the service is reached through the
//!     `TextGenerator` trait; `ChatCompletionClient` is the production
//!     implementation (openai-style chat-completion over https, bearer key).
//!
//! failure model:
//!     one attempt per request. transport errors, non-2xx answers and bodies
//!     without `choices[0].message.content` all surface as
//!     ExternalServiceError; retrying is up to the caller.
//!
//! relationships:
//!     - used by: server.rs (POST /data/analysis)
//!     - reads: store::SummaryStore, store::DeviceRegistry
//!
//! ==============================================================================

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use crate::config::AiConfig;
use crate::domain::{Field, SummaryRecord};
use crate::error::{IngestError, IngestResult};
use crate::store::Storage;

/// kind of report requested; legacy clients send "0".."3"
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportType {
    #[serde(alias = "0")]
    Simple,
    #[serde(alias = "1")]
    Anomaly,
    #[serde(alias = "2")]
    Trend,
    #[serde(alias = "3")]
    Comprehensive,
}

impl ReportType {
    fn instruction(self) -> (&'static str, &'static str) {
        match self {
            ReportType::Simple => (
                "an environmental data analyst",
                "Give a brief analysis of these statistics, summarise their main characteristics \
                 (means, extremes, fluctuation) and state a concise conclusion.",
            ),
            ReportType::Anomaly => (
                "an environmental anomaly detection expert",
                "Check these statistics for anomalies, point out any abnormal data points or \
                 abnormal trends, and briefly explain possible causes.",
            ),
            ReportType::Trend => (
                "an environmental trend forecasting expert",
                "Analyse how the main metrics change over the segments and forecast their \
                 development over the coming period. Give the trend judgement and its basis.",
            ),
            ReportType::Comprehensive => (
                "an expert in comprehensive environmental data analysis",
                "Produce a comprehensive analysis covering a summary of data characteristics, \
                 anomaly detection and trend forecasting, and give a detailed report with \
                 recommendations.",
            ),
        }
    }
}

/// assemble the prompt: one line per summary, four statistics per field
pub fn build_prompt(report_type: ReportType, summaries: &[SummaryRecord]) -> String {
    let mut segments = String::from(
        "Statistics for each segment of this period follow \
         (each metric lists four values: average, variance, minimum, maximum)\n",
    );
    for (i, s) in summaries.iter().enumerate() {
        segments.push_str(&format!("#{}", i + 1));
        for field in Field::ALL {
            segments.push_str(&format!(
                " {}[{:.2},{:.2},{:.2},{:.2}]",
                field.label(),
                s.avg.get(field),
                s.var.get(field),
                s.min.get(field),
                s.max.get(field)
            ));
        }
        segments.push_str(";\n");
    }

    let (role, task) = report_type.instruction();
    format!(
        "Acting as {}, consider the following statistics:\n{}\n{}",
        role, segments, task
    )
}

/// external text-generation service
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, model: &str, prompt: &str) -> IngestResult<String>;
}

pub struct ChatCompletionClient {
    http: reqwest::Client,
    api_url: String,
    api_key: String,
}

impl ChatCompletionClient {
    pub fn new(config: &AiConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()?;
        Ok(Self {
            http,
            api_url: config.api_url.clone(),
            api_key: config.api_key.clone(),
        })
    }
}

/// pull `choices[0].message.content` out of a chat-completion answer
pub fn extract_content(body: &serde_json::Value) -> IngestResult<String> {
    body.pointer("/choices/0/message/content")
        .and_then(|c| c.as_str())
        .map(str::to_string)
        .ok_or_else(|| {
            IngestError::ExternalServiceError("response carries no message content".into())
        })
}

#[async_trait]
impl TextGenerator for ChatCompletionClient {
    async fn generate(&self, model: &str, prompt: &str) -> IngestResult<String> {
        let request = json!({
            "model": model,
            "messages": [{ "role": "system", "content": prompt }],
        });

        let response = self
            .http
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| IngestError::ExternalServiceError(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(IngestError::ExternalServiceError(format!("upstream returned {}", status)));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| {
                IngestError::ExternalServiceError(format!("undecodable response: {}", e))
            })?;
        extract_content(&body)
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct AnalysisRequest {
    pub device_id: String,
    pub report_type: ReportType,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    /// falls back to ai.default_model
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AnalysisReport {
    pub detail: String,
    pub data_count: usize,
    pub device_id: String,
}

pub struct Analyzer {
    storage: Storage,
    generator: Arc<dyn TextGenerator>,
    default_model: String,
}

impl Analyzer {
    pub fn new(
        storage: Storage,
        generator: Arc<dyn TextGenerator>,
        default_model: impl Into<String>,
    ) -> Self {
        Self {
            storage,
            generator,
            default_model: default_model.into(),
        }
    }

    pub async fn analyze(&self, request: &AnalysisRequest) -> IngestResult<AnalysisReport> {
        if request.start_time >= request.end_time {
            return Err(IngestError::BadRequest("start_time must precede end_time".into()));
        }
        self.storage
            .devices
            .find(&request.device_id)
            .await?
            .ok_or(IngestError::UnknownDevice)?;

        let summaries = self
            .storage
            .summaries
            .list(
                &request.device_id,
                Some(request.start_time.timestamp()),
                Some(request.end_time.timestamp()),
            )
            .await?;
        if summaries.is_empty() {
            return Err(IngestError::NoData);
        }

        let prompt = build_prompt(request.report_type, &summaries);
        let model = request.model.as_deref().unwrap_or(&self.default_model);
        tracing::info!(
            device_id = %request.device_id,
            model,
            report_type = ?request.report_type,
            segments = summaries.len(),
            "requesting analysis"
        );

        let detail = self.generator.generate(model, &prompt).await.map_err(|e| {
            tracing::error!(device_id = %request.device_id, "analysis failed: {}", e);
            e
        })?;

        Ok(AnalysisReport {
            detail,
            data_count: summaries.len(),
            device_id: request.device_id.clone(),
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::domain::Reading;
    use std::sync::Mutex;

    /// records every call and answers with a fixed text (or fails)
    pub struct StubGenerator {
        pub calls: Mutex<Vec<(String, String)>>,
        pub fail: bool,
    }

    impl StubGenerator {
        pub fn new(fail: bool) -> Self {
            Self { calls: Mutex::new(Vec::new()), fail }
        }
    }

    #[async_trait]
    impl TextGenerator for StubGenerator {
        async fn generate(&self, model: &str, prompt: &str) -> IngestResult<String> {
            self.calls.lock().unwrap().push((model.to_string(), prompt.to_string()));
            if self.fail {
                return Err(IngestError::ExternalServiceError("upstream returned 503".into()));
            }
            Ok("air quality is stable".to_string())
        }
    }

    fn summary(created_at: i64, temperature: f32) -> SummaryRecord {
        let flat = Reading { temperature, ..Reading::default() };
        SummaryRecord {
            id: 0,
            device_id: "dev".into(),
            created_at,
            sample_count: 10,
            max: Reading { temperature: temperature + 1.0, ..Reading::default() },
            min: Reading { temperature: temperature - 1.0, ..Reading::default() },
            avg: flat,
            var: Reading { temperature: 0.5, ..Reading::default() },
        }
    }

    fn request(start: i64, end: i64) -> AnalysisRequest {
        AnalysisRequest {
            device_id: "dev".into(),
            report_type: ReportType::Trend,
            start_time: DateTime::from_timestamp(start, 0).unwrap(),
            end_time: DateTime::from_timestamp(end, 0).unwrap(),
            model: None,
        }
    }

    async fn analyzer(fail: bool) -> (Arc<StubGenerator>, Analyzer) {
        let storage = Storage::memory();
        storage.devices.provision("dev", "secret").await.unwrap();
        storage.summaries.insert(&summary(1_000, 20.0)).await.unwrap();
        storage.summaries.insert(&summary(2_000, 22.0)).await.unwrap();
        let stub = Arc::new(StubGenerator::new(fail));
        let analyzer = Analyzer::new(storage, stub.clone(), "deepseek-chat");
        (stub, analyzer)
    }

    #[test]
    fn prompt_lists_four_statistics_per_field() {
        let prompt = build_prompt(ReportType::Simple, &[summary(1, 20.0), summary(2, 22.0)]);
        assert!(prompt.starts_with("Acting as an environmental data analyst"));
        assert!(prompt.contains(
            "#1 Temperature[20.00,0.50,19.00,21.00] Humidity[0.00,0.00,0.00,0.00]"
        ));
        assert!(prompt.contains("#2 Temperature[22.00,0.50,21.00,23.00]"));
        assert!(prompt.contains("Radon[0.00,0.00,0.00,0.00];"));
        assert!(prompt.ends_with("state a concise conclusion."));
    }

    #[test]
    fn each_report_type_has_its_own_instruction() {
        let s = [summary(1, 20.0)];
        let prompts: Vec<_> = [
            ReportType::Simple,
            ReportType::Anomaly,
            ReportType::Trend,
            ReportType::Comprehensive,
        ]
        .into_iter()
        .map(|t| build_prompt(t, &s))
        .collect();
        for (i, a) in prompts.iter().enumerate() {
            for b in &prompts[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn report_type_accepts_legacy_selectors() {
        let t: ReportType = serde_json::from_str("\"2\"").unwrap();
        assert_eq!(t, ReportType::Trend);
        let t: ReportType = serde_json::from_str("\"anomaly\"").unwrap();
        assert_eq!(t, ReportType::Anomaly);
        assert!(serde_json::from_str::<ReportType>("\"4\"").is_err());
    }

    #[test]
    fn content_is_extracted_from_first_choice() {
        let body = json!({"choices": [{"message": {"role": "assistant", "content": "ok"}}]});
        assert_eq!(extract_content(&body).unwrap(), "ok");

        let empty = json!({"choices": []});
        assert!(matches!(extract_content(&empty), Err(IngestError::ExternalServiceError(_))));
        let error = json!({"error": {"message": "invalid api key"}});
        assert!(matches!(extract_content(&error), Err(IngestError::ExternalServiceError(_))));
    }

    #[tokio::test]
    async fn analyze_uses_summaries_in_window() {
        let (stub, analyzer) = analyzer(false).await;
        let report = analyzer.analyze(&request(1_500, 2_500)).await.unwrap();
        assert_eq!(report.data_count, 1);
        assert_eq!(report.detail, "air quality is stable");

        let calls = stub.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "deepseek-chat");
        assert!(calls[0].1.contains("#1 Temperature[22.00"));
        assert!(!calls[0].1.contains("#2"));
    }

    #[tokio::test]
    async fn empty_window_is_no_data() {
        let (stub, analyzer) = analyzer(false).await;
        assert!(matches!(analyzer.analyze(&request(5_000, 6_000)).await, Err(IngestError::NoData)));
        assert!(stub.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_device_and_inverted_window_are_rejected() {
        let (_stub, analyzer) = analyzer(false).await;
        let mut req = request(0, 3_000);
        req.device_id = "ghost".into();
        assert!(matches!(analyzer.analyze(&req).await, Err(IngestError::UnknownDevice)));
        assert!(matches!(
            analyzer.analyze(&request(3_000, 0)).await,
            Err(IngestError::BadRequest(_))
        ));
    }

    #[tokio::test]
    async fn generator_failure_is_surfaced_once() {
        let (stub, analyzer) = analyzer(true).await;
        let mut req = request(0, 3_000);
        req.model = Some("deepseek-reasoner".into());
        assert!(matches!(
            analyzer.analyze(&req).await,
            Err(IngestError::ExternalServiceError(_))
        ));
        let calls = stub.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "deepseek-reasoner");
    }
}
