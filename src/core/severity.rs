//! 严重程度评估模块
//!
//! score = clamp01(0.35*confidence + 0.4*危重关键词 + min(0.35, 0.15*红旗症状数))
//!
//! 配置了外部评分服务时优先调用，失败则回退到本地启发式，不向调用方抛错。

use crate::core::error::{TriageError, TriageResult};
use crate::core::models::{SeverityAssessment, SeverityLevel, ServiceConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

const CONFIDENCE_WEIGHT: f64 = 0.35;
const CRITICAL_WEIGHT: f64 = 0.4;
const RED_FLAG_WEIGHT: f64 = 0.15;
const RED_FLAG_CAP: f64 = 0.35;
/// 达到此数量的红旗症状即建议就医
const RED_FLAG_HOSPITAL_COUNT: usize = 2;

/// 疾病名中的危重关键词（小写子串匹配）
const CRITICAL_KEYWORDS: &[&str] = &[
    "nhồi máu",
    "đột quỵ",
    "xuất huyết",
    "suy tim",
    "suy thận",
    "ung thư",
    "nhiễm trùng huyết",
    "viêm màng não",
    "viêm cơ tim",
    "tắc mạch",
    "phình",
    "sốc",
    "suy hô hấp",
    "hoại tử",
    "infarction",
    "stroke",
    "hemorrhage",
    "haemorrhage",
    "heart failure",
    "kidney failure",
    "renal failure",
    "cancer",
    "sepsis",
    "meningitis",
    "myocarditis",
    "embolism",
    "aneurysm",
    "shock",
    "respiratory failure",
    "necrosis",
];

/// 红旗症状
const RED_FLAG_SYMPTOMS: &[&str] = &[
    "đau ngực",
    "khó thở",
    "mất ý thức",
    "liệt",
    "yếu nửa người",
    "co giật",
    "sốt cao",
    "nôn ra máu",
    "đi ngoài ra máu",
    "đau đầu dữ dội",
    "đau bụng dữ dội",
    "đau ngực dữ dội",
    "chảy máu không cầm",
    "vàng da",
    "lơ mơ",
    "đau mắt dữ dội",
    "chest pain",
    "shortness of breath",
    "loss of consciousness",
    "paralysis",
    "seizure",
    "high fever",
    "vomiting blood",
    "bloody stool",
    "severe headache",
    "severe abdominal pain",
    "uncontrolled bleeding",
    "jaundice",
    "confusion",
];

fn clamp01(v: f64) -> f64 {
    if v.is_nan() {
        0.0
    } else {
        v.clamp(0.0, 1.0)
    }
}

/// 疾病名是否包含危重关键词
pub fn has_critical_keyword(disease: &str) -> bool {
    let lower = disease.to_lowercase();
    CRITICAL_KEYWORDS.iter().any(|kw| lower.contains(kw))
}

/// 统计红旗症状数量（去重）
pub fn red_flag_count<S: AsRef<str>>(symptoms: &[S]) -> usize {
    let unique: HashSet<String> = symptoms
        .iter()
        .map(|s| s.as_ref().trim().to_lowercase())
        .collect();
    unique
        .iter()
        .filter(|s| RED_FLAG_SYMPTOMS.contains(&s.as_str()))
        .count()
}

/// 本地启发式评估
pub fn evaluate<S: AsRef<str>>(disease: &str, confidence: f64, symptoms: &[S]) -> SeverityAssessment {
    let red_flags = red_flag_count(symptoms);
    let critical = if has_critical_keyword(disease) { CRITICAL_WEIGHT } else { 0.0 };

    let score = clamp01(
        CONFIDENCE_WEIGHT * clamp01(confidence)
            + critical
            + RED_FLAG_CAP.min(RED_FLAG_WEIGHT * red_flags as f64),
    );

    SeverityAssessment {
        score,
        level: SeverityLevel::from_score(score),
        hospital_flag: score >= 0.7 || red_flags >= RED_FLAG_HOSPITAL_COUNT,
    }
}

pub type SeverityFuture<'a> = Pin<Box<dyn Future<Output = TriageResult<SeverityAssessment>> + Send + 'a>>;

/// 外部严重度评分服务，输入输出与本地启发式一致
pub trait SeverityService: Send + Sync {
    fn assess<'a>(
        &'a self,
        disease: &'a str,
        confidence: f64,
        symptoms: &'a [String],
    ) -> SeverityFuture<'a>;
}

#[derive(Debug, Serialize)]
struct SeverityRequest<'a> {
    disease: &'a str,
    confidence: f64,
    symptoms: &'a [String],
}

#[derive(Debug, Deserialize)]
struct SeverityResponse {
    #[serde(default)]
    severity_score: f64,
    #[serde(default)]
    severity_level: Option<String>,
    #[serde(default)]
    should_visit_hospital: Option<bool>,
}

impl SeverityResponse {
    fn into_assessment(self) -> SeverityAssessment {
        let score = clamp01(self.severity_score);
        let level = self
            .severity_level
            .as_deref()
            .and_then(SeverityLevel::parse)
            .unwrap_or_else(|| SeverityLevel::from_score(score));
        SeverityAssessment {
            score,
            level,
            hospital_flag: self.should_visit_hospital.unwrap_or(score >= 0.7),
        }
    }
}

/// 通过HTTP调用的外部评分服务
pub struct HttpSeverityService {
    config: ServiceConfig,
    client: reqwest::Client,
}

impl HttpSeverityService {
    pub fn new(config: ServiceConfig, timeout: Duration) -> TriageResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TriageError::Configuration(format!("HTTP客户端创建失败: {}", e)))?;
        Ok(Self { config, client })
    }

    async fn call(
        &self,
        disease: &str,
        confidence: f64,
        symptoms: &[String],
    ) -> TriageResult<SeverityAssessment> {
        if !self.config.is_enabled() {
            return Err(TriageError::UpstreamUnavailable("未配置严重度API".to_string()));
        }

        let request = SeverityRequest {
            disease,
            confidence,
            symptoms,
        };
        let mut req = self.client.post(self.config.api_url.trim()).json(&request);
        if !self.config.api_key.is_empty() {
            req = req.header("Authorization", format!("Bearer {}", self.config.api_key));
        }

        let response: SeverityResponse = req.send().await?.error_for_status()?.json().await?;
        Ok(response.into_assessment())
    }
}

impl SeverityService for HttpSeverityService {
    fn assess<'a>(
        &'a self,
        disease: &'a str,
        confidence: f64,
        symptoms: &'a [String],
    ) -> SeverityFuture<'a> {
        Box::pin(self.call(disease, confidence, symptoms))
    }
}

impl Default for SeverityEvaluator {
    fn default() -> Self {
        Self::heuristic()
    }
}

/// 严重度评估器：外部服务优先，失败回退启发式
#[derive(Clone)]
pub struct SeverityEvaluator {
    service: Option<Arc<dyn SeverityService>>,
    timeout: Duration,
}

impl SeverityEvaluator {
    /// 仅使用本地启发式
    pub fn heuristic() -> Self {
        Self {
            service: None,
            timeout: Duration::from_secs(10),
        }
    }

    pub fn has_service(&self) -> bool {
        self.service.is_some()
    }

    pub fn with_service(service: Arc<dyn SeverityService>, timeout: Duration) -> Self {
        Self {
            service: Some(service),
            timeout,
        }
    }

    /// 评估严重程度
    ///
    /// 返回评估结果，以及外部服务失败时的原因（供流水线记录标记）。
    pub async fn assess(
        &self,
        disease: &str,
        confidence: f64,
        symptoms: &[String],
    ) -> (SeverityAssessment, Option<String>) {
        let Some(service) = &self.service else {
            return (evaluate(disease, confidence, symptoms), None);
        };

        let outcome = tokio::time::timeout(self.timeout, service.assess(disease, confidence, symptoms))
            .await
            .unwrap_or_else(|_| {
                Err(TriageError::UpstreamUnavailable(format!(
                    "严重度服务超时 ({} 秒)",
                    self.timeout.as_secs()
                )))
            });

        match outcome {
            Ok(assessment) => (assessment, None),
            Err(e) => {
                tracing::warn!("严重度服务不可用，回退到本地启发式: {}", e);
                (evaluate(disease, confidence, symptoms), Some(e.to_string()))
            }
        }
    }
}
