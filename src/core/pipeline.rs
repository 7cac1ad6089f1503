//! 诊断流水线
//!
//! 输入 → 症状解析 → 特征向量 → 分类 → 流行病学调整（可选）→ 严重度 → 建议 → 结果
//!
//! 每个请求在开始时取一次模型快照，所有阶段都使用同一份快照。
//! 只有分类器失败会让请求失败，其余外部依赖失败都降级并记录标记。

use crate::core::advice;
use crate::core::error::{TriageError, TriageResult};
use crate::core::features::build_feature_vector;
use crate::core::models::{
    DiagnosisRequest, DiagnosisResult, DiseaseVocabulary, PipelineConfig, PipelineFlag,
    ProbabilityDistribution, SymptomInput, SymptomVocabulary,
};
use crate::core::normalize::split_passage;
use crate::core::oracle::ClassifierOracle;
use crate::core::priors::{adjust, PopularityProvider, PriorAdjustment};
use crate::core::severity::SeverityEvaluator;
use crate::core::synonym::SynonymResolver;
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

/// 已加载的模型：两张词表、症状解析器与分类器，构造后不可变
pub struct Model {
    symptoms: SymptomVocabulary,
    diseases: DiseaseVocabulary,
    resolver: SynonymResolver,
    oracle: Arc<dyn ClassifierOracle>,
    fingerprint: String,
}

impl std::fmt::Debug for Model {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Model")
            .field("symptoms", &self.symptoms.len())
            .field("diseases", &self.diseases.len())
            .field("oracle", &self.oracle.name())
            .field("fingerprint", &self.fingerprint)
            .finish()
    }
}

impl Model {
    /// 组装模型，分类器维度必须与词表一致，否则拒绝加载
    pub fn new(
        symptoms: SymptomVocabulary,
        diseases: DiseaseVocabulary,
        resolver: SynonymResolver,
        oracle: Arc<dyn ClassifierOracle>,
    ) -> TriageResult<Self> {
        if symptoms.is_empty() || diseases.is_empty() {
            return Err(TriageError::Configuration("症状或疾病词表为空".to_string()));
        }
        if oracle.input_dim() != symptoms.len() {
            return Err(TriageError::Configuration(format!(
                "分类器输入维度 {} 与症状词表长度 {} 不一致",
                oracle.input_dim(),
                symptoms.len()
            )));
        }
        if oracle.output_dim() != diseases.len() {
            return Err(TriageError::Configuration(format!(
                "分类器输出维度 {} 与疾病词表长度 {} 不一致",
                oracle.output_dim(),
                diseases.len()
            )));
        }

        let fingerprint = fingerprint(&symptoms, &diseases);
        Ok(Self {
            symptoms,
            diseases,
            resolver,
            oracle,
            fingerprint,
        })
    }

    pub fn symptoms(&self) -> &SymptomVocabulary {
        &self.symptoms
    }

    pub fn diseases(&self) -> &DiseaseVocabulary {
        &self.diseases
    }

    pub fn resolver(&self) -> &SynonymResolver {
        &self.resolver
    }

    pub fn oracle(&self) -> &Arc<dyn ClassifierOracle> {
        &self.oracle
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// 模型元信息
    pub fn info(&self) -> ModelInfo {
        ModelInfo {
            total_symptoms: self.symptoms.len(),
            total_diseases: self.diseases.len(),
            synonym_count: self.resolver.synonym_count(),
            oracle: self.oracle.name().to_string(),
            fingerprint: self.fingerprint.clone(),
            symptoms: self.symptoms.entries().to_vec(),
            diseases: self.diseases.entries().to_vec(),
        }
    }
}

/// 词表指纹：SHA-256(症状词表, 疾病词表)
pub fn fingerprint(symptoms: &SymptomVocabulary, diseases: &DiseaseVocabulary) -> String {
    let mut hasher = Sha256::new();
    for entry in symptoms.iter() {
        hasher.update(entry.as_bytes());
        hasher.update([0u8]);
    }
    hasher.update([0xffu8]);
    for entry in diseases.iter() {
        hasher.update(entry.as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

/// 模型元信息（info 命令输出）
#[derive(Debug, Clone, Serialize)]
pub struct ModelInfo {
    pub total_symptoms: usize,
    pub total_diseases: usize,
    pub synonym_count: usize,
    pub oracle: String,
    pub fingerprint: String,
    pub symptoms: Vec<String>,
    pub diseases: Vec<String>,
}

/// 共享模型句柄
///
/// 读锁只保护指针本身，取快照后立即释放；重新训练后整体替换。
pub struct ModelHandle {
    current: RwLock<Arc<Model>>,
}

impl ModelHandle {
    pub fn new(model: Model) -> Self {
        Self {
            current: RwLock::new(Arc::new(model)),
        }
    }

    /// 当前模型快照
    pub fn current(&self) -> Arc<Model> {
        let guard = self.current.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&guard)
    }

    /// 原子替换模型，返回旧模型
    pub fn swap(&self, model: Model) -> Arc<Model> {
        let next = Arc::new(model);
        tracing::info!("切换模型: {}", next.fingerprint());
        let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
        std::mem::replace(&mut *guard, next)
    }
}

/// 诊断流水线
pub struct Pipeline {
    model: Arc<ModelHandle>,
    config: PipelineConfig,
    popularity: Option<Arc<dyn PopularityProvider>>,
    severity: SeverityEvaluator,
    rng: Mutex<ChaCha20Rng>,
}

impl Pipeline {
    pub fn new(model: Arc<ModelHandle>, config: PipelineConfig) -> Self {
        let rng = match config.advice_seed {
            Some(seed) => ChaCha20Rng::seed_from_u64(seed),
            None => ChaCha20Rng::from_entropy(),
        };
        Self {
            model,
            config,
            popularity: None,
            severity: SeverityEvaluator::heuristic(),
            rng: Mutex::new(rng),
        }
    }

    /// 设置流行病学排名服务
    pub fn with_popularity(mut self, provider: Arc<dyn PopularityProvider>) -> Self {
        self.popularity = Some(provider);
        self
    }

    /// 设置严重度评估器
    pub fn with_severity(mut self, severity: SeverityEvaluator) -> Self {
        self.severity = severity;
        self
    }

    pub fn model_handle(&self) -> &Arc<ModelHandle> {
        &self.model
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// 执行一次诊断
    pub async fn diagnose(&self, request: DiagnosisRequest) -> TriageResult<DiagnosisResult> {
        let model = self.model.current();
        let request_id = uuid::Uuid::new_v4().to_string();
        let mut flags = Vec::new();

        // 1. 症状解析
        let tokens = match &request.input {
            SymptomInput::Phrases(phrases) => phrases.clone(),
            SymptomInput::Passage(text) => split_passage(text),
        };
        let resolved = model.resolver().resolve_all(&tokens);
        tracing::debug!(
            "[{}] 解析症状: {} 个输入 -> {:?}",
            request_id,
            tokens.len(),
            resolved
        );

        // 2. 特征向量
        let features = build_feature_vector(&resolved, model.symptoms());
        if features.active_count() == 0 {
            tracing::warn!("[{}] 没有可识别的症状，结果仅反映分类器先验", request_id);
            flags.push(PipelineFlag::NoSignal);
        }

        // 3. 分类
        let distribution = self.classify(&model, &features).await?;
        let oracle_distribution = distribution.clone();

        // 4. 流行病学调整
        let region = request
            .region
            .clone()
            .filter(|r| !r.trim().is_empty())
            .unwrap_or_else(|| self.config.region.clone());
        let (adjustment, popular) = self.apply_priors(&model, distribution, &region, &mut flags).await;

        let top = adjustment
            .adjusted_top
            .ok_or_else(|| TriageError::Oracle("分类器输出为空".to_string()))?;
        let disease = model
            .diseases()
            .get(top)
            .ok_or_else(|| TriageError::Oracle(format!("疾病下标越界: {}", top)))?
            .to_string();
        let confidence = adjustment.distribution.get(top).unwrap_or(0.0);

        let mut original_disease = None;
        let mut original_confidence = None;
        if adjustment.top_changed() {
            if let Some(original) = adjustment.original_top {
                let name = model.diseases().get(original).unwrap_or_default().to_string();
                let prob = oracle_distribution.get(original).unwrap_or(0.0);
                tracing::info!(
                    "[{}] 流行病学调整改变了第一名: {} -> {}",
                    request_id,
                    name,
                    disease
                );
                flags.push(PipelineFlag::TopDiseaseChanged {
                    original: name.clone(),
                    original_probability: prob,
                });
                original_disease = Some(name);
                original_confidence = Some(prob);
            }
        }

        // 5. 严重度
        let (severity, fallback) = self.severity.assess(&disease, confidence, &resolved).await;
        if let Some(reason) = fallback {
            flags.push(PipelineFlag::SeverityServiceFallback { reason });
        }

        // 6. 建议
        let advice_text = {
            let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
            advice::generate(&disease, &severity, &resolved, &popular, &mut *rng)
        };

        let k = match request.top_k {
            Some(k) if k > 0 => k,
            _ => self.config.top_k.max(1),
        };

        tracing::info!(
            "[{}] 诊断完成: {} ({:.3}), 严重度 {}",
            request_id,
            disease,
            confidence,
            severity.level
        );

        Ok(DiagnosisResult {
            request_id,
            disease,
            confidence,
            severity,
            advice: advice_text,
            top_k: adjustment.distribution.top_k(model.diseases(), k),
            normalized_symptoms: resolved,
            all_probabilities: adjustment.distribution.to_map(model.diseases()),
            original_disease,
            original_confidence,
            flags,
            model_fingerprint: model.fingerprint().to_string(),
        })
    }

    /// 调用分类器并校验输出
    async fn classify(
        &self,
        model: &Model,
        features: &crate::core::models::FeatureVector,
    ) -> TriageResult<ProbabilityDistribution> {
        let secs = self.config.oracle_timeout_secs;
        let raw = tokio::time::timeout(Duration::from_secs(secs), model.oracle().predict(features))
            .await
            .map_err(|_| TriageError::OracleTimeout(secs))??;

        if raw.len() != model.diseases().len() {
            return Err(TriageError::DimensionMismatch {
                expected: model.diseases().len(),
                actual: raw.len(),
            });
        }
        ProbabilityDistribution::new(raw)
    }

    /// 应用流行病学先验，失败时原样透传并记录标记
    ///
    /// 返回调整结果与流行疾病名（供建议使用）。
    async fn apply_priors(
        &self,
        model: &Model,
        distribution: ProbabilityDistribution,
        region: &str,
        flags: &mut Vec<PipelineFlag>,
    ) -> (PriorAdjustment, Vec<String>) {
        let Some(provider) = &self.popularity else {
            flags.push(PipelineFlag::NoEpidemiologicalAdjustment {
                reason: "未配置流行病学排名服务".to_string(),
            });
            return (PriorAdjustment::passthrough(distribution), Vec::new());
        };

        let timeout = Duration::from_secs(self.config.upstream_timeout_secs);
        let reason = match tokio::time::timeout(timeout, provider.ranking(region)).await {
            Ok(Ok(names)) if !names.is_empty() => {
                tracing::debug!("地区 {} 的流行疾病: {:?}", region, names);
                return (adjust(&distribution, model.diseases(), &names), names);
            }
            Ok(Ok(_)) => format!("地区 {} 的流行疾病排名为空", region),
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("流行病学排名服务超时 ({} 秒)", timeout.as_secs()),
        };

        tracing::warn!("未应用流行病学调整: {}", reason);
        flags.push(PipelineFlag::NoEpidemiologicalAdjustment { reason });
        (PriorAdjustment::passthrough(distribution), Vec::new())
    }
}
