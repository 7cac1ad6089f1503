//! 核心数据模型定义
//!
//! 词表、特征向量、概率分布与诊断结果等类型。请求内的数据一律不可变，
//! 跨请求共享的只有模型本身（见 pipeline::ModelHandle）。

use crate::core::error::{TriageError, TriageResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

/// 有序词表
/// 下标即特征维度（症状）或分类器输出位置（疾病），加载后不可修改
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vocabulary {
    entries: Vec<String>,
    index: HashMap<String, usize>,
}

/// 症状词表：下标 = 特征维度
pub type SymptomVocabulary = Vocabulary;
/// 疾病词表：与分类器输出逐位对齐
pub type DiseaseVocabulary = Vocabulary;

impl Vocabulary {
    /// 从有序条目构建词表，重复或空条目视为配置错误
    pub fn new(entries: Vec<String>) -> TriageResult<Self> {
        let mut index = HashMap::with_capacity(entries.len());
        for (i, entry) in entries.iter().enumerate() {
            if entry.trim().is_empty() {
                return Err(TriageError::Configuration(format!(
                    "词表第 {} 项为空",
                    i
                )));
            }
            if index.insert(entry.clone(), i).is_some() {
                return Err(TriageError::Configuration(format!(
                    "词表存在重复条目: {}",
                    entry
                )));
            }
        }
        Ok(Self { entries, index })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn get(&self, i: usize) -> Option<&str> {
        self.entries.get(i).map(String::as_str)
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(String::as_str)
    }
}

/// 特征向量 - 与症状词表顺序对齐的0/1指示向量
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureVector {
    values: Vec<f32>,
}

impl FeatureVector {
    pub(crate) fn from_values(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.values
    }

    /// 置1的维度数量
    pub fn active_count(&self) -> usize {
        self.values.iter().filter(|v| **v > 0.0).count()
    }
}

/// 概率分布 - 与疾病词表逐位对齐
///
/// 分类器输出时和约为1；经过流行病学调整后不再归一化，和可能大于1。
#[derive(Debug, Clone, PartialEq)]
pub struct ProbabilityDistribution {
    values: Vec<f64>,
}

impl ProbabilityDistribution {
    /// 校验每个值都在 [0,1] 内
    pub fn new(values: Vec<f64>) -> TriageResult<Self> {
        if let Some((i, v)) = values
            .iter()
            .enumerate()
            .find(|(_, v)| !(0.0..=1.0).contains(*v))
        {
            return Err(TriageError::Oracle(format!(
                "第 {} 个概率值越界: {}",
                i, v
            )));
        }
        Ok(Self { values })
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, i: usize) -> Option<f64> {
        self.values.get(i).copied()
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn sum(&self) -> f64 {
        self.values.iter().sum()
    }

    /// 最大值的下标，并列时取词表中靠前者
    pub fn argmax(&self) -> Option<usize> {
        let mut best: Option<usize> = None;
        for (i, v) in self.values.iter().enumerate() {
            match best {
                Some(b) if self.values[b] >= *v => {}
                _ => best = Some(i),
            }
        }
        best
    }

    /// 降序排列的前k项，概率相同按词表顺序（稳定排序）
    pub fn top_k(&self, diseases: &DiseaseVocabulary, k: usize) -> Vec<RankedDisease> {
        let mut order: Vec<usize> = (0..self.values.len()).collect();
        order.sort_by(|a, b| self.values[*b].total_cmp(&self.values[*a]));
        order
            .into_iter()
            .take(k)
            .filter_map(|i| {
                diseases.get(i).map(|name| RankedDisease {
                    disease: name.to_string(),
                    prob: self.values[i],
                })
            })
            .collect()
    }

    /// 以疾病名为键的完整映射
    pub fn to_map(&self, diseases: &DiseaseVocabulary) -> BTreeMap<String, f64> {
        diseases
            .iter()
            .zip(self.values.iter())
            .map(|(d, p)| (d.to_string(), *p))
            .collect()
    }
}

/// 排名中的一项
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedDisease {
    pub disease: String,
    pub prob: f64,
}

/// 严重程度等级
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SeverityLevel {
    Low,
    Medium,
    High,
}

impl SeverityLevel {
    /// 按分数划分等级
    pub fn from_score(score: f64) -> Self {
        if score >= 0.7 {
            SeverityLevel::High
        } else if score >= 0.5 {
            SeverityLevel::Medium
        } else {
            SeverityLevel::Low
        }
    }

    /// 解析外部服务返回的等级（英文或越南文）
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "high" | "cao" => Some(SeverityLevel::High),
            "medium" | "trung bình" | "trung binh" => Some(SeverityLevel::Medium),
            "low" | "thấp" | "thap" => Some(SeverityLevel::Low),
            _ => None,
        }
    }

    /// 建议文本里使用的越南文标签
    pub fn label_vi(&self) -> &'static str {
        match self {
            SeverityLevel::High => "Cao",
            SeverityLevel::Medium => "Trung bình",
            SeverityLevel::Low => "Thấp",
        }
    }
}

impl std::fmt::Display for SeverityLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SeverityLevel::Low => write!(f, "Low"),
            SeverityLevel::Medium => write!(f, "Medium"),
            SeverityLevel::High => write!(f, "High"),
        }
    }
}

/// 严重程度评估结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeverityAssessment {
    /// 分数，始终在 [0,1]
    #[serde(rename = "severity_score")]
    pub score: f64,
    #[serde(rename = "severity_level")]
    pub level: SeverityLevel,
    #[serde(rename = "should_visit_hospital")]
    pub hospital_flag: bool,
}

/// 流水线降级/审计标记
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PipelineFlag {
    /// 没有任何输入能解析为词表症状，结果为分类器先验
    NoSignal,
    /// 未应用流行病学调整
    NoEpidemiologicalAdjustment { reason: String },
    /// 调整改变了第一名
    TopDiseaseChanged {
        original: String,
        original_probability: f64,
    },
    /// 外部严重度服务失败，已回退到本地启发式
    SeverityServiceFallback { reason: String },
}

/// 症状输入：短语列表或一段自由文本
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SymptomInput {
    Phrases(Vec<String>),
    Passage(String),
}

/// 诊断请求
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosisRequest {
    pub input: SymptomInput,
    /// 对外报告的排名长度，缺省取配置值
    #[serde(default)]
    pub top_k: Option<usize>,
    /// 流行病学地区，缺省取配置值
    #[serde(default)]
    pub region: Option<String>,
}

impl DiagnosisRequest {
    pub fn phrases<I, S>(phrases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            input: SymptomInput::Phrases(phrases.into_iter().map(Into::into).collect()),
            top_k: None,
            region: None,
        }
    }

    pub fn passage(text: impl Into<String>) -> Self {
        Self {
            input: SymptomInput::Passage(text.into()),
            top_k: None,
            region: None,
        }
    }

    pub fn with_top_k(mut self, k: usize) -> Self {
        self.top_k = Some(k);
        self
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }
}

/// 诊断结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosisResult {
    pub request_id: String,
    pub disease: String,
    pub confidence: f64,
    #[serde(flatten)]
    pub severity: SeverityAssessment,
    pub advice: String,
    pub top_k: Vec<RankedDisease>,
    pub normalized_symptoms: Vec<String>,
    /// 调整后的完整分布（未归一化）
    pub all_probabilities: BTreeMap<String, f64>,
    /// 调整改变了第一名时保留分类器原始结论
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_disease: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_confidence: Option<f64>,
    pub flags: Vec<PipelineFlag>,
    pub model_fingerprint: String,
}

impl DiagnosisResult {
    pub fn has_flag(&self, pred: impl Fn(&PipelineFlag) -> bool) -> bool {
        self.flags.iter().any(pred)
    }
}

/// 训练样本（disease_symptom_mapping.json 的一项）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingSample {
    pub disease: String,
    pub symptoms: Vec<String>,
}

/// 模型文件配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// 模型目录（symptoms_list.json / diseases_list.json / classifier.json）
    pub model_dir: PathBuf,
    /// 同义词词典（规范症状 -> 别名列表）
    pub synonyms_path: PathBuf,
    /// 训练数据
    pub training_data_path: PathBuf,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model_dir: PathBuf::from("models"),
            synonyms_path: PathBuf::from("data/symptom_synonyms.json"),
            training_data_path: PathBuf::from("data/disease_symptom_mapping.json"),
        }
    }
}

/// 症状解析配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// 是否启用模糊匹配
    pub fuzzy_enabled: bool,
    /// 模糊匹配阈值 (0-100)
    pub fuzzy_threshold: f64,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            fuzzy_enabled: true,
            fuzzy_threshold: 90.0,
        }
    }
}

/// 分类器来源
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OracleConfig {
    /// 使用模型目录中的内置分类器
    Local,
    /// 远程推理服务
    Remote {
        endpoint: String,
        #[serde(default)]
        api_key: String,
    },
}

impl Default for OracleConfig {
    fn default() -> Self {
        OracleConfig::Local
    }
}

/// 外部HTTP服务配置（流行病学排名 / 严重度评分）
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ServiceConfig {
    /// API端点URL，为空表示不启用
    pub api_url: String,
    /// API密钥
    pub api_key: String,
}

impl ServiceConfig {
    pub fn is_enabled(&self) -> bool {
        !self.api_url.trim().is_empty()
    }
}

/// 流水线配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// 对外排名长度
    pub top_k: usize,
    /// 默认地区
    pub region: String,
    /// 分类器超时（秒）
    pub oracle_timeout_secs: u64,
    /// 外部服务超时（秒）
    pub upstream_timeout_secs: u64,
    /// 流行病学排名缓存时长（小时）
    pub priors_ttl_hours: i64,
    /// 建议语句随机种子（测试复现用）
    pub advice_seed: Option<u64>,
    /// 诊断历史保留条数
    pub history_keep: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            top_k: 5,
            region: "VN".to_string(),
            oracle_timeout_secs: 15,
            upstream_timeout_secs: 10,
            priors_ttl_hours: 24,
            advice_seed: None,
            history_keep: 1000,
        }
    }
}

/// 应用配置
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub model: ModelConfig,
    pub resolver: ResolverConfig,
    pub pipeline: PipelineConfig,
    pub oracle: OracleConfig,
    /// 流行病学排名服务
    pub priors_provider: ServiceConfig,
    /// 外部严重度服务
    pub severity_service: ServiceConfig,
    /// 数据库路径（缓存与诊断历史），为空则不持久化
    pub database_path: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vocab(items: &[&str]) -> Vocabulary {
        Vocabulary::new(items.iter().map(|s| s.to_string()).collect()).unwrap()
    }

    #[test]
    fn test_vocabulary_rejects_duplicates() {
        let err = Vocabulary::new(vec!["Fever".into(), "Fever".into()]).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_distribution_rejects_out_of_range() {
        assert!(ProbabilityDistribution::new(vec![0.5, 1.2]).is_err());
        assert!(ProbabilityDistribution::new(vec![0.5, f64::NAN]).is_err());
        assert!(ProbabilityDistribution::new(vec![0.0, 1.0]).is_ok());
    }

    #[test]
    fn test_top_k_stable_tie_break() {
        let diseases = vocab(&["A", "B", "C", "D"]);
        let dist = ProbabilityDistribution::new(vec![0.2, 0.4, 0.2, 0.2]).unwrap();
        let top = dist.top_k(&diseases, 3);
        let names: Vec<_> = top.iter().map(|r| r.disease.as_str()).collect();
        assert_eq!(names, vec!["B", "A", "C"]);
    }

    #[test]
    fn test_argmax_prefers_earlier_on_tie() {
        let dist = ProbabilityDistribution::new(vec![0.3, 0.5, 0.5]).unwrap();
        assert_eq!(dist.argmax(), Some(1));
    }

    #[test]
    fn test_severity_level_thresholds() {
        assert_eq!(SeverityLevel::from_score(0.7), SeverityLevel::High);
        assert_eq!(SeverityLevel::from_score(0.5), SeverityLevel::Medium);
        assert_eq!(SeverityLevel::from_score(0.4999), SeverityLevel::Low);
        assert_eq!(SeverityLevel::parse("Trung bình"), Some(SeverityLevel::Medium));
        assert_eq!(SeverityLevel::parse("unknown"), None);
    }

    #[test]
    fn test_config_defaults_from_partial_json() {
        let config: AppConfig =
            serde_json::from_str(r#"{"pipeline": {"top_k": 3}}"#).unwrap();
        assert_eq!(config.pipeline.top_k, 3);
        assert_eq!(config.pipeline.priors_ttl_hours, 24);
        assert_eq!(config.resolver.fuzzy_threshold, 90.0);
        assert_eq!(config.oracle, OracleConfig::Local);
    }
}
