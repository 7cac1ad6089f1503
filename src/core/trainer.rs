//! 训练数据管理与内置分类器训练
//!
//! 训练数据是 `[{"disease": ..., "symptoms": [...]}]` 形式的JSON数组。
//! 症状词表与疾病词表取样本中出现过的去重集合并排序，保证同一份数据训练结果确定。

use crate::core::error::{TriageError, TriageResult};
use crate::core::models::{ResolverConfig, TrainingSample, Vocabulary};
use crate::core::oracle::NaiveBayesOracle;
use crate::core::pipeline::Model;
use crate::core::synonym::{SynonymResolver, SynonymTable};
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

/// 训练数据集
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrainingSet {
    samples: Vec<TrainingSample>,
}

impl TrainingSet {
    pub fn new(samples: Vec<TrainingSample>) -> Self {
        Self { samples }
    }

    /// 读取训练文件，文件不存在时返回空集合
    pub fn load(path: &Path) -> TriageResult<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let samples: Vec<TrainingSample> = serde_json::from_str(&content)?;
        Ok(Self { samples })
    }

    /// 写回训练文件
    pub fn save(&self, path: &Path) -> TriageResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(&self.samples)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// 追加样本，返回样本总数
    pub fn add_sample<I, S>(&mut self, disease: &str, symptoms: I) -> TriageResult<usize>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let disease = disease.trim();
        if disease.is_empty() {
            return Err(TriageError::Configuration("疾病名不能为空".to_string()));
        }
        let mut seen = BTreeSet::new();
        let symptoms: Vec<String> = symptoms
            .into_iter()
            .map(|s| s.as_ref().trim().to_string())
            .filter(|s| !s.is_empty() && seen.insert(s.clone()))
            .collect();
        if symptoms.is_empty() {
            return Err(TriageError::Configuration(format!(
                "样本 {} 没有任何症状",
                disease
            )));
        }

        self.samples.push(TrainingSample {
            disease: disease.to_string(),
            symptoms,
        });
        Ok(self.samples.len())
    }

    pub fn samples(&self) -> &[TrainingSample] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// 训练统计
#[derive(Debug, Clone, Serialize)]
pub struct TrainingReport {
    pub total_symptoms: usize,
    pub total_diseases: usize,
    pub training_samples: usize,
}

/// 训练产物：可直接服务的模型，以及需要落盘的分类器参数
#[derive(Debug)]
pub struct TrainedModel {
    pub model: Model,
    pub classifier: Arc<NaiveBayesOracle>,
    pub report: TrainingReport,
}

/// 从样本训练模型
pub fn train(
    samples: &[TrainingSample],
    synonyms: &SynonymTable,
    resolver_config: &ResolverConfig,
) -> TriageResult<TrainedModel> {
    if samples.is_empty() {
        return Err(TriageError::Configuration("训练数据为空".to_string()));
    }

    let symptom_set: BTreeSet<String> = samples
        .iter()
        .flat_map(|s| s.symptoms.iter())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    let disease_set: BTreeSet<String> = samples
        .iter()
        .map(|s| s.disease.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();

    let symptoms = Vocabulary::new(symptom_set.into_iter().collect())?;
    let diseases = Vocabulary::new(disease_set.into_iter().collect())?;

    let rows: Vec<(usize, Vec<usize>)> = samples
        .iter()
        .filter_map(|sample| {
            let d = diseases.index_of(sample.disease.trim())?;
            // 同一样本内重复的症状只计一次
            let present: BTreeSet<usize> = sample
                .symptoms
                .iter()
                .filter_map(|s| symptoms.index_of(s.trim()))
                .collect();
            Some((d, present.into_iter().collect()))
        })
        .collect();

    let classifier = Arc::new(NaiveBayesOracle::fit(&rows, diseases.len(), symptoms.len())?);
    let resolver = SynonymResolver::build(&symptoms, synonyms)
        .with_fuzzy(resolver_config.fuzzy_enabled, resolver_config.fuzzy_threshold);

    let report = TrainingReport {
        total_symptoms: symptoms.len(),
        total_diseases: diseases.len(),
        training_samples: rows.len(),
    };
    tracing::info!(
        "训练完成: {} 个症状, {} 个疾病, {} 条样本",
        report.total_symptoms,
        report.total_diseases,
        report.training_samples
    );

    let model = Model::new(symptoms, diseases, resolver, classifier.clone())?;
    Ok(TrainedModel {
        model,
        classifier,
        report,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::FeatureVector;
    use tempfile::tempdir;

    fn sample(disease: &str, symptoms: &[&str]) -> TrainingSample {
        TrainingSample {
            disease: disease.to_string(),
            symptoms: symptoms.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn samples() -> Vec<TrainingSample> {
        vec![
            sample("Influenza", &["Fever", "Cough", "Headache"]),
            sample("Dengue", &["Fever", "Rash", "Joint pain"]),
            sample("Common cold", &["Cough", "Runny nose"]),
            sample("Influenza", &["Fever", "Cough"]),
        ]
    }

    #[test]
    fn test_vocabularies_are_sorted_unique() {
        let trained = train(&samples(), &SynonymTable::new(), &ResolverConfig::default()).unwrap();
        let model = &trained.model;
        assert_eq!(
            model.symptoms().entries(),
            &["Cough", "Fever", "Headache", "Joint pain", "Rash", "Runny nose"]
        );
        assert_eq!(model.diseases().entries(), &["Common cold", "Dengue", "Influenza"]);
        assert_eq!(trained.report.training_samples, 4);
        assert_eq!(model.oracle().input_dim(), 6);
        assert_eq!(model.oracle().output_dim(), 3);
    }

    #[test]
    fn test_training_is_deterministic() {
        let a = train(&samples(), &SynonymTable::new(), &ResolverConfig::default()).unwrap();
        let mut shuffled = samples();
        shuffled.reverse();
        let b = train(&shuffled, &SynonymTable::new(), &ResolverConfig::default()).unwrap();
        assert_eq!(a.model.fingerprint(), b.model.fingerprint());
        assert_eq!(a.classifier.params().log_present, b.classifier.params().log_present);
    }

    #[tokio::test]
    async fn test_repeated_symptoms_in_a_sample_count_once() {
        let repeated = vec![
            sample("Flu", &["Fever", "Fever", " Fever"]),
            sample("Cold", &["Cough"]),
        ];
        let trained = train(&repeated, &SynonymTable::new(), &ResolverConfig::default()).unwrap();
        let params = trained.classifier.params();
        assert!(params
            .log_absent
            .iter()
            .chain(params.log_present.iter())
            .flatten()
            .all(|v| v.is_finite()));

        let once = vec![sample("Flu", &["Fever"]), sample("Cold", &["Cough"])];
        let reference = train(&once, &SynonymTable::new(), &ResolverConfig::default()).unwrap();
        assert_eq!(params.log_present, reference.classifier.params().log_present);

        // 未命中重复症状的请求也能正常推理
        let cough = trained.model.symptoms().index_of("Cough").unwrap();
        let mut indicators = vec![0.0f32; trained.model.symptoms().len()];
        indicators[cough] = 1.0;
        let probs = trained
            .model
            .oracle()
            .predict(&FeatureVector::from_values(indicators))
            .await
            .unwrap();
        assert!(probs.iter().all(|p| p.is_finite()));
        let cold = trained.model.diseases().index_of("Cold").unwrap();
        assert!(probs[cold] > 0.5);
    }

    #[test]
    fn test_empty_training_data_is_rejected() {
        let err = train(&[], &SynonymTable::new(), &ResolverConfig::default()).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_add_sample_and_roundtrip_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data").join("mapping.json");

        let mut set = TrainingSet::load(&path).unwrap();
        assert!(set.is_empty());
        assert_eq!(set.add_sample(" Dengue ", ["Fever", " Rash ", "", "Fever"]).unwrap(), 1);
        set.save(&path).unwrap();

        let loaded = TrainingSet::load(&path).unwrap();
        assert_eq!(loaded.samples(), &[sample("Dengue", &["Fever", "Rash"])]);
    }

    #[test]
    fn test_add_sample_validation() {
        let mut set = TrainingSet::default();
        assert!(set.add_sample("  ", ["Fever"]).is_err());
        assert!(set.add_sample("Flu", ["  "]).is_err());
        assert_eq!(set.len(), 0);
    }
}
