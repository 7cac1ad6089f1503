//! 模型文件存储
//!
//! 模型目录包含 symptoms_list.json、diseases_list.json 与 classifier.json。
//! 使用远程分类器时只需要两张词表。

use crate::core::models::{AppConfig, OracleConfig, Vocabulary};
use crate::core::oracle::{ClassifierOracle, NaiveBayesOracle, NaiveBayesParams, RemoteOracle};
use crate::core::pipeline::Model;
use crate::core::synonym::{SynonymResolver, SynonymTable};
use crate::core::trainer::TrainedModel;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub const SYMPTOMS_FILE: &str = "symptoms_list.json";
pub const DISEASES_FILE: &str = "diseases_list.json";
pub const CLASSIFIER_FILE: &str = "classifier.json";

/// 模型目录
pub struct ModelStore {
    dir: PathBuf,
}

impl ModelStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// 词表文件是否齐全
    pub fn exists(&self) -> bool {
        self.dir.join(SYMPTOMS_FILE).exists() && self.dir.join(DISEASES_FILE).exists()
    }

    /// 保存训练产物
    pub fn save(&self, trained: &TrainedModel) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        write_json(&self.dir.join(SYMPTOMS_FILE), trained.model.symptoms().entries())?;
        write_json(&self.dir.join(DISEASES_FILE), trained.model.diseases().entries())?;
        write_json(&self.dir.join(CLASSIFIER_FILE), trained.classifier.params())?;
        tracing::info!("模型已保存到 {}", self.dir.display());
        Ok(())
    }

    /// 读取症状词表与疾病词表
    pub fn load_vocabularies(&self) -> Result<(Vocabulary, Vocabulary)> {
        let symptoms: Vec<String> = read_json(&self.dir.join(SYMPTOMS_FILE))?;
        let diseases: Vec<String> = read_json(&self.dir.join(DISEASES_FILE))?;
        Ok((Vocabulary::new(symptoms)?, Vocabulary::new(diseases)?))
    }

    /// 按配置加载模型
    ///
    /// 分类器维度与词表不一致时拒绝加载。
    pub fn load(&self, synonyms: &SynonymTable, config: &AppConfig) -> Result<Model> {
        let (symptoms, diseases) = self.load_vocabularies()?;
        let resolver = SynonymResolver::build(&symptoms, synonyms)
            .with_fuzzy(config.resolver.fuzzy_enabled, config.resolver.fuzzy_threshold);

        let oracle: Arc<dyn ClassifierOracle> = match &config.oracle {
            OracleConfig::Local => {
                let params: NaiveBayesParams = read_json(&self.dir.join(CLASSIFIER_FILE))?;
                Arc::new(NaiveBayesOracle::from_params(params)?)
            }
            OracleConfig::Remote { endpoint, api_key } => Arc::new(RemoteOracle::new(
                endpoint.clone(),
                api_key.clone(),
                symptoms.len(),
                diseases.len(),
                Duration::from_secs(config.pipeline.oracle_timeout_secs),
            )?),
        };

        let model = Model::new(symptoms, diseases, resolver, oracle)?;
        tracing::info!(
            "已加载模型 {} ({} 个症状, {} 个疾病, 分类器 {})",
            model.fingerprint(),
            model.symptoms().len(),
            model.diseases().len(),
            model.oracle().name()
        );
        Ok(model)
    }
}

/// 读取同义词词典，文件不存在时返回空词典
///
/// 格式：`{"规范症状": ["别名", ...]}`，非字符串别名被忽略。
pub fn load_synonyms(path: &Path) -> Result<SynonymTable> {
    if !path.exists() {
        tracing::debug!("未找到同义词词典: {}", path.display());
        return Ok(SynonymTable::new());
    }

    let value: serde_json::Value = read_json(path)?;
    let object = value
        .as_object()
        .with_context(|| format!("同义词词典必须是JSON对象: {}", path.display()))?;

    let table = object
        .iter()
        .map(|(canonical, alternates)| {
            let forms = alternates
                .as_array()
                .map(|items| {
                    items
                        .iter()
                        .filter_map(|v| v.as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default();
            (canonical.clone(), forms)
        })
        .collect();
    Ok(table)
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("无法读取 {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("无法解析 {}", path.display()))
}

fn write_json<T: serde::Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let content = serde_json::to_string_pretty(value)?;
    std::fs::write(path, content).with_context(|| format!("无法写入 {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::{ResolverConfig, TrainingSample};
    use crate::core::trainer::train;
    use tempfile::tempdir;

    fn trained() -> TrainedModel {
        let samples = vec![
            TrainingSample {
                disease: "Influenza".to_string(),
                symptoms: vec!["Fever".to_string(), "Cough".to_string()],
            },
            TrainingSample {
                disease: "Dengue".to_string(),
                symptoms: vec!["Fever".to_string(), "Rash".to_string()],
            },
        ];
        train(&samples, &SynonymTable::new(), &ResolverConfig::default()).unwrap()
    }

    #[test]
    fn test_save_and_load_local_model() {
        let dir = tempdir().unwrap();
        let store = ModelStore::new(dir.path().join("models"));
        assert!(!store.exists());

        let trained = trained();
        store.save(&trained).unwrap();
        assert!(store.exists());

        let loaded = store.load(&SynonymTable::new(), &AppConfig::default()).unwrap();
        assert_eq!(loaded.fingerprint(), trained.model.fingerprint());
        assert_eq!(loaded.oracle().name(), "naive-bayes");
    }

    #[test]
    fn test_remote_oracle_uses_vocabulary_dimensions() {
        let dir = tempdir().unwrap();
        let store = ModelStore::new(dir.path());
        store.save(&trained()).unwrap();

        let config = AppConfig {
            oracle: OracleConfig::Remote {
                endpoint: "http://127.0.0.1:9/predict".to_string(),
                api_key: String::new(),
            },
            ..AppConfig::default()
        };
        let model = store.load(&SynonymTable::new(), &config).unwrap();
        assert_eq!(model.oracle().name(), "remote");
        assert_eq!(model.oracle().input_dim(), 3);
        assert_eq!(model.oracle().output_dim(), 2);
    }

    #[test]
    fn test_mismatched_classifier_is_refused() {
        let dir = tempdir().unwrap();
        let store = ModelStore::new(dir.path());
        store.save(&trained()).unwrap();
        // 词表多出一个症状，分类器参数不再匹配
        std::fs::write(
            dir.path().join(SYMPTOMS_FILE),
            r#"["Cough", "Fever", "Headache", "Rash"]"#,
        )
        .unwrap();

        assert!(store.load(&SynonymTable::new(), &AppConfig::default()).is_err());
    }

    #[test]
    fn test_load_synonyms() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("symptom_synonyms.json");
        assert!(load_synonyms(&path).unwrap().is_empty());

        std::fs::write(
            &path,
            r#"{"Cough": ["ho", "ho khan", 3], "Fever": null}"#,
        )
        .unwrap();
        let table = load_synonyms(&path).unwrap();
        assert_eq!(table["Cough"], vec!["ho".to_string(), "ho khan".to_string()]);
        assert!(table["Fever"].is_empty());
    }
}
