//! 分类器接口
//!
//! 分类器对流水线是黑盒：输入与症状词表对齐的特征向量，输出与疾病词表对齐的概率。
//! 提供两种实现：
//! - NaiveBayesOracle：由训练数据拟合的内置分类器
//! - RemoteOracle：调用远程推理服务（instances/predictions 格式）

use crate::core::error::{TriageError, TriageResult};
use crate::core::models::FeatureVector;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

pub type OracleFuture<'a> = Pin<Box<dyn Future<Output = TriageResult<Vec<f64>>> + Send + 'a>>;

/// 分类器约定
pub trait ClassifierOracle: Send + Sync {
    /// 期望的特征维度
    fn input_dim(&self) -> usize;

    /// 输出的疾病数量
    fn output_dim(&self) -> usize;

    /// 推理，返回与疾病词表逐位对齐的概率
    fn predict<'a>(&'a self, features: &'a FeatureVector) -> OracleFuture<'a>;

    /// 用于日志的名称
    fn name(&self) -> &str {
        "oracle"
    }
}

/// 朴素贝叶斯参数（伯努利模型，拉普拉斯平滑）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NaiveBayesParams {
    /// 每个疾病的对数先验
    pub log_prior: Vec<f64>,
    /// ln P(症状出现 | 疾病)，[疾病][症状]
    pub log_present: Vec<Vec<f64>>,
    /// ln P(症状缺失 | 疾病)
    pub log_absent: Vec<Vec<f64>>,
}

/// 内置分类器
#[derive(Debug, Clone)]
pub struct NaiveBayesOracle {
    params: Arc<NaiveBayesParams>,
    n_features: usize,
}

impl NaiveBayesOracle {
    /// 平滑系数
    pub const ALPHA: f64 = 1.0;

    /// 拟合参数
    ///
    /// `samples` 的每项为 (疾病下标, 出现的症状下标)。
    pub fn fit(
        samples: &[(usize, Vec<usize>)],
        n_diseases: usize,
        n_symptoms: usize,
    ) -> TriageResult<Self> {
        if samples.is_empty() || n_diseases == 0 || n_symptoms == 0 {
            return Err(TriageError::Configuration("训练数据为空".to_string()));
        }

        let mut class_counts = vec![0usize; n_diseases];
        let mut feature_counts = vec![vec![0usize; n_symptoms]; n_diseases];
        for (disease, symptoms) in samples {
            let row = feature_counts.get_mut(*disease).ok_or_else(|| {
                TriageError::Configuration(format!("疾病下标越界: {}", disease))
            })?;
            class_counts[*disease] += 1;
            for &s in symptoms {
                let cell = row.get_mut(s).ok_or_else(|| {
                    TriageError::Configuration(format!("症状下标越界: {}", s))
                })?;
                *cell += 1;
            }
        }

        let total = samples.len() as f64;
        let alpha = Self::ALPHA;
        let log_prior = class_counts
            .iter()
            .map(|&c| ((c as f64 + alpha) / (total + alpha * n_diseases as f64)).ln())
            .collect();

        let mut log_present = Vec::with_capacity(n_diseases);
        let mut log_absent = Vec::with_capacity(n_diseases);
        for (d, row) in feature_counts.iter().enumerate() {
            let n = class_counts[d] as f64;
            let p: Vec<f64> = row
                .iter()
                .map(|&c| (c as f64 + alpha) / (n + 2.0 * alpha))
                .collect();
            log_present.push(p.iter().map(|v| v.ln()).collect());
            log_absent.push(p.iter().map(|v| (1.0 - v).ln()).collect());
        }

        Self::from_params(NaiveBayesParams {
            log_prior,
            log_present,
            log_absent,
        })
    }

    /// 从已保存的参数恢复，检查各维度一致
    pub fn from_params(params: NaiveBayesParams) -> TriageResult<Self> {
        let n_diseases = params.log_prior.len();
        if n_diseases == 0
            || params.log_present.len() != n_diseases
            || params.log_absent.len() != n_diseases
        {
            return Err(TriageError::Configuration("分类器参数的疾病维度不一致".to_string()));
        }
        let n_features = params.log_present[0].len();
        let consistent = params
            .log_present
            .iter()
            .chain(params.log_absent.iter())
            .all(|row| row.len() == n_features);
        if !consistent {
            return Err(TriageError::Configuration("分类器参数的症状维度不一致".to_string()));
        }
        Ok(Self {
            params: Arc::new(params),
            n_features,
        })
    }

    pub fn params(&self) -> &NaiveBayesParams {
        &self.params
    }

    fn infer(params: &NaiveBayesParams, x: &[f32]) -> Vec<f64> {
        let scores: Vec<f64> = params
            .log_prior
            .iter()
            .enumerate()
            .map(|(d, prior)| {
                let present = &params.log_present[d];
                let absent = &params.log_absent[d];
                prior
                    + x.iter()
                        .enumerate()
                        .map(|(j, v)| if *v > 0.0 { present[j] } else { absent[j] })
                        .sum::<f64>()
            })
            .collect();

        // softmax，先减去最大值保证数值稳定
        let max = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let exps: Vec<f64> = scores.iter().map(|s| (s - max).exp()).collect();
        let total: f64 = exps.iter().sum();
        exps.into_iter().map(|e| (e / total).clamp(0.0, 1.0)).collect()
    }
}

impl ClassifierOracle for NaiveBayesOracle {
    fn input_dim(&self) -> usize {
        self.n_features
    }

    fn output_dim(&self) -> usize {
        self.params.log_prior.len()
    }

    fn predict<'a>(&'a self, features: &'a FeatureVector) -> OracleFuture<'a> {
        Box::pin(async move {
            if features.len() != self.n_features {
                return Err(TriageError::DimensionMismatch {
                    expected: self.n_features,
                    actual: features.len(),
                });
            }
            let params = Arc::clone(&self.params);
            let x = features.as_slice().to_vec();
            tokio::task::spawn_blocking(move || Self::infer(&params, &x))
                .await
                .map_err(|e| TriageError::Oracle(format!("推理任务失败: {}", e)))
        })
    }

    fn name(&self) -> &str {
        "naive-bayes"
    }
}

/// 远程推理服务
pub struct RemoteOracle {
    endpoint: String,
    api_key: String,
    client: reqwest::Client,
    input_dim: usize,
    output_dim: usize,
}

#[derive(Debug, Serialize)]
struct PredictRequest<'a> {
    instances: [&'a [f32]; 1],
}

impl RemoteOracle {
    /// 创建远程分类器，维度由本地词表声明
    pub fn new(
        endpoint: String,
        api_key: String,
        input_dim: usize,
        output_dim: usize,
        timeout: Duration,
    ) -> TriageResult<Self> {
        if endpoint.trim().is_empty() {
            return Err(TriageError::Configuration("远程分类器端点为空".to_string()));
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TriageError::Configuration(format!("HTTP客户端创建失败: {}", e)))?;
        Ok(Self {
            endpoint: endpoint.trim().trim_end_matches('/').to_string(),
            api_key,
            client,
            input_dim,
            output_dim,
        })
    }

    async fn call(&self, features: &FeatureVector) -> TriageResult<Vec<f64>> {
        let request = PredictRequest {
            instances: [features.as_slice()],
        };

        let mut req = self.client.post(&self.endpoint).json(&request);
        if !self.api_key.is_empty() {
            req = req.header("Authorization", format!("Bearer {}", self.api_key));
        }

        let value: serde_json::Value = req
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| TriageError::Oracle(format!("远程分类器请求失败: {}", e)))?
            .json()
            .await
            .map_err(|e| TriageError::Oracle(format!("远程分类器响应无法解析: {}", e)))?;

        parse_predictions(&value)
    }
}

impl ClassifierOracle for RemoteOracle {
    fn input_dim(&self) -> usize {
        self.input_dim
    }

    fn output_dim(&self) -> usize {
        self.output_dim
    }

    fn predict<'a>(&'a self, features: &'a FeatureVector) -> OracleFuture<'a> {
        Box::pin(async move {
            if features.len() != self.input_dim {
                return Err(TriageError::DimensionMismatch {
                    expected: self.input_dim,
                    actual: features.len(),
                });
            }
            self.call(features).await
        })
    }

    fn name(&self) -> &str {
        "remote"
    }
}

/// 解析 {"predictions": [[...]]} 或 {"predictions": [...]}
fn parse_predictions(value: &serde_json::Value) -> TriageResult<Vec<f64>> {
    let predictions = value
        .get("predictions")
        .and_then(|v| v.as_array())
        .ok_or_else(|| TriageError::Oracle("响应缺少 predictions 字段".to_string()))?;

    let row = match predictions.first() {
        Some(serde_json::Value::Array(inner)) => inner,
        _ => predictions,
    };

    row.iter()
        .map(|v| {
            v.as_f64()
                .ok_or_else(|| TriageError::Oracle(format!("非数值的预测值: {}", v)))
        })
        .collect()
}
