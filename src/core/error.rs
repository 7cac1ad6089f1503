//! 核心错误类型
//!
//! 只有配置错误和分类器错误会中断请求，其余外部依赖失败都在流水线内降级处理。

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TriageError {
    /// 词表/分类器缺失或维度不一致，必须拒绝服务
    #[error("配置错误: {0}")]
    Configuration(String),

    /// 特征向量长度与分类器输入不一致
    #[error("特征维度不匹配: 期望 {expected}, 实际 {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// 分类器调用失败或返回值违反约定
    #[error("分类器错误: {0}")]
    Oracle(String),

    #[error("分类器超时 ({0} 秒)")]
    OracleTimeout(u64),

    /// 外部服务（流行病学/严重度）不可用
    #[error("上游服务不可用: {0}")]
    UpstreamUnavailable(String),

    #[error("IO错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON错误: {0}")]
    Json(#[from] serde_json::Error),
}

impl TriageError {
    /// 是否为致命错误（进程应拒绝继续服务）
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TriageError::Configuration(_) | TriageError::DimensionMismatch { .. }
        )
    }
}

impl From<reqwest::Error> for TriageError {
    fn from(e: reqwest::Error) -> Self {
        TriageError::UpstreamUnavailable(e.to_string())
    }
}

pub type TriageResult<T> = Result<T, TriageError>;
