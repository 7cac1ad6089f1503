//! 特征向量构建

use crate::core::models::{FeatureVector, SymptomVocabulary};

/// 按词表顺序生成0/1指示向量
///
/// 解析器只会产出词表内的症状，词表外的id在这里被忽略。
pub fn build_feature_vector<S: AsRef<str>>(
    resolved: &[S],
    vocabulary: &SymptomVocabulary,
) -> FeatureVector {
    let mut values = vec![0.0f32; vocabulary.len()];
    for id in resolved {
        if let Some(i) = vocabulary.index_of(id.as_ref()) {
            values[i] = 1.0;
        }
    }
    FeatureVector::from_values(values)
}
