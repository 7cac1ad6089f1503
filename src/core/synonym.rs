//! 症状同义词解析模块
//!
//! 把用户输入的短语映射到词表中的规范症状。查找顺序：
//! 1. 同义词表精确匹配（规范化后）
//! 2. 规范化词表精确匹配
//! 3. 模糊匹配（可关闭），分数达到阈值才接受
//!
//! 都不命中的短语直接丢弃，宁缺毋滥。

use crate::core::models::SymptomVocabulary;
use crate::core::normalize::normalize;
use std::collections::{BTreeMap, HashMap, HashSet};

/// 同义词词典：规范症状 -> 别名列表
pub type SynonymTable = BTreeMap<String, Vec<String>>;

/// 症状解析器
#[derive(Debug, Clone)]
pub struct SynonymResolver {
    /// 规范化别名 -> 规范症状
    synonyms: HashMap<String, String>,
    /// 规范化词表 -> 规范症状
    vocabulary: HashMap<String, String>,
    /// 模糊匹配候选（规范化表面形式, 规范症状），按注册顺序
    candidates: Vec<(String, String)>,
    fuzzy_enabled: bool,
    /// 阈值 (0-100)
    fuzzy_threshold: f64,
}

impl SynonymResolver {
    /// 根据词表和同义词词典构建解析器
    pub fn build(vocabulary: &SymptomVocabulary, table: &SynonymTable) -> Self {
        let mut normalized_vocab: HashMap<String, String> = HashMap::new();
        let mut candidates: Vec<(String, String)> = Vec::new();
        let mut seen_forms: HashSet<String> = HashSet::new();

        for symptom in vocabulary.iter() {
            let key = normalize(symptom);
            if key.is_empty() || normalized_vocab.contains_key(&key) {
                continue;
            }
            normalized_vocab.insert(key.clone(), symptom.to_string());
            seen_forms.insert(key.clone());
            candidates.push((key, symptom.to_string()));
        }

        let mut synonyms: HashMap<String, String> = HashMap::new();
        for (canonical, alternates) in table {
            let canon_key = normalize(canonical);
            let Some(target) = normalized_vocab.get(&canon_key).cloned() else {
                // 词表里没有的规范症状直接跳过，避免特征列错位
                tracing::debug!("同义词目标不在词表中，已跳过: {}", canonical);
                continue;
            };

            for form in alternates.iter().map(|a| normalize(a)).chain([canon_key]) {
                if form.is_empty() {
                    continue;
                }
                if let Some(existing) = synonyms.get(&form) {
                    if existing != &target {
                        tracing::debug!("别名 {} 已映射到 {}，忽略 {}", form, existing, target);
                    }
                    continue;
                }
                synonyms.insert(form.clone(), target.clone());
                if seen_forms.insert(form.clone()) {
                    candidates.push((form, target.clone()));
                }
            }
        }

        Self {
            synonyms,
            vocabulary: normalized_vocab,
            candidates,
            fuzzy_enabled: true,
            fuzzy_threshold: 90.0,
        }
    }

    /// 设置模糊匹配参数
    pub fn with_fuzzy(mut self, enabled: bool, threshold: f64) -> Self {
        self.fuzzy_enabled = enabled;
        self.fuzzy_threshold = threshold.clamp(0.0, 100.0);
        self
    }

    /// 已注册的别名数量
    pub fn synonym_count(&self) -> usize {
        self.synonyms.len()
    }

    /// 解析单个短语
    pub fn resolve(&self, token: &str) -> Option<String> {
        let t = normalize(token);
        if t.is_empty() {
            return None;
        }

        if let Some(id) = self.synonyms.get(&t) {
            return Some(id.clone());
        }
        if let Some(id) = self.vocabulary.get(&t) {
            return Some(id.clone());
        }
        if !self.fuzzy_enabled {
            return None;
        }

        self.fuzzy_match(&t).map(|(id, score)| {
            tracing::debug!("模糊匹配: {} -> {} (score={:.1})", t, id, score);
            id
        })
    }

    /// 批量解析，保持首次出现顺序并去重
    pub fn resolve_all<S: AsRef<str>>(&self, tokens: &[S]) -> Vec<String> {
        let mut out = Vec::new();
        let mut seen = HashSet::new();
        for token in tokens {
            if let Some(id) = self.resolve(token.as_ref()) {
                if seen.insert(id.clone()) {
                    out.push(id);
                }
            }
        }
        out
    }

    fn fuzzy_match(&self, query: &str) -> Option<(String, f64)> {
        let mut best: Option<(&str, &str, f64)> = None;
        for (form, id) in &self.candidates {
            let score = weighted_ratio(query, form);
            let better = match best {
                None => true,
                Some((best_form, _, best_score)) => {
                    score > best_score
                        || (score == best_score
                            && form.chars().count() > best_form.chars().count())
                }
            };
            if better {
                best = Some((form, id, score));
            }
        }

        best.filter(|(_, _, score)| *score >= self.fuzzy_threshold)
            .map(|(_, id, score)| (id.to_string(), score))
    }
}

/// 基于最长公共子序列的相似度 (0-100)
fn ratio(a: &str, b: &str) -> f64 {
    let a_chars: Vec<char> = a.chars().collect();
    let b_chars: Vec<char> = b.chars().collect();
    let total = a_chars.len() + b_chars.len();
    if total == 0 {
        return 100.0;
    }

    let mut prev = vec![0usize; b_chars.len() + 1];
    let mut curr = vec![0usize; b_chars.len() + 1];
    for &a_ch in &a_chars {
        for (j, &b_ch) in b_chars.iter().enumerate() {
            curr[j + 1] = if a_ch == b_ch {
                prev[j] + 1
            } else {
                prev[j + 1].max(curr[j])
            };
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    let lcs = prev[b_chars.len()];
    100.0 * (2 * lcs) as f64 / total as f64
}

/// 短串与长串中等长词窗口的最佳相似度
fn partial_word_ratio(short: &str, long: &str) -> f64 {
    let width = short.split(' ').count();
    let words: Vec<&str> = long.split(' ').collect();
    if words.len() <= width {
        return ratio(short, long);
    }
    words
        .windows(width)
        .map(|w| ratio(short, &w.join(" ")))
        .fold(0.0, f64::max)
}

/// 加权相似度：长度接近时用整体相似度，相差较大时用缩放后的局部相似度
fn weighted_ratio(a: &str, b: &str) -> f64 {
    let la = a.chars().count();
    let lb = b.chars().count();
    if la == 0 || lb == 0 {
        return 0.0;
    }

    let base = ratio(a, b);
    let (short, long, short_len) = if la <= lb { (a, b, la) } else { (b, a, lb) };
    let len_ratio = la.max(lb) as f64 / short_len as f64;
    if len_ratio < 1.5 || short_len < 3 {
        return base;
    }

    let scale = if len_ratio >= 8.0 { 0.6 } else { 0.9 };
    base.max(partial_word_ratio(short, long) * scale)
}
