//! 建议文本生成模块
//!
//! 依次拼接：流行提示（可选）、严重程度语句、症状护理提示、一句鼓励语。
//! 鼓励语由注入的随机源选择，固定种子即可复现。

use crate::core::models::{SeverityAssessment, SeverityLevel};
use rand::seq::SliceRandom;
use rand::Rng;

/// 鼓励语
pub const SUPPORTIVE_REMARKS: &[&str] = &[
    "Nhớ giữ tinh thần lạc quan nhé!",
    "Nghỉ ngơi hợp lý, uống đủ nước nha!",
    "Bạn là chiến binh, mọi chuyện sẽ ổn!",
    "Nếu mệt, hãy nhờ người thân hỗ trợ!",
    "Ăn uống lành mạnh và ngủ đủ giấc!",
    "Mang sạc dự phòng nếu phải đi viện nhé!",
];

pub const POPULARITY_NOTICE: &str =
    "Bệnh này đang khá phổ biến, bạn nên theo dõi kỹ triệu chứng.";

const MEDIUM_SENTENCE: &str =
    "Tình trạng trung bình. Nghỉ ngơi, uống đủ nước và theo dõi 24–48 giờ.";

const LOW_SENTENCE: &str = "Tình trạng nhẹ. Nghỉ ngơi và theo dõi thêm.";

/// 症状护理提示（按规范症状名小写匹配）
const CARE_TIPS: &[(&[&str], &str)] = &[
    (
        &["fever", "sốt", "sốt cao", "high fever"],
        "Uống nhiều nước và dùng thuốc hạ sốt nếu sốt > 38.5°C.",
    ),
    (
        &["cough", "ho", "ho khan"],
        "Dùng siro ho hoặc thuốc long đờm OTC. Tránh nơi bụi bẩn.",
    ),
];

/// 严重程度语句
pub fn severity_sentence(severity: &SeverityAssessment) -> String {
    if severity.hospital_flag {
        return format!(
            "Mức độ {}. Bạn nên đến cơ sở y tế sớm.",
            severity.level.label_vi()
        );
    }
    match severity.level {
        SeverityLevel::Medium => MEDIUM_SENTENCE.to_string(),
        _ => LOW_SENTENCE.to_string(),
    }
}

/// 针对已解析症状的护理提示，顺序固定
pub fn care_tips<S: AsRef<str>>(symptoms: &[S]) -> Vec<&'static str> {
    let lowered: Vec<String> = symptoms
        .iter()
        .map(|s| s.as_ref().trim().to_lowercase())
        .collect();
    CARE_TIPS
        .iter()
        .filter(|(keys, _)| lowered.iter().any(|s| keys.contains(&s.as_str())))
        .map(|(_, tip)| *tip)
        .collect()
}

/// 生成建议文本
///
/// `popular` 为当前地区的流行疾病名（小写），用于判断是否附加流行提示。
pub fn generate<S: AsRef<str>, R: Rng + ?Sized>(
    disease: &str,
    severity: &SeverityAssessment,
    symptoms: &[S],
    popular: &[String],
    rng: &mut R,
) -> String {
    let mut parts: Vec<String> = Vec::new();

    let name = disease.trim().to_lowercase();
    if !name.is_empty() && popular.iter().any(|p| p == &name) {
        parts.push(POPULARITY_NOTICE.to_string());
    }

    parts.push(severity_sentence(severity));
    parts.extend(care_tips(symptoms).into_iter().map(str::to_string));

    if let Some(remark) = SUPPORTIVE_REMARKS.choose(rng) {
        parts.push(remark.to_string());
    }

    parts.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    fn assessment(level: SeverityLevel, hospital_flag: bool) -> SeverityAssessment {
        SeverityAssessment {
            score: 0.0,
            level,
            hospital_flag,
        }
    }

    fn ends_with_remark(text: &str) -> bool {
        SUPPORTIVE_REMARKS.iter().any(|r| text.ends_with(r))
    }

    #[test]
    fn test_high_severity_advice() {
        let mut rng = ChaCha20Rng::seed_from_u64(7);
        let none: [&str; 0] = [];
        let text = generate("Nhồi máu cơ tim", &assessment(SeverityLevel::High, true), &none, &[], &mut rng);
        assert!(text.starts_with("Mức độ Cao. Bạn nên đến cơ sở y tế sớm."));
        assert!(ends_with_remark(&text));
        assert!(!text.contains(POPULARITY_NOTICE));
    }

    #[test]
    fn test_medium_and_low_sentences() {
        let mut rng = ChaCha20Rng::seed_from_u64(1);
        let none: [&str; 0] = [];
        let medium = generate("Flu", &assessment(SeverityLevel::Medium, false), &none, &[], &mut rng);
        assert!(medium.starts_with(MEDIUM_SENTENCE));
        let low = generate("Flu", &assessment(SeverityLevel::Low, false), &none, &[], &mut rng);
        assert!(low.starts_with(LOW_SENTENCE));
    }

    #[test]
    fn test_popularity_notice_and_care_tips() {
        let mut rng = ChaCha20Rng::seed_from_u64(3);
        let popular = vec!["flu".to_string()];
        let text = generate(
            "Flu",
            &assessment(SeverityLevel::Low, false),
            &["Fever", "Cough", "Headache"],
            &popular,
            &mut rng,
        );
        assert!(text.starts_with(POPULARITY_NOTICE));
        let fever_at = text.find("hạ sốt").unwrap();
        let cough_at = text.find("siro ho").unwrap();
        assert!(fever_at < cough_at);
        assert!(ends_with_remark(&text));
    }

    #[test]
    fn test_same_seed_same_text() {
        let none: [&str; 0] = [];
        let severity = assessment(SeverityLevel::Low, false);
        let a = generate("Flu", &severity, &none, &[], &mut ChaCha20Rng::seed_from_u64(42));
        let b = generate("Flu", &severity, &none, &[], &mut ChaCha20Rng::seed_from_u64(42));
        assert_eq!(a, b);
    }

    #[test]
    fn test_hospital_flag_overrides_medium_tier() {
        let sentence = severity_sentence(&assessment(SeverityLevel::Medium, true));
        assert_eq!(sentence, "Mức độ Trung bình. Bạn nên đến cơ sở y tế sớm.");
    }
}
