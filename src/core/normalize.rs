//! 文本规范化模块
//!
//! 小写、Unicode分解后去除组合符号（去变音）、合并空白。
//! 纯函数，幂等：normalize(normalize(x)) == normalize(x)。

use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

/// 规范化一段文本
pub fn normalize(text: &str) -> String {
    let stripped: String = text
        .to_lowercase()
        .nfd()
        .filter(|c| !is_combining_mark(*c))
        .collect();

    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// 将一段自由文本按逗号、分号、换行切分为症状短语
pub fn split_passage(text: &str) -> Vec<String> {
    text.split([',', ';', '\n', '\r'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_vietnamese_diacritics() {
        assert_eq!(normalize("Tôi bị HO KHAN"), "toi bi ho khan");
        assert_eq!(normalize("  sốt   cao\t"), "sot cao");
        assert_eq!(normalize("Đau đầu"), "đau đau");
    }

    #[test]
    fn test_normalize_idempotent() {
        let samples = [
            "Tôi bị ho khan",
            "  Đau   ngực dữ dội ",
            "İstanbul Ǆ ﬁ",
            "Khó\u{00A0}thở",
            "",
            "café naïve",
        ];
        for s in samples {
            let once = normalize(s);
            assert_eq!(normalize(&once), once, "not idempotent for {:?}", s);
        }
    }

    #[test]
    fn test_split_passage() {
        let parts = split_passage("sốt, ho khan;\nđau đầu ,, \r\n");
        assert_eq!(parts, vec!["sốt", "ho khan", "đau đầu"]);
        assert!(split_passage(" ; , ").is_empty());
    }
}
