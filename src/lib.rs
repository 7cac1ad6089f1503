//! Triage - 症状到诊断的调整流水线
//!
//! 核心设计原则：
//! - 分类器是黑盒，只约定输入输出维度
//! - 外部服务失败只降级，不让请求失败
//! - 模型不可变，重新训练后整体替换

pub mod core;
pub mod storage;
