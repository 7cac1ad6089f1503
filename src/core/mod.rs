//! Core模块 - 包含所有核心业务逻辑

pub mod error;
pub mod models;
pub mod normalize;
pub mod synonym;
pub mod features;
pub mod oracle;
pub mod priors;
pub mod severity;
pub mod advice;
pub mod trainer;
pub mod pipeline;
