//! 存储模块：配置、SQLite数据库与模型文件

pub mod config;
pub mod database;
pub mod model_store;
