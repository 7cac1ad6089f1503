//! 数据库存储模块
//!
//! 使用SQLite存储流行病学排名缓存和诊断历史

use crate::core::models::DiagnosisResult;
use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::Serialize;
use std::path::PathBuf;

/// 诊断历史记录
#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    pub request_id: String,
    pub created_at: DateTime<Utc>,
    pub disease: String,
    pub confidence: f64,
    pub severity_level: String,
    pub original_disease: Option<String>,
    pub flags: serde_json::Value,
}

/// 数据库管理器
pub struct Database {
    conn: Connection,
}

impl Database {
    /// 打开或创建数据库
    pub fn open(path: &PathBuf) -> Result<Self> {
        // 确保目录存在
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        let db = Self { conn };
        db.init_tables()?;
        Ok(db)
    }

    /// 内存数据库（测试和不持久化时使用）
    pub fn open_in_memory() -> Result<Self> {
        let db = Self {
            conn: Connection::open_in_memory()?,
        };
        db.init_tables()?;
        Ok(db)
    }

    /// 初始化表结构
    fn init_tables(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            -- 流行病学排名缓存
            CREATE TABLE IF NOT EXISTS priors_cache (
                region TEXT PRIMARY KEY,
                names_json TEXT NOT NULL,
                fetched_at TEXT NOT NULL
            );

            -- 诊断历史
            CREATE TABLE IF NOT EXISTS diagnosis_history (
                request_id TEXT PRIMARY KEY,
                created_at TEXT NOT NULL,
                disease TEXT NOT NULL,
                confidence REAL NOT NULL,
                severity_level TEXT NOT NULL,
                original_disease TEXT,
                flags_json TEXT NOT NULL,
                result_json TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_history_created ON diagnosis_history(created_at DESC);
            "#,
        )?;
        Ok(())
    }

    /// 保存地区排名
    pub fn save_ranking(&self, region: &str, names: &[String], fetched_at: DateTime<Utc>) -> Result<()> {
        let names_json = serde_json::to_string(names)?;
        self.conn.execute(
            r#"
            INSERT OR REPLACE INTO priors_cache (region, names_json, fetched_at)
            VALUES (?1, ?2, ?3)
            "#,
            params![region, names_json, fetched_at.to_rfc3339()],
        )?;
        Ok(())
    }

    /// 读取地区排名及其获取时间
    pub fn load_ranking(&self, region: &str) -> Result<Option<(Vec<String>, DateTime<Utc>)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT names_json, fetched_at FROM priors_cache WHERE region = ?1")?;

        let result = stmt.query_row(params![region], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        });

        match result {
            Ok((names_json, fetched_at)) => {
                let names: Vec<String> = serde_json::from_str(&names_json)?;
                let fetched_at = DateTime::parse_from_rfc3339(&fetched_at)?.with_timezone(&Utc);
                Ok(Some((names, fetched_at)))
            }
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// 记录一次诊断
    pub fn record_diagnosis(&self, result: &DiagnosisResult) -> Result<()> {
        let flags_json = serde_json::to_string(&result.flags)?;
        let result_json = serde_json::to_string(result)?;
        let created_at = Utc::now().to_rfc3339();

        self.conn.execute(
            r#"
            INSERT OR REPLACE INTO diagnosis_history
            (request_id, created_at, disease, confidence, severity_level, original_disease, flags_json, result_json)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                result.request_id,
                created_at,
                result.disease,
                result.confidence,
                result.severity.level.to_string(),
                result.original_disease,
                flags_json,
                result_json,
            ],
        )?;
        Ok(())
    }

    /// 加载最近的诊断记录
    pub fn load_recent_history(&self, limit: usize) -> Result<Vec<HistoryEntry>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT request_id, created_at, disease, confidence, severity_level, original_disease, flags_json
            FROM diagnosis_history
            ORDER BY created_at DESC
            LIMIT ?1
            "#,
        )?;

        let entries = stmt.query_map(params![limit], |row| {
            let created_at_str: String = row.get(1)?;
            let flags_json: String = row.get(6)?;

            Ok(HistoryEntry {
                request_id: row.get(0)?,
                created_at: DateTime::parse_from_rfc3339(&created_at_str)
                    .map(|d| d.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now()),
                disease: row.get(2)?,
                confidence: row.get(3)?,
                severity_level: row.get(4)?,
                original_disease: row.get(5)?,
                flags: serde_json::from_str(&flags_json).unwrap_or_default(),
            })
        })?;

        entries.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// 清理旧的诊断记录
    pub fn cleanup_old_history(&self, keep_count: usize) -> Result<usize> {
        let affected = self.conn.execute(
            r#"
            DELETE FROM diagnosis_history
            WHERE request_id NOT IN (
                SELECT request_id FROM diagnosis_history
                ORDER BY created_at DESC
                LIMIT ?1
            )
            "#,
            params![keep_count],
        )?;
        Ok(affected)
    }

    /// 记录诊断并只保留最近 `keep_count` 条，返回被清理的条数
    pub fn archive_diagnosis(&self, result: &DiagnosisResult, keep_count: usize) -> Result<usize> {
        self.record_diagnosis(result)?;
        let removed = self.cleanup_old_history(keep_count)?;
        if removed > 0 {
            tracing::debug!("已清理 {} 条旧诊断记录", removed);
        }
        Ok(removed)
    }
}
