//! Triage - 症状到诊断的调整流水线
//!
//! 用法：
//!   triage diagnose "tôi bị ho khan, sốt"
//!   triage diagnose --top-k 3 --region VN ho sốt "đau đầu"
//!   triage train
//!   triage info
//!   triage add-sample --disease "Sốt xuất huyết" --symptoms "sốt,phát ban"
//!   triage popular --region VN
//!   triage history --limit 20

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use triage::core::models::{AppConfig, DiagnosisRequest};
use triage::core::pipeline::{ModelHandle, Pipeline};
use triage::core::priors::{CachedPopularityProvider, HttpPopularityProvider, PopularityProvider};
use triage::core::severity::{HttpSeverityService, SeverityEvaluator};
use triage::core::trainer::{train, TrainingSet};
use triage::storage::config::ConfigManager;
use triage::storage::database::Database;
use triage::storage::model_store::{load_synonyms, ModelStore};

#[derive(Parser)]
#[command(name = "triage")]
#[command(version)]
#[command(about = "症状到诊断的调整流水线", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// 配置文件路径
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// 诊断：一个参数按自由文本切分，多个参数视为症状短语
    Diagnose {
        #[arg(required = true)]
        input: Vec<String>,

        /// 排名长度
        #[arg(long)]
        top_k: Option<usize>,

        /// 流行病学地区
        #[arg(long)]
        region: Option<String>,

        /// 建议语句随机种子
        #[arg(long)]
        seed: Option<u64>,
    },

    /// 用训练数据重新训练并保存模型
    Train,

    /// 打印模型信息
    Info,

    /// 追加训练样本
    AddSample {
        #[arg(long)]
        disease: String,

        /// 逗号分隔的症状
        #[arg(long)]
        symptoms: String,
    },

    /// 打印地区流行疾病排名
    Popular {
        #[arg(long)]
        region: Option<String>,
    },

    /// 最近的诊断记录
    History {
        #[arg(long, default_value = "20")]
        limit: usize,
    },
}

/// 应用上下文
struct App {
    config: AppConfig,
    store: ModelStore,
}

impl App {
    fn load(config_path: Option<PathBuf>) -> Result<Self> {
        let manager = ConfigManager::new(config_path.unwrap_or_else(ConfigManager::default_path));
        let config = manager.load_with_env()?;
        tracing::debug!("配置文件: {}", manager.path().display());
        let store = ModelStore::new(config.model.model_dir.clone());
        Ok(Self { config, store })
    }

    fn database(&self) -> Result<Arc<Mutex<Database>>> {
        let path = self
            .config
            .database_path
            .clone()
            .unwrap_or_else(ConfigManager::default_database_path);
        Ok(Arc::new(Mutex::new(Database::open(&path)?)))
    }

    fn popularity(&self, db: &Arc<Mutex<Database>>) -> Result<Option<Arc<dyn PopularityProvider>>> {
        if !self.config.priors_provider.is_enabled() {
            return Ok(None);
        }
        let http = HttpPopularityProvider::new(
            self.config.priors_provider.clone(),
            Duration::from_secs(self.config.pipeline.upstream_timeout_secs),
        )?;
        let cached = CachedPopularityProvider::new(
            Arc::new(http),
            chrono::Duration::hours(self.config.pipeline.priors_ttl_hours),
        )
        .with_store(Arc::clone(db));
        Ok(Some(Arc::new(cached)))
    }

    fn severity(&self) -> Result<SeverityEvaluator> {
        if !self.config.severity_service.is_enabled() {
            return Ok(SeverityEvaluator::heuristic());
        }
        let timeout = Duration::from_secs(self.config.pipeline.upstream_timeout_secs);
        let service = HttpSeverityService::new(self.config.severity_service.clone(), timeout)?;
        Ok(SeverityEvaluator::with_service(Arc::new(service), timeout))
    }

    fn load_model(&self) -> Result<triage::core::pipeline::Model> {
        if !self.store.exists() {
            bail!(
                "模型目录 {} 中没有词表文件，请先运行 `triage train`",
                self.store.dir().display()
            );
        }
        let synonyms = load_synonyms(&self.config.model.synonyms_path)?;
        self.store.load(&synonyms, &self.config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // 初始化日志
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let mut app = App::load(cli.config)?;

    match cli.command {
        Commands::Diagnose {
            input,
            top_k,
            region,
            seed,
        } => {
            if seed.is_some() {
                app.config.pipeline.advice_seed = seed;
            }
            let db = app.database()?;
            let model = app.load_model()?;

            let mut pipeline = Pipeline::new(Arc::new(ModelHandle::new(model)), app.config.pipeline.clone())
                .with_severity(app.severity()?);
            if let Some(provider) = app.popularity(&db)? {
                pipeline = pipeline.with_popularity(provider);
            }

            let mut request = if input.len() == 1 {
                DiagnosisRequest::passage(input[0].clone())
            } else {
                DiagnosisRequest::phrases(input)
            };
            request.top_k = top_k;
            request.region = region;

            let result = pipeline.diagnose(request).await?;
            if let Ok(db) = db.lock() {
                if let Err(e) = db.archive_diagnosis(&result, app.config.pipeline.history_keep) {
                    tracing::warn!("保存诊断记录失败: {}", e);
                }
            }
            println!("{}", serde_json::to_string_pretty(&result)?);
        }

        Commands::Train => {
            let path = &app.config.model.training_data_path;
            let set = TrainingSet::load(path)?;
            if set.is_empty() {
                bail!("训练数据为空: {}", path.display());
            }
            let synonyms = load_synonyms(&app.config.model.synonyms_path)?;
            let trained = train(set.samples(), &synonyms, &app.config.resolver)?;
            app.store.save(&trained)?;
            println!("{}", serde_json::to_string_pretty(&trained.report)?);
        }

        Commands::Info => {
            let model = app.load_model()?;
            println!("{}", serde_json::to_string_pretty(&model.info())?);
        }

        Commands::AddSample { disease, symptoms } => {
            let path = &app.config.model.training_data_path;
            let mut set = TrainingSet::load(path)?;
            let total = set.add_sample(&disease, symptoms.split(','))?;
            set.save(path)?;
            tracing::info!("已添加训练样本: {}", disease);
            println!("{}", serde_json::json!({ "total_entries": total }));
        }

        Commands::Popular { region } => {
            let db = app.database()?;
            let Some(provider) = app.popularity(&db)? else {
                bail!("未配置流行病学排名服务（设置 WHO_API_URL 或配置文件 priors_provider.api_url）");
            };
            let region = region.unwrap_or_else(|| app.config.pipeline.region.clone());
            let names = provider.ranking(&region).await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({ "region": region, "data": names }))?
            );
        }

        Commands::History { limit } => {
            let db = app.database()?;
            let entries = match db.lock() {
                Ok(db) => db.load_recent_history(limit)?,
                Err(_) => bail!("数据库不可用"),
            };
            println!("{}", serde_json::to_string_pretty(&entries)?);
        }
    }

    Ok(())
}
