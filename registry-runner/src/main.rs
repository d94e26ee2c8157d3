//! 卒中登记影像流水线主程序
//!
//! 对单个患者执行一次完整的采集、分类与融合，整合结果以JSON输出。
//! 调度、重试与正式文档库由外部系统负责。

use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::Parser;
use tracing::{error, info};

use registry_core::models::PatientRecord;
use registry_core::PipelineConfig;
use registry_pipeline::{MemoryStudyStore, PipelineEngine};

/// 登记流水线命令行参数
#[derive(Parser, Debug)]
#[command(name = "registry-runner")]
#[command(about = "卒中登记影像采集与整合流水线")]
struct Args {
    /// 配置文件路径
    #[arg(short, long, default_value = "config/registry.toml")]
    config: String,

    /// 患者标识
    #[arg(short, long)]
    patient_id: String,

    /// 到院时间（RFC 3339，如 2023-01-01T09:00:00Z）
    #[arg(short, long)]
    arrival_time: DateTime<Utc>,

    /// 全部已知就诊时间（RFC 3339，升序，须包含到院时间）
    #[arg(short, long)]
    visit_times: Vec<DateTime<Utc>>,

    /// 日志级别
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // 初始化日志
    tracing_subscriber::fmt()
        .with_env_filter(&args.log_level)
        .init();

    let config = PipelineConfig::load(&args.config)
        .with_context(|| format!("加载配置失败: {}", args.config))?;
    info!("归档端点: {}", config.archive.remote_addr());

    let mut visit_times = args.visit_times.clone();
    if visit_times.is_empty() {
        visit_times.push(args.arrival_time);
    }
    visit_times.sort();

    let patient = PatientRecord {
        patient_id: args.patient_id.clone(),
        arrival_time: args.arrival_time,
        visit_times,
    };

    let store = Arc::new(MemoryStudyStore::new());
    let engine = PipelineEngine::new(config, Arc::clone(&store));

    let summary = match engine.run_patient(patient).await {
        Ok(summary) => summary,
        Err(e) => {
            error!("患者 {} 流水线失败: {e}", args.patient_id);
            return Err(e.into());
        }
    };
    info!(
        "患者 {} 运行 {} 完成",
        summary.patient_id, summary.run_id
    );

    let studies = engine.persisted_studies(&args.patient_id).await?;
    println!("{}", serde_json::to_string_pretty(&studies)?);
    Ok(())
}
