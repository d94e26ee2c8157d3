//! # Registry Pipeline
//!
//! 检索结果的整合层：
//! - 采集状态分类器：为每个检查判定院内/院外并按时间编号
//! - 检查融合引擎：合并表示同一次物理成像的多条检查记录
//! - 采集流程：面向单个患者的级联查询与检索编排
//! - 存储接缝：检查集合的原子整体替换

pub mod classifier;
pub mod engine;
pub mod fusion;
pub mod harvest;
pub mod store;

pub use classifier::classify_studies;
pub use engine::{PipelineEngine, RunSummary};
pub use fusion::{consolidate, FusionCatalogs};
pub use store::{MemoryStudyStore, StudyStore};
