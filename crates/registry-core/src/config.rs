//! 配置管理
//!
//! 管线全部可调参数均由外部提供，加载一次后以只读方式传入各组件，
//! 不存在任何模块级可变状态。

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::error::{RegistryError, Result};

/// 管线完整配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// 远程影像归档配置
    pub archive: ArchiveConfig,
    /// 检索行为配置
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    /// 分类器配置
    pub classifier: ClassifierConfig,
    /// 级联过滤配置
    #[serde(default)]
    pub filters: FilterConfig,
    /// 融合目录配置
    #[serde(default)]
    pub fusion: FusionCatalogConfig,
}

/// 远程归档网络端点与AE标识
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveConfig {
    /// 归档主机名或IP
    pub host: String,
    /// 归档端口
    pub port: u16,
    /// 归档AE标题
    pub called_ae_title: String,
    /// 本地AE标题，同时作为C-MOVE的目的地
    pub calling_ae_title: String,
    /// 本地C-STORE接收端口
    pub local_port: u16,
    /// 本地监听地址
    #[serde(default = "default_local_host")]
    pub local_host: String,
}

impl ArchiveConfig {
    /// "host:port" 形式的归档地址
    pub fn remote_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// 本地C-STORE接收端点地址
    pub fn local_addr(&self) -> String {
        format!("{}:{}", self.local_host, self.local_port)
    }
}

/// 检索行为配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// 连续PENDING状态的中止阈值，超过后放弃本次C-MOVE
    #[serde(default = "default_max_pending")]
    pub max_pending_statuses: u32,
    /// 单次C-MOVE的墙钟超时（秒）
    #[serde(default = "default_move_deadline")]
    pub move_deadline_secs: u64,
    /// 套接字读超时（秒）
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            max_pending_statuses: default_max_pending(),
            move_deadline_secs: default_move_deadline(),
            read_timeout_secs: default_read_timeout(),
        }
    }
}

/// 分类器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierConfig {
    /// 本院机构地址标记，出现于 InstitutionAddress 时判定为院内采集。
    /// 与具体部署相关，必须由配置提供。
    pub home_institution_marker: String,
}

/// 级联各级的允许/排除关键字目录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterConfig {
    /// 描述字段包含任一关键字则直接纳入
    #[serde(default)]
    pub include_keywords: Vec<String>,
    /// 描述字段包含任一关键字则排除
    #[serde(default)]
    pub exclude_keywords: Vec<String>,
    /// 排除的治疗相关描述关键字
    #[serde(default)]
    pub exclude_treatments: Vec<String>,
    /// 允许的检查类型，默认 MR/CT/XA
    #[serde(default = "default_modalities")]
    pub allowed_modalities: Vec<String>,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            include_keywords: Vec::new(),
            exclude_keywords: Vec::new(),
            exclude_treatments: Vec::new(),
            allowed_modalities: default_modalities(),
        }
    }
}

/// 融合决策目录，键为排序后的检查描述集合
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FusionCatalogConfig {
    /// 明确保持独立的描述集合
    #[serde(default)]
    pub never_fuse: Vec<Vec<String>>,
    /// 融合为单一采集序号的描述集合（目录A）
    #[serde(default)]
    pub fuse_a: Vec<Vec<String>>,
    /// 融合为单一采集序号的描述集合（目录B）
    #[serde(default)]
    pub fuse_b: Vec<Vec<String>>,
    /// 特殊三元组：首个描述保留原序号，其余两个共享下一序号
    #[serde(default)]
    pub partial_fuse: Vec<Vec<String>>,
}

fn default_local_host() -> String {
    "0.0.0.0".to_string()
}

fn default_max_pending() -> u32 {
    70
}

fn default_move_deadline() -> u64 {
    300
}

fn default_read_timeout() -> u64 {
    30
}

fn default_modalities() -> Vec<String> {
    vec!["MR".to_string(), "CT".to_string(), "XA".to_string()]
}

impl PipelineConfig {
    /// 从配置文件与 `REGISTRY_*` 环境变量加载配置
    pub fn load(path: &str) -> Result<Self> {
        let settings = Config::builder()
            .add_source(File::with_name(path))
            .add_source(Environment::with_prefix("REGISTRY").separator("__"))
            .build()
            .map_err(|e| RegistryError::Config(e.to_string()))?;

        settings
            .try_deserialize()
            .map_err(|e| RegistryError::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retrieval_defaults() {
        let cfg = RetrievalConfig::default();
        assert_eq!(cfg.max_pending_statuses, 70);
        assert_eq!(cfg.move_deadline_secs, 300);
    }

    #[test]
    fn test_archive_addrs() {
        let cfg = ArchiveConfig {
            host: "pacs.example.org".to_string(),
            port: 104,
            called_ae_title: "ARCHIVE".to_string(),
            calling_ae_title: "REGISTRY".to_string(),
            local_port: 11112,
            local_host: default_local_host(),
        };
        assert_eq!(cfg.remote_addr(), "pacs.example.org:104");
        assert_eq!(cfg.local_addr(), "0.0.0.0:11112");
    }
}
