//! # Registry Core
//!
//! 卒中登记影像管线的核心模块，提供基础数据结构、错误定义、配置和时间工具。

pub mod config;
pub mod error;
pub mod models;
pub mod time;

pub use config::PipelineConfig;
pub use error::{RegistryError, Result};
pub use models::*;
