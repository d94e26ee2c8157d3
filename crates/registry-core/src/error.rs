//! 错误定义模块

use thiserror::Error;

/// 影像管线统一错误类型
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("配置错误: {0}")]
    Config(String),

    #[error("DICOM关联错误: {0}")]
    Association(String),

    #[error("DICOM协议错误: {0}")]
    Protocol(String),

    #[error("DICOM处理错误: {0}")]
    Dicom(String),

    #[error("存储错误: {0}")]
    Store(String),

    #[error("网络错误: {0}")]
    Network(#[from] std::io::Error),

    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("系统内部错误: {0}")]
    Internal(String),

    #[error("患者 {patient_id} 未找到任何检查")]
    NoStudiesFound { patient_id: String },

    #[error("患者 {patient_id} 未找到任何序列")]
    NoSeriesFound { patient_id: String },

    #[error("无法确定检查 {accession_number} 的采集状态，需要人工复核")]
    UnresolvedAcquisitionState { accession_number: String },
}

/// 影像管线统一结果类型
pub type Result<T> = std::result::Result<T, RegistryError>;
