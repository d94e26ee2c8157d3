//! # Registry DICOM
//!
//! 查询级联与影像检索引擎的DICOM协议实现：
//! - C-FIND级联（PATIENT/STUDY/SERIES/IMAGE四级查询）
//! - C-MOVE检索，单实例优先、整个序列回退
//! - 临时C-STORE接收端点（作用域资源，调用结束即释放）
//! - 数据集逐元素消毒与代表影像选择

pub mod archive;
pub mod dimse;
pub mod filter;
pub mod find;
pub mod records;
pub mod retrieve;
pub mod sanitize;
pub mod selector;
pub mod store_scp;

pub use archive::ArchiveClient;
pub use filter::CascadeFilter;
pub use retrieve::{partition_outcomes, RetrievalOutcome};
pub use sanitize::sanitize;
pub use selector::middle_first;
pub use store_scp::StoreScp;
