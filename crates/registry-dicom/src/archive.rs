//! 远程归档客户端
//!
//! 查询级联与检索引擎的统一入口。客户端本身无状态，仅持有连接参数；
//! 每次操作建立并释放自己的关联，调用之间不共享任何可变状态。

use dicom::object::InMemDicomObject;

use registry_core::config::{ArchiveConfig, RetrievalConfig};
use registry_core::Result;

use crate::find;
use crate::retrieve::{self, RetrievalOutcome};

/// 面向一个远程归档的客户端
#[derive(Debug, Clone)]
pub struct ArchiveClient {
    archive: ArchiveConfig,
    retrieval: RetrievalConfig,
}

impl ArchiveClient {
    pub fn new(archive: ArchiveConfig, retrieval: RetrievalConfig) -> Self {
        Self { archive, retrieval }
    }

    /// PATIENT级查询
    pub fn query_patients(
        &self,
        patient_name: &str,
        birth_date: &str,
    ) -> Result<Vec<InMemDicomObject>> {
        find::find_patients(&self.archive, &self.retrieval, patient_name, birth_date)
    }

    /// STUDY级查询，`date_range` 形如 "YYYYMMDD-YYYYMMDD"
    pub fn query_studies(
        &self,
        patient_id: &str,
        date_range: Option<&str>,
    ) -> Result<Vec<InMemDicomObject>> {
        find::find_studies(&self.archive, &self.retrieval, patient_id, date_range)
    }

    /// SERIES级查询，限定在一个检查内
    pub fn query_series(&self, study_instance_uid: &str) -> Result<Vec<InMemDicomObject>> {
        find::find_series(&self.archive, &self.retrieval, study_instance_uid)
    }

    /// IMAGE级查询，仅元数据
    pub fn query_instances(
        &self,
        study_instance_uid: &str,
        series_instance_uid: &str,
    ) -> Result<Vec<InMemDicomObject>> {
        find::find_instances(
            &self.archive,
            &self.retrieval,
            study_instance_uid,
            series_instance_uid,
        )
    }

    /// 单实例检索
    pub fn retrieve_instance(
        &self,
        study_instance_uid: &str,
        series_instance_uid: &str,
        sop_instance_uid: &str,
    ) -> Result<RetrievalOutcome> {
        let query = retrieve::instance_move_query(
            study_instance_uid,
            series_instance_uid,
            sop_instance_uid,
        );
        retrieve::retrieve_instance(&self.archive, &self.retrieval, query)
    }

    /// 整序列检索回退
    pub fn retrieve_series(
        &self,
        study_instance_uid: &str,
        series_instance_uid: &str,
    ) -> Result<RetrievalOutcome> {
        retrieve::retrieve_series(
            &self.archive,
            &self.retrieval,
            study_instance_uid,
            series_instance_uid,
        )
    }
}
