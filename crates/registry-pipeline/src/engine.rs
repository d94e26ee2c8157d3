//! 患者流水线引擎
//!
//! 归档交互（级联查询与C-MOVE）为患者级临界区：归档端不支持来自
//! 本流水线的并发检索，同一引擎上的归档阶段串行执行。分类、融合
//! 与持久化在锁外进行，不同患者的这些阶段可以交错。

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{error, info};
use uuid::Uuid;

use registry_core::models::PatientRecord;
use registry_core::{PipelineConfig, RegistryError, Result};
use registry_dicom::{ArchiveClient, CascadeFilter};

use crate::classifier::classify_studies;
use crate::fusion::{consolidate, FusionCatalogs};
use crate::harvest::collect_patient_imaging;
use crate::store::StudyStore;

/// 一次患者运行的结果摘要
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub patient_id: String,
    pub study_count: usize,
    pub attempted_series: usize,
    pub fulfilled_series: usize,
    pub instance_count: usize,
}

/// 以归档临界区与存储接缝组装的流水线
pub struct PipelineEngine<S: StudyStore> {
    config: PipelineConfig,
    store: Arc<S>,
    archive_lock: Mutex<()>,
}

impl<S: StudyStore + 'static> PipelineEngine<S> {
    pub fn new(config: PipelineConfig, store: Arc<S>) -> Self {
        Self {
            config,
            store,
            archive_lock: Mutex::new(()),
        }
    }

    /// 运行一个患者的完整流水线：采集、分类编号、融合、整体替换
    pub async fn run_patient(&self, patient: PatientRecord) -> Result<RunSummary> {
        let run_id = Uuid::new_v4();
        info!("运行 {} 患者 {} 开始", run_id, patient.patient_id);

        let harvest = {
            let _archive = self.archive_lock.lock().await;
            let client = ArchiveClient::new(
                self.config.archive.clone(),
                self.config.retrieval.clone(),
            );
            let filters = CascadeFilter::from_config(&self.config.filters)?;
            let patient = patient.clone();
            tokio::task::spawn_blocking(move || {
                collect_patient_imaging(&client, &filters, &patient)
            })
            .await
            .map_err(|e| RegistryError::Internal(format!("采集任务中断: {e}")))?
        };
        let harvest = match harvest {
            Ok(harvest) => harvest,
            Err(e) => {
                error!("运行 {} 患者 {} 采集失败: {e}", run_id, patient.patient_id);
                return Err(e);
            }
        };

        let mut studies = classify_studies(
            harvest.studies,
            &harvest.instances,
            patient.arrival_time,
            &self.config.classifier.home_institution_marker,
        )?;
        let catalogs = FusionCatalogs::from_config(&self.config.fusion);
        consolidate(&mut studies, &catalogs);

        let summary = RunSummary {
            run_id,
            patient_id: patient.patient_id.clone(),
            study_count: studies.len(),
            attempted_series: harvest.attempted_series,
            fulfilled_series: harvest.fulfilled_series,
            instance_count: harvest.instances.len(),
        };
        self.store.replace_all(&patient.patient_id, studies).await?;
        info!(
            "运行 {} 患者 {} 完成：{} 个检查，{}/{} 个序列",
            run_id,
            summary.patient_id,
            summary.study_count,
            summary.fulfilled_series,
            summary.attempted_series
        );
        Ok(summary)
    }

    /// 读取患者当前持久化的检查集合
    pub async fn persisted_studies(
        &self,
        patient_id: &str,
    ) -> Result<Vec<registry_core::models::StudyRecord>> {
        self.store.load(patient_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStudyStore;
    use chrono::{TimeZone, Utc};
    use registry_core::config::{ArchiveConfig, ClassifierConfig};
    use registry_core::models::{AcquisitionState, StudyRecord};

    fn test_config() -> PipelineConfig {
        PipelineConfig {
            archive: ArchiveConfig {
                host: "127.0.0.1".to_string(),
                port: 11104,
                called_ae_title: "ARCHIVE".to_string(),
                calling_ae_title: "REGISTRY".to_string(),
                local_port: 11112,
                local_host: "127.0.0.1".to_string(),
            },
            retrieval: Default::default(),
            classifier: ClassifierConfig {
                home_institution_marker: "freiburgstrasse".to_string(),
            },
            filters: Default::default(),
            fusion: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_persisted_studies_roundtrip() {
        let store = Arc::new(MemoryStudyStore::new());
        let engine = PipelineEngine::new(test_config(), Arc::clone(&store));

        let mut study = StudyRecord::skeleton("p1", "A1", "1.1");
        study.acquisition_state = Some(AcquisitionState::Internal);
        study.acquisition_number = Some(1);
        study.study_time = Some(Utc.with_ymd_and_hms(2023, 1, 1, 10, 0, 0).unwrap());
        store.replace_all("p1", vec![study]).await.unwrap();

        let loaded = engine.persisted_studies("p1").await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].accession_number, "A1");
    }
}
