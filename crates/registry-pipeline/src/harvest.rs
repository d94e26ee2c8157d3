//! 单患者采集编排
//!
//! 级联查询（STUDY → SERIES → IMAGE）逐级过滤，再对每个序列检索一张
//! 代表影像：优先单实例C-MOVE，失败后回退整序列。协议调用全部阻塞，
//! 由引擎包在 `spawn_blocking` 中执行。

use tracing::{info, warn};

use registry_core::models::{InstanceRecord, PatientRecord, StudyRecord};
use registry_core::time::{dicom_date_range, follow_up_window};
use registry_core::{RegistryError, Result};
use registry_dicom::records::{
    instance_from_dataset, instance_number, series_from_dataset, study_from_dataset, tag_str,
};
use registry_dicom::{
    middle_first, partition_outcomes, ArchiveClient, CascadeFilter, RetrievalOutcome,
};

use dicom::dictionary_std::tags;
use dicom::object::InMemDicomObject;

/// 一次患者采集的产出
#[derive(Debug, Default)]
pub struct HarvestOutcome {
    /// 通过过滤的检查骨架
    pub studies: Vec<StudyRecord>,
    /// 成功检索并通过IMAGE级过滤的实例记录
    pub instances: Vec<InstanceRecord>,
    /// 尝试检索的序列数
    pub attempted_series: usize,
    /// 收到数据的序列数
    pub fulfilled_series: usize,
}

/// 采集一个患者在随访时间窗内的全部影像元数据
///
/// 检查集合为空或全部检查均无可用序列时返回错误：这说明归档端
/// 配置或患者数据有问题，必须让操作员知晓而不是静默产出空集。
pub fn collect_patient_imaging(
    client: &ArchiveClient,
    filters: &CascadeFilter,
    patient: &PatientRecord,
) -> Result<HarvestOutcome> {
    let window = follow_up_window(patient.arrival_time, &patient.visit_times);
    let date_range = window.map(dicom_date_range);
    info!(
        "开始采集患者 {}，时间窗 {:?}",
        patient.patient_id, date_range
    );

    let study_datasets = client.query_studies(&patient.patient_id, date_range.as_deref())?;
    let studies: Vec<StudyRecord> = study_datasets
        .iter()
        .filter_map(|ds| study_from_dataset(&patient.patient_id, ds))
        .filter(|s| filters.allows_study(s.description.as_deref()))
        .collect();
    if studies.is_empty() {
        return Err(RegistryError::NoStudiesFound {
            patient_id: patient.patient_id.clone(),
        });
    }

    let mut instances = Vec::new();
    let mut attempted_series = 0usize;
    let mut fulfilled_series = 0usize;
    let mut total_series = 0usize;

    for study in &studies {
        let series_datasets = client.query_series(&study.study_instance_uid)?;
        let series: Vec<_> = series_datasets
            .iter()
            .filter_map(series_from_dataset)
            .filter(|s| filters.allows_series(s.modality.as_deref(), s.description.as_deref()))
            .collect();
        total_series += series.len();

        let mut retrievals = Vec::with_capacity(series.len());
        for entry in &series {
            attempted_series += 1;
            retrievals.push(harvest_series(
                client,
                &study.study_instance_uid,
                &entry.series_instance_uid,
            )?);
        }

        let (received, failed) = partition_outcomes(retrievals);
        fulfilled_series += received.len();
        if !failed.is_empty() {
            warn!(
                "检查 {} 有 {} 个序列未取回代表影像",
                study.accession_number,
                failed.len()
            );
        }

        for dataset in received {
            let record =
                instance_from_dataset(&patient.patient_id, &study.accession_number, &dataset);
            let descriptions = instance_description_fields(&dataset, &record);
            let description_refs: Vec<Option<&str>> =
                descriptions.iter().map(|d| d.as_deref()).collect();
            if filters.allows_instance(record.modality.as_deref(), &description_refs) {
                instances.push(record);
            }
        }
    }

    if total_series == 0 {
        return Err(RegistryError::NoSeriesFound {
            patient_id: patient.patient_id.clone(),
        });
    }
    info!(
        "患者 {} 采集完成：{} 个检查，{}/{} 个序列取回影像",
        patient.patient_id,
        studies.len(),
        fulfilled_series,
        attempted_series
    );
    Ok(HarvestOutcome {
        studies,
        instances,
        attempted_series,
        fulfilled_series,
    })
}

/// IMAGE级过滤参考的描述字段：申请单描述、序列描述、检查部位
fn instance_description_fields(
    dataset: &InMemDicomObject,
    record: &InstanceRecord,
) -> [Option<String>; 3] {
    [
        tag_str(dataset, tags::REQUESTED_PROCEDURE_DESCRIPTION),
        tag_str(dataset, tags::SERIES_DESCRIPTION),
        record.body_part_examined.clone(),
    ]
}

/// 为一个序列检索代表影像
///
/// IMAGE级查询确定候选实例并按中间优先排序，对首选实例做单实例
/// C-MOVE；无候选或未收到数据时回退整序列C-MOVE。
fn harvest_series(
    client: &ArchiveClient,
    study_instance_uid: &str,
    series_instance_uid: &str,
) -> Result<RetrievalOutcome> {
    let candidates = client.query_instances(study_instance_uid, series_instance_uid)?;
    let ordered = middle_first(candidates, instance_number);
    let representative = ordered
        .first()
        .and_then(|ds| tag_str(ds, tags::SOP_INSTANCE_UID));

    if let Some(sop_instance_uid) = representative {
        let attempt =
            client.retrieve_instance(study_instance_uid, series_instance_uid, &sop_instance_uid)?;
        if attempt.is_received() {
            return Ok(attempt);
        }
        warn!(
            "单实例检索未果，序列 {} 回退整序列检索",
            series_instance_uid
        );
    }
    client.retrieve_series(study_instance_uid, series_instance_uid)
}
