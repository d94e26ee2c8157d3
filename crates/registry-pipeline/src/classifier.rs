//! 采集状态分类器
//!
//! 基线影像为 Internal 1，随访为 2、3 以此类推；外院影像记为 External，
//! 入院前最后一次检查编号最大。院内外两个桶各自独立编号。

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tracing::info;

use registry_core::models::{AcquisitionState, InstanceRecord, StudyRecord};
use registry_core::{RegistryError, Result};

/// 依据检查元数据判定采集状态
///
/// 严格按首个命中规则裁决：
/// 1. 无任何检查记录 → External
/// 2. 检查部位含"extern" → External
/// 3. 机构名称含"import" → External
/// 4. 工作站名称含"import" → External
/// 5./6. 参考时间存在：不早于到院时间 → Internal，否则 External
/// 7. 机构地址含本院标记 → Internal
/// 8. 其余情况显式判定失败，必须人工复核，绝不默认归桶
pub fn classify(
    study: Option<&StudyRecord>,
    arrival_time: DateTime<Utc>,
    home_marker: &str,
) -> Result<AcquisitionState> {
    let Some(study) = study else {
        return Ok(AcquisitionState::External);
    };
    if contains_ci(study.body_part_examined.as_deref(), "extern") {
        return Ok(AcquisitionState::External);
    }
    if contains_ci(study.institution_name.as_deref(), "import") {
        return Ok(AcquisitionState::External);
    }
    if contains_ci(study.station_name.as_deref(), "import") {
        return Ok(AcquisitionState::External);
    }
    if let Some(reference) = study.reference_time() {
        if reference >= arrival_time {
            return Ok(AcquisitionState::Internal);
        }
        return Ok(AcquisitionState::External);
    }
    if contains_ci(study.institution_address.as_deref(), home_marker) {
        return Ok(AcquisitionState::Internal);
    }
    Err(RegistryError::UnresolvedAcquisitionState {
        accession_number: study.accession_number.clone(),
    })
}

fn contains_ci(field: Option<&str>, needle: &str) -> bool {
    if needle.is_empty() {
        return false;
    }
    field
        .map(|f| f.to_lowercase().contains(&needle.to_lowercase()))
        .unwrap_or(false)
}

/// 将检索到的实例元数据折叠进检查记录
///
/// 时间取各实例中的最小值，描述性字段取首个非空值。
pub fn aggregate_study(study: &mut StudyRecord, instances: &[InstanceRecord]) {
    for instance in instances {
        study.study_time = min_time(study.study_time, instance.study_time);
        study.series_time = min_time(study.series_time, instance.series_time);
        study.acquisition_time = min_time(study.acquisition_time, instance.acquisition_time);
        fill(&mut study.modality, &instance.modality);
        fill(&mut study.body_part_examined, &instance.body_part_examined);
        fill(&mut study.institution_name, &instance.institution_name);
        fill(&mut study.station_name, &instance.station_name);
        fill(&mut study.institution_address, &instance.institution_address);
    }
}

fn min_time(
    current: Option<DateTime<Utc>>,
    candidate: Option<DateTime<Utc>>,
) -> Option<DateTime<Utc>> {
    match (current, candidate) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

fn fill(slot: &mut Option<String>, candidate: &Option<String>) {
    if slot.is_none() {
        slot.clone_from(candidate);
    }
}

/// 在各状态桶内按时间升序分配采集序号 1..N
///
/// 排序键为（检查时间、序列时间、采集时间），缺失的时间排在末尾，
/// 检查号作为最终的确定性决胜键。两个桶互相独立编号。
pub fn assign_numbers(studies: &mut [StudyRecord]) {
    for state in [AcquisitionState::Internal, AcquisitionState::External] {
        let mut indices: Vec<usize> = studies
            .iter()
            .enumerate()
            .filter(|(_, s)| s.acquisition_state == Some(state))
            .map(|(i, _)| i)
            .collect();
        indices.sort_by(|&a, &b| sort_key(&studies[a]).cmp(&sort_key(&studies[b])));
        for (ordinal, &index) in indices.iter().enumerate() {
            studies[index].acquisition_number = Some(ordinal as u32 + 1);
        }
    }
}

type TimeKey = (bool, DateTime<Utc>);

fn time_key(time: Option<DateTime<Utc>>) -> TimeKey {
    (time.is_none(), time.unwrap_or(DateTime::<Utc>::MAX_UTC))
}

fn sort_key(study: &StudyRecord) -> (TimeKey, TimeKey, TimeKey, String) {
    (
        time_key(study.study_time),
        time_key(study.series_time),
        time_key(study.acquisition_time),
        study.accession_number.clone(),
    )
}

/// 分类并编号一个患者的全部检查
///
/// 实例按检查号归并进各自的检查骨架；没有任何实例元数据且自身
/// 不含时间与关键字信息的检查按规则1判定为External。
pub fn classify_studies(
    mut studies: Vec<StudyRecord>,
    instances: &[InstanceRecord],
    arrival_time: DateTime<Utc>,
    home_marker: &str,
) -> Result<Vec<StudyRecord>> {
    let mut by_accession: HashMap<&str, Vec<&InstanceRecord>> = HashMap::new();
    for instance in instances {
        by_accession
            .entry(instance.accession_number.as_str())
            .or_default()
            .push(instance);
    }

    for study in &mut studies {
        let matching: Vec<InstanceRecord> = by_accession
            .get(study.accession_number.as_str())
            .map(|v| v.iter().map(|i| (*i).clone()).collect())
            .unwrap_or_default();
        let state = if matching.is_empty() && study.reference_time().is_none() {
            // 无任何可用记录
            classify(None, arrival_time, home_marker)?
        } else {
            aggregate_study(study, &matching);
            classify(Some(study), arrival_time, home_marker)?
        };
        study.acquisition_state = Some(state);
    }

    assign_numbers(&mut studies);
    for study in &studies {
        info!(
            "检查 {} 判定为 {:?} 影像 {}",
            study.accession_number,
            study.acquisition_state,
            study.acquisition_number.unwrap_or(0)
        );
    }
    Ok(studies)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const MARKER: &str = "freiburgstrasse";

    fn arrival() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2023, 1, 1, 9, 0, 0).unwrap()
    }

    fn study_at(time: Option<DateTime<Utc>>) -> StudyRecord {
        let mut study = StudyRecord::skeleton("p1", "ACC001", "1.2.3");
        study.study_time = time;
        study
    }

    #[test]
    fn test_missing_record_is_external() {
        assert_eq!(
            classify(None, arrival(), MARKER).unwrap(),
            AcquisitionState::External
        );
    }

    #[test]
    fn test_extern_body_part_wins_over_timestamp() {
        // 时间规则本应判Internal，但关键字规则优先
        let mut study = study_at(Some(arrival()));
        study.body_part_examined = Some("Extern Kopf".to_string());
        assert_eq!(
            classify(Some(&study), arrival(), MARKER).unwrap(),
            AcquisitionState::External
        );
    }

    #[test]
    fn test_import_keywords() {
        let mut study = study_at(Some(arrival()));
        study.institution_name = Some("CD-Import Extern".to_string());
        assert_eq!(
            classify(Some(&study), arrival(), MARKER).unwrap(),
            AcquisitionState::External
        );

        let mut study = study_at(Some(arrival()));
        study.station_name = Some("IMPORT01".to_string());
        assert_eq!(
            classify(Some(&study), arrival(), MARKER).unwrap(),
            AcquisitionState::External
        );
    }

    #[test]
    fn test_timestamp_rule() {
        let after = study_at(Some(Utc.with_ymd_and_hms(2023, 1, 1, 10, 0, 0).unwrap()));
        assert_eq!(
            classify(Some(&after), arrival(), MARKER).unwrap(),
            AcquisitionState::Internal
        );

        let before = study_at(Some(Utc.with_ymd_and_hms(2023, 1, 1, 8, 0, 0).unwrap()));
        assert_eq!(
            classify(Some(&before), arrival(), MARKER).unwrap(),
            AcquisitionState::External
        );
    }

    #[test]
    fn test_boundary_equal_arrival_is_internal() {
        let study = study_at(Some(arrival()));
        assert_eq!(
            classify(Some(&study), arrival(), MARKER).unwrap(),
            AcquisitionState::Internal
        );
    }

    #[test]
    fn test_home_marker_without_timestamp() {
        let mut study = study_at(None);
        study.institution_address = Some("Freiburgstrasse 18, Bern".to_string());
        assert_eq!(
            classify(Some(&study), arrival(), MARKER).unwrap(),
            AcquisitionState::Internal
        );
    }

    #[test]
    fn test_unresolved_is_explicit_error() {
        let mut study = study_at(None);
        study.institution_address = Some("Unbekannt".to_string());
        let result = classify(Some(&study), arrival(), MARKER);
        assert!(matches!(
            result,
            Err(RegistryError::UnresolvedAcquisitionState { .. })
        ));
    }

    #[test]
    fn test_assign_numbers_per_bucket() {
        let t = |h| Utc.with_ymd_and_hms(2023, 1, 1, h, 0, 0).unwrap();
        let mut studies = Vec::new();
        for (acc, hour, state) in [
            ("A3", 14, AcquisitionState::Internal),
            ("A1", 10, AcquisitionState::Internal),
            ("A2", 12, AcquisitionState::Internal),
            ("B1", 6, AcquisitionState::External),
        ] {
            let mut s = StudyRecord::skeleton("p1", acc, acc);
            s.study_time = Some(t(hour));
            s.acquisition_state = Some(state);
            studies.push(s);
        }
        assign_numbers(&mut studies);
        let number = |acc: &str| {
            studies
                .iter()
                .find(|s| s.accession_number == acc)
                .unwrap()
                .acquisition_number
        };
        assert_eq!(number("A1"), Some(1));
        assert_eq!(number("A2"), Some(2));
        assert_eq!(number("A3"), Some(3));
        // External桶独立编号
        assert_eq!(number("B1"), Some(1));
    }

    #[test]
    fn test_classify_studies_aggregates_instances() {
        let mut study = StudyRecord::skeleton("p1", "ACC001", "1.2.3");
        study.description = Some("CT Schaedel".to_string());
        let instance = InstanceRecord {
            patient_id: "p1".to_string(),
            accession_number: "ACC001".to_string(),
            study_instance_uid: "1.2.3".to_string(),
            series_instance_uid: Some("1.2.3.1".to_string()),
            sop_instance_uid: Some("1.2.3.1.1".to_string()),
            sop_class_uid: Some("1.2.840.10008.5.1.4.1.1.2".to_string()),
            instance_number: Some(10),
            study_time: Some(Utc.with_ymd_and_hms(2023, 1, 1, 11, 0, 0).unwrap()),
            series_time: None,
            acquisition_time: None,
            modality: Some("CT".to_string()),
            body_part_examined: None,
            institution_name: None,
            station_name: None,
            institution_address: None,
        };
        let classified =
            classify_studies(vec![study], &[instance], arrival(), MARKER).unwrap();
        assert_eq!(
            classified[0].acquisition_state,
            Some(AcquisitionState::Internal)
        );
        assert_eq!(classified[0].acquisition_number, Some(1));
        assert_eq!(classified[0].modality.as_deref(), Some("CT"));
    }
}
