//! 数据集到记录类型的转换
//!
//! 查询与检索得到的DICOM数据集在此转换为显式记录类型，
//! 合法缺失的标签一律以 `Option` 表达，不做字符串键查找。

use dicom::core::Tag;
use dicom::dictionary_std::tags;
use dicom::object::InMemDicomObject;

use registry_core::models::{InstanceRecord, SeriesRecord, StudyRecord};
use registry_core::time::exact_datetime;

/// 读取字符串标签，空值视为缺失
pub fn tag_str(obj: &InMemDicomObject, tag: Tag) -> Option<String> {
    obj.element_opt(tag)
        .ok()
        .flatten()
        .and_then(|e| e.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// 读取整数标签
pub fn tag_int(obj: &InMemDicomObject, tag: Tag) -> Option<i64> {
    obj.element_opt(tag)
        .ok()
        .flatten()
        .and_then(|e| e.to_int::<i64>().ok())
}

/// 读取u16标签
pub fn tag_u16(obj: &InMemDicomObject, tag: Tag) -> Option<u16> {
    obj.element_opt(tag)
        .ok()
        .flatten()
        .and_then(|e| e.to_int::<u16>().ok())
}

/// 数据集中的InstanceNumber，代表影像选择的排序依据
pub fn instance_number(obj: &InMemDicomObject) -> Option<i64> {
    tag_int(obj, tags::INSTANCE_NUMBER)
}

/// STUDY级查询结果转为检查骨架。缺少检查号或StudyInstanceUID的结果被丢弃。
pub fn study_from_dataset(patient_id: &str, obj: &InMemDicomObject) -> Option<StudyRecord> {
    let accession = tag_str(obj, tags::ACCESSION_NUMBER)?;
    let study_uid = tag_str(obj, tags::STUDY_INSTANCE_UID)?;
    let mut study = StudyRecord::skeleton(patient_id, &accession, &study_uid);
    study.description = tag_str(obj, tags::STUDY_DESCRIPTION);
    study.modality = tag_str(obj, tags::MODALITIES_IN_STUDY);
    study.study_time = exact_datetime(
        tag_str(obj, tags::STUDY_DATE).as_deref(),
        tag_str(obj, tags::STUDY_TIME).as_deref(),
    );
    Some(study)
}

/// SERIES级查询结果转为序列记录
pub fn series_from_dataset(obj: &InMemDicomObject) -> Option<SeriesRecord> {
    let study_uid = tag_str(obj, tags::STUDY_INSTANCE_UID)?;
    let series_uid = tag_str(obj, tags::SERIES_INSTANCE_UID)?;
    let study_date = tag_str(obj, tags::STUDY_DATE);
    let series_date = tag_str(obj, tags::SERIES_DATE).or(study_date);
    Some(SeriesRecord {
        study_instance_uid: study_uid,
        series_instance_uid: series_uid,
        description: tag_str(obj, tags::SERIES_DESCRIPTION),
        modality: tag_str(obj, tags::MODALITY),
        series_time: exact_datetime(
            series_date.as_deref(),
            tag_str(obj, tags::SERIES_TIME).as_deref(),
        ),
    })
}

/// 检索到的数据集转为实例记录
///
/// 各级"精确时间戳"由日期与时间合成，日期缺失时逐级回退：
/// AcquisitionDate → SeriesDate → StudyDate。
pub fn instance_from_dataset(
    patient_id: &str,
    accession_number: &str,
    obj: &InMemDicomObject,
) -> InstanceRecord {
    let study_date = tag_str(obj, tags::STUDY_DATE);
    let series_date = tag_str(obj, tags::SERIES_DATE).or_else(|| study_date.clone());
    let acquisition_date = tag_str(obj, tags::ACQUISITION_DATE).or_else(|| series_date.clone());

    InstanceRecord {
        patient_id: patient_id.to_string(),
        accession_number: accession_number.to_string(),
        study_instance_uid: tag_str(obj, tags::STUDY_INSTANCE_UID).unwrap_or_default(),
        series_instance_uid: tag_str(obj, tags::SERIES_INSTANCE_UID),
        sop_instance_uid: tag_str(obj, tags::SOP_INSTANCE_UID),
        sop_class_uid: tag_str(obj, tags::SOP_CLASS_UID),
        instance_number: instance_number(obj),
        study_time: exact_datetime(
            study_date.as_deref(),
            tag_str(obj, tags::STUDY_TIME).as_deref(),
        ),
        series_time: exact_datetime(
            series_date.as_deref(),
            tag_str(obj, tags::SERIES_TIME).as_deref(),
        ),
        acquisition_time: exact_datetime(
            acquisition_date.as_deref(),
            tag_str(obj, tags::ACQUISITION_TIME).as_deref(),
        ),
        modality: tag_str(obj, tags::MODALITY),
        body_part_examined: tag_str(obj, tags::BODY_PART_EXAMINED),
        institution_name: tag_str(obj, tags::INSTITUTION_NAME),
        station_name: tag_str(obj, tags::STATION_NAME),
        institution_address: tag_str(obj, tags::INSTITUTION_ADDRESS),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use dicom::core::{dicom_value, DataElement, VR};

    fn sample_study() -> InMemDicomObject {
        InMemDicomObject::from_element_iter([
            DataElement::new(tags::ACCESSION_NUMBER, VR::SH, dicom_value!(Str, "ACC001")),
            DataElement::new(
                tags::STUDY_INSTANCE_UID,
                VR::UI,
                dicom_value!(Str, "1.2.3.4"),
            ),
            DataElement::new(
                tags::STUDY_DESCRIPTION,
                VR::LO,
                dicom_value!(Str, "CT Schaedel"),
            ),
            DataElement::new(tags::STUDY_DATE, VR::DA, dicom_value!(Str, "20230101")),
            DataElement::new(tags::STUDY_TIME, VR::TM, dicom_value!(Str, "101500")),
        ])
    }

    #[test]
    fn test_study_from_dataset() {
        let study = study_from_dataset("p1", &sample_study()).unwrap();
        assert_eq!(study.accession_number, "ACC001");
        assert_eq!(study.study_instance_uid, "1.2.3.4");
        assert_eq!(study.description.as_deref(), Some("CT Schaedel"));
        assert_eq!(
            study.study_time,
            Some(Utc.with_ymd_and_hms(2023, 1, 1, 10, 15, 0).unwrap())
        );
    }

    #[test]
    fn test_study_without_accession_is_dropped() {
        let obj = InMemDicomObject::from_element_iter([DataElement::new(
            tags::STUDY_INSTANCE_UID,
            VR::UI,
            dicom_value!(Str, "1.2.3.4"),
        )]);
        assert!(study_from_dataset("p1", &obj).is_none());
    }

    #[test]
    fn test_instance_acquisition_date_fallback() {
        // AcquisitionDate缺失时采用SeriesDate合成采集时间
        let obj = InMemDicomObject::from_element_iter([
            DataElement::new(
                tags::STUDY_INSTANCE_UID,
                VR::UI,
                dicom_value!(Str, "1.2.3.4"),
            ),
            DataElement::new(tags::SERIES_DATE, VR::DA, dicom_value!(Str, "20230102")),
            DataElement::new(
                tags::ACQUISITION_TIME,
                VR::TM,
                dicom_value!(Str, "090000"),
            ),
        ]);
        let record = instance_from_dataset("p1", "ACC001", &obj);
        assert_eq!(
            record.acquisition_time,
            Some(Utc.with_ymd_and_hms(2023, 1, 2, 9, 0, 0).unwrap())
        );
        assert_eq!(record.sop_class_uid, None);
    }
}
