//! C-FIND查询级联
//!
//! 每次调用建立并释放恰好一个协议关联。关联无法建立视为软失败，
//! 返回空结果并记录日志；协议层错误才向上传播。

use std::time::Duration;

use dicom::core::{dicom_value, DataElement, VR};
use dicom::dictionary_std::{tags, uids};
use dicom::encoding::transfer_syntax::TransferSyntaxIndex;
use dicom::object::InMemDicomObject;
use dicom::transfer_syntax::TransferSyntaxRegistry;
use dicom_ul::pdu::{PDataValue, PDataValueType, Pdu};
use dicom_ul::ClientAssociationOptions;
use tracing::{debug, warn};

use registry_core::config::{ArchiveConfig, RetrievalConfig};
use registry_core::{RegistryError, Result};

use crate::dimse;

/// PATIENT级查询数据集
pub fn patient_query(patient_name: &str, birth_date: &str) -> InMemDicomObject {
    InMemDicomObject::from_element_iter([
        DataElement::new(
            tags::QUERY_RETRIEVE_LEVEL,
            VR::CS,
            dicom_value!(Str, "PATIENT"),
        ),
        DataElement::new(tags::PATIENT_ID, VR::LO, dicom_value!(Str, "")),
        DataElement::new(tags::PATIENT_NAME, VR::PN, dicom_value!(Str, patient_name)),
        DataElement::new(
            tags::PATIENT_BIRTH_DATE,
            VR::DA,
            dicom_value!(Str, birth_date),
        ),
        DataElement::new(
            tags::SPECIFIC_CHARACTER_SET,
            VR::CS,
            dicom_value!(Str, ""),
        ),
    ])
}

/// STUDY级查询数据集，通配字段请求归档返回完整元数据
pub fn study_query(patient_id: &str, date_range: Option<&str>) -> InMemDicomObject {
    InMemDicomObject::from_element_iter([
        DataElement::new(
            tags::QUERY_RETRIEVE_LEVEL,
            VR::CS,
            dicom_value!(Str, "STUDY"),
        ),
        DataElement::new(tags::PATIENT_ID, VR::LO, dicom_value!(Str, patient_id)),
        DataElement::new(tags::PATIENT_NAME, VR::PN, dicom_value!(Str, "")),
        DataElement::new(tags::STUDY_INSTANCE_UID, VR::UI, dicom_value!(Str, "")),
        DataElement::new(tags::STUDY_DESCRIPTION, VR::LO, dicom_value!(Str, "")),
        DataElement::new(
            tags::STUDY_DATE,
            VR::DA,
            dicom_value!(Str, date_range.unwrap_or("")),
        ),
        DataElement::new(tags::STUDY_TIME, VR::TM, dicom_value!(Str, "")),
        DataElement::new(
            tags::NUMBER_OF_STUDY_RELATED_SERIES,
            VR::IS,
            dicom_value!(Str, ""),
        ),
        DataElement::new(
            tags::NUMBER_OF_STUDY_RELATED_INSTANCES,
            VR::IS,
            dicom_value!(Str, ""),
        ),
        DataElement::new(tags::MODALITIES_IN_STUDY, VR::CS, dicom_value!(Str, "")),
        DataElement::new(tags::ACCESSION_NUMBER, VR::SH, dicom_value!(Str, "")),
    ])
}

/// SERIES级查询数据集，限定在一个检查范围内
pub fn series_query(study_instance_uid: &str) -> InMemDicomObject {
    InMemDicomObject::from_element_iter([
        DataElement::new(
            tags::QUERY_RETRIEVE_LEVEL,
            VR::CS,
            dicom_value!(Str, "SERIES"),
        ),
        DataElement::new(
            tags::STUDY_INSTANCE_UID,
            VR::UI,
            dicom_value!(Str, study_instance_uid),
        ),
        DataElement::new(tags::SERIES_INSTANCE_UID, VR::UI, dicom_value!(Str, "")),
        DataElement::new(tags::SERIES_DATE, VR::DA, dicom_value!(Str, "")),
        DataElement::new(tags::SERIES_TIME, VR::TM, dicom_value!(Str, "")),
        DataElement::new(tags::SERIES_DESCRIPTION, VR::LO, dicom_value!(Str, "")),
        DataElement::new(tags::MODALITY, VR::CS, dicom_value!(Str, "")),
        DataElement::new(
            tags::TIMEZONE_OFFSET_FROM_UTC,
            VR::SH,
            dicom_value!(Str, ""),
        ),
    ])
}

/// IMAGE级查询数据集，仅请求元数据
pub fn instance_query(study_instance_uid: &str, series_instance_uid: &str) -> InMemDicomObject {
    InMemDicomObject::from_element_iter([
        DataElement::new(
            tags::QUERY_RETRIEVE_LEVEL,
            VR::CS,
            dicom_value!(Str, "IMAGE"),
        ),
        DataElement::new(
            tags::STUDY_INSTANCE_UID,
            VR::UI,
            dicom_value!(Str, study_instance_uid),
        ),
        DataElement::new(
            tags::SERIES_INSTANCE_UID,
            VR::UI,
            dicom_value!(Str, series_instance_uid),
        ),
        DataElement::new(tags::SOP_INSTANCE_UID, VR::UI, dicom_value!(Str, "")),
        DataElement::new(tags::INSTANCE_NUMBER, VR::IS, dicom_value!(Str, "")),
    ])
}

/// 执行一次C-FIND，返回全部匹配数据集
///
/// Study Root模型用于STUDY/SERIES/IMAGE级，Patient Root用于PATIENT级，
/// 由调用方通过 `abstract_syntax` 指定。
pub fn find(
    archive: &ArchiveConfig,
    retrieval: &RetrievalConfig,
    abstract_syntax: &str,
    identifier: &InMemDicomObject,
) -> Result<Vec<InMemDicomObject>> {
    let addr = archive.remote_addr();
    let options = ClientAssociationOptions::new()
        .calling_ae_title(archive.calling_ae_title.clone())
        .called_ae_title(archive.called_ae_title.clone())
        .with_abstract_syntax(abstract_syntax.to_string())
        .read_timeout(Duration::from_secs(retrieval.read_timeout_secs));

    let mut scu = match options.establish_with(&addr) {
        Ok(scu) => scu,
        Err(e) => {
            // 关联失败按软失败处理：空结果，下游决定是否致命
            warn!("无法与归档 {} 建立C-FIND关联: {}", addr, e);
            return Ok(Vec::new());
        }
    };

    let pc = scu
        .presentation_contexts()
        .first()
        .cloned()
        .ok_or_else(|| RegistryError::Protocol("对端未接受任何表示上下文".to_string()))?;
    let ts = TransferSyntaxRegistry
        .get(&pc.transfer_syntax)
        .ok_or_else(|| {
            RegistryError::Protocol(format!("未知传输语法: {}", pc.transfer_syntax))
        })?;

    let cmd_data = dimse::encode_command(&dimse::find_request(abstract_syntax, 1))?;
    let mut iod_data = Vec::with_capacity(256);
    identifier
        .write_dataset_with_ts(&mut iod_data, ts)
        .map_err(|e| RegistryError::Protocol(format!("无法编码查询数据集: {e}")))?;

    scu.send(&Pdu::PData {
        data: vec![
            PDataValue {
                presentation_context_id: pc.id,
                value_type: PDataValueType::Command,
                is_last: true,
                data: cmd_data,
            },
            PDataValue {
                presentation_context_id: pc.id,
                value_type: PDataValueType::Data,
                is_last: true,
                data: iod_data,
            },
        ],
    })
    .map_err(|e| RegistryError::Protocol(format!("发送C-FIND请求失败: {e}")))?;

    let outcome: Result<Vec<InMemDicomObject>> = (|| {
        let mut results = Vec::new();
        let mut dataset_buf: Vec<u8> = Vec::new();
        loop {
            let pdu = scu
                .receive()
                .map_err(|e| RegistryError::Protocol(format!("接收C-FIND响应失败: {e}")))?;
            match pdu {
                Pdu::PData { data } => {
                    for pdv in data {
                        match pdv.value_type {
                            PDataValueType::Command => {
                                let cmd = dimse::read_command(&pdv.data)?;
                                match cmd.status {
                                    Some(dimse::status::SUCCESS) => return Ok(results),
                                    Some(_) if cmd.is_pending() => {}
                                    Some(other) => {
                                        return Err(RegistryError::Protocol(format!(
                                            "C-FIND失败，状态码 0x{other:04X}"
                                        )));
                                    }
                                    None => {
                                        return Err(RegistryError::Protocol(
                                            "C-FIND响应缺少状态码".to_string(),
                                        ));
                                    }
                                }
                            }
                            PDataValueType::Data => {
                                dataset_buf.extend_from_slice(&pdv.data);
                                if pdv.is_last {
                                    let obj = InMemDicomObject::read_dataset_with_ts(
                                        dataset_buf.as_slice(),
                                        ts,
                                    )
                                    .map_err(|e| {
                                        RegistryError::Protocol(format!(
                                            "无法解码匹配数据集: {e}"
                                        ))
                                    })?;
                                    results.push(obj);
                                    dataset_buf.clear();
                                }
                            }
                        }
                    }
                }
                Pdu::AbortRQ { source } => {
                    return Err(RegistryError::Association(format!(
                        "关联被对端中止: {source:?}"
                    )));
                }
                other => {
                    return Err(RegistryError::Protocol(format!(
                        "收到意外的PDU: {other:?}"
                    )));
                }
            }
        }
    })();

    match outcome {
        Ok(results) => {
            if let Err(e) = scu.release() {
                warn!("释放C-FIND关联失败: {}", e);
            }
            debug!("C-FIND返回 {} 条匹配", results.len());
            Ok(results)
        }
        Err(e) => {
            // 错误路径同样显式收尾，不留悬置关联
            let _ = scu.abort();
            Err(e)
        }
    }
}

/// STUDY级C-FIND入口
pub fn find_studies(
    archive: &ArchiveConfig,
    retrieval: &RetrievalConfig,
    patient_id: &str,
    date_range: Option<&str>,
) -> Result<Vec<InMemDicomObject>> {
    find(
        archive,
        retrieval,
        uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND,
        &study_query(patient_id, date_range),
    )
}

/// PATIENT级C-FIND入口
pub fn find_patients(
    archive: &ArchiveConfig,
    retrieval: &RetrievalConfig,
    patient_name: &str,
    birth_date: &str,
) -> Result<Vec<InMemDicomObject>> {
    find(
        archive,
        retrieval,
        uids::PATIENT_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND,
        &patient_query(patient_name, birth_date),
    )
}

/// SERIES级C-FIND入口
pub fn find_series(
    archive: &ArchiveConfig,
    retrieval: &RetrievalConfig,
    study_instance_uid: &str,
) -> Result<Vec<InMemDicomObject>> {
    find(
        archive,
        retrieval,
        uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND,
        &series_query(study_instance_uid),
    )
}

/// IMAGE级C-FIND入口
pub fn find_instances(
    archive: &ArchiveConfig,
    retrieval: &RetrievalConfig,
    study_instance_uid: &str,
    series_instance_uid: &str,
) -> Result<Vec<InMemDicomObject>> {
    find(
        archive,
        retrieval,
        uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND,
        &instance_query(study_instance_uid, series_instance_uid),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::tag_str;

    #[test]
    fn test_study_query_requests_wildcard_fields() {
        let query = study_query("P-0001", Some("20221231-20231231"));
        assert_eq!(
            tag_str(&query, tags::QUERY_RETRIEVE_LEVEL).as_deref(),
            Some("STUDY")
        );
        assert_eq!(tag_str(&query, tags::PATIENT_ID).as_deref(), Some("P-0001"));
        assert_eq!(
            tag_str(&query, tags::STUDY_DATE).as_deref(),
            Some("20221231-20231231")
        );
        // 通配字段必须存在于查询中（即便为空）
        assert!(query.element(tags::ACCESSION_NUMBER).is_ok());
        assert!(query.element(tags::STUDY_DESCRIPTION).is_ok());
        assert!(query.element(tags::MODALITIES_IN_STUDY).is_ok());
    }

    #[test]
    fn test_patient_query_matches_on_name_and_birth_date() {
        let query = patient_query("MUSTER^MAX", "19500101");
        assert_eq!(
            tag_str(&query, tags::QUERY_RETRIEVE_LEVEL).as_deref(),
            Some("PATIENT")
        );
        assert_eq!(
            tag_str(&query, tags::PATIENT_NAME).as_deref(),
            Some("MUSTER^MAX")
        );
        assert_eq!(
            tag_str(&query, tags::PATIENT_BIRTH_DATE).as_deref(),
            Some("19500101")
        );
        // PatientID作为返回字段请求
        assert!(query.element(tags::PATIENT_ID).is_ok());
    }

    #[test]
    fn test_instance_query_is_metadata_only() {
        let query = instance_query("1.2.3", "1.2.3.1");
        assert_eq!(
            tag_str(&query, tags::QUERY_RETRIEVE_LEVEL).as_deref(),
            Some("IMAGE")
        );
        assert!(query.element(tags::SOP_INSTANCE_UID).is_ok());
        assert!(query.element(tags::INSTANCE_NUMBER).is_ok());
        assert!(query.element(tags::PIXEL_DATA).is_err());
    }
}
