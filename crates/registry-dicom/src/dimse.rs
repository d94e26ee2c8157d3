//! DIMSE命令集的构造与解析
//!
//! 命令集一律以Implicit VR Little Endian编码传输。

use dicom::core::{dicom_value, DataElement, VR};
use dicom::dictionary_std::tags;
use dicom::object::InMemDicomObject;
use dicom::transfer_syntax::entries;

use registry_core::{RegistryError, Result};

use crate::records::{tag_str, tag_u16};

/// DIMSE命令字段取值
pub mod command_field {
    pub const C_STORE_RQ: u16 = 0x0001;
    pub const C_FIND_RQ: u16 = 0x0020;
    pub const C_MOVE_RQ: u16 = 0x0021;
    pub const C_ECHO_RQ: u16 = 0x0030;
    pub const C_STORE_RSP: u16 = 0x8001;
    pub const C_ECHO_RSP: u16 = 0x8030;
}

/// DIMSE状态码
pub mod status {
    pub const SUCCESS: u16 = 0x0000;
    pub const PENDING: u16 = 0xFF00;
    pub const PENDING_WARNING: u16 = 0xFF01;
}

/// 命令集中"无数据集"的标记值
const NO_DATA_SET: u16 = 0x0101;
/// 请求默认使用中等优先级
const PRIORITY_MEDIUM: u16 = 0x0000;

/// 构造C-FIND-RQ命令集
pub fn find_request(sop_class_uid: &str, message_id: u16) -> InMemDicomObject {
    InMemDicomObject::command_from_element_iter([
        DataElement::new(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            dicom_value!(Str, sop_class_uid),
        ),
        DataElement::new(
            tags::COMMAND_FIELD,
            VR::US,
            dicom_value!(U16, [command_field::C_FIND_RQ]),
        ),
        DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [message_id])),
        DataElement::new(tags::PRIORITY, VR::US, dicom_value!(U16, [PRIORITY_MEDIUM])),
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(U16, [0x0001]),
        ),
    ])
}

/// 构造C-MOVE-RQ命令集，`destination` 为接收方AE标题
pub fn move_request(sop_class_uid: &str, message_id: u16, destination: &str) -> InMemDicomObject {
    InMemDicomObject::command_from_element_iter([
        DataElement::new(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            dicom_value!(Str, sop_class_uid),
        ),
        DataElement::new(
            tags::COMMAND_FIELD,
            VR::US,
            dicom_value!(U16, [command_field::C_MOVE_RQ]),
        ),
        DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [message_id])),
        DataElement::new(tags::PRIORITY, VR::US, dicom_value!(U16, [PRIORITY_MEDIUM])),
        DataElement::new(
            tags::MOVE_DESTINATION,
            VR::AE,
            dicom_value!(Str, destination),
        ),
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(U16, [0x0001]),
        ),
    ])
}

/// 构造C-STORE-RSP命令集（成功状态）
pub fn store_response(
    message_id: u16,
    sop_class_uid: &str,
    sop_instance_uid: &str,
) -> InMemDicomObject {
    InMemDicomObject::command_from_element_iter([
        DataElement::new(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            dicom_value!(Str, sop_class_uid),
        ),
        DataElement::new(
            tags::COMMAND_FIELD,
            VR::US,
            dicom_value!(U16, [command_field::C_STORE_RSP]),
        ),
        DataElement::new(
            tags::MESSAGE_ID_BEING_RESPONDED_TO,
            VR::US,
            dicom_value!(U16, [message_id]),
        ),
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(U16, [NO_DATA_SET]),
        ),
        DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [status::SUCCESS])),
        DataElement::new(
            tags::AFFECTED_SOP_INSTANCE_UID,
            VR::UI,
            dicom_value!(Str, sop_instance_uid),
        ),
    ])
}

/// 构造C-ECHO-RSP命令集
pub fn echo_response(message_id: u16, sop_class_uid: &str) -> InMemDicomObject {
    InMemDicomObject::command_from_element_iter([
        DataElement::new(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            dicom_value!(Str, sop_class_uid),
        ),
        DataElement::new(
            tags::COMMAND_FIELD,
            VR::US,
            dicom_value!(U16, [command_field::C_ECHO_RSP]),
        ),
        DataElement::new(
            tags::MESSAGE_ID_BEING_RESPONDED_TO,
            VR::US,
            dicom_value!(U16, [message_id]),
        ),
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(U16, [NO_DATA_SET]),
        ),
        DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [status::SUCCESS])),
    ])
}

/// 将命令集编码为Implicit VR LE字节流
pub fn encode_command(command: &InMemDicomObject) -> Result<Vec<u8>> {
    let mut data = Vec::with_capacity(128);
    command
        .write_dataset_with_ts(&mut data, &entries::IMPLICIT_VR_LITTLE_ENDIAN.erased())
        .map_err(|e| RegistryError::Protocol(format!("无法编码命令集: {e}")))?;
    Ok(data)
}

/// 从Implicit VR LE字节流解码命令集
pub fn decode_command(data: &[u8]) -> Result<InMemDicomObject> {
    InMemDicomObject::read_dataset_with_ts(data, &entries::IMPLICIT_VR_LITTLE_ENDIAN.erased())
        .map_err(|e| RegistryError::Protocol(format!("无法解码命令集: {e}")))
}

/// 解析后的命令集摘要
#[derive(Debug, Clone)]
pub struct CommandSet {
    pub command_field: u16,
    pub message_id: Option<u16>,
    pub status: Option<u16>,
    pub affected_sop_class_uid: Option<String>,
    pub affected_sop_instance_uid: Option<String>,
    pub has_dataset: bool,
}

impl CommandSet {
    /// 状态是否为中间PENDING
    pub fn is_pending(&self) -> bool {
        matches!(
            self.status,
            Some(status::PENDING) | Some(status::PENDING_WARNING)
        )
    }
}

/// 解析对端发来的命令集
pub fn read_command(data: &[u8]) -> Result<CommandSet> {
    let obj = decode_command(data)?;
    let command_field = obj
        .element(tags::COMMAND_FIELD)
        .map_err(|e| RegistryError::Protocol(format!("命令集缺少CommandField: {e}")))?
        .to_int::<u16>()
        .map_err(|e| RegistryError::Protocol(format!("CommandField取值非法: {e}")))?;

    Ok(CommandSet {
        command_field,
        message_id: tag_u16(&obj, tags::MESSAGE_ID),
        status: tag_u16(&obj, tags::STATUS),
        affected_sop_class_uid: tag_str(&obj, tags::AFFECTED_SOP_CLASS_UID),
        affected_sop_instance_uid: tag_str(&obj, tags::AFFECTED_SOP_INSTANCE_UID),
        has_dataset: tag_u16(&obj, tags::COMMAND_DATA_SET_TYPE)
            .map(|v| v != NO_DATA_SET)
            .unwrap_or(false),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_request_roundtrip() {
        let cmd = find_request("1.2.840.10008.5.1.4.1.2.2.1", 7);
        let data = encode_command(&cmd).unwrap();
        let parsed = read_command(&data).unwrap();
        assert_eq!(parsed.command_field, command_field::C_FIND_RQ);
        assert_eq!(parsed.message_id, Some(7));
        assert!(parsed.has_dataset);
        assert_eq!(
            parsed.affected_sop_class_uid.as_deref(),
            Some("1.2.840.10008.5.1.4.1.2.2.1")
        );
    }

    #[test]
    fn test_store_response_has_no_dataset() {
        let cmd = store_response(3, "1.2.840.10008.5.1.4.1.1.4", "1.2.3.4");
        let parsed = read_command(&encode_command(&cmd).unwrap()).unwrap();
        assert_eq!(parsed.command_field, command_field::C_STORE_RSP);
        assert!(!parsed.has_dataset);
        assert_eq!(parsed.status, Some(status::SUCCESS));
    }
}
