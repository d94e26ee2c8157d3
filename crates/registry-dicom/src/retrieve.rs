//! 影像检索引擎
//!
//! 单实例优先：先以C-MOVE请求单张代表影像；失败时回退为整个序列的
//! C-MOVE，并经代表影像选择取其一。卡死在PENDING状态的远端队列由
//! 连续计数阈值与墙钟期限双重兜底。

use std::time::{Duration, Instant};

use dicom::core::{dicom_value, DataElement, VR};
use dicom::dictionary_std::{tags, uids};
use dicom::encoding::transfer_syntax::TransferSyntaxIndex;
use dicom::object::InMemDicomObject;
use dicom::transfer_syntax::TransferSyntaxRegistry;
use dicom_ul::pdu::{PDataValue, PDataValueType, Pdu};
use dicom_ul::ClientAssociationOptions;
use tracing::{debug, info, warn};

use registry_core::config::{ArchiveConfig, RetrievalConfig};
use registry_core::{RegistryError, Result};

use crate::dimse;
use crate::records::instance_number;
use crate::sanitize::sanitize;
use crate::selector::middle_first;
use crate::store_scp::StoreScp;

/// 单次检索尝试的带标结果
#[derive(Debug, Clone)]
pub enum RetrievalOutcome {
    /// 成功收到一个具体实例（仅头部元数据）
    Received(InMemDicomObject),
    /// 未收到任何数据；携带原始查询作为占位
    Unfulfilled(InMemDicomObject),
}

impl RetrievalOutcome {
    pub fn is_received(&self) -> bool {
        matches!(self, RetrievalOutcome::Received(_))
    }

    /// 取出载荷：成功时为实例数据集，否则为原始查询
    pub fn into_dataset(self) -> InMemDicomObject {
        match self {
            RetrievalOutcome::Received(ds) | RetrievalOutcome::Unfulfilled(ds) => ds,
        }
    }
}

/// 将一批结果划分为成功/失败两组
///
/// 数据集携带可识别的SOPClassUID即视为成功；占位查询不含该字段，
/// 归入失败组供下游处理。
pub fn partition_outcomes(
    outcomes: Vec<RetrievalOutcome>,
) -> (Vec<InMemDicomObject>, Vec<InMemDicomObject>) {
    outcomes
        .into_iter()
        .map(RetrievalOutcome::into_dataset)
        .partition(|ds| ds.element(tags::SOP_CLASS_UID).is_ok())
}

/// 连续PENDING计数器的裁决
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PendingVerdict {
    /// 继续等待后续状态
    Continue,
    /// 收到终止状态，移动结束
    Terminal,
    /// 连续PENDING超过阈值，应当中止关联
    Abort,
}

/// 连续PENDING状态的计数兜底
///
/// 远端队列可能卡死在PENDING而永不给出终止状态。连续PENDING超过
/// 阈值即判定中止；任何非PENDING状态都视为终止并复位计数。
#[derive(Debug)]
pub(crate) struct PendingWatch {
    limit: u32,
    consecutive: u32,
}

impl PendingWatch {
    pub(crate) fn new(limit: u32) -> Self {
        Self {
            limit,
            consecutive: 0,
        }
    }

    pub(crate) fn observe(&mut self, status: u16) -> PendingVerdict {
        match status {
            dimse::status::PENDING | dimse::status::PENDING_WARNING => {
                self.consecutive += 1;
                if self.consecutive > self.limit {
                    PendingVerdict::Abort
                } else {
                    PendingVerdict::Continue
                }
            }
            _ => {
                self.consecutive = 0;
                PendingVerdict::Terminal
            }
        }
    }
}

/// 状态循环的结束方式，决定关联以释放还是中止收尾
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MoveLoopEnd {
    Completed,
    Abort,
}

/// 一次C-MOVE的收尾方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MoveCompletion {
    /// 远端报告终止状态
    Completed,
    /// 关联无法建立
    AssociationFailed,
    /// 由PENDING计数或墙钟期限触发的主动中止
    Aborted,
}

/// 执行一次C-MOVE并消费全部状态响应
fn move_scu(
    archive: &ArchiveConfig,
    retrieval: &RetrievalConfig,
    identifier: &InMemDicomObject,
) -> Result<MoveCompletion> {
    let addr = archive.remote_addr();
    let options = ClientAssociationOptions::new()
        .calling_ae_title(archive.calling_ae_title.clone())
        .called_ae_title(archive.called_ae_title.clone())
        .with_abstract_syntax(uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_MOVE.to_string())
        .read_timeout(Duration::from_secs(retrieval.read_timeout_secs));

    let mut scu = match options.establish_with(&addr) {
        Ok(scu) => scu,
        Err(e) => {
            warn!("无法与归档 {} 建立C-MOVE关联: {}", addr, e);
            return Ok(MoveCompletion::AssociationFailed);
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

    let cmd = dimse::move_request(
        uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_MOVE,
        1,
        &archive.calling_ae_title,
    );
    let mut iod_data = Vec::with_capacity(128);
    identifier
        .write_dataset_with_ts(&mut iod_data, ts)
        .map_err(|e| RegistryError::Protocol(format!("无法编码移动请求数据集: {e}")))?;

    scu.send(&Pdu::PData {
        data: vec![
            PDataValue {
                presentation_context_id: pc.id,
                value_type: PDataValueType::Command,
                is_last: true,
                data: dimse::encode_command(&cmd)?,
            },
            PDataValue {
                presentation_context_id: pc.id,
                value_type: PDataValueType::Data,
                is_last: true,
                data: iod_data,
            },
        ],
    })
    .map_err(|e| RegistryError::Protocol(format!("发送C-MOVE请求失败: {e}")))?;

    let mut watch = PendingWatch::new(retrieval.max_pending_statuses);
    let deadline = Instant::now() + Duration::from_secs(retrieval.move_deadline_secs);
    let verdict: Result<MoveLoopEnd> = (|| {
        loop {
            if Instant::now() >= deadline {
                warn!("C-MOVE超过墙钟期限，主动中止关联");
                return Ok(MoveLoopEnd::Abort);
            }
            let pdu = match scu.receive() {
                Ok(pdu) => pdu,
                Err(e) => {
                    // 对端中途沉默按单次检索失败处理，由回退路径接手
                    warn!("接收C-MOVE响应失败，中止关联: {}", e);
                    return Ok(MoveLoopEnd::Abort);
                }
            };
            match pdu {
                Pdu::PData { data } => {
                    for pdv in data {
                        if pdv.value_type != PDataValueType::Command {
                            // 移动响应的子操作统计数据集不参与决策
                            continue;
                        }
                        let cmd = dimse::read_command(&pdv.data)?;
                        let Some(status) = cmd.status else {
                            continue;
                        };
                        debug!("C-MOVE状态: 0x{:04X}", status);
                        match watch.observe(status) {
                            PendingVerdict::Continue => {}
                            PendingVerdict::Terminal => {
                                if status != dimse::status::SUCCESS {
                                    warn!("C-MOVE以状态 0x{:04X} 结束", status);
                                }
                                return Ok(MoveLoopEnd::Completed);
                            }
                            PendingVerdict::Abort => {
                                warn!(
                                    "连续PENDING超过阈值 {}，中止C-MOVE",
                                    retrieval.max_pending_statuses
                                );
                                return Ok(MoveLoopEnd::Abort);
                            }
                        }
                    }
                }
                Pdu::AbortRQ { source } => {
                    warn!("C-MOVE关联被对端中止: {:?}", source);
                    return Ok(MoveLoopEnd::Abort);
                }
                other => {
                    return Err(RegistryError::Protocol(format!(
                        "收到意外的PDU: {other:?}"
                    )));
                }
            }
        }
    })();

    match verdict {
        Ok(MoveLoopEnd::Completed) => {
            if let Err(e) = scu.release() {
                warn!("释放C-MOVE关联失败: {}", e);
            }
            Ok(MoveCompletion::Completed)
        }
        Ok(MoveLoopEnd::Abort) => {
            let _ = scu.abort();
            Ok(MoveCompletion::Aborted)
        }
        Err(e) => {
            // 协议错误同样不能让关联悬置
            let _ = scu.abort();
            Err(e)
        }
    }
}

/// IMAGE级移动请求数据集
pub fn instance_move_query(
    study_instance_uid: &str,
    series_instance_uid: &str,
    sop_instance_uid: &str,
) -> InMemDicomObject {
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
        DataElement::new(
            tags::SOP_INSTANCE_UID,
            VR::UI,
            dicom_value!(Str, sop_instance_uid),
        ),
    ])
}

/// SERIES级移动请求数据集
pub fn series_move_query(
    study_instance_uid: &str,
    series_instance_uid: &str,
) -> InMemDicomObject {
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
        DataElement::new(
            tags::SERIES_INSTANCE_UID,
            VR::UI,
            dicom_value!(Str, series_instance_uid),
        ),
    ])
}

/// 检索单个实例（仅头部元数据）
///
/// 开启临时接收端点，发出单实例移动请求，最多等待一个推送数据集。
/// 关联失败或零数据集均返回 `Unfulfilled`，由调用方决定回退。
pub fn retrieve_instance(
    archive: &ArchiveConfig,
    retrieval: &RetrievalConfig,
    query: InMemDicomObject,
) -> Result<RetrievalOutcome> {
    let receiver = StoreScp::start(
        &archive.local_addr(),
        &archive.calling_ae_title,
        Duration::from_secs(retrieval.read_timeout_secs),
    )?;
    let completion = move_scu(archive, retrieval, &query)?;
    let mut datasets = receiver.finish();

    if completion == MoveCompletion::AssociationFailed || datasets.is_empty() {
        debug!("单实例检索未取得数据");
        return Ok(RetrievalOutcome::Unfulfilled(query));
    }
    if datasets.len() > 1 {
        warn!("单实例移动收到 {} 个数据集，仅保留第一个", datasets.len());
    }
    let dataset = datasets.swap_remove(0);
    Ok(RetrievalOutcome::Received(sanitize(&dataset)))
}

/// 检索整个序列并选出代表影像
///
/// 单实例检索失败后的回退路径：收集序列的全部推送数据集，
/// 交由代表影像选择，选中者成为结果载荷。
pub fn retrieve_series(
    archive: &ArchiveConfig,
    retrieval: &RetrievalConfig,
    study_instance_uid: &str,
    series_instance_uid: &str,
) -> Result<RetrievalOutcome> {
    let query = series_move_query(study_instance_uid, series_instance_uid);
    let receiver = StoreScp::start(
        &archive.local_addr(),
        &archive.calling_ae_title,
        Duration::from_secs(retrieval.read_timeout_secs),
    )?;
    let completion = move_scu(archive, retrieval, &query)?;
    let datasets = receiver.finish();

    if datasets.is_empty() {
        if completion == MoveCompletion::Aborted {
            info!("序列检索被中止且无数据，记录为未完成");
        }
        return Ok(RetrievalOutcome::Unfulfilled(query));
    }

    let ordered = middle_first(datasets, instance_number);
    match ordered.into_iter().next() {
        Some(representative) => Ok(RetrievalOutcome::Received(sanitize(&representative))),
        None => Ok(RetrievalOutcome::Unfulfilled(query)),
    }
}
