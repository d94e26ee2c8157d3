//! 核心数据模型定义

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 患者基本信息
///
/// 一次管线运行期间不可变。`visit_times` 包含该患者所有已知就诊时间，
/// 用于界定随访影像的时间窗。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatientRecord {
    pub patient_id: String,                // 登记系统患者ID
    pub arrival_time: DateTime<Utc>,       // 到院时间
    pub visit_times: Vec<DateTime<Utc>>,   // 全部就诊时间，升序
}

/// 采集状态：检查是否在本院完成
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum AcquisitionState {
    Internal,
    External,
}

/// 检查信息
///
/// 由 STUDY 级查询创建骨架，经影像检索补全元数据，
/// 再由分类器与融合引擎写入派生注释。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StudyRecord {
    pub patient_id: String,
    pub accession_number: String, // 检查号，(patient, accession) 唯一
    pub study_instance_uid: String,
    pub description: Option<String>,
    /// 该检查所有实例中最早的检查时间
    pub study_time: Option<DateTime<Utc>>,
    /// 该检查所有实例中最早的序列时间
    pub series_time: Option<DateTime<Utc>>,
    /// 该检查所有实例中最早的采集时间
    pub acquisition_time: Option<DateTime<Utc>>,
    pub modality: Option<String>,
    pub body_part_examined: Option<String>,
    pub institution_name: Option<String>,
    pub station_name: Option<String>,
    pub institution_address: Option<String>,
    /// 派生注释：采集状态
    pub acquisition_state: Option<AcquisitionState>,
    /// 派生注释：状态桶内的时间序号，从1开始连续编号
    pub acquisition_number: Option<u32>,
}

impl StudyRecord {
    /// 新建仅含标识信息的检查骨架
    pub fn skeleton(patient_id: &str, accession_number: &str, study_instance_uid: &str) -> Self {
        Self {
            patient_id: patient_id.to_string(),
            accession_number: accession_number.to_string(),
            study_instance_uid: study_instance_uid.to_string(),
            description: None,
            study_time: None,
            series_time: None,
            acquisition_time: None,
            modality: None,
            body_part_examined: None,
            institution_name: None,
            station_name: None,
            institution_address: None,
            acquisition_state: None,
            acquisition_number: None,
        }
    }

    /// 分类与融合使用的参考时间：采集时间优先，其次序列时间、检查时间
    pub fn reference_time(&self) -> Option<DateTime<Utc>> {
        self.acquisition_time.or(self.series_time).or(self.study_time)
    }
}

/// 序列信息，属于且仅属于一个检查
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeriesRecord {
    pub study_instance_uid: String,
    pub series_instance_uid: String,
    pub description: Option<String>,
    pub modality: Option<String>,
    pub series_time: Option<DateTime<Utc>>,
}

/// 影像实例信息，仅包含头部元数据，不携带像素数据
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub patient_id: String,
    pub accession_number: String,
    pub study_instance_uid: String,
    pub series_instance_uid: Option<String>,
    pub sop_instance_uid: Option<String>,
    /// SOPClassUID 的存在与否是检索成功的判定依据
    pub sop_class_uid: Option<String>,
    pub instance_number: Option<i64>,
    pub study_time: Option<DateTime<Utc>>,
    pub series_time: Option<DateTime<Utc>>,
    pub acquisition_time: Option<DateTime<Utc>>,
    pub modality: Option<String>,
    pub body_part_examined: Option<String>,
    pub institution_name: Option<String>,
    pub station_name: Option<String>,
    pub institution_address: Option<String>,
}
