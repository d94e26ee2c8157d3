//! 检查融合引擎
//!
//! 同一次物理成像在归档中可能登记为多条检查记录（如 CT 平扫与灌注
//! 分开建检查）。融合引擎按参考时间把检查聚为组，对照目录裁决每组
//! 是否共用一个采集序号，并做稠密重编号，保证序号仍然连续且该过程
//! 可重复执行。

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use registry_core::config::FusionCatalogConfig;
use registry_core::models::{AcquisitionState, StudyRecord};

/// 一组描述集合的裁决结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FusionDecision {
    /// 各自保留独立序号
    Separate,
    /// 整组共用一个序号
    Fuse,
    /// 三条记录占两个序号：排序后首条独占，其余两条共用下一个
    Partial,
    /// 目录未覆盖，保持独立并留诊断日志
    Unknown,
}

/// 融合目录，键为组内检查描述排序后的列表
#[derive(Debug, Clone, Default)]
pub struct FusionCatalogs {
    never_fuse: Vec<Vec<String>>,
    fuse_a: Vec<Vec<String>>,
    fuse_b: Vec<Vec<String>>,
    partial_fuse: Vec<Vec<String>>,
}

impl FusionCatalogs {
    pub fn from_config(config: &FusionCatalogConfig) -> Self {
        Self {
            never_fuse: normalize(&config.never_fuse),
            fuse_a: normalize(&config.fuse_a),
            fuse_b: normalize(&config.fuse_b),
            partial_fuse: normalize(&config.partial_fuse),
        }
    }

    /// 对一组描述裁决，单条记录的组恒为 Separate
    pub fn decide(&self, descriptions: &[String]) -> FusionDecision {
        if descriptions.len() <= 1 {
            return FusionDecision::Separate;
        }
        let mut key: Vec<String> = descriptions.to_vec();
        key.sort();
        if self.never_fuse.contains(&key) {
            return FusionDecision::Separate;
        }
        if self.fuse_a.contains(&key) || self.fuse_b.contains(&key) {
            return FusionDecision::Fuse;
        }
        if key.len() == 3 && self.partial_fuse.contains(&key) {
            return FusionDecision::Partial;
        }
        FusionDecision::Unknown
    }
}

fn normalize(entries: &[Vec<String>]) -> Vec<Vec<String>> {
    entries
        .iter()
        .map(|entry| {
            let mut sorted = entry.clone();
            sorted.sort();
            sorted
        })
        .collect()
}

/// 按状态桶整合检查序号
///
/// 每个桶内：共享参考时间的检查为一组（无参考时间的各自成组），
/// 按组内最小采集序号走访，依裁决稠密重编号。整趟为幂等操作，
/// 对已整合的集合重复执行不再改变任何序号。
pub fn consolidate(studies: &mut [StudyRecord], catalogs: &FusionCatalogs) {
    for state in [AcquisitionState::Internal, AcquisitionState::External] {
        consolidate_bucket(studies, state, catalogs);
    }
}

fn consolidate_bucket(
    studies: &mut [StudyRecord],
    state: AcquisitionState,
    catalogs: &FusionCatalogs,
) {
    // (参考时间, 组内索引)，无参考时间用自身索引区分成单例组
    let mut groups: BTreeMap<(Option<DateTime<Utc>>, usize), Vec<usize>> = BTreeMap::new();
    for (index, study) in studies.iter().enumerate() {
        if study.acquisition_state != Some(state) {
            continue;
        }
        let key = match study.reference_time() {
            Some(time) => (Some(time), 0),
            None => (None, index),
        };
        groups.entry(key).or_default().push(index);
    }

    let mut ordered: Vec<Vec<usize>> = groups.into_values().collect();
    for group in &mut ordered {
        group.sort_by_key(|&i| studies[i].acquisition_number);
    }
    ordered.sort_by_key(|group| {
        group
            .iter()
            .filter_map(|&i| studies[i].acquisition_number)
            .min()
    });

    let mut next = 1u32;
    for group in ordered {
        let descriptions: Vec<String> = group
            .iter()
            .map(|&i| studies[i].description.clone().unwrap_or_default())
            .collect();
        match catalogs.decide(&descriptions) {
            FusionDecision::Fuse => {
                debug!("融合 {:?} 为序号 {}", descriptions, next);
                for &index in &group {
                    studies[index].acquisition_number = Some(next);
                }
                next += 1;
            }
            FusionDecision::Partial => {
                // 描述字典序首条独占本组序号，其余两条共用下一个
                let mut by_description: Vec<usize> = group.clone();
                by_description.sort_by_key(|&i| studies[i].description.clone());
                studies[by_description[0]].acquisition_number = Some(next);
                for &index in &by_description[1..] {
                    studies[index].acquisition_number = Some(next + 1);
                }
                next += 2;
            }
            decision => {
                if decision == FusionDecision::Unknown {
                    warn!("融合目录未覆盖描述组合 {:?}，保持独立序号待人工确认", descriptions);
                }
                for &index in &group {
                    studies[index].acquisition_number = Some(next);
                    next += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn catalogs() -> FusionCatalogs {
        FusionCatalogs::from_config(&FusionCatalogConfig {
            never_fuse: vec![vec!["CT Schaedel".to_string(), "CT Thorax".to_string()]],
            fuse_a: vec![vec![
                "CT Schaedel nativ".to_string(),
                "CT Perfusion".to_string(),
            ]],
            fuse_b: vec![vec![
                "MR Schaedel".to_string(),
                "MR Angiographie".to_string(),
            ]],
            partial_fuse: vec![vec![
                "CT Schaedel nativ".to_string(),
                "CT Perfusion".to_string(),
                "CT Angiographie".to_string(),
            ]],
        })
    }

    fn study(acc: &str, desc: &str, number: u32, hour: u32) -> StudyRecord {
        let mut s = StudyRecord::skeleton("p1", acc, acc);
        s.description = Some(desc.to_string());
        s.acquisition_state = Some(AcquisitionState::Internal);
        s.acquisition_number = Some(number);
        s.study_time = Some(Utc.with_ymd_and_hms(2023, 1, 1, hour, 0, 0).unwrap());
        s
    }

    fn number(studies: &[StudyRecord], acc: &str) -> Option<u32> {
        studies
            .iter()
            .find(|s| s.accession_number == acc)
            .unwrap()
            .acquisition_number
    }

    #[test]
    fn test_decide_is_order_insensitive() {
        let c = catalogs();
        assert_eq!(
            c.decide(&["CT Perfusion".to_string(), "CT Schaedel nativ".to_string()]),
            FusionDecision::Fuse
        );
        assert_eq!(
            c.decide(&["CT Schaedel nativ".to_string(), "CT Perfusion".to_string()]),
            FusionDecision::Fuse
        );
    }

    #[test]
    fn test_fuse_collapses_group_and_shifts_later_numbers() {
        let mut studies = vec![
            study("A1", "CT Schaedel nativ", 1, 10),
            study("A2", "CT Perfusion", 2, 10),
            study("A3", "MR Schaedel", 3, 14),
        ];
        consolidate(&mut studies, &catalogs());
        assert_eq!(number(&studies, "A1"), Some(1));
        assert_eq!(number(&studies, "A2"), Some(1));
        assert_eq!(number(&studies, "A3"), Some(2));
    }

    #[test]
    fn test_never_fuse_keeps_distinct_numbers() {
        let mut studies = vec![
            study("A1", "CT Schaedel", 1, 10),
            study("A2", "CT Thorax", 2, 10),
        ];
        consolidate(&mut studies, &catalogs());
        assert_eq!(number(&studies, "A1"), Some(1));
        assert_eq!(number(&studies, "A2"), Some(2));
    }

    #[test]
    fn test_partial_fuse_takes_two_slots() {
        let mut studies = vec![
            study("A1", "CT Schaedel nativ", 1, 10),
            study("A2", "CT Perfusion", 2, 10),
            study("A3", "CT Angiographie", 3, 10),
            study("A4", "MR Schaedel", 4, 14),
        ];
        consolidate(&mut studies, &catalogs());
        // 字典序首条 "CT Angiographie" 独占序号1
        assert_eq!(number(&studies, "A3"), Some(1));
        assert_eq!(number(&studies, "A1"), Some(2));
        assert_eq!(number(&studies, "A2"), Some(2));
        assert_eq!(number(&studies, "A4"), Some(3));
    }

    #[test]
    fn test_unknown_combination_stays_separate() {
        let mut studies = vec![
            study("A1", "CT Abdomen", 1, 10),
            study("A2", "CT Becken", 2, 10),
        ];
        consolidate(&mut studies, &catalogs());
        assert_eq!(number(&studies, "A1"), Some(1));
        assert_eq!(number(&studies, "A2"), Some(2));
    }

    #[test]
    fn test_consolidate_is_idempotent() {
        let mut studies = vec![
            study("A1", "CT Schaedel nativ", 1, 10),
            study("A2", "CT Perfusion", 2, 10),
            study("A3", "MR Schaedel", 3, 14),
            study("A4", "MR Angiographie", 4, 14),
        ];
        consolidate(&mut studies, &catalogs());
        let first: Vec<Option<u32>> = studies.iter().map(|s| s.acquisition_number).collect();
        consolidate(&mut studies, &catalogs());
        let second: Vec<Option<u32>> = studies.iter().map(|s| s.acquisition_number).collect();
        assert_eq!(first, second);
        assert_eq!(number(&studies, "A1"), Some(1));
        assert_eq!(number(&studies, "A3"), Some(2));
        assert_eq!(number(&studies, "A4"), Some(2));
    }

    #[test]
    fn test_buckets_consolidate_independently() {
        let mut internal = study("A1", "CT Schaedel nativ", 1, 10);
        internal.acquisition_state = Some(AcquisitionState::Internal);
        let mut external = study("B1", "MR Schaedel", 1, 10);
        external.acquisition_state = Some(AcquisitionState::External);
        let mut studies = vec![internal, external];
        consolidate(&mut studies, &catalogs());
        assert_eq!(number(&studies, "A1"), Some(1));
        assert_eq!(number(&studies, "B1"), Some(1));
    }
}
