//! 检查集合存储接缝
//!
//! 整合完成后以患者为粒度整体替换持久化的检查集合，不做逐条
//! 删改，避免中间状态被读到。

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use registry_core::models::StudyRecord;
use registry_core::Result;

/// 以患者为键的检查集合存储
#[async_trait]
pub trait StudyStore: Send + Sync {
    /// 读取一个患者当前持久化的全部检查
    async fn load(&self, patient_id: &str) -> Result<Vec<StudyRecord>>;

    /// 原子替换一个患者的全部检查
    async fn replace_all(&self, patient_id: &str, studies: Vec<StudyRecord>) -> Result<()>;
}

/// 进程内存储，用于单机运行与测试
#[derive(Debug, Default)]
pub struct MemoryStudyStore {
    inner: RwLock<HashMap<String, Vec<StudyRecord>>>,
}

impl MemoryStudyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StudyStore for MemoryStudyStore {
    async fn load(&self, patient_id: &str) -> Result<Vec<StudyRecord>> {
        let guard = self.inner.read().await;
        Ok(guard.get(patient_id).cloned().unwrap_or_default())
    }

    async fn replace_all(&self, patient_id: &str, studies: Vec<StudyRecord>) -> Result<()> {
        let mut guard = self.inner.write().await;
        guard.insert(patient_id.to_string(), studies);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_load_unknown_patient_is_empty() {
        let store = MemoryStudyStore::new();
        assert!(store.load("p1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_replace_all_swaps_whole_set() {
        let store = MemoryStudyStore::new();
        let first = vec![
            StudyRecord::skeleton("p1", "A1", "1.1"),
            StudyRecord::skeleton("p1", "A2", "1.2"),
        ];
        store.replace_all("p1", first).await.unwrap();
        assert_eq!(store.load("p1").await.unwrap().len(), 2);

        let second = vec![StudyRecord::skeleton("p1", "A3", "1.3")];
        store.replace_all("p1", second).await.unwrap();
        let loaded = store.load("p1").await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].accession_number, "A3");
    }

    #[tokio::test]
    async fn test_patients_are_isolated() {
        let store = MemoryStudyStore::new();
        store
            .replace_all("p1", vec![StudyRecord::skeleton("p1", "A1", "1.1")])
            .await
            .unwrap();
        assert!(store.load("p2").await.unwrap().is_empty());
    }
}
