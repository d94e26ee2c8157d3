//! 数据集消毒
//!
//! 检索到的数据集偶见无法编码/解码的元素（长度非法、VR不匹配等）。
//! 消毒采取隔离策略：仅移除出错的单个元素并记录日志，
//! 绝不丢弃整个数据集。

use dicom::object::InMemDicomObject;
use dicom::transfer_syntax::entries;
use tracing::warn;

/// 逐元素校验数据集，移除无法完成编解码往返的元素
pub fn sanitize(dataset: &InMemDicomObject) -> InMemDicomObject {
    let mut clean = InMemDicomObject::new_empty();
    let ts = entries::EXPLICIT_VR_LITTLE_ENDIAN.erased();
    for element in dataset {
        let mut probe = InMemDicomObject::new_empty();
        probe.put(element.clone());
        let mut buf = Vec::new();
        let verdict = probe
            .write_dataset_with_ts(&mut buf, &ts)
            .map_err(|e| e.to_string())
            .and_then(|_| {
                InMemDicomObject::read_dataset_with_ts(buf.as_slice(), &ts)
                    .map(|_| ())
                    .map_err(|e| e.to_string())
            });
        match verdict {
            Ok(()) => {
                clean.put(element.clone());
            }
            Err(e) => {
                warn!("跳过标签 {}: {}", element.header().tag, e);
            }
        }
    }
    clean
}
