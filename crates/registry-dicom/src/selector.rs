//! 代表影像选择
//!
//! 序列边缘的影像更可能不可用或元数据损坏，因此不检查像素内容，
//! 直接取序列"中间"的影像作为代表。

/// 将位置居中的元素排到首位
///
/// 依据 `position` 将元素分为有序号与无序号两组：有序号的按序号升序排序，
/// 取其中点（`len/2`，0起）移到输出首位，其余保持排序；无序号的按输入
/// 顺序追加到尾部。空输入返回空，单元素原样返回。
pub fn middle_first<T, F>(items: Vec<T>, position: F) -> Vec<T>
where
    F: Fn(&T) -> Option<i64>,
{
    let (mut defined, undefined): (Vec<T>, Vec<T>) =
        items.into_iter().partition(|item| position(item).is_some());
    defined.sort_by_key(|item| position(item).unwrap_or(i64::MAX));

    let mut result = Vec::with_capacity(defined.len() + undefined.len());
    if !defined.is_empty() {
        let mid = defined.len() / 2;
        result.push(defined.remove(mid));
    }
    result.extend(defined);
    result.extend(undefined);
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn positions(items: &[Option<i64>]) -> Vec<Option<i64>> {
        middle_first(items.to_vec(), |p| *p)
    }

    #[test]
    fn test_middle_moved_to_front() {
        let input = vec![Some(1), Some(2), Some(3), Some(4), Some(5)];
        assert_eq!(
            positions(&input),
            vec![Some(3), Some(1), Some(2), Some(4), Some(5)]
        );
    }

    #[test]
    fn test_unsorted_input_is_sorted_first() {
        let input = vec![Some(5), Some(1), Some(3), Some(2), Some(4)];
        assert_eq!(
            positions(&input),
            vec![Some(3), Some(1), Some(2), Some(4), Some(5)]
        );
    }

    #[test]
    fn test_undefined_positions_move_to_tail() {
        let input = vec![Some(1), Some(2), None];
        assert_eq!(positions(&input), vec![Some(2), Some(1), None]);
    }

    #[test]
    fn test_only_undefined_positions() {
        let input = vec![None, None];
        assert_eq!(positions(&input), vec![None, None]);
    }

    #[test]
    fn test_empty_and_singleton() {
        assert_eq!(positions(&[]), Vec::<Option<i64>>::new());
        assert_eq!(positions(&[Some(7)]), vec![Some(7)]);
    }

    #[test]
    fn test_even_length_takes_upper_middle() {
        let input = vec![Some(1), Some(2), Some(3), Some(4)];
        assert_eq!(
            positions(&input),
            vec![Some(3), Some(1), Some(2), Some(4)]
        );
    }
}
