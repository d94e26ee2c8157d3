//! DICOM时间工具
//!
//! DA/TM值的解析、各级精确时间戳的合成以及随访时间窗的计算。
//! DA/TM不携带时区信息，统一按UTC解释。

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Utc};

/// 解析DICOM DA值（YYYYMMDD）
pub fn parse_da(value: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(value.trim(), "%Y%m%d").ok()
}

/// 解析DICOM TM值（HH、HHMM、HHMMSS，可带小数秒）
pub fn parse_tm(value: &str) -> Option<NaiveTime> {
    let value = value.trim();
    // 合法TM仅含ASCII数字与小数点；按字节切片前先排除多字节字符
    if !value.is_ascii() {
        return None;
    }
    let (base, frac) = match value.split_once('.') {
        Some((b, f)) => (b, f),
        None => (value, ""),
    };
    if base.len() < 2 || base.len() > 6 || base.len() % 2 != 0 {
        return None;
    }
    let digit = |s: &str| s.parse::<u32>().ok();
    let hour = digit(&base[0..2])?;
    let minute = if base.len() >= 4 { digit(&base[2..4])? } else { 0 };
    let second = if base.len() >= 6 { digit(&base[4..6])? } else { 0 };
    let micro = if frac.is_empty() {
        0
    } else {
        // 小数秒按微秒精度截断或补齐
        let padded = format!("{:0<6}", &frac[..frac.len().min(6)]);
        padded.parse::<u32>().ok()?
    };
    NaiveTime::from_hms_micro_opt(hour, minute, second, micro)
}

/// 由DA与TM合成UTC时间戳。日期缺失时无法合成；时间缺失按零点处理。
pub fn exact_datetime(da: Option<&str>, tm: Option<&str>) -> Option<DateTime<Utc>> {
    let date = parse_da(da?)?;
    let time = tm.and_then(parse_tm).unwrap_or(NaiveTime::MIN);
    Some(Utc.from_utc_datetime(&date.and_time(time)))
}

/// 随访影像时间窗
///
/// 以到院时间为锚点：窗口自到院前12小时起，至下一次已知就诊为止，
/// 最长不超过52周。`visits` 需为升序的全部就诊时间。
pub fn follow_up_window(
    arrival_time: DateTime<Utc>,
    visits: &[DateTime<Utc>],
) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let lead = Duration::hours(12);
    let cap = Duration::weeks(52);
    for (i, start) in visits.iter().enumerate() {
        if *start != arrival_time {
            continue;
        }
        let mut end = match visits.get(i + 1) {
            Some(next) => *next,
            None => *start + cap,
        };
        if end - *start > cap {
            end = *start + cap;
        }
        return Some((*start - lead, end));
    }
    None
}

/// 将时间窗格式化为DICOM日期范围查询值（YYYYMMDD-YYYYMMDD）
pub fn dicom_date_range(window: (DateTime<Utc>, DateTime<Utc>)) -> String {
    format!(
        "{}-{}",
        window.0.format("%Y%m%d"),
        window.1.format("%Y%m%d")
    )
}
