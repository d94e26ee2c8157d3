//! 级联关键字过滤
//!
//! 每级查询结果在交给下游之前先经过允许/排除关键字策略。
//! 目录为空时策略保持宽松（全部放行），通过配置收紧。

use regex::Regex;
use tracing::{debug, warn};

use registry_core::config::FilterConfig;
use registry_core::{RegistryError, Result};

/// 描述字段的允许/排除关键字策略
///
/// 判定顺序：允许关键字命中则纳入；排除关键字或排除治疗关键字命中
/// 则排除；其余默认纳入。描述缺失或为空一律纳入。
#[derive(Debug, Clone)]
pub struct KeywordPolicy {
    include: Option<Regex>,
    exclude: Option<Regex>,
    exclude_treatments: Option<Regex>,
}

impl KeywordPolicy {
    pub fn from_config(config: &FilterConfig) -> Result<Self> {
        Ok(Self {
            include: compile(&config.include_keywords, false)?,
            exclude: compile(&config.exclude_keywords, true)?,
            exclude_treatments: compile(&config.exclude_treatments, true)?,
        })
    }

    /// 描述是否通过策略
    pub fn allows(&self, description: Option<&str>) -> bool {
        let Some(desc) = description.filter(|d| !d.is_empty()) else {
            // 无描述信息时暂且纳入
            return true;
        };
        let desc = desc.to_lowercase();
        if let Some(include) = &self.include {
            if include.is_match(&desc) {
                return true;
            }
        }
        if let Some(exclude) = &self.exclude {
            if exclude.is_match(&desc) {
                return false;
            }
        }
        if let Some(treatments) = &self.exclude_treatments {
            if treatments.is_match(&desc) {
                return false;
            }
        }
        true
    }
}

/// 将关键字目录编译为单个备选正则；空目录不参与判定
fn compile(keywords: &[String], word_bounded: bool) -> Result<Option<Regex>> {
    if keywords.is_empty() {
        return Ok(None);
    }
    let pattern = keywords
        .iter()
        .map(|k| {
            let escaped = regex::escape(&k.to_lowercase());
            if word_bounded {
                format!("\\b{escaped}\\b")
            } else {
                escaped
            }
        })
        .collect::<Vec<_>>()
        .join("|");
    Regex::new(&pattern)
        .map(Some)
        .map_err(|e| RegistryError::Config(format!("非法过滤关键字: {e}")))
}

/// 级联全部过滤规则：关键字策略加检查类型白名单
#[derive(Debug, Clone)]
pub struct CascadeFilter {
    policy: KeywordPolicy,
    allowed_modalities: Vec<String>,
}

impl CascadeFilter {
    pub fn from_config(config: &FilterConfig) -> Result<Self> {
        Ok(Self {
            policy: KeywordPolicy::from_config(config)?,
            allowed_modalities: config.allowed_modalities.clone(),
        })
    }

    /// STUDY级：依据检查描述
    pub fn allows_study(&self, description: Option<&str>) -> bool {
        let allowed = self.policy.allows(description);
        if allowed {
            debug!("纳入检查，描述: {:?}", description);
        } else {
            warn!("跳过检查，描述: {:?}", description);
        }
        allowed
    }

    /// SERIES级：依据检查类型与序列描述；类型缺失暂且纳入
    pub fn allows_series(&self, modality: Option<&str>, description: Option<&str>) -> bool {
        let modality_ok = match modality {
            Some(m) => self.allowed_modalities.iter().any(|a| a == m),
            None => true,
        };
        let allowed = modality_ok && self.policy.allows(description);
        if !allowed {
            warn!(
                "跳过序列，类型: {:?}，描述: {:?}",
                modality, description
            );
        }
        allowed
    }

    /// IMAGE级：检查类型必须在白名单内，且各描述字段均通过策略
    pub fn allows_instance(
        &self,
        modality: Option<&str>,
        descriptions: &[Option<&str>],
    ) -> bool {
        let modality_ok = modality
            .map(|m| self.allowed_modalities.iter().any(|a| a == m))
            .unwrap_or(false);
        let allowed = modality_ok && descriptions.iter().all(|d| self.policy.allows(*d));
        if !allowed {
            warn!(
                "跳过影像，类型: {:?}，描述字段: {:?}",
                modality, descriptions
            );
        }
        allowed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(
        include: &[&str],
        exclude: &[&str],
        treatments: &[&str],
    ) -> FilterConfig {
        FilterConfig {
            include_keywords: include.iter().map(|s| s.to_string()).collect(),
            exclude_keywords: exclude.iter().map(|s| s.to_string()).collect(),
            exclude_treatments: treatments.iter().map(|s| s.to_string()).collect(),
            allowed_modalities: vec!["MR".into(), "CT".into(), "XA".into()],
        }
    }

    #[test]
    fn test_permissive_by_default() {
        let policy = KeywordPolicy::from_config(&FilterConfig::default()).unwrap();
        assert!(policy.allows(None));
        assert!(policy.allows(Some("")));
        assert!(policy.allows(Some("CT Thorax")));
    }

    #[test]
    fn test_include_wins_over_exclude() {
        let policy =
            KeywordPolicy::from_config(&config(&["schaedel"], &["thorax"], &[])).unwrap();
        // 允许关键字命中，即使排除关键字同样命中
        assert!(policy.allows(Some("CT Schaedel und Thorax")));
        assert!(!policy.allows(Some("CT Thorax")));
    }

    #[test]
    fn test_exclude_is_word_bounded() {
        let policy = KeywordPolicy::from_config(&config(&[], &["arm"], &[])).unwrap();
        assert!(!policy.allows(Some("Roentgen Arm links")));
        // "arm"作为子串不触发排除
        assert!(policy.allows(Some("Darmspiegelung")));
    }

    #[test]
    fn test_series_modality_allowlist() {
        let filter = CascadeFilter::from_config(&config(&[], &[], &[])).unwrap();
        assert!(filter.allows_series(Some("CT"), Some("Schaedel nativ")));
        assert!(filter.allows_series(None, None));
        assert!(!filter.allows_series(Some("US"), None));
    }

    #[test]
    fn test_instance_requires_modality() {
        let filter = CascadeFilter::from_config(&config(&[], &[], &[])).unwrap();
        assert!(filter.allows_instance(Some("MR"), &[Some("DWI"), None]));
        // IMAGE级不允许类型缺失
        assert!(!filter.allows_instance(None, &[Some("DWI")]));
    }
}
