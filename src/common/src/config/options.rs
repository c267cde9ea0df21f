//! Typed accessors for config option values.

use super::{ConfigError, SectionView};

pub fn option_as_uint<T>(
    value: &str,
    option_desc: &str,
    min_value: T,
    max_value: T,
) -> Result<T, ConfigError>
where
    T: Copy + PartialOrd + std::fmt::Display + std::str::FromStr,
{
    let out_of_range = || {
        ConfigError::InvalidArgument(format!(
            "{option_desc} needs value between {min_value} and {max_value} inclusive, was '{value}'"
        ))
    };

    let parsed: T = value.trim().parse().map_err(|_| out_of_range())?;
    if parsed < min_value || parsed > max_value {
        return Err(out_of_range());
    }
    Ok(parsed)
}

pub fn option_as_double(
    value: &str,
    option_desc: &str,
    min_value: f64,
    max_value: f64,
) -> Result<f64, ConfigError> {
    let out_of_range = || {
        ConfigError::InvalidArgument(format!(
            "{option_desc} needs value between {min_value} and {max_value} inclusive, was '{value}'"
        ))
    };

    let parsed: f64 = value.trim().parse().map_err(|_| out_of_range())?;
    if parsed < min_value - 0.0001 || parsed > max_value + 0.0001 {
        return Err(out_of_range());
    }
    Ok(parsed)
}

pub fn option_as_bool(value: &str, option_desc: &str) -> Result<bool, ConfigError> {
    match value.trim() {
        "0" => Ok(false),
        "1" => Ok(true),
        other => Err(ConfigError::InvalidArgument(format!(
            "{option_desc} needs value between 0 and 1 inclusive, was '{other}'"
        ))),
    }
}

/// A named option with an optional default; mirrors the harness accessors:
/// a required option that is missing reports "is required", a required
/// option with an empty value reports "needs a value".
#[derive(Debug, Clone)]
pub struct ConfigOption {
    name: &'static str,
    default_value: Option<&'static str>,
}

impl ConfigOption {
    pub const fn required(name: &'static str) -> Self {
        Self {
            name,
            default_value: None,
        }
    }

    pub const fn with_default(name: &'static str, default_value: &'static str) -> Self {
        Self {
            name,
            default_value: Some(default_value),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_required(&self) -> bool {
        self.default_value.is_none()
    }

    pub fn get_option_string(
        &self,
        section: &SectionView<'_>,
        section_desc: &str,
    ) -> Result<String, ConfigError> {
        let value = section.get(self.name)?;
        match value {
            None => match self.default_value {
                Some(default_value) => Ok(default_value.to_string()),
                None => Err(ConfigError::InvalidArgument(format!(
                    "option {} in {section_desc} is required",
                    self.name
                ))),
            },
            Some(value) if value.is_empty() => {
                if self.is_required() {
                    Err(ConfigError::InvalidArgument(format!(
                        "option {} in {section_desc} needs a value",
                        self.name
                    )))
                } else {
                    Ok(self.default_value.unwrap_or_default().to_string())
                }
            }
            Some(value) => Ok(value),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn uint_in_range() {
        assert_eq!(option_as_uint::<u16>("6446", "bind_port", 1, 65535).unwrap(), 6446);
    }

    #[test]
    fn uint_out_of_range() {
        let err = option_as_uint::<u16>("0", "bind_port", 1, 65535).unwrap_err();
        assert_eq!(
            err.to_string(),
            "bind_port needs value between 1 and 65535 inclusive, was '0'"
        );
    }

    #[test]
    fn uint_garbage() {
        assert!(option_as_uint::<u32>("12x", "threads", 0, 1024).is_err());
        assert!(option_as_uint::<u32>("-1", "threads", 0, 1024).is_err());
    }

    #[test]
    fn double_in_range() {
        let parsed = option_as_double("1.5", "connection_sharing_delay", 0.0, 3600.0).unwrap();
        assert!((parsed - 1.5).abs() < f64::EPSILON);
    }

    #[test]
    fn double_rejects_locale_comma() {
        assert!(option_as_double("1,5", "connection_sharing_delay", 0.0, 3600.0).is_err());
    }

    #[test]
    fn bool_values() {
        assert!(!option_as_bool("0", "router_require_enforce").unwrap());
        assert!(option_as_bool("1", "router_require_enforce").unwrap());
        assert!(option_as_bool("yes", "router_require_enforce").is_err());
    }

    #[test]
    fn required_option_missing() {
        let mut config = Config::new();
        config.read_str("[routing]\n").unwrap();
        let section = config.get("routing", None).unwrap();
        let err = ConfigOption::required("destinations")
            .get_option_string(&section, "[routing]")
            .unwrap_err();
        assert!(err.to_string().contains("is required"));
    }

    #[test]
    fn empty_required_option_needs_value() {
        let mut config = Config::new();
        config.read_str("[routing]\ndestinations =\n").unwrap();
        let section = config.get("routing", None).unwrap();
        let err = ConfigOption::required("destinations")
            .get_option_string(&section, "[routing]")
            .unwrap_err();
        assert!(err.to_string().contains("needs a value"));
    }

    #[test]
    fn default_applies() {
        let mut config = Config::new();
        config.read_str("[routing]\n").unwrap();
        let section = config.get("routing", None).unwrap();
        let value = ConfigOption::with_default("connect_timeout", "5")
            .get_option_string(&section, "[routing]")
            .unwrap();
        assert_eq!(value, "5");
    }
}
