//! `/proc/version` parsing.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::{Grammar, MonitorError, ParseLocation};

const PREFIX: &str = "Linux version ";

static VERSION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+)\.(\d+)\.(\d+)(?:-(\S*)|\s|$)").expect("valid regex"));

/// Running kernel release, e.g. `5.4.0-1104-azure`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelVersion {
    pub version: String,
    pub patch_level: String,
    pub sub_level: String,
    pub extra_version: Option<String>,
}

impl fmt::Display for KernelVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.version, self.patch_level, self.sub_level)?;
        if let Some(extra) = &self.extra_version {
            write!(f, "-{}", extra)?;
        }
        Ok(())
    }
}

pub fn parse_kernel_version(raw: &str) -> crate::Result<KernelVersion> {
    let fail = |expected: &'static str| MonitorError::Parse {
        grammar: Grammar::KernelVersion,
        location: ParseLocation { line: 1, expected },
        raw: raw.to_string(),
    };

    let rest = raw
        .get(..PREFIX.len())
        .filter(|head| head.eq_ignore_ascii_case(PREFIX))
        .map(|_| &raw[PREFIX.len()..])
        .ok_or_else(|| fail("prefix 'Linux version '"))?;

    let caps = VERSION
        .captures(rest)
        .ok_or_else(|| fail("version digits"))?;

    Ok(KernelVersion {
        version: caps[1].to_string(),
        patch_level: caps[2].to_string(),
        sub_level: caps[3].to_string(),
        extra_version: caps
            .get(4)
            .map(|m| m.as_str().to_string())
            .filter(|extra| !extra.is_empty()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_azure_kernel() {
        let raw = "Linux version 5.4.0-1104-azure (buildd@lcy02-amd64-027) (gcc version 7.5.0 (Ubuntu 7.5.0-3ubuntu1~18.04)) #110~18.04.1-Ubuntu SMP Sat Feb 11 17:31:55 UTC 2023\n";
        let version = parse_kernel_version(raw).unwrap();
        assert_eq!(version.version, "5");
        assert_eq!(version.patch_level, "4");
        assert_eq!(version.sub_level, "0");
        assert_eq!(version.extra_version.as_deref(), Some("1104-azure"));
        assert_eq!(version.to_string(), "5.4.0-1104-azure");
    }

    #[test]
    fn test_without_extra_version() {
        let version = parse_kernel_version("Linux version 5.4.0 (buildd@lcy02) #1 SMP").unwrap();
        assert_eq!(version.extra_version, None);
        assert_eq!(version.to_string(), "5.4.0");
    }

    #[test]
    fn test_multi_digit_components() {
        let version = parse_kernel_version("Linux version 500.400.100 (someone)").unwrap();
        assert_eq!(version.version, "500");
        assert_eq!(version.patch_level, "400");
        assert_eq!(version.sub_level, "100");
    }

    #[test]
    fn test_missing_prefix_fails() {
        let err = parse_kernel_version("5.4.0-1104-azure").unwrap_err();
        assert!(matches!(
            err,
            MonitorError::Parse { grammar: Grammar::KernelVersion, ref location, .. }
                if location.expected.starts_with("prefix")
        ));
    }

    #[test]
    fn test_missing_digits_fails() {
        let err = parse_kernel_version("Linux version five (buildd)").unwrap_err();
        assert!(matches!(
            err,
            MonitorError::Parse { ref location, .. } if location.expected == "version digits"
        ));
    }

    #[test]
    fn test_short_input_fails() {
        assert!(parse_kernel_version("").is_err());
        assert!(parse_kernel_version("Linux").is_err());
    }
}
