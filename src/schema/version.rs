//! Schema release and API version.
//!
//! The version source declares a single enum whose values carry the release
//! stamp (`..._RELEASE_YEAR` through `..._RELEASE_MINUTE`) and, optionally,
//! the API version (`..._API_MAJOR`, `..._API_MINOR`, `..._API_PATCH`).
//! Values are matched by suffix so the naming prefix is free.

use std::fmt;

use prost_types::FileDescriptorProto;

use crate::error::{GatewayError, Result};

/// How many minor versions ahead of ours a backend may be.
pub const MINOR_VERSION_WINDOW: u32 = 9;

/// Release timestamp of a schema build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReleaseStamp {
    pub year: u32,
    pub month: u32,
    pub day: u32,
    pub hour: u32,
    pub minute: u32,
}

impl fmt::Display for ReleaseStamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}.{}",
            self.year, self.month, self.day, self.hour, self.minute
        )
    }
}

/// Semantic API version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ApiVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl ApiVersion {
    pub fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Whether a backend reporting `remote` can serve clients built on `self`.
    ///
    /// The major version must match and the backend's minor version may be
    /// ahead of ours by at most [`MINOR_VERSION_WINDOW`].
    ///
    /// ```
    /// use core_gateway::schema::ApiVersion;
    ///
    /// let local = ApiVersion::new(1, 2, 0);
    /// assert!(local.is_compatible_with(&ApiVersion::new(1, 5, 3)));
    /// assert!(!local.is_compatible_with(&ApiVersion::new(1, 1, 0)));
    /// assert!(!local.is_compatible_with(&ApiVersion::new(2, 2, 0)));
    /// ```
    pub fn is_compatible_with(&self, remote: &ApiVersion) -> bool {
        remote.major == self.major
            && remote.minor >= self.minor
            && remote.minor <= self.minor + MINOR_VERSION_WINDOW
    }
}

impl fmt::Display for ApiVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Version information declared by the loaded schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchemaVersion {
    pub release: ReleaseStamp,
    pub api: Option<ApiVersion>,
}

impl SchemaVersion {
    /// Extract the version from a parsed version source.
    pub fn from_file(file: &FileDescriptorProto) -> Result<Self> {
        let values = file
            .enum_type
            .iter()
            .map(|e| &e.value)
            .find(|values| values.iter().any(|v| v.name().ends_with("RELEASE_YEAR")))
            .ok_or_else(|| GatewayError::Schema("Version source declares no release enum".into()))?;

        let find = |suffix: &str| -> Option<u32> {
            values
                .iter()
                .find(|v| v.name().ends_with(suffix))
                .and_then(|v| u32::try_from(v.number()).ok())
        };
        let require = |suffix: &str| -> Result<u32> {
            find(suffix).ok_or_else(|| {
                GatewayError::Schema(format!("Version enum is missing {}", suffix))
            })
        };

        let release = ReleaseStamp {
            year: require("RELEASE_YEAR")?,
            month: require("RELEASE_MONTH")?,
            day: require("RELEASE_DAY")?,
            hour: require("RELEASE_HOUR")?,
            minute: require("RELEASE_MINUTE")?,
        };

        let api = match (find("API_MAJOR"), find("API_MINOR")) {
            (Some(major), Some(minor)) => Some(ApiVersion::new(
                major,
                minor,
                find("API_PATCH").unwrap_or(0),
            )),
            _ => None,
        };

        Ok(Self { release, api })
    }
}
