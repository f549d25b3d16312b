//! Running-platform facts used by release selection.
//!
//! OS labels follow the appcast convention: a generic family label such as
//! `windows`, and architecture-specific labels such as `windows-x64`.

use std::cmp::Ordering;
use std::fmt;

/// OS family label for the current build target.
pub fn current_os_family() -> &'static str {
    if cfg!(target_os = "windows") {
        "windows"
    } else if cfg!(target_os = "macos") {
        "macos"
    } else if cfg!(target_os = "linux") {
        "linux"
    } else {
        std::env::consts::OS
    }
}

/// Architecture suffix for the current build target.
pub fn current_arch() -> &'static str {
    if cfg!(target_arch = "x86_64") {
        "x64"
    } else if cfg!(target_arch = "x86") {
        "x86"
    } else if cfg!(target_arch = "aarch64") {
        "arm64"
    } else {
        std::env::consts::ARCH
    }
}

/// Numeric OS version (`major.minor.build`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct OsVersion {
    pub major: u32,
    pub minor: u32,
    pub build: u32,
}

impl OsVersion {
    pub const fn new(major: u32, minor: u32, build: u32) -> Self {
        Self { major, minor, build }
    }

    /// Parse `major[.minor[.build]]`, ignoring any non-numeric suffix of a
    /// component (`6.1.0-generic` reads as `6.1.0`).
    pub fn parse(input: &str) -> Option<Self> {
        let mut parts = input.trim().split('.').map(|part| {
            let digits: String = part.chars().take_while(|c| c.is_ascii_digit()).collect();
            digits.parse::<u32>().ok()
        });

        let major = parts.next().flatten()?;
        let minor = parts.next().flatten().unwrap_or(0);
        let build = parts.next().flatten().unwrap_or(0);
        Some(Self { major, minor, build })
    }

    /// Compare at major.minor precision first, then at build precision.
    pub fn compare(&self, other: &Self) -> Ordering {
        (self.major, self.minor)
            .cmp(&(other.major, other.minor))
            .then(self.build.cmp(&other.build))
    }

    /// Best-effort detection of the running OS version.
    pub fn detect() -> Option<Self> {
        #[cfg(target_os = "linux")]
        {
            std::fs::read_to_string("/proc/sys/kernel/osrelease")
                .ok()
                .and_then(|release| Self::parse(&release))
        }

        #[cfg(not(target_os = "linux"))]
        {
            None
        }
    }
}

impl fmt::Display for OsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.build)
    }
}

/// Platform context a release is selected for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OsContext {
    /// Generic OS label; empty disables OS filtering.
    pub os_label: String,
    /// Architecture suffix (`x64`, `x86`, `arm64`, ...).
    pub arch: String,
    /// Running OS version, when known.
    pub os_version: Option<OsVersion>,
}

impl OsContext {
    pub fn new(os_label: impl Into<String>, arch: impl Into<String>, os_version: Option<OsVersion>) -> Self {
        Self {
            os_label: os_label.into(),
            arch: arch.into(),
            os_version,
        }
    }

    /// Context of the running process.
    pub fn current() -> Self {
        Self::new(current_os_family(), current_arch(), OsVersion::detect())
    }

    /// Architecture-specific label, e.g. `windows-x64`.
    pub fn arch_label(&self) -> String {
        format!("{}-{}", self.os_label, self.arch)
    }
}
