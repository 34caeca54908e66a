//! Remote appliance version parsing and the version-dependent decisions
//! derived from it.

use std::borrow::Cow;
use std::fmt;
use std::io::{self, BufRead, Write};
use std::str::FromStr;

/// `major.minor.patch[.extra]`, ordered as a four-tuple of integers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RemoteVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    pub extra: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unparseable version string '{0}'")]
pub struct VersionParseError(pub String);

impl RemoteVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
            extra: 0,
        }
    }
}

/// Leading digits of `part`; an empty or missing part counts as zero.
fn numeric_prefix(part: Option<&str>) -> Option<u32> {
    let part = part.unwrap_or("").trim();
    let digits: &str = match part.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => &part[..idx],
        None => part,
    };
    if digits.is_empty() {
        return Some(0);
    }
    digits.parse().ok()
}

impl FromStr for RemoteVersion {
    type Err = VersionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || VersionParseError(s.to_string());
        let trimmed = s.trim();
        let body = trimmed.strip_prefix('v').unwrap_or(trimmed);
        let mut parts = body.split('.');

        let major = parts.next().filter(|p| !p.is_empty()).ok_or_else(err)?;
        if !major.chars().all(|c| c.is_ascii_digit()) {
            return Err(err());
        }
        let major = major.parse().map_err(|_| err())?;

        let minor = parts.next();
        if let Some(minor) = minor {
            if !minor.chars().all(|c| c.is_ascii_digit()) {
                return Err(err());
            }
        }
        let minor = numeric_prefix(minor).ok_or_else(err)?;
        // Trailing suffixes such as "3rc1" are dropped.
        let patch = numeric_prefix(parts.next()).ok_or_else(err)?;
        let extra = numeric_prefix(parts.next()).ok_or_else(err)?;

        Ok(Self {
            major,
            minor,
            patch,
            extra,
        })
    }
}

impl fmt::Display for RemoteVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if self.extra > 0 {
            write!(f, ".{}", self.extra)?;
        }
        Ok(())
    }
}

/// Remote data layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataLayout {
    /// 11.10 line and anything before 2.0: user data lives directly in `/data`.
    Legacy,
    /// 2.0 onward: user data lives in `/data/user`.
    UserSubdir,
}

const LAYOUT_REVISION: RemoteVersion = RemoteVersion::new(2, 0, 0);

impl DataLayout {
    pub fn for_version(version: &RemoteVersion) -> Self {
        let legacy_line = version.major == 11 && version.minor == 10;
        if legacy_line || *version < LAYOUT_REVISION {
            DataLayout::Legacy
        } else {
            DataLayout::UserSubdir
        }
    }

    pub fn user_data_dir(&self, remote_root: &str) -> String {
        let root = remote_root.trim_end_matches('/');
        match self {
            DataLayout::Legacy => format!("{root}/data"),
            DataLayout::UserSubdir => format!("{root}/data/user"),
        }
    }
}

/// Version at or above which a behavior applies, optionally restricted to
/// one `major.minor` release line.
#[derive(Debug, Clone, Copy)]
struct Threshold {
    since: RemoteVersion,
    line_only: bool,
}

impl Threshold {
    const fn on_line(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            since: RemoteVersion::new(major, minor, patch),
            line_only: true,
        }
    }

    const fn onward(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            since: RemoteVersion::new(major, minor, patch),
            line_only: false,
        }
    }

    fn applies_to(&self, version: &RemoteVersion) -> bool {
        let same_line = version.major == self.since.major && version.minor == self.since.minor;
        (same_line || !self.line_only) && *version >= self.since
    }
}

/// Releases from which gist paths in the repository listing are already
/// reported at their final depth.
const GIST_PASSTHROUGH: [Threshold; 4] = [
    Threshold::on_line(2, 16, 23),
    Threshold::on_line(2, 17, 14),
    Threshold::on_line(2, 18, 8),
    Threshold::onward(2, 19, 3),
];

pub const GIST_MARKER: &str = "gist";

/// Reduces each listed path to its parent directory, leaving lines that
/// carry the preserved marker untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathFixup {
    preserve: Option<&'static str>,
}

impl PathFixup {
    pub fn for_version(version: &RemoteVersion) -> Self {
        let passthrough = GIST_PASSTHROUGH.iter().any(|t| t.applies_to(version));
        Self {
            preserve: passthrough.then_some(GIST_MARKER),
        }
    }

    pub fn preserves_gists(&self) -> bool {
        self.preserve.is_some()
    }

    pub fn apply<'a>(&self, line: &'a str) -> Cow<'a, str> {
        if let Some(marker) = self.preserve {
            if line.contains(marker) {
                return Cow::Borrowed(line);
            }
        }
        Cow::Borrowed(parent_dir(line))
    }

    /// Apply the fixup to every line of `input`.
    pub fn filter<R: BufRead, W: Write>(&self, input: R, mut output: W) -> io::Result<()> {
        for line in input.lines() {
            let line = line?;
            writeln!(output, "{}", self.apply(&line))?;
        }
        output.flush()
    }
}

/// `dirname` without forking: drop one trailing slash, a path without
/// slashes becomes ".", otherwise cut from the final slash.
fn parent_dir(line: &str) -> &str {
    let line = line.strip_suffix('/').unwrap_or(line);
    match line.rfind('/') {
        Some(idx) => &line[..idx],
        None => ".",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> RemoteVersion {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_versions() {
        assert_eq!(v("3.1.4"), RemoteVersion::new(3, 1, 4));
        assert_eq!(v("v2.19.3"), RemoteVersion::new(2, 19, 3));
        assert_eq!(v("2.20.0rc1"), RemoteVersion::new(2, 20, 0));
        assert_eq!(v("3.9"), RemoteVersion::new(3, 9, 0));
        assert_eq!(v("11.10.344").major, 11);
        assert_eq!(v("2.19.3.7").extra, 7);
        assert!("".parse::<RemoteVersion>().is_err());
        assert!("vX.1.2".parse::<RemoteVersion>().is_err());
        assert!("3.x.2".parse::<RemoteVersion>().is_err());
    }

    #[test]
    fn test_ordering_is_numeric() {
        assert!(v("2.10.1") > v("2.9.9"));
        assert!(v("2.9") < v("2.10"));
        assert!(v("3.0") == v("3.0.0"));
        assert!(v("2.19.3.1") > v("2.19.3"));
        assert!(v("10.0.0") > v("9.99.99"));
    }

    #[test]
    fn test_display() {
        assert_eq!(v("v3.1.4").to_string(), "3.1.4");
        assert_eq!(v("2.19.3.7").to_string(), "2.19.3.7");
    }

    #[test]
    fn test_data_layout() {
        assert_eq!(DataLayout::for_version(&v("11.10.344")), DataLayout::Legacy);
        assert_eq!(DataLayout::for_version(&v("1.0.0")), DataLayout::Legacy);
        assert_eq!(DataLayout::for_version(&v("2.0.0")), DataLayout::UserSubdir);
        assert_eq!(DataLayout::for_version(&v("3.1.4")), DataLayout::UserSubdir);
        assert_eq!(DataLayout::UserSubdir.user_data_dir(""), "/data/user");
        assert_eq!(DataLayout::Legacy.user_data_dir("/tmp/root/"), "/tmp/root/data");
    }

    #[test]
    fn test_parent_dir_truncation() {
        let fixup = PathFixup::for_version(&v("2.15.0"));
        assert_eq!(fixup.apply("c"), ".");
        assert_eq!(fixup.apply("a/b/c"), "a/b");
        assert_eq!(fixup.apply("a/b/"), "a");
        assert_eq!(fixup.apply("/a"), "");
        assert_eq!(fixup.apply("x/gist/y.git"), "x/gist");
    }

    #[test]
    fn test_gist_passthrough_thresholds() {
        let line = "a/b/gist/abc.git";
        for (version, preserved) in [
            ("2.16.22", false),
            ("2.16.23", true),
            ("2.17.13", false),
            ("2.17.14", true),
            ("2.18.7", false),
            ("2.18.8", true),
            ("2.19.2", false),
            ("2.19.3", true),
            ("2.20.0", true),
            ("3.1.4", true),
        ] {
            let fixup = PathFixup::for_version(&v(version));
            assert_eq!(fixup.preserves_gists(), preserved, "version {version}");
            let expected = if preserved { line } else { "a/b/gist" };
            assert_eq!(fixup.apply(line), expected, "version {version}");
        }
        // Non-gist lines are always truncated.
        assert_eq!(PathFixup::for_version(&v("3.1.4")).apply("a/b/c.git"), "a/b");
    }

    #[test]
    fn test_filter_streams_lines() {
        let fixup = PathFixup::for_version(&v("3.0.0"));
        let input = "repos/a/b.git\nrepos/gist/c.git\nplain\n";
        let mut out = Vec::new();
        fixup.filter(input.as_bytes(), &mut out).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "repos/a\nrepos/gist/c.git\n.\n");
    }
}
