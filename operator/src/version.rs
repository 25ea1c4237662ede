use std::{cmp::Ordering, fmt};

/// Version of the Ceph engine binaries.
///
/// Ordering and equality ignore the commit id.
#[derive(Debug, Clone, Default)]
pub struct CephVersion {
    /// Major release, i.e. 17 for Quincy.
    pub major: u32,
    /// Minor release.
    pub minor: u32,
    /// Point release.
    pub extra: u32,
    /// Downstream build number.
    pub build: u32,
    /// Upstream commit, when known.
    pub commit_id: String,
}

/// A version string did not have the `<major>.<minor>.<extra>-<build>` form.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid ceph version {0:?}, expected <major>.<minor>.<extra>-<build>")]
pub struct ParseVersionError(pub String);

impl CephVersion {
    /// Construct a version with a zero build and no commit id.
    pub fn new(major: u32, minor: u32, extra: u32) -> Self {
        Self {
            major,
            minor,
            extra,
            ..Default::default()
        }
    }

    /// The zero version stands for "unknown".
    pub fn is_zero(&self) -> bool {
        self.major == 0 && self.minor == 0 && self.extra == 0 && self.build == 0
    }

    /// Copy of the version with the commit id dropped.
    pub fn without_commit_id(&self) -> Self {
        Self {
            commit_id: String::new(),
            ..self.clone()
        }
    }

    /// True when self >= other.
    pub fn is_at_least(&self, other: &CephVersion) -> bool {
        self >= other
    }

    /// Parse a version as written in resource status.
    ///
    /// Only the exact `<major>.<minor>.<extra>-<build>` form is accepted.
    pub fn parse_status(s: &str) -> Result<Self, ParseVersionError> {
        let err = || ParseVersionError(s.to_owned());
        let (release, build) = s.split_once('-').ok_or_else(err)?;
        let parts: Vec<&str> = release.split('.').collect();
        if parts.len() != 3 {
            return Err(err());
        }
        let num = |part: &str| -> Result<u32, ParseVersionError> {
            if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                return Err(err());
            }
            part.parse().map_err(|_| err())
        };
        Ok(Self {
            major: num(parts[0])?,
            minor: num(parts[1])?,
            extra: num(parts[2])?,
            build: num(build)?,
            commit_id: String::new(),
        })
    }

    /// Best effort extraction of the release from a container image tag.
    ///
    /// Accepts tags such as `v17.2.6`, `17.2.6` and `v17.2.6-20230410`. Tag suffixes are
    /// image dates or flavors, never engine builds, so the build is always 0.
    /// Returns None for tags without a version, i.e. `latest`.
    pub fn from_image(image: &str) -> Option<Self> {
        let name = image.rsplit('/').next().unwrap_or(image);
        let tag = name.split('@').next()?.split_once(':')?.1;
        let tag = tag.strip_prefix('v').unwrap_or(tag);
        let release = tag.split_once('-').map_or(tag, |(release, _)| release);
        let mut parts = release.split('.').map(|p| p.parse::<u32>());
        let major = parts.next()?.ok()?;
        let minor = parts.next()?.ok()?;
        let extra = parts.next()?.ok()?;
        if parts.next().is_some() {
            return None;
        }
        Some(Self::new(major, minor, extra))
    }

    /// Major, minor and point release, without build or commit.
    pub fn release(&self) -> (u32, u32, u32) {
        (self.major, self.minor, self.extra)
    }

    fn key(&self) -> (u32, u32, u32, u32) {
        (self.major, self.minor, self.extra, self.build)
    }
}

impl fmt::Display for CephVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}-{}", self.major, self.minor, self.extra, self.build)
    }
}

impl PartialEq for CephVersion {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for CephVersion {}

impl PartialOrd for CephVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CephVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}
