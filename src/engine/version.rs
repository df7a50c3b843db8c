//! Engine build descriptors and the version selection policy
//!
//! Discovering installed builds is left to the host; this module only
//! chooses among the candidates it is given.

use std::path::PathBuf;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::{Error, Result, settings};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum License {
    Gpl,
    Afpl,
    Commercial,
    Unknown,
}

/// One installed engine build
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EngineVersion {
    pub revision: u32,
    pub license: License,
    pub library_path: PathBuf,
}

impl EngineVersion {
    pub fn new(revision: u32, license: License, library_path: impl Into<PathBuf>) -> Self {
        Self {
            revision,
            license,
            library_path: library_path.into(),
        }
    }

    /// Most recent build whose license is in `allowed`.
    /// On equal revisions the `preferred` license wins.
    pub fn latest<'a>(
        candidates: &'a [EngineVersion],
        allowed: &[License],
        preferred: License,
    ) -> Result<&'a EngineVersion> {
        let chosen = candidates
            .iter()
            .filter(|v| allowed.contains(&v.license))
            .max_by_key(|v| (v.revision, v.license == preferred))
            .ok_or(Error::EngineNotFound)?;
        debug!(
            "Selected engine revision {} ({:?}) at {:?}",
            chosen.revision, chosen.license, chosen.library_path
        );
        Ok(chosen)
    }
}

/// What to load: a build on disk or a library image held in memory
#[derive(Clone, Debug)]
pub enum EngineSource {
    Version(EngineVersion),
    Image(Vec<u8>),
}

impl EngineSource {
    /// Library configured in the settings file
    pub fn configured() -> Result<Self> {
        let path = settings::get_engine_path().ok_or(Error::EngineNotFound)?;
        Ok(Self::Version(EngineVersion::new(0, License::Unknown, path)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidates() -> Vec<EngineVersion> {
        vec![
            EngineVersion::new(954, License::Gpl, "/opt/gs954/libgs.so"),
            EngineVersion::new(10021, License::Afpl, "/opt/gs10021a/libgs.so"),
            EngineVersion::new(10021, License::Gpl, "/opt/gs10021/libgs.so"),
            EngineVersion::new(10050, License::Commercial, "/opt/gsc/libgs.so"),
        ]
    }

    #[test]
    fn picks_highest_allowed_revision() {
        let all = candidates();
        let chosen =
            EngineVersion::latest(&all, &[License::Gpl, License::Afpl], License::Gpl).unwrap();
        assert_eq!(chosen.library_path, PathBuf::from("/opt/gs10021/libgs.so"));

        let chosen =
            EngineVersion::latest(&all, &[License::Gpl, License::Afpl], License::Afpl).unwrap();
        assert_eq!(chosen.license, License::Afpl);
    }

    #[test]
    fn nothing_allowed_is_not_found() {
        let all = candidates();
        assert!(matches!(
            EngineVersion::latest(&all, &[License::Unknown], License::Gpl),
            Err(Error::EngineNotFound)
        ));
        assert!(matches!(
            EngineVersion::latest(&[], &[License::Gpl], License::Gpl),
            Err(Error::EngineNotFound)
        ));
    }

    #[test]
    #[serial_test::serial]
    fn configured_source_follows_settings() {
        settings::reset_to_defaults();
        assert!(matches!(
            EngineSource::configured(),
            Err(Error::EngineNotFound)
        ));

        settings::set_engine_path(Some(PathBuf::from("/opt/gs/libgs.so")));
        match EngineSource::configured().unwrap() {
            EngineSource::Version(version) => {
                assert_eq!(version.library_path, PathBuf::from("/opt/gs/libgs.so"));
            }
            other => panic!("expected a version source, got {other:?}"),
        }
        settings::reset_to_defaults();
    }
}
