//! Compound `<container>/<key>` locator stored in `archive_location`.

use crate::errors::ArchiveError;
use serde::Serialize;
use std::fmt;

/// Where an archived dump lives in the object store.
///
/// The first `/` is the boundary: everything before it is the container,
/// everything after it (further separators included) is the object key.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct Locator {
    pub container: String,
    pub key: String,
}

impl Locator {
    pub fn new(container: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            container: container.into(),
            key: key.into(),
        }
    }

    /// Split a stored locator at its first separator.
    ///
    /// Rejects locators with no separator, an empty container (leading `/`)
    /// or a trailing `/`.
    pub fn parse(raw: &str) -> Result<Self, ArchiveError> {
        let invalid = |reason: &str| ArchiveError::LocatorFormat {
            locator: raw.to_string(),
            reason: reason.to_string(),
        };

        let Some(pos) = raw.find('/') else {
            return Err(invalid("missing `/` between container and key"));
        };
        if pos == 0 {
            return Err(invalid("container name is empty"));
        }
        if raw.ends_with('/') {
            return Err(invalid("object key is empty or ends with `/`"));
        }

        Ok(Self::new(&raw[..pos], &raw[pos + 1..]))
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.container, self.key)
    }
}
