//! `[datastore] path/file.iso` storage references
//!
//! Parsing only checks the syntax. Whether the datastore exists is checked
//! against the management plane's datastore list; whether the file exists is
//! only discovered when the media is mounted.

use serde::{Deserialize, Serialize};

use crate::controller::HypervisorControl;
use crate::error::{HypervisorError, Result};

/// A parsed datastore file reference
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatastorePath {
    pub datastore: String,
    pub path: String,
}

impl DatastorePath {
    /// Parse `[datastore] path/to/file.iso`
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if !raw.starts_with('[') || !raw.contains(']') {
            return Err(HypervisorError::InvalidPath(format!(
                "invalid ISO path format (expects [datastore] path/file.iso): {}",
                raw
            )));
        }

        let (head, tail) = raw
            .split_once(']')
            .ok_or_else(|| HypervisorError::InvalidPath(format!("could not parse ISO path: {}", raw)))?;

        let datastore = head.trim_start_matches('[').trim();
        let path = tail.trim();
        let path = path.strip_prefix('/').unwrap_or(path);

        if datastore.is_empty() || path.is_empty() {
            return Err(HypervisorError::InvalidPath(format!(
                "datastore name or file path is empty: {}",
                raw
            )));
        }

        if !path.to_lowercase().ends_with(".iso") {
            return Err(HypervisorError::InvalidPath(format!(
                "file path must end with .iso: {}",
                path
            )));
        }

        Ok(Self {
            datastore: datastore.to_string(),
            path: path.to_string(),
        })
    }

    /// Check the datastore name against a list of known datastores
    pub fn validate_against(&self, known: &[String]) -> Result<()> {
        let wanted = self.datastore.to_lowercase();
        if known.iter().any(|name| name.to_lowercase() == wanted) {
            Ok(())
        } else {
            Err(HypervisorError::DatastoreNotFound {
                name: self.datastore.clone(),
                available: known.to_vec(),
            })
        }
    }

    /// Check the datastore name against the management plane
    pub async fn validate(&self, hypervisor: &dyn HypervisorControl) -> Result<()> {
        let known = hypervisor.list_datastores().await?;
        tracing::debug!(datastore = %self.datastore, known = known.len(), "Validating ISO datastore");
        self.validate_against(&known)
    }
}

impl std::fmt::Display for DatastorePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.datastore, self.path)
    }
}

impl std::str::FromStr for DatastorePath {
    type Err = HypervisorError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid() {
        let p = DatastorePath::parse("  [datastore1] iso/windows-server-2022.iso ").unwrap();
        assert_eq!(p.datastore, "datastore1");
        assert_eq!(p.path, "iso/windows-server-2022.iso");
        assert_eq!(p.to_string(), "[datastore1] iso/windows-server-2022.iso");
    }

    #[test]
    fn test_parse_strips_leading_slash() {
        let p = DatastorePath::parse("[ds] /win2022.ISO").unwrap();
        assert_eq!(p.path, "win2022.ISO");
    }

    #[test]
    fn test_parse_rejects_bad_format() {
        assert!(matches!(
            DatastorePath::parse("datastore1/win.iso"),
            Err(HypervisorError::InvalidPath(_))
        ));
        assert!(matches!(
            DatastorePath::parse("[] win.iso"),
            Err(HypervisorError::InvalidPath(_))
        ));
        assert!(matches!(
            DatastorePath::parse("[ds1]   "),
            Err(HypervisorError::InvalidPath(_))
        ));
    }

    #[test]
    fn test_parse_requires_iso_suffix() {
        let err = DatastorePath::parse("[ds1] images/win.vmdk").unwrap_err();
        assert!(err.to_string().contains("must end with .iso"));
    }

    #[test]
    fn test_validate_against_is_case_insensitive() {
        let p = DatastorePath::parse("[DataStore1] win.iso").unwrap();
        let known = vec!["datastore1".to_string(), "nfs-iso".to_string()];
        assert!(p.validate_against(&known).is_ok());
    }

    #[test]
    fn test_validate_against_lists_available() {
        let p = DatastorePath::parse("[missing] win.iso").unwrap();
        let known = vec!["datastore1".to_string()];
        match p.validate_against(&known) {
            Err(HypervisorError::DatastoreNotFound { name, available }) => {
                assert_eq!(name, "missing");
                assert_eq!(available, known);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
