/// Operating-system → hypervisor template lookup shared across API/Orchestrator.
///
/// Kept small on purpose: a flat table of normalised OS keys to template vmids.
use std::collections::BTreeMap;

// Templates prepared on every node of the cluster.
pub const DEFAULT_TEMPLATES: &str =
    "ubuntu-22.04=9000,ubuntu-20.04=9001,centos-8=9002,debian-11=9003,fedora-37=9004";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TemplateTableError {
    #[error("template entry '{0}' is not of the form os=vmid")]
    MalformedEntry(String),
    #[error("template vmid '{0}' is not a number")]
    InvalidVmid(String),
}

/// Normalise a display name to a lookup key.
///
/// - Lowercases
/// - Drops a trailing `LTS` marker
/// - Joins words with `-` ("Ubuntu 22.04 LTS" → "ubuntu-22.04")
pub fn normalize_os_name(raw: &str) -> String {
    raw.split(|c: char| c.is_whitespace() || c == '-' || c == '_')
        .map(|s| s.trim().to_ascii_lowercase())
        .filter(|s| !s.is_empty() && s != "lts")
        .collect::<Vec<_>>()
        .join("-")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateTable {
    entries: BTreeMap<String, u32>,
}

impl Default for TemplateTable {
    fn default() -> Self {
        // DEFAULT_TEMPLATES is a well-formed constant.
        Self::parse(Some(DEFAULT_TEMPLATES)).unwrap_or_else(|_| Self {
            entries: BTreeMap::new(),
        })
    }
}

impl TemplateTable {
    /// Parse comma-separated `os=vmid` pairs.
    ///
    /// - Trims whitespace
    /// - Drops empty entries
    /// - If input is empty/None, returns the default table
    pub fn parse(raw: Option<&str>) -> Result<Self, TemplateTableError> {
        let raw = raw.map(str::trim).filter(|s| !s.is_empty());
        let raw = raw.unwrap_or(DEFAULT_TEMPLATES);

        let mut entries = BTreeMap::new();
        for entry in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let (os, vmid) = entry
                .split_once('=')
                .ok_or_else(|| TemplateTableError::MalformedEntry(entry.to_string()))?;
            let vmid: u32 = vmid
                .trim()
                .parse()
                .map_err(|_| TemplateTableError::InvalidVmid(vmid.trim().to_string()))?;
            entries.insert(normalize_os_name(os), vmid);
        }
        Ok(Self { entries })
    }

    /// Template vmid for an OS display name. Unknown names return None; callers
    /// must not fall back to a default image.
    pub fn lookup(&self, os: &str) -> Option<u32> {
        self.entries.get(&normalize_os_name(os)).copied()
    }

    pub fn os_names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_display_names() {
        assert_eq!(normalize_os_name("Ubuntu 22.04 LTS"), "ubuntu-22.04");
        assert_eq!(normalize_os_name("  debian_11 "), "debian-11");
        assert_eq!(normalize_os_name("CentOS-8"), "centos-8");
    }

    #[test]
    fn default_table_resolves_known_systems() {
        let t = TemplateTable::default();
        assert_eq!(t.lookup("Ubuntu 22.04 LTS"), Some(9000));
        assert_eq!(t.lookup("ubuntu-20.04"), Some(9001));
        assert_eq!(t.lookup("Fedora 37"), Some(9004));
        assert_eq!(t.lookup("windows-2022"), None);
    }

    #[test]
    fn custom_table_parsing() {
        let t = TemplateTable::parse(Some(" alpine-3.19 = 8000 , ,rocky-9=8001")).unwrap();
        assert_eq!(t.lookup("Alpine 3.19"), Some(8000));
        assert_eq!(t.lookup("rocky 9"), Some(8001));
        assert_eq!(t.lookup("ubuntu-22.04"), None);

        assert_eq!(
            TemplateTable::parse(Some("ubuntu")),
            Err(TemplateTableError::MalformedEntry("ubuntu".to_string()))
        );
        assert_eq!(
            TemplateTable::parse(Some("ubuntu=abc")),
            Err(TemplateTableError::InvalidVmid("abc".to_string()))
        );
        assert_eq!(TemplateTable::parse(None).unwrap(), TemplateTable::default());
    }
}
