//! Flat record cache: one `name|status|location|group` line per VM.

use std::path::Path;

use facet::Facet;

use crate::error::VmctlError;

#[derive(Debug, Clone, PartialEq, Eq, Facet)]
pub struct Record {
    pub name: String,
    pub status: String,
    /// Endpoint the VM lives on.
    pub location: String,
    pub group: String,
}

fn clean(field: &str) -> String {
    field
        .chars()
        .map(|c| if matches!(c, '|' | '\n' | '\r') { ' ' } else { c })
        .collect::<String>()
        .trim()
        .to_string()
}

impl Record {
    pub fn new(name: &str, status: &str, location: &str, group: &str) -> Self {
        Self {
            name: clean(name),
            status: clean(status),
            location: clean(location),
            group: clean(group),
        }
    }

    /// Parse one cache line. Anything other than exactly four fields with a
    /// non-empty name is rejected.
    pub fn parse_line(line: &str) -> Option<Self> {
        let fields: Vec<&str> = line.split('|').collect();
        let [name, status, location, group] = fields.as_slice() else {
            return None;
        };
        let name = name.trim();
        if name.is_empty() {
            return None;
        }
        Some(Self {
            name: name.to_string(),
            status: status.trim().to_string(),
            location: location.trim().to_string(),
            group: group.trim().to_string(),
        })
    }

    pub fn to_line(&self) -> String {
        format!(
            "{}|{}|{}|{}",
            clean(&self.name),
            clean(&self.status),
            clean(&self.location),
            clean(&self.group)
        )
    }
}

#[derive(Debug, Clone, Default)]
pub struct Inventory {
    records: Vec<Record>,
}

impl Inventory {
    pub fn from_records(records: Vec<Record>) -> Self {
        Self { records }
    }

    pub fn parse(contents: &str) -> Self {
        let mut records = Vec::new();
        for (idx, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match Record::parse_line(line) {
                Some(record) => records.push(record),
                None => tracing::debug!(line = idx + 1, "skipping malformed inventory line"),
            }
        }
        Self { records }
    }

    pub fn load(path: &Path) -> Result<Self, VmctlError> {
        match std::fs::read_to_string(path) {
            Ok(contents) => Ok(Self::parse(&contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(VmctlError::Inventory {
                message: format!("no inventory cache at {}", path.display()),
            }),
            Err(source) => Err(VmctlError::Io {
                context: format!("failed to read {}", path.display()),
                source,
            }),
        }
    }

    /// Write the cache atomically: temp file in the same directory, then rename.
    pub fn save(&self, path: &Path) -> Result<(), VmctlError> {
        let io_err =
            |context: String| move |source: std::io::Error| VmctlError::Io { context, source };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(io_err(format!("failed to create {}", parent.display())))?;
        }

        let mut contents = String::new();
        for record in &self.records {
            contents.push_str(&record.to_line());
            contents.push('\n');
        }

        let tmp = path.with_extension(format!("tmp.{}", std::process::id()));
        std::fs::write(&tmp, contents)
            .map_err(io_err(format!("failed to write {}", tmp.display())))?;
        std::fs::rename(&tmp, path).map_err(|source| {
            let _ = std::fs::remove_file(&tmp);
            VmctlError::Io {
                context: format!("failed to replace {}", path.display()),
                source,
            }
        })
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Case-insensitive substring match on the name, sorted by name then
    /// location. An empty pattern matches everything.
    pub fn search(&self, pattern: &str) -> Vec<&Record> {
        let needle = pattern.trim().to_lowercase();
        let mut hits: Vec<&Record> = self
            .records
            .iter()
            .filter(|r| r.name.to_lowercase().contains(&needle))
            .collect();
        hits.sort_by(|a, b| {
            a.name
                .to_lowercase()
                .cmp(&b.name.to_lowercase())
                .then_with(|| a.location.cmp(&b.location))
        });
        hits
    }

    /// The single record named exactly `name`, optionally on `location`.
    pub fn find_exact(&self, name: &str, location: Option<&str>) -> Result<&Record, VmctlError> {
        let hits: Vec<&Record> = self
            .records
            .iter()
            .filter(|r| r.name == name)
            .filter(|r| location.is_none_or(|loc| r.location == loc))
            .collect();
        match hits.as_slice() {
            [] => Err(VmctlError::NotFound {
                message: match location {
                    Some(loc) => format!("no VM named '{name}' on '{loc}'"),
                    None => format!("no VM named '{name}' in the inventory"),
                },
            }),
            [one] => Ok(*one),
            many => {
                let locations: Vec<&str> = many.iter().map(|r| r.location.as_str()).collect();
                Err(VmctlError::Validation {
                    message: format!(
                        "'{name}' exists on {}; pass --location",
                        locations.join(", ")
                    ),
                })
            }
        }
    }
}
