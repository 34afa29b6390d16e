//! Advisory single-writer ownership record.
//!
//! The owner is a `(host, process)` pair kept in the root attributes
//! `Process_Machine` and `Process_ID`. Empty values mean unowned. The record
//! is a compare-and-claim protocol between cooperating processes, not a
//! kernel lock: every mutation re-reads it first.

use super::schema::{read_attr_string, write_attr_string};
use crate::Result;
use hdf5::Group;
use std::fmt;

pub(crate) const MACHINE_ATTR: &str = "Process_Machine";
pub(crate) const PROCESS_ATTR: &str = "Process_ID";

/// Identity of a store writer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Owner {
    pub host: String,
    pub process: u32,
}

impl Owner {
    pub fn new(host: impl Into<String>, process: u32) -> Self {
        Self {
            host: host.into(),
            process,
        }
    }

    /// The calling process on this host.
    #[must_use]
    pub fn current() -> Self {
        let host = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "localhost".to_string());
        Self::new(host, std::process::id())
    }
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.process)
    }
}

/// Reads the recorded owner, `None` when the store is unowned.
pub(crate) fn read_owner(root: &Group) -> Result<Option<Owner>> {
    let host = read_attr_string(root, MACHINE_ATTR)?.unwrap_or_default();
    if host.is_empty() {
        return Ok(None);
    }
    let process = read_attr_string(root, PROCESS_ATTR)?
        .and_then(|p| p.trim().parse().ok())
        .unwrap_or(0);
    Ok(Some(Owner { host, process }))
}

/// Records `owner`, or clears the record with `None`.
pub(crate) fn write_owner(root: &Group, owner: Option<&Owner>) -> Result<()> {
    let (host, process) = owner.map_or((String::new(), String::new()), |o| {
        (o.host.clone(), o.process.to_string())
    });
    write_attr_string(root, MACHINE_ATTR, &host)?;
    write_attr_string(root, PROCESS_ATTR, &process)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_owner_display() {
        assert_eq!(Owner::new("beamline", 4242).to_string(), "beamline:4242");
    }

    #[test]
    fn test_current_owner_uses_this_process() {
        let owner = Owner::current();
        assert_eq!(owner.process, std::process::id());
        assert!(!owner.host.is_empty());
    }

    #[test]
    fn test_owner_attrs_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let file = hdf5::File::create(dir.path().join("owner.h5")).unwrap();
        let root = file.create_group("xrfmap").unwrap();
        assert_eq!(read_owner(&root).unwrap(), None);

        let owner = Owner::new("host-a", 17);
        write_owner(&root, Some(&owner)).unwrap();
        assert_eq!(read_owner(&root).unwrap(), Some(owner));

        write_owner(&root, None).unwrap();
        assert_eq!(read_owner(&root).unwrap(), None);
    }
}
