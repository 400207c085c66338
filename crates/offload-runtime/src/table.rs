//! Resolved entry tables
//!
//! A [`ResolvedTable`] is the post-load mapping from symbol name to
//! device-valid address for one (binary, device) pairing. Its entries follow
//! the order of the descriptor's host entries.

use serde::{Deserialize, Serialize};

use crate::entry::{DeviceAddress, EntryRecord};

/// Host entries with addresses valid on one device
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedTable {
    entries: Vec<EntryRecord>,
}

impl ResolvedTable {
    pub(crate) fn from_entries(entries: Vec<EntryRecord>) -> Self {
        Self { entries }
    }

    /// Entries in host order
    pub fn entries(&self) -> &[EntryRecord] {
        &self.entries
    }

    /// Find an entry by name
    pub fn get(&self, name: &str) -> Option<&EntryRecord> {
        self.entries.iter().find(|entry| entry.name == name)
    }

    /// Device address of a symbol; `None` if the name is not in the table.
    ///
    /// An optional symbol without a device definition yields `Some(NULL)`.
    pub fn address_of(&self, name: &str) -> Option<DeviceAddress> {
        self.get(name).map(|entry| entry.address)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, EntryRecord> {
        self.entries.iter()
    }
}

impl<'a> IntoIterator for &'a ResolvedTable {
    type Item = &'a EntryRecord;
    type IntoIter = std::slice::Iter<'a, EntryRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}
