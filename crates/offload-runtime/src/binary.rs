//! Device images and binary descriptors
//!
//! A [`BinaryDescriptor`] aggregates every [`DeviceImage`] produced for one
//! host translation or link unit together with the host-side entry table that
//! mirrors them. Descriptors are built once when the program or module loads,
//! are immutable afterwards, and are shared read-only with every device.
//!
//! ```text
//! BinaryDescriptor
//! ├── images[0]  ImageInfo{"sm_90"}   code + entries
//! ├── images[1]  ImageInfo{"gfx942"}  code + entries
//! └── host_entries                    name-aligned with each image
//! ```

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::entry::EntryRecord;
use crate::error::{OffloadError, Result};

/// Architecture tag used to pick which image a backend should load
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageInfo {
    pub architecture: String,
}

impl ImageInfo {
    pub fn new(architecture: impl Into<String>) -> Self {
        Self {
            architecture: architecture.into(),
        }
    }
}

impl fmt::Display for ImageInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.architecture)
    }
}

/// One architecture-specific compiled unit of offloadable code
///
/// `entries` describes exactly the symbols defined inside `code`. The
/// [`ImageInfo`] travels alongside the image for selection and is never
/// handed to the backend as part of the load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceImage {
    pub info: ImageInfo,
    #[serde(default)]
    pub code: Vec<u8>,
    #[serde(default)]
    pub entries: Vec<EntryRecord>,
}

impl DeviceImage {
    /// Create an image for `architecture`
    pub fn new(architecture: impl Into<String>, code: Vec<u8>, entries: Vec<EntryRecord>) -> Self {
        Self {
            info: ImageInfo::new(architecture),
            code,
            entries,
        }
    }

    /// Architecture tag of this image
    pub fn architecture(&self) -> &str {
        &self.info.architecture
    }

    /// Code blob, the `[start, end)` range of the image
    pub fn code(&self) -> &[u8] {
        &self.code
    }

    /// Find an entry by name
    pub fn entry(&self, name: &str) -> Option<&EntryRecord> {
        self.entries.iter().find(|entry| entry.name == name)
    }

    /// Check that every symbol is defined at most once
    ///
    /// # Errors
    ///
    /// Returns `MalformedBinary` naming the first duplicated symbol.
    pub fn check_entries(&self) -> Result<()> {
        check_unique_names(&self.entries).map_err(|name| {
            OffloadError::malformed(format!(
                "image '{}' defines symbol '{}' more than once",
                self.info.architecture, name
            ))
        })
    }
}

/// All device images for one host translation unit plus the mirrored host entries
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinaryDescriptor {
    #[serde(default)]
    pub images: Vec<DeviceImage>,
    #[serde(default)]
    pub host_entries: Vec<EntryRecord>,
}

impl BinaryDescriptor {
    /// Create an empty (host-only) descriptor
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a device image
    pub fn with_image(mut self, image: DeviceImage) -> Self {
        self.images.push(image);
        self
    }

    /// Add a host entry
    pub fn with_host_entry(mut self, entry: EntryRecord) -> Self {
        self.host_entries.push(entry);
        self
    }

    /// Parse a descriptor from JSON
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| OffloadError::malformed(format!("descriptor JSON: {e}")))
    }

    /// Check whether the unit carries no device code
    pub fn is_host_only(&self) -> bool {
        self.images.is_empty()
    }

    /// Architecture tags of all images, in image order
    pub fn architectures(&self) -> Vec<String> {
        self.images.iter().map(|image| image.info.architecture.clone()).collect()
    }

    /// Check that host entry names are unique
    ///
    /// # Errors
    ///
    /// Returns `MalformedBinary` naming the first duplicated symbol.
    pub fn check_host_entries(&self) -> Result<()> {
        check_unique_names(&self.host_entries)
            .map_err(|name| OffloadError::malformed(format!("host table lists symbol '{name}' more than once")))
    }
}

fn check_unique_names(entries: &[EntryRecord]) -> std::result::Result<(), String> {
    let mut seen = HashSet::with_capacity(entries.len());
    for entry in entries {
        if !seen.insert(entry.name.as_str()) {
            return Err(entry.name.clone());
        }
    }
    Ok(())
}
