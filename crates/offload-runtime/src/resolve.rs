//! Symbol resolution
//!
//! Maps each host entry onto the same-named entry of a loaded image and
//! produces a [`ResolvedTable`] in host order.
//!
//! | host entry                    | image entry           | result                 |
//! |-------------------------------|-----------------------|------------------------|
//! | any                           | present, same kind    | device address copied  |
//! | any                           | present, other kind   | `MalformedBinary`      |
//! | global                        | present, size differs | `MalformedBinary` (*)  |
//! | `WEAK`                        | missing or null       | null address           |
//! | not `WEAK`                    | missing or null       | `UnresolvedSymbol`     |
//!
//! (*) only when [`ResolveOptions::check_global_sizes`] is set.

use std::collections::HashMap;

use crate::backend::DeviceHandle;
use crate::entry::{DeviceAddress, EntryRecord};
use crate::error::{OffloadError, Result};
use crate::table::ResolvedTable;

/// Knobs for [`resolve_entries`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolveOptions {
    /// Require host and device globals to agree on size
    pub check_global_sizes: bool,
}

impl Default for ResolveOptions {
    fn default() -> Self {
        Self {
            check_global_sizes: true,
        }
    }
}

/// Resolve host entries against the entries of a loaded image
///
/// `device_entries` must carry the addresses the backend assigned. The
/// returned table has one entry per host entry, in host order; each entry
/// keeps the host's name, size and flags with the device address filled in.
///
/// # Errors
///
/// `MalformedBinary` if names or kinds do not correspond, `UnresolvedSymbol`
/// for the first required symbol without a device definition. No table is
/// produced on error.
#[tracing::instrument(skip(host_entries, device_entries), fields(host = host_entries.len(), image = device_entries.len()))]
pub fn resolve_entries(
    host_entries: &[EntryRecord],
    device_entries: &[EntryRecord],
    options: ResolveOptions,
    device: DeviceHandle,
) -> Result<ResolvedTable> {
    let mut by_name: HashMap<&str, &EntryRecord> = HashMap::with_capacity(device_entries.len());
    for entry in device_entries {
        if by_name.insert(entry.name.as_str(), entry).is_some() {
            return Err(OffloadError::malformed(format!(
                "loaded image defines symbol '{}' more than once",
                entry.name
            )));
        }
    }

    let mut resolved = Vec::with_capacity(host_entries.len());
    for host in host_entries {
        let address = match by_name.get(host.name.as_str()) {
            Some(found) => {
                if found.kind() != host.kind() {
                    return Err(OffloadError::malformed(format!(
                        "symbol '{}' is a {} on the host but a {} in the image",
                        host.name,
                        host.kind(),
                        found.kind()
                    )));
                }
                if options.check_global_sizes && found.size != host.size {
                    return Err(OffloadError::malformed(format!(
                        "global '{}' is {} bytes on the host but {} bytes in the image",
                        host.name, host.size, found.size
                    )));
                }
                found.address
            }
            None => DeviceAddress::NULL,
        };

        if address.is_null() {
            if !host.is_weak() {
                return Err(OffloadError::UnresolvedSymbol {
                    name: host.name.clone(),
                    device,
                });
            }
            tracing::debug!(symbol = %host.name, "optional symbol left unresolved");
        }

        resolved.push(host.clone().with_address(address));
    }

    Ok(ResolvedTable::from_entries(resolved))
}
