//! Fixed-layout views for the dynamic plugin boundary
//!
//! These `#[repr(C)]` records are what host code generators and separately
//! compiled plugins exchange. They carry explicit widths and raw ranges and
//! own nothing. [`BinaryDescriptor::from_raw`] copies a raw descriptor into
//! owned data; [`RawTableStorage`] goes the other way for a resolved table.
//!
//! ```text
//! RawBinaryDescriptor
//! ├── num_device_images: i32
//! ├── device_images ──► [RawDeviceImage; n]
//! │                      ├── image_start..image_end        code bytes
//! │                      └── entries_begin..entries_end ──► [RawOffloadEntry]
//! └── host_entries_begin..host_entries_end ──► [RawOffloadEntry]
//!
//! image_infos ──► [RawImageInfo; n]   parallel to device_images
//! ```

use std::ffi::{c_char, c_void, CStr, CString};
use std::ptr;
use std::slice;

use crate::backend::DeviceHandle;
use crate::binary::{BinaryDescriptor, DeviceImage, ImageInfo};
use crate::entry::{DeviceAddress, EntryFlags, EntryRecord};
use crate::error::{OffloadError, Result};
use crate::table::ResolvedTable;

/// Version of the record layouts in this module
pub const ABI_VERSION: u32 = 1;

/// One offloadable symbol
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RawOffloadEntry {
    pub addr: *mut c_void,
    /// NUL-terminated symbol name
    pub name: *const c_char,
    /// 0 for functions
    pub size: usize,
    pub flags: i32,
    pub reserved: i32,
}

/// One device image
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RawDeviceImage {
    pub image_start: *const c_void,
    pub image_end: *const c_void,
    pub entries_begin: *const RawOffloadEntry,
    pub entries_end: *const RawOffloadEntry,
}

/// Architecture tag of one device image
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RawImageInfo {
    /// NUL-terminated architecture tag
    pub arch: *const c_char,
}

/// Every device image of one host translation unit
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RawBinaryDescriptor {
    pub num_device_images: i32,
    pub device_images: *const RawDeviceImage,
    pub host_entries_begin: *const RawOffloadEntry,
    pub host_entries_end: *const RawOffloadEntry,
}

/// Device handle as it crosses the boundary
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawDeviceInfo {
    pub context: u64,
    pub device: u64,
}

impl From<RawDeviceInfo> for DeviceHandle {
    fn from(raw: RawDeviceInfo) -> Self {
        DeviceHandle::new(raw.context, raw.device)
    }
}

impl From<DeviceHandle> for RawDeviceInfo {
    fn from(handle: DeviceHandle) -> Self {
        RawDeviceInfo {
            context: handle.context,
            device: handle.device,
        }
    }
}

/// Resolved entries as a raw range
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RawTargetTable {
    pub entries_begin: *const RawOffloadEntry,
    pub entries_end: *const RawOffloadEntry,
}

/// Borrow the range `[begin, end)` as a slice
///
/// # Safety
///
/// Both pointers must come from the same live allocation of `T`.
unsafe fn range<'a, T>(begin: *const T, end: *const T, what: &str) -> Result<&'a [T]> {
    if begin.is_null() || end.is_null() {
        if begin == end {
            return Ok(&[]);
        }
        return Err(OffloadError::invalid_abi(format!("{what}: one end of the range is null")));
    }
    let len = end.offset_from(begin);
    if len < 0 {
        return Err(OffloadError::invalid_abi(format!("{what}: range end precedes its start")));
    }
    Ok(slice::from_raw_parts(begin, len as usize))
}

/// # Safety
///
/// `ptr` must be null or point to a NUL-terminated string.
unsafe fn c_string(ptr: *const c_char, what: &str) -> Result<String> {
    if ptr.is_null() {
        return Err(OffloadError::invalid_abi(format!("{what} is null")));
    }
    CStr::from_ptr(ptr)
        .to_str()
        .map(str::to_owned)
        .map_err(|e| OffloadError::invalid_abi(format!("{what} is not UTF-8: {e}")))
}

impl RawOffloadEntry {
    /// Copy into an owned record
    ///
    /// # Safety
    ///
    /// `name` must be null or a valid NUL-terminated string.
    pub unsafe fn to_entry(&self) -> Result<EntryRecord> {
        let name = c_string(self.name, "entry name")?;
        Ok(EntryRecord {
            address: DeviceAddress::new(self.addr as usize as u64),
            name,
            size: self.size as u64,
            flags: EntryFlags::from_bits(self.flags as u32),
            reserved: self.reserved,
        })
    }
}

unsafe fn entries(begin: *const RawOffloadEntry, end: *const RawOffloadEntry, what: &str) -> Result<Vec<EntryRecord>> {
    range(begin, end, what)?.iter().map(|raw| raw.to_entry()).collect()
}

impl BinaryDescriptor {
    /// Copy a raw descriptor and its parallel image-info array into owned data
    ///
    /// # Safety
    ///
    /// `desc` must point to a valid [`RawBinaryDescriptor`] whose ranges and
    /// strings are live for the duration of the call, and `infos` must point
    /// to `num_device_images` [`RawImageInfo`] records (it may be null when
    /// there are no images).
    ///
    /// # Errors
    ///
    /// `InvalidAbi` for null pointers, a negative image count, inverted
    /// ranges or non-UTF-8 strings.
    pub unsafe fn from_raw(desc: *const RawBinaryDescriptor, infos: *const RawImageInfo) -> Result<Self> {
        let desc = desc
            .as_ref()
            .ok_or_else(|| OffloadError::invalid_abi("binary descriptor is null"))?;
        let count = usize::try_from(desc.num_device_images)
            .map_err(|_| OffloadError::invalid_abi(format!("negative image count {}", desc.num_device_images)))?;

        let mut images = Vec::with_capacity(count);
        if count > 0 {
            if desc.device_images.is_null() || infos.is_null() {
                return Err(OffloadError::invalid_abi("device image array is null"));
            }
            let raw_images = slice::from_raw_parts(desc.device_images, count);
            let raw_infos = slice::from_raw_parts(infos, count);

            for (index, (raw, info)) in raw_images.iter().zip(raw_infos).enumerate() {
                let code = range(raw.image_start as *const u8, raw.image_end as *const u8, "image code")?;
                images.push(DeviceImage {
                    info: ImageInfo::new(c_string(info.arch, "image architecture")?),
                    code: code.to_vec(),
                    entries: entries(raw.entries_begin, raw.entries_end, &format!("image {index} entries"))?,
                });
            }
        }

        Ok(BinaryDescriptor {
            images,
            host_entries: entries(desc.host_entries_begin, desc.host_entries_end, "host entries")?,
        })
    }
}

/// Owns the storage behind a [`RawTargetTable`]
///
/// The raw view stays valid for as long as this value lives.
#[derive(Debug)]
pub struct RawTableStorage {
    entries: Vec<RawOffloadEntry>,
    _names: Vec<CString>,
}

// The raw pointers only reference `_names`, which moves with the storage.
unsafe impl Send for RawTableStorage {}
unsafe impl Sync for RawTableStorage {}

impl RawTableStorage {
    /// Build raw entries for a resolved table
    ///
    /// # Errors
    ///
    /// `InvalidAbi` if a symbol name contains an interior NUL.
    pub fn new(table: &ResolvedTable) -> Result<Self> {
        let names = table
            .iter()
            .map(|entry| {
                CString::new(entry.name.as_str())
                    .map_err(|_| OffloadError::invalid_abi(format!("symbol '{}' contains NUL", entry.name)))
            })
            .collect::<Result<Vec<_>>>()?;

        let entries = table
            .iter()
            .zip(&names)
            .map(|(entry, name)| RawOffloadEntry {
                addr: entry.address.raw() as usize as *mut c_void,
                name: name.as_ptr(),
                size: entry.size as usize,
                flags: entry.flags.bits() as i32,
                reserved: entry.reserved,
            })
            .collect();

        Ok(Self { entries, _names: names })
    }

    pub fn as_raw(&self) -> RawTargetTable {
        if self.entries.is_empty() {
            return RawTargetTable {
                entries_begin: ptr::null(),
                entries_end: ptr::null(),
            };
        }
        let range = self.entries.as_ptr_range();
        RawTargetTable {
            entries_begin: range.start,
            entries_end: range.end,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_entry(name: &CStr, size: usize, flags: i32) -> RawOffloadEntry {
        RawOffloadEntry {
            addr: ptr::null_mut(),
            name: name.as_ptr(),
            size,
            flags,
            reserved: 0,
        }
    }

    #[test]
    fn test_from_raw_copies_everything() {
        let kernel = CString::new("kernel1").unwrap();
        let gvar = CString::new("gvar").unwrap();
        let arch = CString::new("arch-x").unwrap();
        let code = [0xdeu8, 0xad, 0xbe, 0xef];

        let image_entries = [raw_entry(&kernel, 0, 0), raw_entry(&gvar, 64, 0)];
        let host_entries = [raw_entry(&kernel, 0, 0), raw_entry(&gvar, 64, EntryFlags::WEAK.bits() as i32)];
        let code_range = code.as_ptr_range();
        let image_range = image_entries.as_ptr_range();
        let host_range = host_entries.as_ptr_range();

        let images = [RawDeviceImage {
            image_start: code_range.start as *const c_void,
            image_end: code_range.end as *const c_void,
            entries_begin: image_range.start,
            entries_end: image_range.end,
        }];
        let infos = [RawImageInfo { arch: arch.as_ptr() }];
        let raw = RawBinaryDescriptor {
            num_device_images: 1,
            device_images: images.as_ptr(),
            host_entries_begin: host_range.start,
            host_entries_end: host_range.end,
        };

        let desc = unsafe { BinaryDescriptor::from_raw(&raw, infos.as_ptr()) }.unwrap();
        assert_eq!(desc.architectures(), vec!["arch-x".to_string()]);
        assert_eq!(desc.images[0].code(), &code);
        assert_eq!(desc.images[0].entries.len(), 2);
        assert_eq!(desc.host_entries[1].size, 64);
        assert!(desc.host_entries[1].is_weak());
    }

    #[test]
    fn test_from_raw_rejects_bad_input() {
        assert!(matches!(
            unsafe { BinaryDescriptor::from_raw(ptr::null(), ptr::null()) },
            Err(OffloadError::InvalidAbi(_))
        ));

        let negative = RawBinaryDescriptor {
            num_device_images: -1,
            device_images: ptr::null(),
            host_entries_begin: ptr::null(),
            host_entries_end: ptr::null(),
        };
        assert!(unsafe { BinaryDescriptor::from_raw(&negative, ptr::null()) }.is_err());

        let name = CString::new("k").unwrap();
        let host = [raw_entry(&name, 0, 0), raw_entry(&name, 0, 0)];
        let range = host.as_ptr_range();
        let inverted = RawBinaryDescriptor {
            num_device_images: 0,
            device_images: ptr::null(),
            host_entries_begin: range.end,
            host_entries_end: range.start,
        };
        assert!(unsafe { BinaryDescriptor::from_raw(&inverted, ptr::null()) }.is_err());

        let half_null = RawBinaryDescriptor {
            host_entries_begin: range.start,
            host_entries_end: ptr::null(),
            ..inverted
        };
        assert!(unsafe { BinaryDescriptor::from_raw(&half_null, ptr::null()) }.is_err());
    }

    #[test]
    fn test_host_only_descriptor() {
        let raw = RawBinaryDescriptor {
            num_device_images: 0,
            device_images: ptr::null(),
            host_entries_begin: ptr::null(),
            host_entries_end: ptr::null(),
        };
        let desc = unsafe { BinaryDescriptor::from_raw(&raw, ptr::null()) }.unwrap();
        assert!(desc.is_host_only());
        assert!(desc.host_entries.is_empty());
    }

    #[test]
    fn test_table_storage_view() {
        let table = ResolvedTable::from_entries(vec![
            EntryRecord::function("kernel1").with_address(DeviceAddress::new(0x1000)),
            EntryRecord::global("gvar", 64).with_address(DeviceAddress::new(0x1010)),
        ]);
        let storage = RawTableStorage::new(&table).unwrap();
        let view = storage.as_raw();

        let raw = unsafe { range(view.entries_begin, view.entries_end, "table") }.unwrap();
        assert_eq!(raw.len(), 2);
        let back: Vec<EntryRecord> = raw.iter().map(|e| unsafe { e.to_entry() }.unwrap()).collect();
        assert_eq!(back, table.entries());

        let empty = RawTableStorage::new(&ResolvedTable::default()).unwrap();
        assert!(empty.as_raw().entries_begin.is_null());
    }

    #[test]
    fn test_device_info_conversion() {
        let handle: DeviceHandle = RawDeviceInfo { context: 1, device: 2 }.into();
        assert_eq!(handle, DeviceHandle::new(1, 2));
        assert_eq!(RawDeviceInfo::from(handle), RawDeviceInfo { context: 1, device: 2 });
    }
}
