//! Offload entry records
//!
//! An entry names one offloadable symbol, either a function or a global
//! variable, and bridges the host and device namespaces. Entries appear in
//! three places: the host table of a [`BinaryDescriptor`](crate::BinaryDescriptor),
//! the table of each [`DeviceImage`](crate::DeviceImage), and the
//! [`ResolvedTable`](crate::ResolvedTable) produced by loading.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use serde::{Deserialize, Serialize};

/// Opaque host or device address
///
/// The runtime never dereferences addresses; it only copies them between
/// tables. Zero is the null address.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceAddress(pub u64);

impl DeviceAddress {
    /// The null address
    pub const NULL: Self = DeviceAddress(0);

    /// Create a new address
    pub const fn new(raw: u64) -> Self {
        DeviceAddress(raw)
    }

    /// Get the raw address value
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Check whether this is the null address
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Bit-set of entry flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryFlags(u32);

impl EntryFlags {
    /// No flags set
    pub const NONE: Self = EntryFlags(0);
    /// Entry requires link resolution (the device holds a reference to host storage)
    pub const LINK: Self = EntryFlags(0x01);
    /// Entry is a device constructor
    pub const CTOR: Self = EntryFlags(0x02);
    /// Entry is a device destructor
    pub const DTOR: Self = EntryFlags(0x04);
    /// Entry may be called indirectly through a function pointer
    pub const INDIRECT: Self = EntryFlags(0x08);
    /// Entry is optional; an image without a definition resolves it to null
    pub const WEAK: Self = EntryFlags(0x20);

    /// Create flags from raw bits; unknown bits are preserved
    pub const fn from_bits(bits: u32) -> Self {
        EntryFlags(bits)
    }

    /// Get the raw bits
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Check whether every bit of `other` is set
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Check whether no bits are set
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for EntryFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        EntryFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for EntryFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for EntryFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// What an entry denotes, derived from its size
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    /// Executable code (size 0)
    Function,
    /// Data object whose device storage is exactly `size` bytes
    Global,
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryKind::Function => write!(f, "function"),
            EntryKind::Global => write!(f, "global"),
        }
    }
}

/// Record of an offloadable function or global variable
///
/// `size == 0` denotes a function entry; `size > 0` denotes a global whose
/// device storage must be exactly `size` bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntryRecord {
    /// Host or device address, null until resolved on a device
    #[serde(default)]
    pub address: DeviceAddress,
    /// Symbol name, the key used to align host and device tables
    pub name: String,
    /// Size in bytes (0 for functions)
    #[serde(default)]
    pub size: u64,
    /// Entry flags
    #[serde(default)]
    pub flags: EntryFlags,
    /// Runtime-private scratch value
    #[serde(default)]
    pub reserved: i32,
}

impl EntryRecord {
    /// Create a function entry with a null address
    pub fn function(name: impl Into<String>) -> Self {
        Self {
            address: DeviceAddress::NULL,
            name: name.into(),
            size: 0,
            flags: EntryFlags::NONE,
            reserved: 0,
        }
    }

    /// Create a global entry of `size` bytes with a null address
    pub fn global(name: impl Into<String>, size: u64) -> Self {
        Self {
            address: DeviceAddress::NULL,
            name: name.into(),
            size,
            flags: EntryFlags::NONE,
            reserved: 0,
        }
    }

    /// Set the address
    pub fn with_address(mut self, address: DeviceAddress) -> Self {
        self.address = address;
        self
    }

    /// Add flags
    pub fn with_flags(mut self, flags: EntryFlags) -> Self {
        self.flags |= flags;
        self
    }

    /// Whether the entry denotes a function or a global
    pub fn kind(&self) -> EntryKind {
        if self.size == 0 {
            EntryKind::Function
        } else {
            EntryKind::Global
        }
    }

    /// Check whether the entry is optional
    pub fn is_weak(&self) -> bool {
        self.flags.contains(EntryFlags::WEAK)
    }
}

impl fmt::Display for EntryRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} @ {}", self.kind(), self.name, self.address)?;
        if self.size > 0 {
            write!(f, " ({} bytes)", self.size)?;
        }
        Ok(())
    }
}
