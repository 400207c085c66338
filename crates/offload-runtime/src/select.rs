//! Architecture selection
//!
//! Picks the one device image whose architecture tag exactly matches the
//! architecture a device reports. There is no fallback to a "close" match.

use std::collections::HashSet;

use crate::binary::{BinaryDescriptor, DeviceImage};
use crate::error::{OffloadError, Result};

/// Select the image built for `architecture`
///
/// The whole descriptor is checked for duplicated tags first, so the result
/// does not depend on image order.
///
/// # Errors
///
/// - `DuplicateImage` if two images share a tag
/// - `NoCompatibleImage` if no image matches exactly
pub fn select_image<'a>(descriptor: &'a BinaryDescriptor, architecture: &str) -> Result<&'a DeviceImage> {
    let mut seen = HashSet::with_capacity(descriptor.images.len());
    for image in &descriptor.images {
        if !seen.insert(image.architecture()) {
            return Err(OffloadError::DuplicateImage {
                architecture: image.architecture().to_string(),
            });
        }
    }

    descriptor
        .images
        .iter()
        .find(|image| image.architecture() == architecture)
        .ok_or_else(|| OffloadError::NoCompatibleImage {
            architecture: architecture.to_string(),
            available: descriptor.architectures(),
        })
}
