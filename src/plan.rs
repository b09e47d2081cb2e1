//! Chunk planning.
//!
//! Decides between a single PUT and a multipart transfer and computes the
//! part boundaries.  Part numbers are contiguous from 1; every part has
//! the same size except the last, which may be shorter.

use tracing::warn;

use crate::errors::UploadError;

/// One planned byte range of the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartSpec {
    /// 1-based part number.
    pub number: u32,
    /// Offset of the first byte in the source.
    pub offset: u64,
    /// Length in bytes.
    pub size: u64,
}

/// Result of planning a transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadPlan {
    /// Upload with one PutObject call.
    SingleShot { size: u64 },
    /// Upload as a multipart session.
    Multipart {
        total_size: u64,
        part_size: u64,
        parts: Vec<PartSpec>,
    },
}

impl UploadPlan {
    /// Total number of requests that move data.
    pub fn part_count(&self) -> usize {
        match self {
            UploadPlan::SingleShot { .. } => 1,
            UploadPlan::Multipart { parts, .. } => parts.len(),
        }
    }

    /// Total bytes covered by the plan.
    pub fn total_size(&self) -> u64 {
        match self {
            UploadPlan::SingleShot { size } => *size,
            UploadPlan::Multipart { total_size, .. } => *total_size,
        }
    }
}

/// Plan an upload of `total_size` bytes.
///
/// Sources up to and including `multipart_threshold` bytes use a single
/// PUT.  If `part_size` would need more than `max_parts` parts, the part
/// size grows to the smallest value that fits and a warning is logged.
pub fn plan_upload(
    total_size: u64,
    multipart_threshold: u64,
    part_size: u64,
    max_parts: u32,
) -> Result<UploadPlan, UploadError> {
    if total_size == 0 {
        return Err(UploadError::EmptyInput);
    }
    if part_size == 0 {
        return Err(UploadError::InvalidConfig("part_size must be > 0".into()));
    }
    if max_parts == 0 {
        return Err(UploadError::InvalidConfig("max_parts must be > 0".into()));
    }

    if total_size <= multipart_threshold {
        return Ok(UploadPlan::SingleShot { size: total_size });
    }

    let part_size = fit_part_size(total_size, part_size, max_parts);
    Ok(UploadPlan::Multipart {
        total_size,
        part_size,
        parts: split_parts(total_size, part_size),
    })
}

/// Smallest part size >= `requested` that keeps the part count within
/// `max_parts`.
fn fit_part_size(total_size: u64, requested: u64, max_parts: u32) -> u64 {
    let needed = total_size.div_ceil(requested);
    if needed <= u64::from(max_parts) {
        return requested;
    }
    let adjusted = total_size.div_ceil(u64::from(max_parts));
    warn!(
        total_size,
        requested_part_size = requested,
        adjusted_part_size = adjusted,
        max_parts,
        "Part size too small for part limit, increasing"
    );
    adjusted
}

/// Split `[0, total_size)` into contiguous parts of `part_size`.
pub fn split_parts(total_size: u64, part_size: u64) -> Vec<PartSpec> {
    let count = total_size.div_ceil(part_size);
    (0..count)
        .map(|i| {
            let offset = i * part_size;
            PartSpec {
                number: (i + 1) as u32,
                offset,
                size: part_size.min(total_size - offset),
            }
        })
        .collect()
}

// -- Tests -------------------------------------------------------------------
