//! Disk descriptor parsing.
//!
//! Descriptors look like `local-lvm:vm-105-disk-0,size=32G,ssd=1`. Size
//! suffixes `K`, `M`, `G` and `T` are binary multiples; a bare number is bytes.
//! This is the only place sizes are parsed.

use crate::error::{GatewayError, Result};

pub const KIB: u64 = 1024;
pub const MIB: u64 = KIB * 1024;
pub const GIB: u64 = MIB * 1024;
pub const TIB: u64 = GIB * 1024;

/// Tolerance under which a disk counts as already at its target size.
pub const RESIZE_TOLERANCE_BYTES: u64 = MIB;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskDescriptor {
    pub storage: String,
    pub volume: String,
    pub size_bytes: Option<u64>,
}

impl DiskDescriptor {
    pub fn parse(raw: &str) -> Result<Self> {
        let mut parts = raw.split(',');
        let location = parts.next().unwrap_or_default();
        let (storage, volume) = location
            .split_once(':')
            .ok_or_else(|| GatewayError::Decode(format!("Malformed disk descriptor: {raw}")))?;

        let mut size_bytes = None;
        for option in parts {
            if let Some(size) = option.trim().strip_prefix("size=") {
                size_bytes = Some(parse_size_bytes(size)?);
            }
        }

        Ok(Self {
            storage: storage.to_string(),
            volume: volume.to_string(),
            size_bytes,
        })
    }

    /// True when the disk is within [`RESIZE_TOLERANCE_BYTES`] of `target_bytes` or larger.
    pub fn satisfies(&self, target_bytes: u64) -> bool {
        self.size_bytes
            .is_some_and(|current| current >= target_bytes.saturating_sub(RESIZE_TOLERANCE_BYTES))
    }
}

/// Parse `<N><unit>` where unit is one of `T`, `G`, `M`, `K` or absent (bytes).
/// Fractional values are accepted (`1.5G`) and truncated to whole bytes.
pub fn parse_size_bytes(raw: &str) -> Result<u64> {
    let raw = raw.trim();
    let (number, multiplier) = match raw.chars().last() {
        Some('T' | 't') => (&raw[..raw.len() - 1], TIB),
        Some('G' | 'g') => (&raw[..raw.len() - 1], GIB),
        Some('M' | 'm') => (&raw[..raw.len() - 1], MIB),
        Some('K' | 'k') => (&raw[..raw.len() - 1], KIB),
        Some(c) if c.is_ascii_digit() => (raw, 1),
        _ => return Err(GatewayError::Decode(format!("Invalid disk size: '{raw}'"))),
    };

    if let Ok(whole) = number.parse::<u64>() {
        return whole
            .checked_mul(multiplier)
            .ok_or_else(|| GatewayError::Decode(format!("Disk size overflows: '{raw}'")));
    }

    let value: f64 = number
        .parse()
        .map_err(|_| GatewayError::Decode(format!("Invalid disk size: '{raw}'")))?;
    if !value.is_finite() || value < 0.0 {
        return Err(GatewayError::Decode(format!("Invalid disk size: '{raw}'")));
    }
    Ok((value * multiplier as f64) as u64)
}

/// Render a byte count with the largest suffix that represents it exactly.
pub fn format_size(bytes: u64) -> String {
    for (unit, suffix) in [(TIB, "T"), (GIB, "G"), (MIB, "M"), (KIB, "K")] {
        if bytes >= unit && bytes % unit == 0 {
            return format!("{}{}", bytes / unit, suffix);
        }
    }
    bytes.to_string()
}
