//! Address allocation constants.

/// QEMU's locally-administered OUI.
pub const MAC_OUI: [u8; 3] = [0x52, 0x54, 0x00];

/// Fixed fleet bytes following the OUI.
///
/// Keeps fleet NICs clear of QEMU's default `52:54:00:12:34:56`.
pub const MAC_FLEET_BYTES: [u8; 2] = [0xf1, 0x33];

/// Offset added to the instance index to form the last MAC byte.
pub const MAC_BASE_OFFSET: u8 = 0x10;

/// Number of distinct last-byte values, and so the largest fleet with unique MACs.
pub const MAX_FLEET_SIZE: u32 = 256;

/// Default CIDR prefix length for the instance network.
pub const DEFAULT_PREFIX_LEN: u8 = 24;
