//! Protocol constants for EN 13757 framing and record parsing.

/// DIF mask for the data-field nibble (width/encoding).
pub const DIF_MASK_DATA: u8 = 0x0F;

/// DIF mask for the function field (instantaneous/max/min/at-error).
pub const DIF_MASK_FUNCTION: u8 = 0x30;

/// DIF bit carrying the least significant storage-number bit.
pub const DIF_MASK_STORAGE_LSB: u8 = 0x40;

/// DIFE mask for the storage-number nibble.
pub const DIFE_MASK_STORAGE: u8 = 0x0F;

/// DIFE mask for the tariff bits.
pub const DIFE_MASK_TARIFF: u8 = 0x30;

/// DIFE mask for the subunit bit.
pub const DIFE_MASK_SUBUNIT: u8 = 0x40;

/// Extension bit shared by DIF/DIFE and VIF/VIFE chains.
pub const EXTENSION_BIT: u8 = 0x80;

/// DIF idle filler, skipped between records.
pub const DIF_IDLE_FILLER: u8 = 0x2F;

/// DIF introducing a manufacturer specific data block.
pub const DIF_MANUFACTURER_SPECIFIC: u8 = 0x0F;

/// DIF signalling that more records follow in another telegram.
pub const DIF_MORE_RECORDS_FOLLOW: u8 = 0x1F;

/// VIF value (sans extension bit) introducing a plain-text VIF.
pub const VIF_PLAIN_TEXT: u8 = 0x7C;

/// VIF escape into the first extension table.
pub const VIF_EXTENSION_FB: u8 = 0xFB;

/// VIF escape into the second extension table.
pub const VIF_EXTENSION_FD: u8 = 0xFD;

/// VIF escape for manufacturer specific codings.
pub const VIF_MANUFACTURER: u8 = 0xFF;

// M-Bus wired framing delimiters (EN 13757-2).
pub const MBUS_FRAME_ACK: u8 = 0xE5;
pub const MBUS_FRAME_SHORT_START: u8 = 0x10;
pub const MBUS_FRAME_LONG_START: u8 = 0x68;
pub const MBUS_FRAME_STOP: u8 = 0x16;

// Application layer CI codes seen on the telegram path.
/// EN 13757-3 application layer, no TPL header.
pub const CI_APL_NO_HEADER: u8 = 0x78;
/// TPL with short header (ACC, STATUS, CFG).
pub const CI_TPL_SHORT: u8 = 0x7A;
/// TPL with long header (ID, M, V, T, ACC, STATUS, CFG).
pub const CI_TPL_LONG: u8 = 0x72;
/// Extended link layer with session number.
pub const CI_ELL_SESSION: u8 = 0x8D;
/// Extended link layer, short (CC, ACC only).
pub const CI_ELL_SHORT: u8 = 0x8C;
/// Techem manufacturer specific application layer.
pub const CI_MFCT_SPECIFIC_A2: u8 = 0xA2;

/// Decrypted TPL payloads must start with these two filler bytes.
pub const TPL_DECRYPT_MARKER: [u8; 2] = [0x2F, 0x2F];
