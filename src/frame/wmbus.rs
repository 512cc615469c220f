//! wM-Bus frame recognition.
//!
//! Radio dongles strip the EN 13757-4 block CRCs before handing bytes over,
//! so a frame here is the L-field followed by L bytes of link layer and
//! application layer. The smallest possible frame carries the full DLL
//! header: C-field, manufacturer, address, version and device type.

use super::FrameStatus;

/// L-field must at least cover the DLL header and the CI:
/// C(1) + M(2) + A(4) + version(1) + type(1) + CI(1).
const MIN_L_FIELD: usize = 10;

/// Locates one wM-Bus frame at the front of `buf`.
pub fn check_frame(buf: &[u8]) -> FrameStatus {
    if buf.is_empty() {
        return FrameStatus::Partial;
    }

    let l_field = buf[0] as usize;
    if l_field < MIN_L_FIELD {
        return FrameStatus::Error;
    }

    // The L-field counts every byte after itself.
    let frame_length = l_field + 1;
    if buf.len() < frame_length {
        return FrameStatus::Partial;
    }

    FrameStatus::Full {
        frame_length,
        payload_len: l_field,
        payload_offset: 1,
    }
}
