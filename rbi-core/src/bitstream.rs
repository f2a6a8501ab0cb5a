use bytes::{Bytes, BytesMut};

/// Annex B start code (4-byte)
const START_CODE: &[u8] = &[0x00, 0x00, 0x00, 0x01];

/// Elementary stream flavour produced by an encoder worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bitstream {
    H264,
    Hevc,
    /// Every unit is a self-contained still
    Jpeg,
}

/// Check if packet data is in Annex B format by looking at the start codes.
pub fn is_annexb_packet(data: &[u8]) -> bool {
    if data.len() < 4 {
        return false;
    }
    if data[0] == 0x00 && data[1] == 0x00 && data[2] == 0x00 && data[3] == 0x01 {
        return true;
    }
    if data[0] == 0x00 && data[1] == 0x00 && data[2] == 0x01 {
        return true;
    }
    false
}

/// Converts AVCC (4-byte length + NAL) to Annex B (start code + NAL).
/// Hardware encoders on some platforms emit length-prefixed output even when
/// asked for a raw elementary stream.
pub fn convert_avcc_to_annexb(avcc: &[u8]) -> Bytes {
    let mut out = BytesMut::new();
    let mut i = 0;
    while i + 4 <= avcc.len() {
        let len = (u32::from(avcc[i]) << 24
            | u32::from(avcc[i + 1]) << 16
            | u32::from(avcc[i + 2]) << 8
            | u32::from(avcc[i + 3])) as usize;
        i += 4;
        if len == 0 || i + len > avcc.len() {
            break;
        }
        out.extend_from_slice(START_CODE);
        out.extend_from_slice(&avcc[i..i + len]);
        i += len;
    }
    out.freeze()
}

/// Iterates over the first header byte of every NAL unit in an Annex B buffer.
fn nal_headers(data: &[u8]) -> impl Iterator<Item = u8> + '_ {
    let mut i = 0;
    std::iter::from_fn(move || {
        while i + 3 <= data.len() {
            if data[i] == 0x00 && data[i + 1] == 0x00 && data[i + 2] == 0x01 {
                let start = i + 3;
                i = start;
                return data.get(start).copied();
            }
            i += 1;
        }
        None
    })
}

/// Whether the buffer carries a random access point.
///
/// H.264: IDR slice (type 5) or SPS (7). HEVC: IRAP slices (16..=21) or VPS/SPS (32, 33).
pub fn contains_keyframe(kind: Bitstream, data: &[u8]) -> bool {
    match kind {
        Bitstream::Jpeg => !data.is_empty(),
        Bitstream::H264 => nal_headers(data).any(|h| matches!(h & 0x1f, 5 | 7)),
        Bitstream::Hevc => nal_headers(data).any(|h| {
            let t = (h >> 1) & 0x3f;
            (16..=21).contains(&t) || t == 32 || t == 33
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_annexb() {
        assert!(is_annexb_packet(&[0x00, 0x00, 0x00, 0x01, 0x67]));
        assert!(is_annexb_packet(&[0x00, 0x00, 0x01, 0x67]));
        assert!(!is_annexb_packet(&[0x01, 0x00, 0x00, 0x00]));
        assert!(!is_annexb_packet(&[0x00, 0x00]));
    }

    #[test]
    fn test_avcc_to_annexb() {
        let avcc = [0, 0, 0, 4, 0x65, 0x88, 0x81, 0x00];
        let out = convert_avcc_to_annexb(&avcc);
        assert_eq!(
            &out[..],
            &[0x00, 0x00, 0x00, 0x01, 0x65, 0x88, 0x81, 0x00][..]
        );
    }

    #[test]
    fn test_h264_keyframe_detection() {
        // SPS + IDR
        let idr = [0, 0, 0, 1, 0x67, 0x42, 0, 0, 1, 0x65, 0x88];
        assert!(contains_keyframe(Bitstream::H264, &idr));
        // non-IDR slice only
        let p = [0, 0, 0, 1, 0x41, 0x9a, 0x02];
        assert!(!contains_keyframe(Bitstream::H264, &p));
    }

    #[test]
    fn test_hevc_keyframe_detection() {
        // IDR_W_RADL: type 19 -> header byte 19 << 1 = 0x26
        let idr = [0, 0, 1, 0x26, 0x01, 0xaf];
        assert!(contains_keyframe(Bitstream::Hevc, &idr));
        // TRAIL_R: type 1 -> 0x02
        let trail = [0, 0, 1, 0x02, 0x01, 0xd0];
        assert!(!contains_keyframe(Bitstream::Hevc, &trail));
    }
}
