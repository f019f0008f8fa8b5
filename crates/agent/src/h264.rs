//! Minimal Annex B scanning: enough to find keyframes and read the
//! profile an encoder actually produced.

const NAL_IDR: u8 = 5;
const NAL_SPS: u8 = 7;

/// Iterator over NAL unit bodies (start codes stripped) in an Annex B buffer.
pub struct NalUnits<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> NalUnits<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        let pos = find_start_code(data, 0).map_or(data.len(), |(_, body)| body);
        Self { data, pos }
    }
}

/// Returns `(start_code_offset, body_offset)` of the first start code at or after `from`.
fn find_start_code(data: &[u8], from: usize) -> Option<(usize, usize)> {
    let mut i = from;
    while i + 3 <= data.len() {
        if data[i] == 0 && data[i + 1] == 0 {
            if data[i + 2] == 1 {
                return Some((i, i + 3));
            }
            if data[i + 2] == 0 && data.get(i + 3) == Some(&1) {
                return Some((i, i + 4));
            }
        }
        i += 1;
    }
    None
}

impl<'a> Iterator for NalUnits<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<&'a [u8]> {
        while self.pos < self.data.len() {
            let start = self.pos;
            let (end, next) = find_start_code(self.data, start)
                .unwrap_or((self.data.len(), self.data.len()));
            self.pos = next;
            if end > start {
                return Some(&self.data[start..end]);
            }
        }
        None
    }
}

pub fn nal_type(nal: &[u8]) -> Option<u8> {
    nal.first().map(|b| b & 0x1F)
}

/// True if the access unit carries an IDR slice.
pub fn contains_idr(data: &[u8]) -> bool {
    NalUnits::new(data).any(|nal| nal_type(nal) == Some(NAL_IDR))
}

/// `profile-level-id` (as used in SDP fmtp) of the first SPS, e.g. `42e01f`.
pub fn profile_level_id(data: &[u8]) -> Option<String> {
    let sps = NalUnits::new(data).find(|nal| nal_type(nal) == Some(NAL_SPS))?;
    let bytes = sps.get(1..4)?;
    Some(format!("{:02x}{:02x}{:02x}", bytes[0], bytes[1], bytes[2]))
}

/// H.264 profile advertised on the video track.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum H264Profile {
    ConstrainedBaseline,
    Main,
}

impl H264Profile {
    pub fn profile_level_id(self) -> &'static str {
        match self {
            H264Profile::ConstrainedBaseline => "42e01f",
            H264Profile::Main => "4d001f",
        }
    }

    pub fn fmtp(self) -> String {
        format!(
            "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id={}",
            self.profile_level_id()
        )
    }

    /// Whether an SPS `profile-level-id` belongs to this profile. Only
    /// profile_idc is compared; constraint flags and level vary by encoder.
    pub fn matches(self, profile_level_id: &str) -> bool {
        profile_level_id
            .get(..2)
            .is_some_and(|idc| idc.eq_ignore_ascii_case(&self.profile_level_id()[..2]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPS: [u8; 5] = [0x67, 0x42, 0xe0, 0x1f, 0xda];
    const PPS: [u8; 3] = [0x68, 0xce, 0x3c];

    fn annex_b(nals: &[&[u8]], four_byte: bool) -> Vec<u8> {
        let mut out = Vec::new();
        for nal in nals {
            if four_byte {
                out.extend_from_slice(&[0, 0, 0, 1]);
            } else {
                out.extend_from_slice(&[0, 0, 1]);
            }
            out.extend_from_slice(nal);
        }
        out
    }

    #[test]
    fn splits_mixed_start_codes() {
        let mut data = annex_b(&[&SPS], true);
        data.extend(annex_b(&[&PPS, &[0x65, 0x88, 0x84]], false));
        let nals: Vec<&[u8]> = NalUnits::new(&data).collect();
        assert_eq!(nals, vec![&SPS[..], &PPS[..], &[0x65, 0x88, 0x84][..]]);
    }

    #[test]
    fn leading_garbage_is_skipped() {
        let mut data = vec![0xff, 0x12];
        data.extend(annex_b(&[&[0x41, 0x9a]], true));
        assert_eq!(NalUnits::new(&data).count(), 1);
    }

    #[test]
    fn idr_detection() {
        let keyframe = annex_b(&[&SPS, &PPS, &[0x65, 0x88]], true);
        let delta = annex_b(&[&[0x41, 0x9a, 0x02]], true);
        assert!(contains_idr(&keyframe));
        assert!(!contains_idr(&delta));
        assert!(contains_idr(&annex_b(&[&[0x65]], false)));
    }

    #[test]
    fn empty_and_truncated_inputs() {
        assert!(!contains_idr(&[]));
        assert!(!contains_idr(&[0, 0, 1]));
        assert!(!contains_idr(&[0, 0, 0, 1]));
        assert_eq!(NalUnits::new(&[0, 0]).count(), 0);
    }

    #[test]
    fn reads_profile_from_sps() {
        let data = annex_b(&[&SPS, &PPS, &[0x65]], true);
        assert_eq!(profile_level_id(&data).as_deref(), Some("42e01f"));

        let main = annex_b(&[&[0x67, 0x4d, 0x40, 0x28]], true);
        assert_eq!(profile_level_id(&main).as_deref(), Some("4d4028"));

        assert_eq!(profile_level_id(&annex_b(&[&PPS], true)), None);
        assert_eq!(profile_level_id(&annex_b(&[&[0x67, 0x42]], true)), None);
    }

    #[test]
    fn profile_fmtp_and_matching() {
        assert_eq!(
            H264Profile::Main.fmtp(),
            "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=4d001f"
        );
        assert!(H264Profile::Main.matches("4d4028"));
        assert!(!H264Profile::Main.matches("42e01f"));
        assert!(H264Profile::ConstrainedBaseline.matches("42C01E"));
        assert!(!H264Profile::ConstrainedBaseline.matches(""));
    }
}
