//! Annex-B scanning for H264 access units

/// NAL unit types we care about (5 bits)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NalUnitType {
    /// Non-IDR slice (P or B frame)
    SliceNonIdr,
    /// IDR slice (keyframe)
    SliceIdr,
    Sei,
    Sps,
    Pps,
    Aud,
    Other(u8),
}

impl From<u8> for NalUnitType {
    fn from(header: u8) -> Self {
        match header & 0x1f {
            1 => NalUnitType::SliceNonIdr,
            5 => NalUnitType::SliceIdr,
            6 => NalUnitType::Sei,
            7 => NalUnitType::Sps,
            8 => NalUnitType::Pps,
            9 => NalUnitType::Aud,
            n => NalUnitType::Other(n),
        }
    }
}

/// NAL unit payloads (header byte first) of an Annex-B buffer
pub fn nal_units(data: &[u8]) -> NalUnits<'_> {
    NalUnits {
        data,
        pos: next_start_code(data, 0).map_or(data.len(), |(_, end)| end),
    }
}

pub struct NalUnits<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Iterator for NalUnits<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.data.len() {
            return None;
        }
        let start = self.pos;
        match next_start_code(self.data, start) {
            Some((code, end)) => {
                self.pos = end;
                Some(&self.data[start..code])
            }
            None => {
                self.pos = self.data.len();
                Some(&self.data[start..])
            }
        }
    }
}

/// Find the next 00 00 01 or 00 00 00 01 at or after `from`.
/// Returns (start of the code, first byte after it).
fn next_start_code(data: &[u8], from: usize) -> Option<(usize, usize)> {
    let mut i = from;
    while i + 3 <= data.len() {
        if data[i] == 0 && data[i + 1] == 0 {
            if data[i + 2] == 1 {
                let start = if i > from && data[i - 1] == 0 { i - 1 } else { i };
                return Some((start, i + 3));
            }
            if data[i + 2] == 0 {
                i += 1;
                continue;
            }
        }
        i += 1;
    }
    None
}

pub fn nal_types(data: &[u8]) -> impl Iterator<Item = NalUnitType> + '_ {
    nal_units(data)
        .filter(|nal| !nal.is_empty())
        .map(|nal| NalUnitType::from(nal[0]))
}

/// Whether an access unit carries an IDR slice
pub fn is_key_frame(data: &[u8]) -> bool {
    nal_types(data).any(|t| t == NalUnitType::SliceIdr)
}

/// Whether SPS and PPS travel with this access unit
pub fn has_parameter_sets(data: &[u8]) -> bool {
    let (mut sps, mut pps) = (false, false);
    for t in nal_types(data) {
        sps |= t == NalUnitType::Sps;
        pps |= t == NalUnitType::Pps;
    }
    sps && pps
}
