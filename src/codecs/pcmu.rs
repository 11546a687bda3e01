use anyhow::Result;
use bytes::{BufMut, Bytes, BytesMut};
use std::sync::OnceLock;

use super::{Decoder, Encoder};
use crate::{PcmBuf, Sample};

/// Byte emitted for silent audio frames.
pub const ULAW_SILENCE: u8 = 0x80;

const LINEAR_MAX: i32 = 32767;

/// expand[j] = ((256^(j/127) - 1) / 255) * 32767
fn expand_table() -> &'static [i32; 128] {
    static TABLE: OnceLock<[i32; 128]> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut table = [0i32; 128];
        for (j, slot) in table.iter_mut().enumerate() {
            let v = (256f64.powf(j as f64 / 127.0) - 1.0) / 255.0 * LINEAR_MAX as f64;
            *slot = v as i32;
        }
        table
    })
}

/// compress[v] is the index into the expand table closest to v, built by a
/// single sweep that advances whenever the next entry is nearer.
fn compress_table() -> &'static [u8] {
    static TABLE: OnceLock<Vec<u8>> = OnceLock::new();
    TABLE.get_or_init(|| {
        let expand = expand_table();
        let mut table = Vec::with_capacity(LINEAR_MAX as usize + 1);
        let mut j = 0usize;
        for v in 0..=LINEAR_MAX {
            if j < 127 && (expand[j + 1] - v).abs() < (expand[j] - v).abs() {
                j += 1;
            }
            table.push(j as u8);
        }
        table
    })
}

/// µ-law compress one linear sample; magnitudes beyond the 16-bit range are
/// clamped.
pub fn linear_to_ulaw(val: i32) -> u8 {
    let compress = compress_table();
    if val >= 0 {
        255 - compress[val.min(LINEAR_MAX) as usize]
    } else {
        127 - compress[(-val).min(LINEAR_MAX) as usize]
    }
}

pub fn ulaw_to_linear(byte: u8) -> Sample {
    let expand = expand_table();
    if byte >= 128 {
        expand[(255 - byte) as usize] as Sample
    } else {
        -(expand[(127 - byte) as usize] as Sample)
    }
}

pub struct PcmuEncoder {}

impl PcmuEncoder {
    pub fn new() -> Self {
        Self {}
    }
}

impl Default for PcmuEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Encoder for PcmuEncoder {
    fn encode(&mut self, samples: &[Sample]) -> Result<Bytes> {
        let mut output = BytesMut::with_capacity(samples.len());
        for &sample in samples {
            output.put_u8(linear_to_ulaw(sample as i32));
        }
        Ok(output.freeze())
    }

    fn sample_rate(&self) -> u32 {
        8000
    }

    fn channels(&self) -> u16 {
        1
    }
}

pub struct PcmuDecoder {}

impl PcmuDecoder {
    pub fn new() -> Self {
        Self {}
    }
}

impl Default for PcmuDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for PcmuDecoder {
    fn decode(&mut self, data: &[u8]) -> Result<PcmBuf> {
        Ok(data.iter().map(|&b| ulaw_to_linear(b)).collect())
    }

    fn sample_rate(&self) -> u32 {
        8000
    }

    fn channels(&self) -> u16 {
        1
    }
}
