//! UDP wire packet codec. Layout and validation follow
//! `intensity_packet::read`/`encode` bit for bit, including the u64-widened
//! overflow checks.

/// Header size in bytes: protocol_version(4) + data_nbytes(2) +
/// fpga_counts_per_sample(2) + fpga_count(8) + nbeams(2) + nfreq_coarse(2) +
/// nupfreq(2) + ntsamp(2).
pub const HEADER_NBYTES: usize = 24;

/// Largest single UDP payload this codec will decode.
pub const MAX_UDP_PACKET_SIZE: usize = 9000;

/// Coarse-frequency IDs must be smaller than this.
pub const NFREQ_COARSE: u16 = 1024;

/// A borrowed, validated view over a UDP datagram.
///
/// All slice fields borrow directly from the source buffer: decoding a
/// packet never copies sample data.
#[derive(Debug, Clone, Copy)]
pub struct Packet<'a> {
    pub protocol_version: u32,
    pub data_nbytes: u16,
    pub fpga_counts_per_sample: u16,
    pub fpga_count: u64,
    pub nbeams: u16,
    pub nfreq_coarse: u16,
    pub nupfreq: u16,
    pub ntsamp: u16,
    pub beam_ids: &'a [u8],
    pub freq_ids_raw: &'a [u8],
    pub scales_raw: &'a [u8],
    pub offsets_raw: &'a [u8],
    pub data: &'a [u8],
}

fn is_power_of_two(n: u16) -> bool {
    n != 0 && (n & (n - 1)) == 0
}

fn u16_le(buf: &[u8]) -> u16 {
    u16::from_le_bytes([buf[0], buf[1]])
}

fn u32_le(buf: &[u8]) -> u32 {
    u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]])
}

fn u64_le(buf: &[u8]) -> u64 {
    u64::from_le_bytes([
        buf[0], buf[1], buf[2], buf[3], buf[4], buf[5], buf[6], buf[7],
    ])
}

fn f32_le(buf: &[u8]) -> f32 {
    f32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]])
}

impl<'a> Packet<'a> {
    /// True iff `src` is the bare 24-byte end-of-stream sentinel.
    pub fn is_end_of_stream_sentinel(src: &[u8]) -> bool {
        src.len() == HEADER_NBYTES
    }

    /// Parse and validate a raw datagram. Returns `None` on any validation
    /// failure (a "bad packet", counted by the caller, never raised).
    pub fn decode(src: &'a [u8]) -> Option<Packet<'a>> {
        if src.len() < HEADER_NBYTES {
            return None;
        }
        if src.len() > MAX_UDP_PACKET_SIZE {
            return None;
        }

        let protocol_version = u32_le(&src[0..4]);
        let data_nbytes = u16_le(&src[4..6]);
        let fpga_counts_per_sample = u16_le(&src[6..8]);
        let fpga_count = u64_le(&src[8..16]);
        let nbeams = u16_le(&src[16..18]);
        let nfreq_coarse = u16_le(&src[18..20]);
        let nupfreq = u16_le(&src[20..22]);
        let ntsamp = u16_le(&src[22..24]);

        if protocol_version != 1 {
            return None;
        }
        if !is_power_of_two(ntsamp) {
            return None;
        }
        if fpga_counts_per_sample == 0 {
            return None;
        }

        // Widen to u64 before multiplying/modding to avoid overflow, as in
        // intensity_packet::read.
        let fpga_counts_per_packet = fpga_counts_per_sample as u64 * ntsamp as u64;
        if fpga_counts_per_packet == 0 || fpga_count % fpga_counts_per_packet != 0 {
            return None;
        }

        let n1 = nbeams as u64;
        let n2 = nfreq_coarse as u64;
        let n3 = nupfreq as u64;
        let n4 = ntsamp as u64;

        let nh = HEADER_NBYTES as u64 + 2 * n1 + 2 * n2 + 8 * n1 * n2;
        let nd = n1 * n2 * n3 * n4;

        if src.len() as u64 != nh + nd {
            return None;
        }
        if data_nbytes as u64 != nd {
            return None;
        }

        let nh = nh as usize;
        let beam_ids_off = HEADER_NBYTES;
        let freq_ids_off = beam_ids_off + 2 * nbeams as usize;
        let scales_off = freq_ids_off + 2 * nfreq_coarse as usize;
        let offsets_off = scales_off + 4 * nbeams as usize * nfreq_coarse as usize;

        let freq_ids_raw = &src[freq_ids_off..scales_off];
        for chunk in freq_ids_raw.chunks_exact(2) {
            if u16_le(chunk) >= NFREQ_COARSE {
                return None;
            }
        }

        Some(Packet {
            protocol_version,
            data_nbytes,
            fpga_counts_per_sample,
            fpga_count,
            nbeams,
            nfreq_coarse,
            nupfreq,
            ntsamp,
            beam_ids: &src[beam_ids_off..freq_ids_off],
            freq_ids_raw,
            scales_raw: &src[scales_off..offsets_off],
            offsets_raw: &src[offsets_off..nh],
            data: &src[nh..],
        })
    }

    pub fn beam_id(&self, i: usize) -> u16 {
        u16_le(&self.beam_ids[2 * i..2 * i + 2])
    }

    pub fn freq_id(&self, i: usize) -> u16 {
        u16_le(&self.freq_ids_raw[2 * i..2 * i + 2])
    }

    pub fn scale(&self, beam: usize, freq: usize) -> f32 {
        let idx = beam * self.nfreq_coarse as usize + freq;
        f32_le(&self.scales_raw[4 * idx..4 * idx + 4])
    }

    pub fn offset(&self, beam: usize, freq: usize) -> f32 {
        let idx = beam * self.nfreq_coarse as usize + freq;
        f32_le(&self.offsets_raw[4 * idx..4 * idx + 4])
    }

    /// Quantized samples for one (beam, coarse-freq) block:
    /// `nupfreq * ntsamp` bytes, row-major `[upfreq][time]`.
    pub fn block_data(&self, beam: usize, freq: usize) -> &'a [u8] {
        let block_len = self.nupfreq as usize * self.ntsamp as usize;
        let idx = beam * self.nfreq_coarse as usize + freq;
        &self.data[idx * block_len..(idx + 1) * block_len]
    }

    pub fn find_freq_id(&self, freq_id: u16) -> Option<usize> {
        (0..self.nfreq_coarse as usize).find(|&i| self.freq_id(i) == freq_id)
    }

    pub fn contains_freq_id(&self, freq_id: u16) -> bool {
        self.find_freq_id(freq_id).is_some()
    }
}

/// Encode a packet body from float intensity/weight arrays.
///
/// `intensity`/`weights` are indexed as `[beam][coarse_freq][upfreq][time]`
/// with the given `beam_stride`/`freq_stride` (elements, not bytes) between
/// consecutive beams/coarse-freq blocks — mirroring
/// `intensity_packet::encode`'s `beam_stride`/`freq_stride` parameters.
#[allow(clippy::too_many_arguments)]
pub fn encode(
    dst: &mut Vec<u8>,
    protocol_version: u32,
    fpga_counts_per_sample: u16,
    fpga_count: u64,
    beam_ids: &[u16],
    freq_ids: &[u16],
    nupfreq: u16,
    ntsamp: u16,
    intensity: &[f32],
    weights: &[f32],
    beam_stride: usize,
    freq_stride: usize,
    wt_cutoff: f32,
) {
    let nb = beam_ids.len();
    let nf = freq_ids.len();
    let nu = nupfreq as usize;
    let nt = ntsamp as usize;
    let data_nbytes = (nb * nf * nu * nt) as u16;

    dst.clear();
    dst.extend_from_slice(&protocol_version.to_le_bytes());
    dst.extend_from_slice(&data_nbytes.to_le_bytes());
    dst.extend_from_slice(&fpga_counts_per_sample.to_le_bytes());
    dst.extend_from_slice(&fpga_count.to_le_bytes());
    dst.extend_from_slice(&(nb as u16).to_le_bytes());
    dst.extend_from_slice(&(nf as u16).to_le_bytes());
    dst.extend_from_slice(&nupfreq.to_le_bytes());
    dst.extend_from_slice(&ntsamp.to_le_bytes());
    for &b in beam_ids {
        dst.extend_from_slice(&b.to_le_bytes());
    }
    for &f in freq_ids {
        dst.extend_from_slice(&f.to_le_bytes());
    }

    let mut scales = vec![0f32; nb * nf];
    let mut offsets = vec![0f32; nb * nf];
    let mut data = vec![0u8; nb * nf * nu * nt];

    for b in 0..nb {
        for f in 0..nf {
            let sub_int = &intensity[b * beam_stride + f * nu * freq_stride..];
            let sub_wt = &weights[b * beam_stride + f * nu * freq_stride..];

            let mut acc0 = 0f32;
            let mut acc1 = 0f32;
            let mut acc2 = 0f32;
            for u in 0..nu {
                for t in 0..nt {
                    let x = sub_int[u * freq_stride + t];
                    let w = if sub_wt[u * freq_stride + t] >= wt_cutoff {
                        1.0
                    } else {
                        0.0
                    };
                    acc0 += w;
                    acc1 += w * x;
                    acc2 += w * x * x;
                }
            }

            let sub_data = &mut data[(b * nf + f) * (nu * nt)..(b * nf + f + 1) * (nu * nt)];

            if acc0 <= 0.0 {
                scales[b * nf + f] = 1.0;
                offsets[b * nf + f] = 0.0;
                sub_data.fill(0);
                continue;
            }

            let mean = acc1 / acc0;
            let mut var = acc2 / acc0 - mean * mean;
            var = var.max(1.0e-5 * mean * mean);

            let scale = var.sqrt() / 25.0;
            let offset = mean - 128.0 * scale;
            scales[b * nf + f] = scale;
            offsets[b * nf + f] = offset;

            for u in 0..nu {
                for t in 0..nt {
                    let x = sub_int[u * freq_stride + t];
                    let w = if sub_wt[u * freq_stride + t] >= wt_cutoff {
                        1.0
                    } else {
                        0.0
                    };
                    let mut xq = w * (x - offset) / scale;
                    xq = xq.min(255.0).max(0.0);
                    sub_data[u * nt + t] = (xq + 0.5) as u8;
                }
            }
        }
    }

    for s in &scales {
        dst.extend_from_slice(&s.to_le_bytes());
    }
    for o in &offsets {
        dst.extend_from_slice(&o.to_le_bytes());
    }
    dst.extend_from_slice(&data);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_packet(
        beam_ids: &[u16],
        freq_ids: &[u16],
        nupfreq: u16,
        ntsamp: u16,
        fpga_counts_per_sample: u16,
        fpga_count: u64,
    ) -> Vec<u8> {
        let nb = beam_ids.len();
        let nf = freq_ids.len();
        let nu = nupfreq as usize;
        let nt = ntsamp as usize;
        let intensity = vec![10.0f32; nb * nf * nu * nt];
        let weights = vec![1.0f32; nb * nf * nu * nt];
        let mut dst = Vec::new();
        encode(
            &mut dst,
            1,
            fpga_counts_per_sample,
            fpga_count,
            beam_ids,
            freq_ids,
            nupfreq,
            ntsamp,
            &intensity,
            &weights,
            nf * nu * nt,
            nt,
            0.5,
        );
        dst
    }

    #[test]
    fn decode_accepts_well_formed_packet() {
        let raw = make_packet(&[77, 42], &[0, 1, 2], 4, 16, 384, 0);
        let pkt = Packet::decode(&raw).expect("should decode");
        assert_eq!(pkt.nbeams, 2);
        assert_eq!(pkt.nfreq_coarse, 3);
        assert_eq!(pkt.beam_id(0), 77);
        assert_eq!(pkt.beam_id(1), 42);
        assert_eq!(pkt.freq_id(2), 2);
    }

    #[test]
    fn decode_rejects_non_power_of_two_ntsamp() {
        // Hand-build a header with ntsamp=3 and otherwise-consistent sizes.
        let beam_ids = [1u16];
        let freq_ids = [0u16];
        let nupfreq = 1u16;
        let ntsamp = 3u16; // not a power of two
        let nd = beam_ids.len() * freq_ids.len() * nupfreq as usize * ntsamp as usize;
        let mut raw = Vec::new();
        raw.extend_from_slice(&1u32.to_le_bytes());
        raw.extend_from_slice(&(nd as u16).to_le_bytes());
        raw.extend_from_slice(&1u16.to_le_bytes());
        raw.extend_from_slice(&0u64.to_le_bytes());
        raw.extend_from_slice(&1u16.to_le_bytes());
        raw.extend_from_slice(&1u16.to_le_bytes());
        raw.extend_from_slice(&nupfreq.to_le_bytes());
        raw.extend_from_slice(&ntsamp.to_le_bytes());
        raw.extend_from_slice(&1u16.to_le_bytes());
        raw.extend_from_slice(&0u16.to_le_bytes());
        raw.extend_from_slice(&0.0f32.to_le_bytes());
        raw.extend_from_slice(&0.0f32.to_le_bytes());
        raw.extend_from_slice(&vec![0u8; nd]);
        assert!(Packet::decode(&raw).is_none());
    }

    #[test]
    fn decode_rejects_bad_fpga_count_alignment() {
        let mut raw = make_packet(&[1], &[0], 1, 2, 10, 0);
        // fpga_count must be a multiple of fpga_counts_per_sample*ntsamp (20).
        raw[8..16].copy_from_slice(&7u64.to_le_bytes());
        assert!(Packet::decode(&raw).is_none());
    }

    #[test]
    fn end_of_stream_sentinel_is_exactly_header_size() {
        assert!(Packet::is_end_of_stream_sentinel(&[0u8; HEADER_NBYTES]));
        assert!(!Packet::is_end_of_stream_sentinel(&[0u8; HEADER_NBYTES + 1]));
    }

    #[test]
    fn encode_zeros_block_when_total_weight_nonpositive() {
        let beam_ids = [1u16];
        let freq_ids = [0u16];
        let intensity = vec![5.0f32; 4];
        let weights = vec![0.0f32; 4]; // all below cutoff
        let mut dst = Vec::new();
        encode(
            &mut dst, 1, 1, 0, &beam_ids, &freq_ids, 2, 2, &intensity, &weights, 4, 2, 0.5,
        );
        let pkt = Packet::decode(&dst).unwrap();
        assert_eq!(pkt.scale(0, 0), 1.0);
        assert_eq!(pkt.offset(0, 0), 0.0);
        assert!(pkt.block_data(0, 0).iter().all(|&b| b == 0));
    }
}
