//! Assembled-chunk store: quantized tile data, scale/offset reconstruction,
//! pairwise time-downsampling. Geometry, validation order and the
//! weight-rail rule follow `assembled_chunk.cpp` exactly.

use crate::error::ConstructError;
use crate::packet::Packet;

pub const MAX_ALLOWED_BEAM_ID: u16 = 65535;
pub const MAX_ALLOWED_NUPFREQ: u16 = 512;
pub const MAX_ALLOWED_NT_PER_PACKET: u16 = 1024;
pub const MAX_ALLOWED_FPGA_COUNTS_PER_SAMPLE: u32 = 1 << 20;
pub const NFREQ_COARSE: u16 = 1024;

fn is_power_of_two(n: u16) -> bool {
    n != 0 && (n & (n - 1)) == 0
}

/// A fixed-size time-frequency tile of quantized intensity samples for one
/// beam, at a given time-binning level.
#[derive(Debug, Clone)]
pub struct AssembledChunk {
    pub beam_id: u16,
    pub nupfreq: u16,
    pub nt_per_packet: u16,
    pub fpga_counts_per_sample: u32,
    pub nt_per_assembled_chunk: u32,
    pub binning: u32,
    pub ichunk: u64,
    pub fpga_begin: u64,
    pub fpga_end: u64,
    pub frame0_nano: u64,
    pub nrfifreq: u16,
    pub has_rfi_mask: bool,

    /// `[coarse_freq][upfreq][time]`, length `ndata()`.
    pub data: Vec<u8>,
    /// `[coarse_freq][time_coarse]`, length `nscales()`.
    pub scales: Vec<f32>,
    /// `[coarse_freq][time_coarse]`, length `nscales()`.
    pub offsets: Vec<f32>,
    /// Optional RFI mask, `nrfimaskbytes()` long when present.
    pub rfi_mask: Option<Vec<u8>>,
}

impl AssembledChunk {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        beam_id: u16,
        nupfreq: u16,
        nt_per_packet: u16,
        fpga_counts_per_sample: u32,
        nt_per_assembled_chunk: u32,
        binning: u32,
        ichunk: u64,
        nrfifreq: u16,
    ) -> Result<Self, ConstructError> {
        if beam_id > MAX_ALLOWED_BEAM_ID {
            return Err(ConstructError::BadBeamId(beam_id, MAX_ALLOWED_BEAM_ID));
        }
        if nupfreq == 0 || nupfreq > MAX_ALLOWED_NUPFREQ {
            return Err(ConstructError::BadNupfreq(
                nupfreq as u32,
                MAX_ALLOWED_NUPFREQ as u32,
            ));
        }
        if !is_power_of_two(nt_per_packet)
            || nt_per_packet as u32 > nt_per_assembled_chunk
            || nt_per_packet > MAX_ALLOWED_NT_PER_PACKET
        {
            return Err(ConstructError::BadNtPerPacket(
                nt_per_packet as u32,
                nt_per_assembled_chunk,
            ));
        }
        if fpga_counts_per_sample == 0
            || fpga_counts_per_sample > MAX_ALLOWED_FPGA_COUNTS_PER_SAMPLE
        {
            return Err(ConstructError::BadFpgaCountsPerSample(
                fpga_counts_per_sample,
                MAX_ALLOWED_FPGA_COUNTS_PER_SAMPLE,
            ));
        }

        let nt_coarse = nt_per_assembled_chunk / nt_per_packet as u32;
        let nscales = NFREQ_COARSE as usize * nt_coarse as usize;
        let ndata = NFREQ_COARSE as usize * nupfreq as usize * nt_per_assembled_chunk as usize;
        let nrfimaskbytes = nrfifreq as usize * nt_coarse as usize;

        let fpga_begin =
            ichunk * nt_per_assembled_chunk as u64 * fpga_counts_per_sample as u64 * binning as u64;
        let fpga_end =
            fpga_begin + (nt_per_assembled_chunk as u64 * fpga_counts_per_sample as u64 * binning as u64);

        Ok(AssembledChunk {
            beam_id,
            nupfreq,
            nt_per_packet,
            fpga_counts_per_sample,
            nt_per_assembled_chunk,
            binning,
            ichunk,
            fpga_begin,
            fpga_end,
            frame0_nano: 0,
            nrfifreq,
            has_rfi_mask: nrfifreq > 0,
            data: vec![0u8; ndata],
            scales: vec![1.0; nscales],
            offsets: vec![0.0; nscales],
            rfi_mask: if nrfifreq > 0 {
                Some(vec![0u8; nrfimaskbytes])
            } else {
                None
            },
        })
    }

    pub fn nt_coarse(&self) -> u32 {
        self.nt_per_assembled_chunk / self.nt_per_packet as u32
    }

    pub fn nscales(&self) -> usize {
        NFREQ_COARSE as usize * self.nt_coarse() as usize
    }

    pub fn ndata(&self) -> usize {
        NFREQ_COARSE as usize * self.nupfreq as usize * self.nt_per_assembled_chunk as usize
    }

    pub fn nrfimaskbytes(&self) -> usize {
        self.nrfifreq as usize * self.nt_coarse() as usize
    }

    /// Worst-case bitshuffle+LZ4 compressed size for `ndata()` bytes.
    pub fn max_compressed_size(&self) -> usize {
        crate::serialize::max_compressed_size(self.ndata())
    }

    /// Ingest one wire packet's contribution to this chunk.
    ///
    /// Precondition: `pkt` belongs to this chunk's beam; its `fpga_count`
    /// falls in `[fpga_begin, fpga_end)`; `nupfreq`, `nt_per_packet`,
    /// `fpga_counts_per_sample` match this chunk's geometry.
    pub fn add_packet(&mut self, pkt: &Packet, beam_index: usize) -> bool {
        if pkt.nupfreq != self.nupfreq
            || pkt.ntsamp != self.nt_per_packet
            || pkt.fpga_counts_per_sample as u32 != self.fpga_counts_per_sample
        {
            return false;
        }
        if pkt.fpga_count < self.fpga_begin || pkt.fpga_count >= self.fpga_end {
            return false;
        }

        let isample = pkt.fpga_count / self.fpga_counts_per_sample as u64;
        let chunk_isample = self.ichunk * self.nt_per_assembled_chunk as u64;
        let t0 = (isample - chunk_isample) as usize;
        let t_coarse = t0 / self.nt_per_packet as usize;
        let nt_coarse = self.nt_coarse() as usize;
        let nt_per_packet = self.nt_per_packet as usize;

        for f in 0..pkt.nfreq_coarse as usize {
            let freq_id = pkt.freq_id(f) as usize;
            if freq_id >= NFREQ_COARSE as usize {
                continue;
            }

            let scale_idx = freq_id * nt_coarse + t_coarse;
            self.scales[scale_idx] = pkt.scale(beam_index, f);
            self.offsets[scale_idx] = pkt.offset(beam_index, f);

            let block = pkt.block_data(beam_index, f);
            for u in 0..self.nupfreq as usize {
                let row = freq_id * self.nupfreq as usize + u;
                let dst_off = row * self.nt_per_assembled_chunk as usize + t0;
                let src_off = u * nt_per_packet;
                self.data[dst_off..dst_off + nt_per_packet]
                    .copy_from_slice(&block[src_off..src_off + nt_per_packet]);
            }
        }
        true
    }

    /// Decode quantized samples into float intensity + weight arrays, each
    /// `stride`-strided per fine-freq row. `weight == 1.0` iff the quantized
    /// byte is in `{1, ..., 254}` (the two rail values encode masked/
    /// saturated samples), matching `assembled_chunk.cpp`'s
    /// `(x*(255-x))>0.5` test.
    pub fn decode(&self, intensity_out: &mut [f32], weights_out: &mut [f32], stride: usize) -> Result<(), ConstructError> {
        if stride < self.nt_per_assembled_chunk as usize {
            return Err(ConstructError::StrideTooShort(
                stride,
                self.nt_per_assembled_chunk as usize,
            ));
        }

        let nt_coarse = self.nt_coarse() as usize;
        let nt_per_packet = self.nt_per_packet as usize;
        let nt = self.nt_per_assembled_chunk as usize;

        for f in 0..NFREQ_COARSE as usize {
            for u in 0..self.nupfreq as usize {
                let row = f * self.nupfreq as usize + u;
                let src_row = &self.data[row * nt..row * nt + nt];
                let out_row_i = &mut intensity_out[row * stride..row * stride + nt];
                let out_row_w = &mut weights_out[row * stride..row * stride + nt];

                for t_coarse in 0..nt_coarse {
                    let scale = self.scales[f * nt_coarse + t_coarse];
                    let offset = self.offsets[f * nt_coarse + t_coarse];
                    let t_start = t_coarse * nt_per_packet;
                    for t in t_start..t_start + nt_per_packet {
                        let x = src_row[t];
                        out_row_i[t] = scale * x as f32 + offset;
                        let xf = x as f32;
                        out_row_w[t] = if xf * (255.0 - xf) > 0.5 { 1.0 } else { 0.0 };
                    }
                }
            }
        }
        Ok(())
    }

    /// Produce a chunk of binning `2*binning` from two time-adjacent chunks
    /// of the same binning (`a.ichunk + a.binning == b.ichunk`). The merged
    /// chunk's `ichunk` is `a.ichunk`: `ichunk` always indexes the
    /// native-rate timeline, not a level-local counter, so it is never
    /// rescaled by the merge.
    /// Data is pair-averaged, weights combine by AND, scale/offset are
    /// refit to the merged data.
    pub fn downsample(a: &AssembledChunk, b: &AssembledChunk) -> AssembledChunk {
        debug_assert_eq!(a.beam_id, b.beam_id);
        debug_assert_eq!(a.binning, b.binning);
        debug_assert_eq!(a.ichunk + a.binning as u64, b.ichunk);

        let mut out = AssembledChunk::new(
            a.beam_id,
            a.nupfreq,
            a.nt_per_packet,
            a.fpga_counts_per_sample,
            a.nt_per_assembled_chunk,
            a.binning * 2,
            a.ichunk,
            a.nrfifreq,
        )
        .expect("downsampled geometry mirrors a valid source chunk");
        out.frame0_nano = a.frame0_nano;
        out.fpga_begin = a.fpga_begin;
        out.fpga_end = b.fpga_end;

        let nt = a.nt_per_assembled_chunk as usize;
        let nt_coarse = a.nt_coarse() as usize;
        let nt_per_packet = a.nt_per_packet as usize;
        let mut ia = vec![0f32; NFREQ_COARSE as usize * a.nupfreq as usize * nt];
        let mut wa = vec![0f32; ia.len()];
        let mut ib = vec![0f32; ia.len()];
        let mut wb = vec![0f32; ia.len()];
        a.decode(&mut ia, &mut wa, nt).unwrap();
        b.decode(&mut ib, &mut wb, nt).unwrap();

        for f in 0..NFREQ_COARSE as usize {
            for u in 0..a.nupfreq as usize {
                let row = f * a.nupfreq as usize + u;
                for t_coarse in 0..nt_coarse {
                    // Pair-average two adjacent native-rate samples from the
                    // concatenation of a then b into one merged sample.
                    let t_start = t_coarse * nt_per_packet;
                    let mut acc0 = 0f32;
                    let mut acc1 = 0f32;
                    let mut acc2 = 0f32;
                    for t in t_start..t_start + nt_per_packet {
                        for (i, w) in [(ia[row * nt + t], wa[row * nt + t]), (ib[row * nt + t], wb[row * nt + t])] {
                            if w > 0.0 {
                                acc0 += 1.0;
                                acc1 += i;
                                acc2 += i * i;
                            }
                        }
                    }

                    let scale_idx = f * nt_coarse + t_coarse;
                    if acc0 <= 0.0 {
                        out.scales[scale_idx] = 1.0;
                        out.offsets[scale_idx] = 0.0;
                        continue;
                    }
                    let mean = acc1 / acc0;
                    let mut var = acc2 / acc0 - mean * mean;
                    var = var.max(1.0e-5 * mean * mean);
                    let scale = var.sqrt() / 25.0;
                    let offset = mean - 128.0 * scale;
                    out.scales[scale_idx] = scale;
                    out.offsets[scale_idx] = offset;

                    for t in t_start..t_start + nt_per_packet {
                        let (ia_t, wa_t) = (ia[row * nt + t], wa[row * nt + t]);
                        let (ib_t, wb_t) = (ib[row * nt + t], wb[row * nt + t]);
                        let both_present = wa_t > 0.0 && wb_t > 0.0;
                        let merged = if both_present {
                            (ia_t + ib_t) / 2.0
                        } else if wa_t > 0.0 {
                            ia_t
                        } else if wb_t > 0.0 {
                            ib_t
                        } else {
                            0.0
                        };
                        let weight_ok = wa_t > 0.0 && wb_t > 0.0;
                        let q = if weight_ok {
                            (((merged - offset) / scale).clamp(0.0, 255.0) + 0.5) as u8
                        } else {
                            0
                        };
                        out.data[row * nt + t] = q;
                    }
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_chunk(ichunk: u64) -> AssembledChunk {
        AssembledChunk::new(7, 2, 4, 10, 8, 1, ichunk, 0).unwrap()
    }

    #[test]
    fn construct_rejects_bad_geometry() {
        assert!(AssembledChunk::new(7, 2, 3, 10, 8, 1, 0, 0).is_err()); // nt_per_packet not pow2
        assert!(AssembledChunk::new(7, 0, 4, 10, 8, 1, 0, 0).is_err()); // nupfreq == 0
        assert!(AssembledChunk::new(7, 2, 4, 0, 8, 1, 0, 0).is_err()); // fpga_counts_per_sample == 0
    }

    #[test]
    fn decode_weight_rail_rule() {
        let mut ch = tiny_chunk(0);
        ch.data[0] = 0; // masked
        ch.data[1] = 1; // live
        ch.data[2] = 254; // live
        ch.data[3] = 255; // saturated
        let nt = ch.nt_per_assembled_chunk as usize;
        let mut intensity = vec![0f32; NFREQ_COARSE as usize * ch.nupfreq as usize * nt];
        let mut weights = vec![0f32; intensity.len()];
        ch.decode(&mut intensity, &mut weights, nt).unwrap();
        assert_eq!(weights[0], 0.0);
        assert_eq!(weights[1], 1.0);
        assert_eq!(weights[2], 1.0);
        assert_eq!(weights[3], 0.0);
    }

    #[test]
    fn decode_rejects_short_stride() {
        let ch = tiny_chunk(0);
        let mut intensity = vec![0f32; 1];
        let mut weights = vec![0f32; 1];
        assert!(ch.decode(&mut intensity, &mut weights, 1).is_err());
    }

    #[test]
    fn downsample_doubles_binning_and_advances_ichunk_pair() {
        let a = tiny_chunk(0);
        let b = tiny_chunk(1);
        let merged = AssembledChunk::downsample(&a, &b);
        assert_eq!(merged.binning, 2);
        assert_eq!(merged.ichunk, 0);
    }
}
