//! Sample table expansion.
//!
//! An MP4 track describes its samples with run-length tables (`stts`,
//! `stsc`, `stsz`, `stco`/`co64`, `ctts`, `stss`). [`SampleTable::expand`]
//! flattens them into one [`SampleEntry`] per sample, in decode order.

use crate::error::ExtractError;

/// Raw sample tables of one track.
#[derive(Debug, Clone, Default)]
pub(crate) struct SampleTable {
    /// Sample count declared by `stsz`.
    pub sample_count: u32,
    /// Set when every sample has the same size.
    pub uniform_size: Option<u32>,
    pub sample_sizes: Vec<u32>,
    pub chunk_offsets: Vec<u64>,
    /// `(first_chunk, samples_per_chunk, description_index)`, chunks 1-based.
    pub sample_to_chunk: Vec<(u32, u32, u32)>,
    /// `(sample_count, sample_delta)`.
    pub time_to_sample: Vec<(u32, u32)>,
    /// `(sample_count, offset)`.
    pub composition_offsets: Vec<(u32, i32)>,
    /// 1-based sync sample numbers. `None` means every sample is a sync
    /// sample.
    pub sync_samples: Option<Vec<u32>>,
}

/// One sample's location and timing, in track timescale ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SampleEntry {
    pub offset: u64,
    pub size: u32,
    pub decode_ticks: u64,
    pub composition_offset: i64,
    pub duration_ticks: u32,
    pub is_sync: bool,
}

impl SampleEntry {
    pub(crate) fn end(&self) -> u64 {
        self.offset.saturating_add(u64::from(self.size))
    }
}

impl SampleTable {
    pub(crate) fn is_empty(&self) -> bool {
        self.sample_count == 0
    }

    fn size_of(&self, index: usize) -> Result<u32, ExtractError> {
        match self.uniform_size {
            Some(size) => Ok(size),
            None => self.sample_sizes.get(index).copied().ok_or_else(|| {
                ExtractError::Demux(format!("stsz has no size for sample {}", index + 1))
            }),
        }
    }

    /// Chunk indices (0-based) covered by `stsc` run `run`.
    fn run_chunks(&self, run: usize, first_chunk: u32) -> std::ops::Range<usize> {
        let chunk_count = self.chunk_offsets.len();
        let end = match self.sample_to_chunk.get(run + 1) {
            Some(&(next_first, _, _)) => (next_first as usize).saturating_sub(1).min(chunk_count),
            None => chunk_count,
        };
        (first_chunk as usize).saturating_sub(1)..end
    }

    /// How many samples `stsc` and `stco` can place.
    fn locatable_samples(&self) -> u64 {
        self.sample_to_chunk
            .iter()
            .enumerate()
            .map(|(run, &(first_chunk, samples_per_chunk, _))| {
                let chunks = self.run_chunks(run, first_chunk).len() as u64;
                chunks.saturating_mul(u64::from(samples_per_chunk))
            })
            .fold(0, u64::saturating_add)
    }

    /// Flatten the tables into one entry per sample.
    ///
    /// # Errors
    ///
    /// Returns [`ExtractError::Demux`] when the tables disagree about how
    /// many samples exist, declare more samples than a `file_len`-byte file
    /// can hold, or place a sample beyond the addressable range.
    pub(crate) fn expand(&self, file_len: u64) -> Result<Vec<SampleEntry>, ExtractError> {
        let declared = u64::from(self.sample_count);
        // Every sample occupies at least one byte of the file.
        if declared > file_len {
            return Err(ExtractError::Demux(format!(
                "stsz declares {declared} samples in a {file_len}-byte file"
            )));
        }
        let locatable = self.locatable_samples();
        if declared > locatable {
            return Err(ExtractError::Demux(format!(
                "sample-to-chunk table locates {locatable} of {declared} samples"
            )));
        }

        let count = self.sample_count as usize;
        let mut entries = Vec::with_capacity(count);

        // Locations, from stsc + stco + stsz.
        let mut sample_index = 0usize;
        for (run, &(first_chunk, samples_per_chunk, _)) in self.sample_to_chunk.iter().enumerate() {
            if first_chunk == 0 {
                return Err(ExtractError::Demux("stsc references chunk 0".to_string()));
            }
            for chunk in self.run_chunks(run, first_chunk) {
                let mut offset = self.chunk_offsets[chunk];
                for _ in 0..samples_per_chunk {
                    if sample_index == count {
                        break;
                    }
                    let size = self.size_of(sample_index)?;
                    entries.push(SampleEntry {
                        offset,
                        size,
                        decode_ticks: 0,
                        composition_offset: 0,
                        duration_ticks: 0,
                        is_sync: self.sync_samples.is_none(),
                    });
                    offset = offset.checked_add(u64::from(size)).ok_or_else(|| {
                        ExtractError::Demux(format!(
                            "sample {} in chunk {} overflows the file offset range",
                            sample_index + 1,
                            chunk + 1
                        ))
                    })?;
                    sample_index += 1;
                }
            }
        }
        if entries.len() != count {
            return Err(ExtractError::Demux(format!(
                "sample-to-chunk table locates {} of {count} samples",
                entries.len()
            )));
        }

        // Decode times, from stts.
        let mut decode_ticks = 0u64;
        let mut timed = 0usize;
        let mut last_delta = 0u32;
        'stts: for &(run_count, delta) in &self.time_to_sample {
            for _ in 0..run_count {
                let Some(entry) = entries.get_mut(timed) else {
                    break 'stts;
                };
                entry.decode_ticks = decode_ticks;
                entry.duration_ticks = delta;
                decode_ticks = decode_ticks.saturating_add(u64::from(delta));
                last_delta = delta;
                timed += 1;
            }
        }
        if timed < count {
            log::warn!(
                "stts covers {timed} of {count} samples, extending the last duration"
            );
            for entry in &mut entries[timed..] {
                entry.decode_ticks = decode_ticks;
                entry.duration_ticks = last_delta;
                decode_ticks = decode_ticks.saturating_add(u64::from(last_delta));
            }
        }

        // Presentation offsets, from ctts.
        let mut shifted = 0usize;
        'ctts: for &(run_count, offset) in &self.composition_offsets {
            for _ in 0..run_count {
                let Some(entry) = entries.get_mut(shifted) else {
                    break 'ctts;
                };
                entry.composition_offset = i64::from(offset);
                shifted += 1;
            }
        }

        if let Some(sync) = &self.sync_samples {
            for &number in sync {
                if let Some(entry) = (number as usize).checked_sub(1).and_then(|i| entries.get_mut(i)) {
                    entry.is_sync = true;
                }
            }
        }

        Ok(entries)
    }
}

/// Convert `ticks` in `timescale` to microseconds without overflow.
pub(crate) fn ticks_to_micros(ticks: i64, timescale: u32) -> i64 {
    if timescale == 0 {
        return 0;
    }
    (i128::from(ticks) * 1_000_000 / i128::from(timescale)) as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    const FILE_LEN: u64 = 10_000;

    fn table() -> SampleTable {
        SampleTable {
            sample_count: 5,
            uniform_size: None,
            sample_sizes: vec![10, 20, 30, 40, 50],
            chunk_offsets: vec![1000, 5000],
            // Chunk 1 holds 3 samples, chunk 2 holds 2.
            sample_to_chunk: vec![(1, 3, 1), (2, 2, 1)],
            time_to_sample: vec![(5, 512)],
            composition_offsets: vec![(1, 1024), (4, 0)],
            sync_samples: Some(vec![1, 4]),
        }
    }

    #[test]
    fn expands_offsets_across_chunks() {
        let entries = table().expand(FILE_LEN).unwrap();
        let offsets: Vec<u64> = entries.iter().map(|e| e.offset).collect();
        assert_eq!(offsets, vec![1000, 1010, 1030, 5000, 5040]);
        assert_eq!(entries[4].end(), 5090);
    }

    #[test]
    fn expands_timing_and_sync_flags() {
        let entries = table().expand(FILE_LEN).unwrap();
        let dts: Vec<u64> = entries.iter().map(|e| e.decode_ticks).collect();
        assert_eq!(dts, vec![0, 512, 1024, 1536, 2048]);
        assert_eq!(entries[0].composition_offset, 1024);
        assert_eq!(entries[1].composition_offset, 0);
        let sync: Vec<bool> = entries.iter().map(|e| e.is_sync).collect();
        assert_eq!(sync, vec![true, false, false, true, false]);
    }

    #[test]
    fn missing_stss_means_all_sync() {
        let mut table = table();
        table.sync_samples = None;
        assert!(table.expand(FILE_LEN).unwrap().iter().all(|e| e.is_sync));
    }

    #[test]
    fn short_chunk_map_is_an_error() {
        let mut table = table();
        table.chunk_offsets.pop();
        assert!(matches!(table.expand(FILE_LEN), Err(ExtractError::Demux(_))));
    }

    #[test]
    fn oversized_uniform_count_is_rejected_before_expanding() {
        let table = SampleTable {
            sample_count: u32::MAX,
            uniform_size: Some(1),
            chunk_offsets: vec![0],
            sample_to_chunk: vec![(1, 2, 1)],
            ..SampleTable::default()
        };
        let error = table.expand(u64::from(u32::MAX) * 2).unwrap_err();
        assert!(error.to_string().contains("locates 2 of"), "{error}");
        assert!(matches!(table.expand(FILE_LEN), Err(ExtractError::Demux(_))));
    }

    #[test]
    fn count_larger_than_file_is_rejected() {
        let table = SampleTable {
            sample_count: 1_000_000,
            uniform_size: Some(1),
            chunk_offsets: vec![0],
            sample_to_chunk: vec![(1, u32::MAX, 1)],
            ..SampleTable::default()
        };
        let error = table.expand(FILE_LEN).unwrap_err();
        assert!(error.to_string().contains("10000-byte file"), "{error}");
    }

    #[test]
    fn offset_overflow_is_a_demux_error() {
        let table = SampleTable {
            sample_count: 2,
            uniform_size: Some(16),
            chunk_offsets: vec![u64::MAX - 8],
            sample_to_chunk: vec![(1, 2, 1)],
            time_to_sample: vec![(2, 1)],
            ..SampleTable::default()
        };
        assert!(matches!(table.expand(FILE_LEN), Err(ExtractError::Demux(_))));
    }

    #[test]
    fn entry_end_saturates() {
        let entry = SampleEntry {
            offset: u64::MAX - 1,
            size: 16,
            decode_ticks: 0,
            composition_offset: 0,
            duration_ticks: 0,
            is_sync: true,
        };
        assert_eq!(entry.end(), u64::MAX);
    }

    #[test]
    fn short_stts_reuses_last_delta() {
        let mut table = table();
        table.time_to_sample = vec![(2, 100)];
        let entries = table.expand(FILE_LEN).unwrap();
        assert_eq!(entries[4].decode_ticks, 400);
        assert_eq!(entries[4].duration_ticks, 100);
    }

    #[test]
    fn tick_conversion_handles_large_values() {
        assert_eq!(ticks_to_micros(90_000, 90_000), 1_000_000);
        assert_eq!(ticks_to_micros(1, 3), 333_333);
        // Ten years at a nanosecond timescale overflows a 64-bit product.
        let ticks = 315_360_000 * 1_000_000_000;
        assert_eq!(ticks_to_micros(ticks, 1_000_000_000), 315_360_000_000_000);
    }
}
