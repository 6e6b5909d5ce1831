//! ISO base media box parsing.
//!
//! Everything here works on byte slices that are already in memory: the
//! incremental [`Demuxer`](super::Demuxer) buffers a whole `moov` box before
//! calling [`parse_movie`].

use crate::error::ExtractError;

use super::sample_table::SampleTable;

pub(crate) type FourCc = [u8; 4];

pub(crate) const MOOV: FourCc = *b"moov";
pub(crate) const MDAT: FourCc = *b"mdat";
const MVHD: FourCc = *b"mvhd";
const MVEX: FourCc = *b"mvex";
const TRAK: FourCc = *b"trak";
const TKHD: FourCc = *b"tkhd";
const MDIA: FourCc = *b"mdia";
const MDHD: FourCc = *b"mdhd";
const HDLR: FourCc = *b"hdlr";
const MINF: FourCc = *b"minf";
const STBL: FourCc = *b"stbl";
const STSD: FourCc = *b"stsd";
const STTS: FourCc = *b"stts";
const CTTS: FourCc = *b"ctts";
const STSC: FourCc = *b"stsc";
const STSZ: FourCc = *b"stsz";
const STCO: FourCc = *b"stco";
const CO64: FourCc = *b"co64";
const STSS: FourCc = *b"stss";

const VIDE: FourCc = *b"vide";

const AVCC: FourCc = *b"avcC";
const HVCC: FourCc = *b"hvcC";
const VPCC: FourCc = *b"vpcC";
const AV1C: FourCc = *b"av1C";

/// Bytes between the start of a visual sample entry's payload and its
/// first child box.
const VISUAL_SAMPLE_ENTRY_LEN: usize = 78;

/// Render a fourcc for log and error messages.
pub(crate) fn fourcc_str(kind: &FourCc) -> String {
    kind.iter()
        .map(|&byte| if byte.is_ascii_graphic() { byte as char } else { '?' })
        .collect()
}

/// Declared extent of a box.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BoxSize {
    /// Total size including the header.
    Exact(u64),
    /// The box runs to the end of its container (or of the file).
    ToEnd,
}

/// A parsed box header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BoxHeader {
    pub kind: FourCc,
    pub header_len: u64,
    pub size: BoxSize,
}

impl BoxHeader {
    /// Parse a header from the start of `bytes`.
    ///
    /// Returns `Ok(None)` when `bytes` is too short to hold the full header.
    pub(crate) fn parse(bytes: &[u8]) -> Result<Option<Self>, ExtractError> {
        if bytes.len() < 8 {
            return Ok(None);
        }
        let size32 = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let kind = [bytes[4], bytes[5], bytes[6], bytes[7]];

        let header = match size32 {
            0 => BoxHeader {
                kind,
                header_len: 8,
                size: BoxSize::ToEnd,
            },
            1 => {
                if bytes.len() < 16 {
                    return Ok(None);
                }
                let mut large = [0u8; 8];
                large.copy_from_slice(&bytes[8..16]);
                BoxHeader {
                    kind,
                    header_len: 16,
                    size: BoxSize::Exact(u64::from_be_bytes(large)),
                }
            }
            size => BoxHeader {
                kind,
                header_len: 8,
                size: BoxSize::Exact(u64::from(size)),
            },
        };

        match header.size {
            BoxSize::Exact(size) if size < header.header_len => Err(ExtractError::Demux(format!(
                "'{}' box declares size {size}, smaller than its {}-byte header",
                fourcc_str(&kind),
                header.header_len
            ))),
            _ => Ok(Some(header)),
        }
    }

    /// Total box size, resolving [`BoxSize::ToEnd`] against `available`
    /// bytes counted from the start of the box.
    pub(crate) fn total_len(&self, available: u64) -> u64 {
        match self.size {
            BoxSize::Exact(size) => size,
            BoxSize::ToEnd => available,
        }
    }
}

/// Big-endian cursor over a box payload.
pub(crate) struct ByteReader<'a> {
    bytes: &'a [u8],
    position: usize,
    context: &'static str,
}

impl<'a> ByteReader<'a> {
    pub(crate) fn new(bytes: &'a [u8], context: &'static str) -> Self {
        Self {
            bytes,
            position: 0,
            context,
        }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.bytes.len() - self.position
    }

    pub(crate) fn take(&mut self, len: usize) -> Result<&'a [u8], ExtractError> {
        if self.remaining() < len {
            return Err(ExtractError::Demux(format!(
                "'{}' box ended early: needed {len} bytes, {} left",
                self.context,
                self.remaining()
            )));
        }
        let slice = &self.bytes[self.position..self.position + len];
        self.position += len;
        Ok(slice)
    }

    pub(crate) fn skip(&mut self, len: usize) -> Result<(), ExtractError> {
        self.take(len).map(|_| ())
    }

    pub(crate) fn u8(&mut self) -> Result<u8, ExtractError> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn u16(&mut self) -> Result<u16, ExtractError> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    pub(crate) fn u32(&mut self) -> Result<u32, ExtractError> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub(crate) fn i32(&mut self) -> Result<i32, ExtractError> {
        Ok(self.u32()? as i32)
    }

    pub(crate) fn u64(&mut self) -> Result<u64, ExtractError> {
        let bytes = self.take(8)?;
        let mut array = [0u8; 8];
        array.copy_from_slice(bytes);
        Ok(u64::from_be_bytes(array))
    }

    pub(crate) fn fourcc(&mut self) -> Result<FourCc, ExtractError> {
        let bytes = self.take(4)?;
        Ok([bytes[0], bytes[1], bytes[2], bytes[3]])
    }

    /// Version byte and 24-bit flags of a full box.
    pub(crate) fn full_box_header(&mut self) -> Result<(u8, u32), ExtractError> {
        let word = self.u32()?;
        Ok(((word >> 24) as u8, word & 0x00FF_FFFF))
    }

    /// A `Vec` capacity for `count` entries of `entry_len` bytes that the
    /// remaining payload can actually hold.
    pub(crate) fn capacity_for(&self, count: u32, entry_len: usize) -> usize {
        (count as usize).min(self.remaining() / entry_len.max(1))
    }
}

/// Iterate the child boxes packed into `payload`.
pub(crate) fn children(payload: &[u8]) -> Children<'_> {
    Children {
        payload,
        position: 0,
    }
}

pub(crate) struct Children<'a> {
    payload: &'a [u8],
    position: usize,
}

impl<'a> Iterator for Children<'a> {
    type Item = Result<(FourCc, &'a [u8]), ExtractError>;

    fn next(&mut self) -> Option<Self::Item> {
        let rest = &self.payload[self.position..];
        // Trailing padding shorter than a header is tolerated.
        if rest.len() < 8 {
            return None;
        }
        let header = match BoxHeader::parse(rest) {
            Ok(Some(header)) => header,
            Ok(None) => {
                self.position = self.payload.len();
                return Some(Err(ExtractError::Demux("truncated child box header".to_string())));
            }
            Err(error) => {
                self.position = self.payload.len();
                return Some(Err(error));
            }
        };
        let total = header.total_len(rest.len() as u64);
        if total > rest.len() as u64 {
            self.position = self.payload.len();
            return Some(Err(ExtractError::Demux(format!(
                "'{}' box overruns its parent by {} bytes",
                fourcc_str(&header.kind),
                total - rest.len() as u64
            ))));
        }
        let body = &rest[header.header_len as usize..total as usize];
        self.position += total as usize;
        Some(Ok((header.kind, body)))
    }
}

/// Codec information from the first `stsd` entry.
#[derive(Debug, Clone, Default)]
pub(crate) struct SampleDescription {
    pub format: FourCc,
    pub width: u16,
    pub height: u16,
    /// Decoder configuration record, without its box header.
    pub config: Vec<u8>,
}

/// One `trak`, reduced to what frame extraction needs.
#[derive(Debug, Clone, Default)]
pub(crate) struct ParsedTrack {
    pub track_id: u32,
    pub handler: FourCc,
    pub timescale: u32,
    pub duration: u64,
    pub description: Option<SampleDescription>,
    pub table: SampleTable,
}

impl ParsedTrack {
    pub(crate) fn is_video(&self) -> bool {
        self.handler == VIDE
    }
}

/// Result of parsing a complete `moov` payload.
#[derive(Debug, Default)]
pub(crate) struct Movie {
    pub timescale: u32,
    pub duration: u64,
    pub tracks: Vec<ParsedTrack>,
    /// A `mvex` box was present, so samples live in `moof` fragments.
    pub fragmented: bool,
}

impl Movie {
    /// First track whose handler is `vide`.
    pub(crate) fn first_video_track(self) -> Option<ParsedTrack> {
        self.tracks.into_iter().find(ParsedTrack::is_video)
    }
}

/// Parse the payload of a `moov` box.
pub(crate) fn parse_movie(payload: &[u8]) -> Result<Movie, ExtractError> {
    let mut movie = Movie::default();
    for child in children(payload) {
        let (kind, body) = child?;
        match kind {
            MVHD => {
                let mut reader = ByteReader::new(body, "mvhd");
                let (version, _) = reader.full_box_header()?;
                if version == 1 {
                    reader.skip(16)?;
                    movie.timescale = reader.u32()?;
                    movie.duration = reader.u64()?;
                } else {
                    reader.skip(8)?;
                    movie.timescale = reader.u32()?;
                    movie.duration = u64::from(reader.u32()?);
                }
            }
            TRAK => movie.tracks.push(parse_track(body)?),
            MVEX => movie.fragmented = true,
            _ => {}
        }
    }
    Ok(movie)
}

fn parse_track(payload: &[u8]) -> Result<ParsedTrack, ExtractError> {
    let mut track = ParsedTrack::default();
    for child in children(payload) {
        let (kind, body) = child?;
        match kind {
            TKHD => {
                let mut reader = ByteReader::new(body, "tkhd");
                let (version, _) = reader.full_box_header()?;
                reader.skip(if version == 1 { 16 } else { 8 })?;
                track.track_id = reader.u32()?;
            }
            MDIA => parse_media(body, &mut track)?,
            _ => {}
        }
    }
    Ok(track)
}

fn parse_media(payload: &[u8], track: &mut ParsedTrack) -> Result<(), ExtractError> {
    for child in children(payload) {
        let (kind, body) = child?;
        match kind {
            MDHD => {
                let mut reader = ByteReader::new(body, "mdhd");
                let (version, _) = reader.full_box_header()?;
                if version == 1 {
                    reader.skip(16)?;
                    track.timescale = reader.u32()?;
                    track.duration = reader.u64()?;
                } else {
                    reader.skip(8)?;
                    track.timescale = reader.u32()?;
                    track.duration = u64::from(reader.u32()?);
                }
            }
            HDLR => {
                let mut reader = ByteReader::new(body, "hdlr");
                reader.full_box_header()?;
                reader.skip(4)?;
                track.handler = reader.fourcc()?;
            }
            MINF => {
                for grandchild in children(body) {
                    let (kind, stbl) = grandchild?;
                    if kind == STBL {
                        parse_sample_table(stbl, track)?;
                    }
                }
            }
            _ => {}
        }
    }
    Ok(())
}

fn parse_sample_table(payload: &[u8], track: &mut ParsedTrack) -> Result<(), ExtractError> {
    for child in children(payload) {
        let (kind, body) = child?;
        match kind {
            STSD => track.description = parse_sample_description(body)?,
            STTS => {
                let mut reader = ByteReader::new(body, "stts");
                reader.full_box_header()?;
                let count = reader.u32()?;
                let mut entries = Vec::with_capacity(reader.capacity_for(count, 8));
                for _ in 0..count {
                    entries.push((reader.u32()?, reader.u32()?));
                }
                track.table.time_to_sample = entries;
            }
            CTTS => {
                let mut reader = ByteReader::new(body, "ctts");
                reader.full_box_header()?;
                let count = reader.u32()?;
                let mut entries = Vec::with_capacity(reader.capacity_for(count, 8));
                for _ in 0..count {
                    // Version 0 offsets are nominally unsigned; encoders
                    // routinely write negative values there too.
                    entries.push((reader.u32()?, reader.i32()?));
                }
                track.table.composition_offsets = entries;
            }
            STSC => {
                let mut reader = ByteReader::new(body, "stsc");
                reader.full_box_header()?;
                let count = reader.u32()?;
                let mut entries = Vec::with_capacity(reader.capacity_for(count, 12));
                for _ in 0..count {
                    entries.push((reader.u32()?, reader.u32()?, reader.u32()?));
                }
                track.table.sample_to_chunk = entries;
            }
            STSZ => {
                let mut reader = ByteReader::new(body, "stsz");
                reader.full_box_header()?;
                let uniform = reader.u32()?;
                let count = reader.u32()?;
                track.table.sample_count = count;
                if uniform == 0 {
                    let mut sizes = Vec::with_capacity(reader.capacity_for(count, 4));
                    for _ in 0..count {
                        sizes.push(reader.u32()?);
                    }
                    track.table.sample_sizes = sizes;
                } else {
                    track.table.uniform_size = Some(uniform);
                }
            }
            STCO => {
                let mut reader = ByteReader::new(body, "stco");
                reader.full_box_header()?;
                let count = reader.u32()?;
                let mut offsets = Vec::with_capacity(reader.capacity_for(count, 4));
                for _ in 0..count {
                    offsets.push(u64::from(reader.u32()?));
                }
                track.table.chunk_offsets = offsets;
            }
            CO64 => {
                let mut reader = ByteReader::new(body, "co64");
                reader.full_box_header()?;
                let count = reader.u32()?;
                let mut offsets = Vec::with_capacity(reader.capacity_for(count, 8));
                for _ in 0..count {
                    offsets.push(reader.u64()?);
                }
                track.table.chunk_offsets = offsets;
            }
            STSS => {
                let mut reader = ByteReader::new(body, "stss");
                reader.full_box_header()?;
                let count = reader.u32()?;
                let mut sync = Vec::with_capacity(reader.capacity_for(count, 4));
                for _ in 0..count {
                    sync.push(reader.u32()?);
                }
                track.table.sync_samples = Some(sync);
            }
            _ => {}
        }
    }
    Ok(())
}

fn parse_sample_description(payload: &[u8]) -> Result<Option<SampleDescription>, ExtractError> {
    let mut reader = ByteReader::new(payload, "stsd");
    reader.full_box_header()?;
    if reader.u32()? == 0 {
        return Ok(None);
    }

    // Only the first entry is used.
    let Some((format, entry)) = children(&payload[8..]).next().transpose()? else {
        return Ok(None);
    };

    let mut entry_reader = ByteReader::new(entry, "stsd entry");
    entry_reader.skip(24)?;
    let width = entry_reader.u16()?;
    let height = entry_reader.u16()?;

    let mut description = SampleDescription {
        format,
        width,
        height,
        config: Vec::new(),
    };

    if entry.len() > VISUAL_SAMPLE_ENTRY_LEN {
        for child in children(&entry[VISUAL_SAMPLE_ENTRY_LEN..]) {
            let (kind, body) = child?;
            if matches!(kind, AVCC | HVCC | VPCC | AV1C) {
                description.config = body.to_vec();
                break;
            }
        }
    }

    Ok(Some(description))
}
