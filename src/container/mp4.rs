//! ISO base media (MP4) muxer
//!
//! Layout: `ftyp`, one `mdat` streamed with a 64-bit size, then `moov`
//! written on finish. Every sample is its own chunk, addressed through `co64`.
//!
//! Sample payloads are written as delivered. Compressed video must already be
//! length-prefixed, and `TrackFormat::codec_config` carries the complete
//! `avcC`/`hvcC` record or AudioSpecificConfig.

use super::muxer::{Muxer, MuxerFactory};
use crate::encoder::{EncodedSample, StreamKind, TrackFormat, TrackParams};
use crate::utils::error::WriterError;
use std::fs::File;
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::Path;

/// Movie timescale (milliseconds)
const MOVIE_TIMESCALE: u32 = 1_000;
const VIDEO_TIMESCALE: u32 = 90_000;
/// PCM frames per AAC-LC access unit
const AAC_FRAME_SAMPLES: u32 = 1024;

const MATRIX_ONE: i32 = 0x0001_0000;
const MATRIX_W: i32 = 0x4000_0000;

/// Sample entry types the muxer can describe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SampleEntry {
    Avc,
    Hevc,
    RawVideo,
    Aac,
    PcmLe,
}

impl SampleEntry {
    fn from_mime(mime: &str) -> Option<Self> {
        match mime {
            "video/avc" => Some(SampleEntry::Avc),
            "video/hevc" => Some(SampleEntry::Hevc),
            "video/raw" => Some(SampleEntry::RawVideo),
            "audio/mp4a-latm" => Some(SampleEntry::Aac),
            "audio/raw" => Some(SampleEntry::PcmLe),
            _ => None,
        }
    }

    fn fourcc(&self) -> &'static [u8; 4] {
        match self {
            SampleEntry::Avc => b"avc1",
            SampleEntry::Hevc => b"hvc1",
            SampleEntry::RawVideo => b"raw ",
            SampleEntry::Aac => b"mp4a",
            SampleEntry::PcmLe => b"sowt",
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct SampleInfo {
    offset: u64,
    size: u32,
    pts_us: u64,
    sync: bool,
}

struct Mp4Track {
    id: u32,
    format: TrackFormat,
    entry: SampleEntry,
    timescale: u32,
    samples: Vec<SampleInfo>,
}

impl Mp4Track {
    fn kind(&self) -> StreamKind {
        self.format.kind()
    }

    fn ticks(&self, pts_us: u64) -> u64 {
        (u128::from(pts_us) * u128::from(self.timescale) / 1_000_000) as u64
    }

    /// Duration of the last sample, which has no successor to measure against
    fn last_sample_duration(&self, last: &SampleInfo, previous: Option<u64>) -> u32 {
        if let Some(delta) = previous {
            return delta as u32;
        }
        match (&self.format.params, self.entry) {
            (TrackParams::Video { frame_rate, .. }, _) => self.timescale / (*frame_rate).max(1),
            (TrackParams::Audio { channels, bits_per_sample, .. }, SampleEntry::PcmLe) => {
                let frame_bytes = u32::from(*channels).max(1) * u32::from(*bits_per_sample / 8).max(1);
                last.size / frame_bytes
            }
            (TrackParams::Audio { .. }, _) => AAC_FRAME_SAMPLES,
        }
    }

    /// Per-sample durations in media timescale units
    fn durations(&self) -> Vec<u32> {
        let ticks: Vec<u64> = self.samples.iter().map(|s| self.ticks(s.pts_us)).collect();
        let mut durations: Vec<u32> = ticks
            .windows(2)
            .map(|w| w[1].saturating_sub(w[0]) as u32)
            .collect();
        if let Some(last) = self.samples.last() {
            let previous = durations.last().map(|d| u64::from(*d));
            durations.push(self.last_sample_duration(last, previous));
        }
        durations
    }
}

/// Streaming MP4 writer
pub struct Mp4Muxer<W: Write + Seek + Send = BufWriter<File>> {
    out: W,
    tracks: Vec<Mp4Track>,
    /// Offset of the `mdat` header once started
    mdat_start: Option<u64>,
    position: u64,
    finished: bool,
}

impl Mp4Muxer<BufWriter<File>> {
    /// Create (or truncate) the output file
    pub fn create(path: &Path) -> Result<Self, WriterError> {
        let file = File::create(path)?;
        Ok(Self::new(BufWriter::new(file)))
    }
}

/// Factory for file-backed `Mp4Muxer`s
#[derive(Debug, Default, Clone, Copy)]
pub struct Mp4MuxerFactory;

impl MuxerFactory for Mp4MuxerFactory {
    fn open(&self, path: &Path) -> Result<Box<dyn Muxer>, WriterError> {
        Ok(Box::new(Mp4Muxer::create(path)?))
    }
}

impl<W: Write + Seek + Send> Mp4Muxer<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            tracks: Vec::new(),
            mdat_start: None,
            position: 0,
            finished: false,
        }
    }

    /// Give back the underlying writer
    pub fn into_inner(self) -> W {
        self.out
    }

    fn write_all(&mut self, data: &[u8]) -> Result<(), WriterError> {
        self.out.write_all(data)?;
        self.position += data.len() as u64;
        Ok(())
    }

    fn movie_duration_ms(&self) -> u64 {
        let origin = self.movie_origin_us();
        self.tracks
            .iter()
            .map(|t| track_edit_offset_ms(t, origin) + track_media_duration_ms(t))
            .max()
            .unwrap_or(0)
    }

    /// Earliest first-sample timestamp across tracks
    fn movie_origin_us(&self) -> u64 {
        self.tracks
            .iter()
            .filter_map(|t| t.samples.first().map(|s| s.pts_us))
            .min()
            .unwrap_or(0)
    }

    fn build_moov(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        let moov = begin_box(&mut buf, b"moov");
        write_mvhd(&mut buf, self.movie_duration_ms(), self.tracks.len() as u32 + 1);
        let origin = self.movie_origin_us();
        for track in &self.tracks {
            write_trak(&mut buf, track, origin);
        }
        end_box(&mut buf, moov);
        buf
    }
}

impl<W: Write + Seek + Send> Muxer for Mp4Muxer<W> {
    fn name(&self) -> &str {
        "mp4"
    }

    fn add_track(&mut self, format: &TrackFormat) -> Result<usize, WriterError> {
        if self.mdat_start.is_some() {
            return Err(WriterError::Muxer("track added after start".to_string()));
        }
        let entry = SampleEntry::from_mime(&format.mime)
            .ok_or_else(|| WriterError::Muxer(format!("unsupported track type {}", format.mime)))?;
        let timescale = match format.params {
            TrackParams::Video { .. } => VIDEO_TIMESCALE,
            TrackParams::Audio { sample_rate, .. } => sample_rate.max(1),
        };

        let index = self.tracks.len();
        self.tracks.push(Mp4Track {
            id: index as u32 + 1,
            format: format.clone(),
            entry,
            timescale,
            samples: Vec::new(),
        });
        Ok(index)
    }

    fn start(&mut self) -> Result<(), WriterError> {
        if self.mdat_start.is_some() {
            return Err(WriterError::Muxer("muxer already started".to_string()));
        }

        let mut header = Vec::new();
        let ftyp = begin_box(&mut header, b"ftyp");
        header.extend_from_slice(b"isom");
        header.extend_from_slice(&0x200u32.to_be_bytes());
        for brand in [b"isom", b"iso2", b"mp41"] {
            header.extend_from_slice(brand);
        }
        end_box(&mut header, ftyp);

        let mdat_start = header.len() as u64;
        // size 1: the real size follows as a 64-bit value
        header.extend_from_slice(&1u32.to_be_bytes());
        header.extend_from_slice(b"mdat");
        header.extend_from_slice(&0u64.to_be_bytes());

        self.write_all(&header)?;
        self.mdat_start = Some(mdat_start);
        Ok(())
    }

    fn write_sample(&mut self, track: usize, sample: &EncodedSample) -> Result<(), WriterError> {
        if self.mdat_start.is_none() || self.finished {
            return Err(WriterError::Muxer("sample written outside of mdat".to_string()));
        }
        if track >= self.tracks.len() {
            return Err(WriterError::Muxer(format!("no track {}", track)));
        }

        let offset = self.position;
        self.write_all(&sample.data)?;
        self.tracks[track].samples.push(SampleInfo {
            offset,
            size: sample.data.len() as u32,
            pts_us: sample.pts_us,
            sync: sample.flags.key_frame,
        });
        Ok(())
    }

    fn finish(&mut self) -> Result<(), WriterError> {
        if self.finished {
            return Ok(());
        }
        let mdat_start = self
            .mdat_start
            .ok_or_else(|| WriterError::Muxer("finish before start".to_string()))?;
        self.finished = true;

        let mdat_size = self.position - mdat_start;
        self.out.seek(SeekFrom::Start(mdat_start + 8))?;
        self.out.write_all(&mdat_size.to_be_bytes())?;
        self.out.seek(SeekFrom::Start(self.position))?;

        let moov = self.build_moov();
        self.write_all(&moov)?;
        self.out.flush()?;

        tracing::debug!(
            "MP4 finished: {} tracks, {} bytes of media, {} byte index",
            self.tracks.len(),
            mdat_size,
            moov.len()
        );
        Ok(())
    }

    fn abort(&mut self) {
        self.finished = true;
        let _ = self.out.flush();
    }
}

fn track_media_duration_ms(track: &Mp4Track) -> u64 {
    let ticks: u64 = track.durations().iter().map(|d| u64::from(*d)).sum();
    ticks * u64::from(MOVIE_TIMESCALE) / u64::from(track.timescale)
}

fn track_edit_offset_ms(track: &Mp4Track, origin_us: u64) -> u64 {
    track
        .samples
        .first()
        .map(|s| (s.pts_us - origin_us) / 1_000)
        .unwrap_or(0)
}

// Box helpers: write a placeholder header, fill the body, patch the size.

fn begin_box(buf: &mut Vec<u8>, fourcc: &[u8; 4]) -> usize {
    let start = buf.len();
    buf.extend_from_slice(&0u32.to_be_bytes());
    buf.extend_from_slice(fourcc);
    start
}

fn begin_full_box(buf: &mut Vec<u8>, fourcc: &[u8; 4], version: u8, flags: u32) -> usize {
    let start = begin_box(buf, fourcc);
    buf.extend_from_slice(&((u32::from(version) << 24) | (flags & 0x00ff_ffff)).to_be_bytes());
    start
}

fn end_box(buf: &mut [u8], start: usize) {
    let size = (buf.len() - start) as u32;
    buf[start..start + 4].copy_from_slice(&size.to_be_bytes());
}

fn put_u16(buf: &mut Vec<u8>, v: u16) {
    buf.extend_from_slice(&v.to_be_bytes());
}

fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_be_bytes());
}

fn put_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_be_bytes());
}

fn put_matrix(buf: &mut Vec<u8>, rotation: u16) {
    let (a, b, c, d) = match rotation {
        90 => (0, MATRIX_ONE, -MATRIX_ONE, 0),
        180 => (-MATRIX_ONE, 0, 0, -MATRIX_ONE),
        270 => (0, -MATRIX_ONE, MATRIX_ONE, 0),
        _ => (MATRIX_ONE, 0, 0, MATRIX_ONE),
    };
    for v in [a, b, 0, c, d, 0, 0, 0, MATRIX_W] {
        buf.extend_from_slice(&v.to_be_bytes());
    }
}

fn write_mvhd(buf: &mut Vec<u8>, duration_ms: u64, next_track_id: u32) {
    let mvhd = begin_full_box(buf, b"mvhd", 0, 0);
    put_u32(buf, 0); // creation_time
    put_u32(buf, 0); // modification_time
    put_u32(buf, MOVIE_TIMESCALE);
    put_u32(buf, duration_ms.min(u64::from(u32::MAX)) as u32);
    put_u32(buf, 0x0001_0000); // rate 1.0
    put_u16(buf, 0x0100); // volume 1.0
    buf.extend_from_slice(&[0; 10]);
    put_matrix(buf, 0);
    buf.extend_from_slice(&[0; 24]); // pre_defined
    put_u32(buf, next_track_id);
    end_box(buf, mvhd);
}

fn write_trak(buf: &mut Vec<u8>, track: &Mp4Track, origin_us: u64) {
    let edit_ms = track_edit_offset_ms(track, origin_us);
    let media_ms = track_media_duration_ms(track);

    let trak = begin_box(buf, b"trak");
    write_tkhd(buf, track, edit_ms + media_ms);
    if edit_ms > 0 {
        write_edts(buf, edit_ms, media_ms);
    }

    let mdia = begin_box(buf, b"mdia");
    write_mdhd(buf, track);
    write_hdlr(buf, track.kind());

    let minf = begin_box(buf, b"minf");
    match track.kind() {
        StreamKind::Video => {
            let vmhd = begin_full_box(buf, b"vmhd", 0, 1);
            buf.extend_from_slice(&[0; 8]); // graphics mode, opcolor
            end_box(buf, vmhd);
        }
        StreamKind::Audio => {
            let smhd = begin_full_box(buf, b"smhd", 0, 0);
            buf.extend_from_slice(&[0; 4]); // balance, reserved
            end_box(buf, smhd);
        }
    }
    write_dinf(buf);
    write_stbl(buf, track);
    end_box(buf, minf);

    end_box(buf, mdia);
    end_box(buf, trak);
}

fn write_tkhd(buf: &mut Vec<u8>, track: &Mp4Track, duration_ms: u64) {
    // enabled | in movie
    let tkhd = begin_full_box(buf, b"tkhd", 0, 0x3);
    put_u32(buf, 0);
    put_u32(buf, 0);
    put_u32(buf, track.id);
    put_u32(buf, 0);
    put_u32(buf, duration_ms.min(u64::from(u32::MAX)) as u32);
    buf.extend_from_slice(&[0; 8]);
    put_u16(buf, 0); // layer
    put_u16(buf, 0); // alternate_group
    match track.format.params {
        TrackParams::Video {
            width,
            height,
            rotation,
            ..
        } => {
            put_u16(buf, 0);
            put_u16(buf, 0);
            put_matrix(buf, rotation);
            put_u32(buf, width << 16);
            put_u32(buf, height << 16);
        }
        TrackParams::Audio { .. } => {
            put_u16(buf, 0x0100);
            put_u16(buf, 0);
            put_matrix(buf, 0);
            put_u32(buf, 0);
            put_u32(buf, 0);
        }
    }
    end_box(buf, tkhd);
}

/// Empty edit shifting a late-starting track, followed by its media
fn write_edts(buf: &mut Vec<u8>, empty_ms: u64, media_ms: u64) {
    let edts = begin_box(buf, b"edts");
    let elst = begin_full_box(buf, b"elst", 1, 0);
    put_u32(buf, 2);
    put_u64(buf, empty_ms);
    buf.extend_from_slice(&(-1i64).to_be_bytes());
    put_u32(buf, 0x0001_0000);
    put_u64(buf, media_ms);
    put_u64(buf, 0);
    put_u32(buf, 0x0001_0000);
    end_box(buf, elst);
    end_box(buf, edts);
}

fn write_mdhd(buf: &mut Vec<u8>, track: &Mp4Track) {
    let duration: u64 = track.durations().iter().map(|d| u64::from(*d)).sum();
    let mdhd = begin_full_box(buf, b"mdhd", 1, 0);
    put_u64(buf, 0);
    put_u64(buf, 0);
    put_u32(buf, track.timescale);
    put_u64(buf, duration);
    put_u16(buf, 0x55c4); // und
    put_u16(buf, 0);
    end_box(buf, mdhd);
}

fn write_hdlr(buf: &mut Vec<u8>, kind: StreamKind) {
    let (handler, name): (&[u8; 4], &[u8]) = match kind {
        StreamKind::Video => (b"vide", b"VideoHandle\0"),
        StreamKind::Audio => (b"soun", b"SoundHandle\0"),
    };
    let hdlr = begin_full_box(buf, b"hdlr", 0, 0);
    put_u32(buf, 0);
    buf.extend_from_slice(handler);
    buf.extend_from_slice(&[0; 12]);
    buf.extend_from_slice(name);
    end_box(buf, hdlr);
}

fn write_dinf(buf: &mut Vec<u8>) {
    let dinf = begin_box(buf, b"dinf");
    let dref = begin_full_box(buf, b"dref", 0, 0);
    put_u32(buf, 1);
    // self-contained
    let url = begin_full_box(buf, b"url ", 0, 1);
    end_box(buf, url);
    end_box(buf, dref);
    end_box(buf, dinf);
}

fn write_stbl(buf: &mut Vec<u8>, track: &Mp4Track) {
    let stbl = begin_box(buf, b"stbl");
    write_stsd(buf, track);

    // stts, run-length encoded
    let mut runs: Vec<(u32, u32)> = Vec::new();
    for duration in track.durations() {
        match runs.last_mut() {
            Some((count, delta)) if *delta == duration => *count += 1,
            _ => runs.push((1, duration)),
        }
    }
    let stts = begin_full_box(buf, b"stts", 0, 0);
    put_u32(buf, runs.len() as u32);
    for (count, delta) in runs {
        put_u32(buf, count);
        put_u32(buf, delta);
    }
    end_box(buf, stts);

    let all_sync = track.samples.iter().all(|s| s.sync);
    if track.kind() == StreamKind::Video && !all_sync {
        let stss = begin_full_box(buf, b"stss", 0, 0);
        let sync: Vec<u32> = track
            .samples
            .iter()
            .enumerate()
            .filter(|(_, s)| s.sync)
            .map(|(i, _)| i as u32 + 1)
            .collect();
        put_u32(buf, sync.len() as u32);
        for number in sync {
            put_u32(buf, number);
        }
        end_box(buf, stss);
    }

    let stsz = begin_full_box(buf, b"stsz", 0, 0);
    put_u32(buf, 0); // sizes follow
    put_u32(buf, track.samples.len() as u32);
    for sample in &track.samples {
        put_u32(buf, sample.size);
    }
    end_box(buf, stsz);

    let stsc = begin_full_box(buf, b"stsc", 0, 0);
    if track.samples.is_empty() {
        put_u32(buf, 0);
    } else {
        put_u32(buf, 1);
        put_u32(buf, 1); // first chunk
        put_u32(buf, 1); // samples per chunk
        put_u32(buf, 1); // description index
    }
    end_box(buf, stsc);

    let co64 = begin_full_box(buf, b"co64", 0, 0);
    put_u32(buf, track.samples.len() as u32);
    for sample in &track.samples {
        put_u64(buf, sample.offset);
    }
    end_box(buf, co64);

    end_box(buf, stbl);
}

fn write_stsd(buf: &mut Vec<u8>, track: &Mp4Track) {
    let stsd = begin_full_box(buf, b"stsd", 0, 0);
    put_u32(buf, 1);

    let entry = begin_box(buf, track.entry.fourcc());
    buf.extend_from_slice(&[0; 6]);
    put_u16(buf, 1); // data_reference_index

    match track.format.params {
        TrackParams::Video { width, height, .. } => {
            buf.extend_from_slice(&[0; 16]);
            put_u16(buf, width.min(u32::from(u16::MAX)) as u16);
            put_u16(buf, height.min(u32::from(u16::MAX)) as u16);
            put_u32(buf, 0x0048_0000); // 72 dpi
            put_u32(buf, 0x0048_0000);
            put_u32(buf, 0);
            put_u16(buf, 1); // frame_count
            buf.extend_from_slice(&[0; 32]); // compressorname
            let depth = if track.entry == SampleEntry::RawVideo { 32 } else { 0x18 };
            put_u16(buf, depth);
            buf.extend_from_slice(&(-1i16).to_be_bytes());

            let config: Option<&[u8; 4]> = match track.entry {
                SampleEntry::Avc => Some(b"avcC"),
                SampleEntry::Hevc => Some(b"hvcC"),
                _ => None,
            };
            if let Some(fourcc) = config {
                let record = begin_box(buf, fourcc);
                buf.extend_from_slice(&track.format.codec_config);
                end_box(buf, record);
            }
        }
        TrackParams::Audio {
            sample_rate,
            channels,
            bits_per_sample,
        } => {
            buf.extend_from_slice(&[0; 8]);
            put_u16(buf, channels);
            put_u16(buf, bits_per_sample);
            put_u16(buf, 0);
            put_u16(buf, 0);
            let rate = if sample_rate > u32::from(u16::MAX) { 0 } else { sample_rate << 16 };
            put_u32(buf, rate);

            if track.entry == SampleEntry::Aac {
                write_esds(buf, track);
            }
        }
    }
    end_box(buf, entry);
    end_box(buf, stsd);
}

/// MPEG-4 descriptor with its size encoded in 7-bit groups
fn put_descriptor(buf: &mut Vec<u8>, tag: u8, body: &[u8]) {
    buf.push(tag);
    let len = body.len() as u32;
    let mut groups = vec![(len & 0x7f) as u8];
    let mut rest = len >> 7;
    while rest > 0 {
        groups.push((rest & 0x7f) as u8 | 0x80);
        rest >>= 7;
    }
    groups.reverse();
    buf.extend_from_slice(&groups);
    buf.extend_from_slice(body);
}

fn write_esds(buf: &mut Vec<u8>, track: &Mp4Track) {
    let mut decoder_config = vec![0x40, 0x15]; // MPEG-4 audio, audio stream
    decoder_config.extend_from_slice(&[0, 0x18, 0]); // buffer size
    decoder_config.extend_from_slice(&track.format.bitrate.to_be_bytes()); // max
    decoder_config.extend_from_slice(&track.format.bitrate.to_be_bytes()); // avg
    put_descriptor(&mut decoder_config, 0x05, &track.format.codec_config);

    let mut es = Vec::new();
    es.extend_from_slice(&(track.id as u16).to_be_bytes());
    es.push(0);
    put_descriptor(&mut es, 0x04, &decoder_config);
    put_descriptor(&mut es, 0x06, &[0x02]);

    let esds = begin_full_box(buf, b"esds", 0, 0);
    put_descriptor(buf, 0x03, &es);
    end_box(buf, esds);
}
