//! Uncompressed QuickTime writer.
//!
//! Layout: `ftyp`, one growing `mdat` with a 64-bit size patched on finish,
//! then `moov`. Samples are 32-bit ARGB (`raw `) at the target size. Sample
//! presentation times are the capture timestamps: decode times start at zero,
//! a constant `ctts` offset adds the origin back, and the edit list starts
//! playback at the origin. The media timescale is the origin's own, or a
//! coarser one when the origin would overflow the 32-bit offset.

use super::{Muxer, TargetSize};
use crate::error::RecordingError;
use crate::frame::{Frame, MediaTime, PixelFormat};
use bytes::{BufMut, BytesMut};
use fast_image_resize::images::{Image, ImageRef};
use fast_image_resize::{FilterType, PixelType, ResizeAlg, ResizeOptions, Resizer};
use std::fs::File;
use std::io::{self, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const FTYP_SIZE: u64 = 20;
/// size(1) + "mdat" + 64-bit largesize
const MDAT_HEADER: u64 = 16;
const MOVIE_TIMESCALE: u32 = 600;
/// Used for the last sample when there is no following frame
const DEFAULT_FPS: u32 = 30;

const IDENTITY_MATRIX: [u32; 9] = [0x0001_0000, 0, 0, 0, 0x0001_0000, 0, 0, 0, 0x4000_0000];

pub struct MovMuxer {
    path: PathBuf,
    out: BufWriter<File>,
    target: TargetSize,
    resizer: Resizer,
    scaled: Image<'static>,
    argb: Vec<u8>,
    origin: Option<MediaTime>,
    timescale: u32,
    /// Presentation times in the media timescale
    pts: Vec<i64>,
}

impl MovMuxer {
    pub fn create(path: &Path, target: TargetSize) -> Result<Self, RecordingError> {
        let fits = |v: u32| v > 0 && v <= u16::MAX as u32;
        if !fits(target.width) || !fits(target.height) {
            return Err(RecordingError::AddTrack(format!(
                "unsupported track size {}x{}",
                target.width, target.height
            )));
        }
        let file = File::create(path).map_err(RecordingError::CreateContainer)?;
        let mut out = BufWriter::new(file);

        let mut header = BytesMut::with_capacity((FTYP_SIZE + MDAT_HEADER) as usize);
        write_box(&mut header, b"ftyp", |b| {
            b.put_slice(b"qt  ");
            b.put_u32(0x2005_0300);
            b.put_slice(b"qt  ");
        });
        header.put_u32(1);
        header.put_slice(b"mdat");
        header.put_u64(MDAT_HEADER);
        out.write_all(&header).map_err(RecordingError::CreateContainer)?;

        let sample_len = target.width as usize * target.height as usize * PixelFormat::BYTES_PER_PIXEL;
        Ok(Self {
            path: path.to_path_buf(),
            out,
            target,
            resizer: Resizer::new(),
            scaled: Image::new(target.width, target.height, PixelType::U8x4),
            argb: vec![0; sample_len],
            origin: None,
            timescale: MOVIE_TIMESCALE,
            pts: Vec::new(),
        })
    }

    fn sample_len(&self) -> u64 {
        self.argb.len() as u64
    }

    fn timescale(&self) -> u32 {
        self.timescale
    }

    /// Scales `frame` to the target, cropping to keep its aspect, into `self.argb`.
    fn convert(&mut self, frame: &Frame) -> Result<(), RecordingError> {
        let buffer = &frame.buffer;
        let packed = buffer.packed();
        let same_size = buffer.width() == self.target.width && buffer.height() == self.target.height;

        let pixels: &[u8] = if same_size {
            &packed
        } else {
            let src = ImageRef::new(buffer.width(), buffer.height(), &packed, PixelType::U8x4)
                .map_err(|e| RecordingError::Write(io::Error::other(e)))?;
            // camera frames are opaque, so skip alpha premultiplication
            let options = ResizeOptions::new()
                .resize_alg(ResizeAlg::Convolution(FilterType::Bilinear))
                .use_alpha(false)
                .fit_into_destination(Some((0.5, 0.5)));
            self.resizer
                .resize(&src, &mut self.scaled, &options)
                .map_err(|e| RecordingError::Write(io::Error::other(e)))?;
            self.scaled.buffer()
        };

        let (r, g, b) = match buffer.format() {
            PixelFormat::Bgra8 => (2, 1, 0),
            PixelFormat::Rgba8 => (0, 1, 2),
        };
        for (dst, src) in self.argb.chunks_exact_mut(4).zip(pixels.chunks_exact(4)) {
            dst[0] = src[3];
            dst[1] = src[r];
            dst[2] = src[g];
            dst[3] = src[b];
        }
        Ok(())
    }

    /// Sample durations in the media timescale. The last one repeats the
    /// previous delta, or a nominal frame time for single-frame files.
    fn durations(&self) -> Vec<u32> {
        let mut durations: Vec<u32> = self
            .pts
            .windows(2)
            .map(|w| (w[1] - w[0]).clamp(0, u32::MAX as i64) as u32)
            .collect();
        if !self.pts.is_empty() {
            let last = durations
                .last()
                .copied()
                .unwrap_or_else(|| (self.timescale() / DEFAULT_FPS).max(1));
            durations.push(last);
        }
        durations
    }

    fn write_moov(&self, durations: &[u32]) -> BytesMut {
        let timescale = self.timescale();
        let media_duration: u64 = durations.iter().map(|&d| d as u64).sum();
        let movie_duration = MediaTime::new(media_duration as i64, timescale).rescale(MOVIE_TIMESCALE) as u64;
        let count = self.pts.len() as u32;

        // start_session picked a timescale in which the origin fits
        let first = self.pts.first().copied().unwrap_or(0);
        let offset = u32::try_from(first).unwrap_or(0);
        let width = self.target.width;
        let height = self.target.height;
        let sample_len = self.sample_len() as u32;

        let mut moov = BytesMut::new();
        write_box(&mut moov, b"moov", |b| {
            full_box(b, b"mvhd", 1, 0, |b| {
                b.put_u64(0);
                b.put_u64(0);
                b.put_u32(MOVIE_TIMESCALE);
                b.put_u64(movie_duration);
                b.put_u32(0x0001_0000);
                b.put_u16(0x0100);
                b.put_bytes(0, 10);
                IDENTITY_MATRIX.iter().for_each(|&m| b.put_u32(m));
                b.put_bytes(0, 24);
                b.put_u32(2);
            });
            write_box(b, b"trak", |b| {
                full_box(b, b"tkhd", 1, 0x3, |b| {
                    b.put_u64(0);
                    b.put_u64(0);
                    b.put_u32(1);
                    b.put_u32(0);
                    b.put_u64(movie_duration);
                    b.put_bytes(0, 8);
                    b.put_u16(0);
                    b.put_u16(0);
                    b.put_u16(0);
                    b.put_u16(0);
                    IDENTITY_MATRIX.iter().for_each(|&m| b.put_u32(m));
                    b.put_u32(width << 16);
                    b.put_u32(height << 16);
                });
                write_box(b, b"edts", |b| {
                    full_box(b, b"elst", 1, 0, |b| {
                        b.put_u32(1);
                        b.put_u64(movie_duration);
                        b.put_i64(i64::from(offset));
                        b.put_i16(1);
                        b.put_i16(0);
                    });
                });
                write_box(b, b"mdia", |b| {
                    full_box(b, b"mdhd", 1, 0, |b| {
                        b.put_u64(0);
                        b.put_u64(0);
                        b.put_u32(timescale);
                        b.put_u64(media_duration);
                        b.put_u16(0x55c4);
                        b.put_u16(0);
                    });
                    handler(b, b"mhlr", b"vide", "VideoHandler");
                    write_box(b, b"minf", |b| {
                        full_box(b, b"vmhd", 0, 0x1, |b| {
                            b.put_u16(0x40);
                            b.put_bytes(0x80, 6);
                        });
                        handler(b, b"dhlr", b"alis", "DataHandler");
                        write_box(b, b"dinf", |b| {
                            full_box(b, b"dref", 0, 0, |b| {
                                b.put_u32(1);
                                full_box(b, b"alis", 0, 0x1, |_| {});
                            });
                        });
                        write_box(b, b"stbl", |b| {
                            full_box(b, b"stsd", 0, 0, |b| {
                                b.put_u32(1);
                                write_box(b, b"raw ", |b| {
                                    b.put_bytes(0, 6);
                                    b.put_u16(1);
                                    b.put_u16(0);
                                    b.put_u16(0);
                                    b.put_u32(0);
                                    b.put_u32(0);
                                    b.put_u32(0x200);
                                    b.put_u16(width as u16);
                                    b.put_u16(height as u16);
                                    b.put_u32(0x0048_0000);
                                    b.put_u32(0x0048_0000);
                                    b.put_u32(0);
                                    b.put_u16(1);
                                    b.put_bytes(0, 32);
                                    b.put_u16(32);
                                    b.put_i16(-1);
                                });
                            });
                            full_box(b, b"stts", 0, 0, |b| {
                                let runs = run_lengths(durations);
                                b.put_u32(runs.len() as u32);
                                for (n, delta) in runs {
                                    b.put_u32(n);
                                    b.put_u32(delta);
                                }
                            });
                            if count > 0 {
                                full_box(b, b"ctts", 0, 0, |b| {
                                    b.put_u32(1);
                                    b.put_u32(count);
                                    b.put_u32(offset);
                                });
                            }
                            full_box(b, b"stsc", 0, 0, |b| {
                                if count > 0 {
                                    b.put_u32(1);
                                    b.put_u32(1);
                                    b.put_u32(count);
                                    b.put_u32(1);
                                } else {
                                    b.put_u32(0);
                                }
                            });
                            full_box(b, b"stsz", 0, 0, |b| {
                                b.put_u32(sample_len);
                                b.put_u32(count);
                            });
                            full_box(b, b"co64", 0, 0, |b| {
                                if count > 0 {
                                    b.put_u32(1);
                                    b.put_u64(FTYP_SIZE + MDAT_HEADER);
                                } else {
                                    b.put_u32(0);
                                }
                            });
                        });
                    });
                });
            });
        });
        moov
    }
}

impl Muxer for MovMuxer {
    fn start_session(&mut self, origin: MediaTime) -> Result<(), RecordingError> {
        let timescale = media_timescale(origin).ok_or_else(|| {
            RecordingError::AddTrack(format!(
                "origin {}/{} cannot be stored as a composition offset",
                origin.value, origin.timescale
            ))
        })?;
        if timescale != origin.timescale {
            warn!(
                from = origin.timescale,
                to = timescale,
                "Origin overflows the media timescale; using a coarser one"
            );
        }
        debug!(path = %self.path.display(), timescale, "MOV session started");
        self.origin = Some(origin);
        self.timescale = timescale;
        Ok(())
    }

    fn append(&mut self, frame: &Frame) -> Result<(), RecordingError> {
        if self.origin.is_none() {
            self.start_session(frame.pts)?;
        }
        self.convert(frame)?;
        self.out.write_all(&self.argb).map_err(RecordingError::Write)?;
        self.pts.push(frame.pts.rescale(self.timescale()));
        Ok(())
    }

    fn finish(mut self: Box<Self>) -> Result<(), RecordingError> {
        let durations = self.durations();
        let moov = self.write_moov(&durations);
        let mdat_size = MDAT_HEADER + self.sample_len() * self.pts.len() as u64;

        let finalize = |out: &mut BufWriter<File>| -> io::Result<()> {
            out.write_all(&moov)?;
            out.seek(SeekFrom::Start(FTYP_SIZE + 8))?;
            out.write_all(&mdat_size.to_be_bytes())?;
            out.flush()?;
            out.get_ref().sync_all()
        };
        finalize(&mut self.out).map_err(|e| RecordingError::Finalize(e.to_string()))?;
        debug!(path = %self.path.display(), samples = self.pts.len(), "MOV finalized");
        Ok(())
    }
}

/// Finest of the origin's timescale, the movie timescale and seconds in which
/// the origin fits the unsigned 32-bit `ctts` offset.
fn media_timescale(origin: MediaTime) -> Option<u32> {
    [origin.timescale, MOVIE_TIMESCALE, 1]
        .into_iter()
        .find(|&ts| u32::try_from(origin.rescale(ts)).is_ok())
}

fn write_box(buf: &mut BytesMut, kind: &[u8; 4], body: impl FnOnce(&mut BytesMut)) {
    let start = buf.len();
    buf.put_u32(0);
    buf.put_slice(kind);
    body(buf);
    let size = (buf.len() - start) as u32;
    buf[start..start + 4].copy_from_slice(&size.to_be_bytes());
}

fn full_box(buf: &mut BytesMut, kind: &[u8; 4], version: u8, flags: u32, body: impl FnOnce(&mut BytesMut)) {
    write_box(buf, kind, |b| {
        b.put_u32((version as u32) << 24 | (flags & 0x00ff_ffff));
        body(b);
    });
}

fn handler(buf: &mut BytesMut, component: &[u8; 4], subtype: &[u8; 4], name: &str) {
    full_box(buf, b"hdlr", 0, 0, |b| {
        b.put_slice(component);
        b.put_slice(subtype);
        b.put_u32(0);
        b.put_u32(0);
        b.put_u32(0);
        b.put_u8(name.len() as u8);
        b.put_slice(name.as_bytes());
    });
}

fn run_lengths(values: &[u32]) -> Vec<(u32, u32)> {
    let mut runs: Vec<(u32, u32)> = Vec::new();
    for &v in values {
        match runs.last_mut() {
            Some((n, delta)) if *delta == v => *n += 1,
            _ => runs.push((1, v)),
        }
    }
    runs
}
