//! PSB/PSD composite driver.
//!
//! Photoshop documents carry a flattened composite of the layer stack in
//! their final section, stored planar (channel by channel) either raw or
//! PackBits RLE-compressed. Metadata extraction parses only the fixed
//! 26-byte header; tile generation loads the whole composite, which is an
//! O(image) memory step gated by a RAM pre-check upstream.
//!
//! Layout: header, color mode data, image resources, layer & mask info,
//! image data. PSB ("big" documents, version 2) widens the layer-section
//! length and the RLE row counts to eight and four bytes respectively.

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use image::RgbImage;

use crate::error::RasterError;
use crate::raster::RasterMetadata;

/// Magic signature opening every PSD/PSB file.
const SIGNATURE: &[u8; 4] = b"8BPS";

/// Header length in bytes.
const HEADER_LEN: usize = 26;

/// Dimension caps: 30 000 for PSD, 300 000 for PSB.
const MAX_DIM_PSD: u32 = 30_000;
const MAX_DIM_PSB: u32 = 300_000;

/// Color modes carrying a composite this driver renders.
const COLOR_MODE_GRAYSCALE: u16 = 1;
const COLOR_MODE_RGB: u16 = 3;

/// Parsed PSD/PSB file header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PsdHeader {
    /// 1 = PSD, 2 = PSB.
    pub version: u16,
    pub channels: u16,
    pub width: u32,
    pub height: u32,
    pub depth: u16,
    pub color_mode: u16,
}

impl PsdHeader {
    /// Parse and validate the 26-byte header.
    pub fn parse(bytes: &[u8]) -> Result<Self, RasterError> {
        if bytes.len() < HEADER_LEN {
            return Err(RasterError::InvalidHeader(format!(
                "file too short for header: {} bytes",
                bytes.len()
            )));
        }
        if &bytes[0..4] != SIGNATURE {
            return Err(RasterError::InvalidHeader(format!(
                "bad signature: {:02X?}",
                &bytes[0..4]
            )));
        }

        let version = u16::from_be_bytes([bytes[4], bytes[5]]);
        if version != 1 && version != 2 {
            return Err(RasterError::InvalidHeader(format!(
                "unsupported version: {}",
                version
            )));
        }

        let channels = u16::from_be_bytes([bytes[12], bytes[13]]);
        let height = u32::from_be_bytes([bytes[14], bytes[15], bytes[16], bytes[17]]);
        let width = u32::from_be_bytes([bytes[18], bytes[19], bytes[20], bytes[21]]);
        let depth = u16::from_be_bytes([bytes[22], bytes[23]]);
        let color_mode = u16::from_be_bytes([bytes[24], bytes[25]]);

        let max_dim = if version == 2 { MAX_DIM_PSB } else { MAX_DIM_PSD };
        if width == 0 || height == 0 || width > max_dim || height > max_dim {
            return Err(RasterError::InvalidHeader(format!(
                "dimensions {}x{} out of range for version {}",
                width, height, version
            )));
        }
        if channels == 0 || channels > 56 {
            return Err(RasterError::InvalidHeader(format!(
                "channel count {} out of range",
                channels
            )));
        }

        Ok(Self {
            version,
            channels,
            width,
            height,
            depth,
            color_mode,
        })
    }

    pub fn is_big(&self) -> bool {
        self.version == 2
    }
}

/// Read dimensions from the header without composing.
pub fn probe(path: &Path) -> Result<RasterMetadata, RasterError> {
    let mut file = File::open(path)?;
    let mut header_bytes = [0u8; HEADER_LEN];
    file.read_exact(&mut header_bytes)
        .map_err(|_| RasterError::InvalidHeader("file too short for header".to_string()))?;
    let header = PsdHeader::parse(&header_bytes)?;

    Ok(RasterMetadata {
        width: header.width,
        height: header.height,
        bands: header.channels.min(u8::MAX as u16) as u8,
        bit_depth: header.depth.min(u8::MAX as u16) as u8,
        projection: None,
        geotransform: None,
        bounds: None,
    })
}

/// Load the flattened composite as RGB.
///
/// Grayscale composites are replicated across the channels; RGB composites
/// take their first three channels (extras, typically alpha, are ignored).
/// Sixteen-bit samples are narrowed by `>> 8`.
pub fn load_composite(path: &Path) -> Result<RgbImage, RasterError> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);

    let mut header_bytes = [0u8; HEADER_LEN];
    reader
        .read_exact(&mut header_bytes)
        .map_err(|_| RasterError::InvalidHeader("file too short for header".to_string()))?;
    let header = PsdHeader::parse(&header_bytes)?;

    if header.depth != 8 && header.depth != 16 {
        return Err(RasterError::UnsupportedSampleType(format!(
            "u{}",
            header.depth
        )));
    }
    if header.color_mode != COLOR_MODE_GRAYSCALE && header.color_mode != COLOR_MODE_RGB {
        return Err(RasterError::UnsupportedFormat {
            reason: format!("unsupported color mode: {}", header.color_mode),
        });
    }

    // Skip color mode data and image resources (u32-length sections), then
    // the layer & mask section (u32 for PSD, u64 for PSB).
    skip_section_u32(&mut reader)?;
    skip_section_u32(&mut reader)?;
    if header.is_big() {
        let len = read_u64(&mut reader)?;
        reader.seek(SeekFrom::Current(len as i64))?;
    } else {
        skip_section_u32(&mut reader)?;
    }

    let compression = read_u16(&mut reader)?;
    let channels_needed = if header.color_mode == COLOR_MODE_GRAYSCALE {
        1
    } else {
        3
    };
    if (header.channels as usize) < channels_needed {
        return Err(RasterError::UnsupportedFormat {
            reason: format!(
                "color mode {} with only {} channels",
                header.color_mode, header.channels
            ),
        });
    }

    let planes = match compression {
        0 => read_raw_planes(&mut reader, &header, channels_needed)?,
        1 => read_rle_planes(&mut reader, &header, channels_needed)?,
        other => {
            return Err(RasterError::UnsupportedFormat {
                reason: format!("unsupported composite compression: {}", other),
            })
        }
    };

    Ok(planes_to_rgb(&header, &planes))
}

/// Read `channels_needed` raw planar channels, narrowed to u8.
fn read_raw_planes(
    reader: &mut impl Read,
    header: &PsdHeader,
    channels_needed: usize,
) -> Result<Vec<Vec<u8>>, RasterError> {
    let pixels = header.width as usize * header.height as usize;
    let bytes_per_sample = (header.depth / 8) as usize;
    let mut planes = Vec::with_capacity(channels_needed);

    for _ in 0..channels_needed {
        let mut raw = vec![0u8; pixels * bytes_per_sample];
        reader.read_exact(&mut raw).map_err(|e| {
            RasterError::InvalidHeader(format!("truncated composite data: {}", e))
        })?;
        planes.push(narrow_samples(&raw, header.depth));
    }

    Ok(planes)
}

/// Read `channels_needed` RLE (PackBits) planar channels, narrowed to u8.
fn read_rle_planes(
    reader: &mut impl Read,
    header: &PsdHeader,
    channels_needed: usize,
) -> Result<Vec<Vec<u8>>, RasterError> {
    let height = header.height as usize;
    let total_rows = header.channels as usize * height;
    let row_bytes = header.width as usize * (header.depth / 8) as usize;

    // Per-row compressed byte counts for every channel, u16 for PSD and
    // u32 for PSB.
    let mut row_lengths = Vec::with_capacity(total_rows);
    for _ in 0..total_rows {
        let len = if header.is_big() {
            read_u32(reader)? as usize
        } else {
            read_u16(reader)? as usize
        };
        row_lengths.push(len);
    }

    let mut planes = Vec::with_capacity(channels_needed);
    for channel in 0..channels_needed {
        let mut plane_raw = Vec::with_capacity(height * row_bytes);
        for row in 0..height {
            let compressed_len = row_lengths[channel * height + row];
            let mut compressed = vec![0u8; compressed_len];
            reader.read_exact(&mut compressed).map_err(|e| {
                RasterError::InvalidHeader(format!("truncated RLE data: {}", e))
            })?;
            let decoded = unpack_bits(&compressed, row_bytes)?;
            plane_raw.extend_from_slice(&decoded);
        }
        planes.push(narrow_samples(&plane_raw, header.depth));
    }

    Ok(planes)
}

/// Narrow big-endian samples of the given depth to u8.
fn narrow_samples(raw: &[u8], depth: u16) -> Vec<u8> {
    match depth {
        8 => raw.to_vec(),
        // Big-endian u16: the high byte is the first of each pair.
        16 => raw.chunks_exact(2).map(|pair| pair[0]).collect(),
        _ => unreachable!("depth validated at open"),
    }
}

fn planes_to_rgb(header: &PsdHeader, planes: &[Vec<u8>]) -> RgbImage {
    let (width, height) = (header.width, header.height);
    let mut rgb = RgbImage::new(width, height);

    if planes.len() == 1 {
        for (i, pixel) in rgb.pixels_mut().enumerate() {
            let v = planes[0][i];
            *pixel = image::Rgb([v, v, v]);
        }
    } else {
        for (i, pixel) in rgb.pixels_mut().enumerate() {
            *pixel = image::Rgb([planes[0][i], planes[1][i], planes[2][i]]);
        }
    }

    rgb
}

/// PackBits decompression producing exactly `expected_len` bytes.
fn unpack_bits(input: &[u8], expected_len: usize) -> Result<Vec<u8>, RasterError> {
    let mut out = Vec::with_capacity(expected_len);
    let mut i = 0usize;

    while i < input.len() && out.len() < expected_len {
        let control = input[i] as i8;
        i += 1;

        if control >= 0 {
            let count = control as usize + 1;
            if i + count > input.len() {
                return Err(RasterError::InvalidHeader(
                    "PackBits literal run past end of data".to_string(),
                ));
            }
            out.extend_from_slice(&input[i..i + count]);
            i += count;
        } else if control != -128 {
            let count = 1 - control as isize;
            if i >= input.len() {
                return Err(RasterError::InvalidHeader(
                    "PackBits repeat run past end of data".to_string(),
                ));
            }
            let byte = input[i];
            i += 1;
            out.extend(std::iter::repeat(byte).take(count as usize));
        }
        // -128 is a no-op filler byte.
    }

    if out.len() != expected_len {
        return Err(RasterError::InvalidHeader(format!(
            "PackBits row decoded to {} bytes, expected {}",
            out.len(),
            expected_len
        )));
    }

    Ok(out)
}

fn read_u16(reader: &mut impl Read) -> Result<u16, RasterError> {
    let mut buf = [0u8; 2];
    reader.read_exact(&mut buf)?;
    Ok(u16::from_be_bytes(buf))
}

fn read_u32(reader: &mut impl Read) -> Result<u32, RasterError> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_be_bytes(buf))
}

fn read_u64(reader: &mut impl Read) -> Result<u64, RasterError> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(u64::from_be_bytes(buf))
}

fn skip_section_u32(reader: &mut (impl Read + Seek)) -> Result<(), RasterError> {
    let len = read_u32(reader)?;
    reader.seek(SeekFrom::Current(len as i64))?;
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn header_bytes(
        version: u16,
        channels: u16,
        width: u32,
        height: u32,
        depth: u16,
        color_mode: u16,
    ) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_LEN);
        bytes.extend_from_slice(SIGNATURE);
        bytes.extend_from_slice(&version.to_be_bytes());
        bytes.extend_from_slice(&[0u8; 6]);
        bytes.extend_from_slice(&channels.to_be_bytes());
        bytes.extend_from_slice(&height.to_be_bytes());
        bytes.extend_from_slice(&width.to_be_bytes());
        bytes.extend_from_slice(&depth.to_be_bytes());
        bytes.extend_from_slice(&color_mode.to_be_bytes());
        bytes
    }

    /// Build a complete PSD with empty middle sections.
    fn build_psd(header: &[u8], image_data: &[u8]) -> Vec<u8> {
        let mut bytes = header.to_vec();
        bytes.extend_from_slice(&0u32.to_be_bytes()); // color mode data
        bytes.extend_from_slice(&0u32.to_be_bytes()); // image resources
        bytes.extend_from_slice(&0u32.to_be_bytes()); // layer & mask info
        bytes.extend_from_slice(image_data);
        bytes
    }

    #[test]
    fn test_header_parse() {
        let bytes = header_bytes(1, 3, 4096, 3072, 8, COLOR_MODE_RGB);
        let header = PsdHeader::parse(&bytes).unwrap();
        assert_eq!(header.version, 1);
        assert_eq!(header.channels, 3);
        assert_eq!(header.width, 4096);
        assert_eq!(header.height, 3072);
        assert_eq!(header.depth, 8);
        assert!(!header.is_big());
    }

    #[test]
    fn test_header_rejects_bad_signature() {
        let mut bytes = header_bytes(1, 3, 10, 10, 8, COLOR_MODE_RGB);
        bytes[0] = b'X';
        assert!(matches!(
            PsdHeader::parse(&bytes),
            Err(RasterError::InvalidHeader(_))
        ));
    }

    #[test]
    fn test_header_rejects_bad_version() {
        let bytes = header_bytes(3, 3, 10, 10, 8, COLOR_MODE_RGB);
        assert!(PsdHeader::parse(&bytes).is_err());
    }

    #[test]
    fn test_psb_dimension_cap_is_wider() {
        // 100k pixels wide: invalid for PSD, valid for PSB.
        let psd = header_bytes(1, 3, 100_000, 10, 8, COLOR_MODE_RGB);
        assert!(PsdHeader::parse(&psd).is_err());

        let psb = header_bytes(2, 3, 100_000, 10, 8, COLOR_MODE_RGB);
        let header = PsdHeader::parse(&psb).unwrap();
        assert!(header.is_big());
    }

    #[test]
    fn test_probe_reads_header_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.psb");
        // Header with no image data at all: probe must still succeed.
        std::fs::write(&path, header_bytes(2, 4, 25_000, 18_000, 16, COLOR_MODE_RGB)).unwrap();

        let meta = probe(&path).unwrap();
        assert_eq!(meta.width, 25_000);
        assert_eq!(meta.height, 18_000);
        assert_eq!(meta.bands, 4);
        assert_eq!(meta.bit_depth, 16);
    }

    #[test]
    fn test_raw_rgb_composite() {
        let (width, height) = (4u32, 2u32);
        // Planar: all R, all G, all B.
        let mut data = vec![0u8; 2]; // compression = 0 (raw)
        data[1] = 0;
        for v in 0..8u8 {
            data.push(v * 10); // R plane
        }
        for v in 0..8u8 {
            data.push(v * 10 + 1); // G plane
        }
        for v in 0..8u8 {
            data.push(v * 10 + 2); // B plane
        }

        let psd = build_psd(&header_bytes(1, 3, width, height, 8, COLOR_MODE_RGB), &data);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("raw.psd");
        std::fs::write(&path, psd).unwrap();

        let rgb = load_composite(&path).unwrap();
        assert_eq!(rgb.dimensions(), (4, 2));
        assert_eq!(*rgb.get_pixel(0, 0), image::Rgb([0, 1, 2]));
        assert_eq!(*rgb.get_pixel(3, 1), image::Rgb([70, 71, 72]));
    }

    #[test]
    fn test_raw_gray16_composite() {
        let (width, height) = (2u32, 2u32);
        let mut data = vec![0u8, 0]; // raw
        for v in [0x10u8, 0x20, 0x30, 0x40] {
            data.push(v); // high byte
            data.push(0xFF); // low byte discarded by >> 8
        }

        let psd = build_psd(
            &header_bytes(1, 1, width, height, 16, COLOR_MODE_GRAYSCALE),
            &data,
        );
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gray16.psd");
        std::fs::write(&path, psd).unwrap();

        let rgb = load_composite(&path).unwrap();
        assert_eq!(*rgb.get_pixel(0, 0), image::Rgb([0x10, 0x10, 0x10]));
        assert_eq!(*rgb.get_pixel(1, 1), image::Rgb([0x40, 0x40, 0x40]));
    }

    #[test]
    fn test_rle_rgb_composite() {
        let (width, height) = (4u32, 1u32);
        // Each row: repeat run of 4 identical bytes -> control -3, value.
        let mut data = vec![0u8, 1]; // compression = 1 (RLE)
        for _ in 0..3 {
            data.extend_from_slice(&2u16.to_be_bytes()); // row lengths (3 channels x 1 row)
        }
        for value in [0xAAu8, 0xBB, 0xCC] {
            data.push((-3i8) as u8);
            data.push(value);
        }

        let psd = build_psd(&header_bytes(1, 3, width, height, 8, COLOR_MODE_RGB), &data);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rle.psd");
        std::fs::write(&path, psd).unwrap();

        let rgb = load_composite(&path).unwrap();
        for x in 0..4 {
            assert_eq!(*rgb.get_pixel(x, 0), image::Rgb([0xAA, 0xBB, 0xCC]));
        }
    }

    #[test]
    fn test_unpack_bits() {
        // Literal run: control 2 -> 3 literal bytes.
        let decoded = unpack_bits(&[2, 10, 20, 30], 3).unwrap();
        assert_eq!(decoded, vec![10, 20, 30]);

        // Repeat run: control -2 -> 3 copies.
        let decoded = unpack_bits(&[(-2i8) as u8, 7], 3).unwrap();
        assert_eq!(decoded, vec![7, 7, 7]);

        // Mixed with a -128 no-op.
        let decoded = unpack_bits(&[(-128i8) as u8, 0, 42, (-1i8) as u8, 9], 3).unwrap();
        assert_eq!(decoded, vec![42, 9, 9]);

        // Wrong length is an error.
        assert!(unpack_bits(&[0, 1], 5).is_err());
    }

    #[test]
    fn test_unsupported_color_mode() {
        let psd = build_psd(&header_bytes(1, 4, 2, 2, 8, 4), &[0, 0]); // CMYK
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cmyk.psd");
        std::fs::write(&path, psd).unwrap();

        let err = load_composite(&path).unwrap_err();
        assert!(matches!(err, RasterError::UnsupportedFormat { .. }));
    }
}
