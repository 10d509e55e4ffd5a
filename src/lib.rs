//! PDF Image Compressor Library
//!
//! Core logic for shrinking PDFs by recompressing embedded raster images.
//!
//! Walks every page's resource dictionary (including nested Form XObjects and
//! soft masks) to locate image streams, classifies each stream's encoding from
//! its declared filter chain, decodes it with a prioritized chain of fallback
//! strategies that preserve the image's color model, re-encodes as JPEG at a
//! configurable quality, and rewrites the stream in place. Images that cannot
//! be decoded or that do not shrink enough are left byte-for-byte unchanged.

use flate2::read::ZlibDecoder;
use image::{DynamicImage, GrayImage, ImageFormat, RgbImage};
use lopdf::{Dictionary, Document, Object, ObjectId, Stream};
use rayon::prelude::*;
use std::collections::HashSet;
use std::io::Read;
use thiserror::Error;

/// Options for one compression run
#[derive(Debug, Clone)]
pub struct CompressOptions {
    /// JPEG quality for color images (1-100)
    pub quality: u8,
    /// JPEG quality for grayscale images; falls back to `quality` when unset.
    /// Grayscale scan content tolerates more aggressive compression, so a
    /// distinct value is common.
    pub gray_quality: Option<u8>,
    /// Maximum width in pixels before downscaling (0 = no limit)
    pub max_width: u32,
    /// Maximum height in pixels before downscaling (0 = no limit)
    pub max_height: u32,
    /// Minimum size reduction (percent) required to replace an image
    pub min_reduction: f32,
    /// Clear the document info dictionary and XMP metadata
    pub strip_metadata: bool,
    /// Flate-compress uncompressed content streams on save
    pub compress_streams: bool,
    /// Decode strategies, tried in order until one succeeds
    pub decode_order: Vec<DecodeStrategy>,
}

impl Default for CompressOptions {
    fn default() -> Self {
        Self {
            quality: 30,
            gray_quality: None,
            max_width: 1200,
            max_height: 1200,
            min_reduction: 10.0,
            strip_metadata: true,
            compress_streams: true,
            decode_order: DEFAULT_DECODE_ORDER.to_vec(),
        }
    }
}

impl CompressOptions {
    /// Effective quality for grayscale images
    pub fn grayscale_quality(&self) -> u8 {
        self.gray_quality.unwrap_or(self.quality)
    }

    pub fn validate(&self) -> Result<(), CompressError> {
        if self.quality == 0 || self.quality > 100 {
            return Err(CompressError::InvalidQuality);
        }
        if let Some(q) = self.gray_quality {
            if q == 0 || q > 100 {
                return Err(CompressError::InvalidQuality);
            }
        }
        Ok(())
    }
}

/// Named quality presets pairing a color and a grayscale quality
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QualityTier {
    /// Larger file, best quality
    High,
    /// Good balance of size and quality
    Balanced,
    /// Smallest file, lower quality
    Compact,
}

impl QualityTier {
    /// Returns the (color, grayscale) quality pair for this tier
    pub fn qualities(self) -> (u8, u8) {
        match self {
            QualityTier::High => (60, 70),
            QualityTier::Balanced => (45, 55),
            QualityTier::Compact => (30, 40),
        }
    }
}

/// Decode strategies for turning an image stream into raw pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeStrategy {
    /// Reinterpret the (inflated) stream bytes using the declared
    /// width/height/colorspace/bit depth
    Raw,
    /// Decode an embedded JPEG (DCTDecode) payload
    Jpeg,
    /// Let the image library sniff and decode whatever the bytes are
    Library,
}

/// Default strategy priority: cheap reinterpretation first, generic format
/// sniffing as the last resort.
pub const DEFAULT_DECODE_ORDER: [DecodeStrategy; 3] =
    [DecodeStrategy::Raw, DecodeStrategy::Jpeg, DecodeStrategy::Library];

/// Error type for whole-document failures
#[derive(Debug, Error)]
pub enum CompressError {
    #[error("quality must be between 1 and 100")]
    InvalidQuality,
    #[error("failed to load PDF: {0}")]
    Load(String),
    #[error("failed to save PDF: {0}")]
    Save(String),
}

/// Why a single image was left unchanged
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Width or height missing or zero
    InvalidDimensions,
    /// Filter chain is neither raw raster nor embedded JPEG
    Unsupported,
    /// Every decode strategy failed
    DecodeFailed,
    /// Recompression could not produce a valid stream
    EncodeFailed,
    /// Replacement did not shrink the stream enough
    InsufficientGain,
}

impl SkipReason {
    pub const ALL: [SkipReason; 5] = [
        SkipReason::InvalidDimensions,
        SkipReason::Unsupported,
        SkipReason::DecodeFailed,
        SkipReason::EncodeFailed,
        SkipReason::InsufficientGain,
    ];
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            SkipReason::InvalidDimensions => "invalid dimensions",
            SkipReason::Unsupported => "unsupported filter chain",
            SkipReason::DecodeFailed => "decode failed",
            SkipReason::EncodeFailed => "encode failed",
            SkipReason::InsufficientGain => "insufficient gain",
        };
        f.write_str(text)
    }
}

/// Outcome for a single image stream
#[derive(Debug, Clone)]
pub struct ImageOutcome {
    /// Object ID (number, generation)
    pub object_id: (u32, u16),
    /// Stream size in bytes before the run
    pub original_size: usize,
    pub outcome: ImageResult,
}

#[derive(Debug, Clone)]
pub enum ImageResult {
    Compressed { new_size: usize },
    Skipped(SkipReason),
}

/// Per-image outcomes plus aggregate accounting for one run
#[derive(Debug, Clone, Default)]
pub struct CompressReport {
    pub images: Vec<ImageOutcome>,
}

impl CompressReport {
    pub fn total_images(&self) -> usize {
        self.images.len()
    }

    pub fn compressed_images(&self) -> usize {
        self.images
            .iter()
            .filter(|i| matches!(i.outcome, ImageResult::Compressed { .. }))
            .count()
    }

    pub fn skipped_images(&self) -> usize {
        self.total_images() - self.compressed_images()
    }

    pub fn skip_count(&self, reason: SkipReason) -> usize {
        self.images
            .iter()
            .filter(|i| matches!(i.outcome, ImageResult::Skipped(r) if r == reason))
            .count()
    }

    /// Total image stream bytes before the run
    pub fn original_image_bytes(&self) -> u64 {
        self.images.iter().map(|i| i.original_size as u64).sum()
    }

    /// Total image stream bytes after the run (skipped images keep their
    /// original size)
    pub fn final_image_bytes(&self) -> u64 {
        self.images
            .iter()
            .map(|i| match i.outcome {
                ImageResult::Compressed { new_size } => new_size as u64,
                ImageResult::Skipped(_) => i.original_size as u64,
            })
            .sum()
    }

    pub fn reduction_percent(&self) -> f64 {
        let original = self.original_image_bytes();
        if original == 0 {
            return 0.0;
        }
        (1.0 - self.final_image_bytes() as f64 / original as f64) * 100.0
    }
}

/// Declared colorspace resolved to a closed set of color models
#[derive(Debug, Clone, PartialEq)]
pub enum ColorSpace {
    Gray,
    Rgb,
    Cmyk,
    /// Palette-mapped samples; `lookup` holds packed base-space entries
    Indexed { base: Box<ColorSpace>, lookup: Vec<u8> },
}

impl ColorSpace {
    /// Components per sample as stored in the stream (indexed samples are
    /// single palette indices)
    pub fn channels(&self) -> u32 {
        match self {
            ColorSpace::Gray => 1,
            ColorSpace::Rgb => 3,
            ColorSpace::Cmyk => 4,
            ColorSpace::Indexed { .. } => 1,
        }
    }
}

/// Color model of a decoded raster. CMYK is a distinct tag so that
/// four-channel ink data is never mistaken for RGBA.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorModel {
    Gray,
    Rgb,
    Rgba,
    Cmyk,
}

impl ColorModel {
    pub fn channels(self) -> u32 {
        match self {
            ColorModel::Gray => 1,
            ColorModel::Rgb => 3,
            ColorModel::Rgba | ColorModel::Cmyk => 4,
        }
    }
}

/// One embedded image stream located in the document
#[derive(Debug, Clone)]
pub struct ImageResource {
    pub id: ObjectId,
    pub width: u32,
    pub height: u32,
    pub bits_per_component: u32,
    pub color_space: Option<ColorSpace>,
    /// Declared filter chain in decoding order
    pub filters: Vec<String>,
    /// Predictor from DecodeParms, when declared
    pub predictor: Option<i64>,
    /// Raw stream bytes as stored in the file
    pub data: Vec<u8>,
}

/// An in-memory decoded image with an explicit channel count
#[derive(Debug, Clone)]
pub struct DecodedRaster {
    pixels: Vec<u8>,
    width: u32,
    height: u32,
    model: ColorModel,
}

impl DecodedRaster {
    /// Builds a raster, verifying the buffer holds exactly
    /// width x height x channels bytes
    pub fn new(
        pixels: Vec<u8>,
        width: u32,
        height: u32,
        model: ColorModel,
    ) -> Result<Self, String> {
        let expected = (width as usize) * (height as usize) * model.channels() as usize;
        if pixels.len() != expected {
            return Err(format!(
                "raster buffer size mismatch: got {} expected {} ({}x{} {:?})",
                pixels.len(),
                expected,
                width,
                height,
                model
            ));
        }
        if width == 0 || height == 0 {
            return Err("raster has zero dimension".to_string());
        }
        Ok(Self { pixels, width, height, model })
    }

    fn from_dynamic(img: DynamicImage) -> Result<Self, String> {
        let width = img.width();
        let height = img.height();
        let (pixels, model) = match img {
            DynamicImage::ImageLuma8(buf) => (buf.into_raw(), ColorModel::Gray),
            DynamicImage::ImageRgb8(buf) => (buf.into_raw(), ColorModel::Rgb),
            DynamicImage::ImageRgba8(buf) => (buf.into_raw(), ColorModel::Rgba),
            DynamicImage::ImageLumaA8(buf) => (
                DynamicImage::ImageLumaA8(buf).to_luma8().into_raw(),
                ColorModel::Gray,
            ),
            other => {
                if other.color().has_color() {
                    (other.to_rgb8().into_raw(), ColorModel::Rgb)
                } else {
                    (other.to_luma8().into_raw(), ColorModel::Gray)
                }
            }
        };
        Self::new(pixels, width, height, model)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn model(&self) -> ColorModel {
        self.model
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }
}

/// Replacement stream produced by the recompressor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedImage {
    pub data: Vec<u8>,
    /// PDF colorspace name matching the encoded channel count
    pub color_space: &'static str,
    pub width: u32,
    pub height: u32,
}

/// Classification of an image stream's encoding, derived purely from its
/// declared filter chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageEncoding {
    /// Uncompressed or flate-compressed raw samples
    RawRaster,
    /// A DCTDecode (JPEG) payload somewhere in the chain
    EmbeddedJpeg,
    Unsupported,
}

/// Classify a filter chain without touching the stream bytes.
///
/// An empty chain counts as a raw raster: uncompressed image objects
/// commonly carry no Filter entry at all.
pub fn classify_encoding(filters: &[String]) -> ImageEncoding {
    if filters.iter().any(|f| f == "DCTDecode") {
        ImageEncoding::EmbeddedJpeg
    } else if filters.iter().all(|f| f == "FlateDecode") {
        ImageEncoding::RawRaster
    } else {
        ImageEncoding::Unsupported
    }
}

/// Inflate one zlib/flate layer
fn inflate(data: &[u8]) -> Result<Vec<u8>, String> {
    let mut decoder = ZlibDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out).map_err(|e| e.to_string())?;
    Ok(out)
}

/// Decompress a stream's content, applying FlateDecode layers and returning
/// the bytes as-is when an unknown filter is hit
fn decompress_stream(stream: &Stream) -> Vec<u8> {
    let filters = extract_filters(&stream.dict);
    let mut data = stream.content.clone();
    for name in filters {
        match name.as_str() {
            "FlateDecode" => match inflate(&data) {
                Ok(decoded) => data = decoded,
                Err(_) => return stream.content.clone(),
            },
            _ => return data,
        }
    }
    data
}

/// Extract the declared filter chain as a list of names, in decoding order
fn extract_filters(dict: &Dictionary) -> Vec<String> {
    match dict.get(b"Filter") {
        Ok(Object::Name(n)) => vec![String::from_utf8_lossy(n).to_string()],
        Ok(Object::Array(arr)) => arr
            .iter()
            .filter_map(|f| match f {
                Object::Name(n) => Some(String::from_utf8_lossy(n).to_string()),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

/// Extract a declared Predictor from DecodeParms (or its DP alias)
fn extract_predictor(doc: &Document, dict: &Dictionary) -> Option<i64> {
    let parms = dict.get(b"DecodeParms").or_else(|_| dict.get(b"DP")).ok()?;
    let parms = match parms {
        Object::Reference(id) => doc.get_object(*id).ok()?,
        other => other,
    };
    let parms_dict = match parms {
        Object::Dictionary(d) => Some(d),
        Object::Array(arr) => arr.iter().find_map(|entry| match entry {
            Object::Dictionary(d) => Some(d),
            _ => None,
        }),
        _ => None,
    }?;
    match parms_dict.get(b"Predictor") {
        Ok(Object::Integer(n)) => Some(*n),
        _ => None,
    }
}

fn dict_u32(dict: &Dictionary, key: &[u8]) -> Option<u32> {
    match dict.get(key) {
        Ok(Object::Integer(n)) if *n > 0 => Some(*n as u32),
        _ => None,
    }
}

/// Resolve a declared ColorSpace object into the closed [`ColorSpace`] set.
///
/// Handles direct names, references, ICCBased streams (via their /N component
/// count) and Indexed palettes with inline or stream lookups. Returns `None`
/// for families the pipeline cannot reinterpret (Separation, DeviceN, ...).
pub fn resolve_color_space(doc: &Document, obj: &Object) -> Option<ColorSpace> {
    match obj {
        Object::Name(name) => match name.as_slice() {
            b"DeviceGray" | b"CalGray" => Some(ColorSpace::Gray),
            b"DeviceRGB" | b"CalRGB" => Some(ColorSpace::Rgb),
            b"DeviceCMYK" => Some(ColorSpace::Cmyk),
            _ => None,
        },
        Object::Reference(id) => doc
            .get_object(*id)
            .ok()
            .and_then(|resolved| resolve_color_space(doc, resolved)),
        Object::Array(arr) => {
            let family = match arr.first() {
                Some(Object::Name(n)) => n.as_slice(),
                _ => return None,
            };
            match family {
                b"ICCBased" => {
                    let stream = match arr.get(1) {
                        Some(Object::Reference(id)) => match doc.get_object(*id) {
                            Ok(Object::Stream(s)) => s,
                            _ => return None,
                        },
                        Some(Object::Stream(s)) => s,
                        _ => return None,
                    };
                    match stream.dict.get(b"N") {
                        Ok(Object::Integer(1)) => Some(ColorSpace::Gray),
                        Ok(Object::Integer(3)) => Some(ColorSpace::Rgb),
                        Ok(Object::Integer(4)) => Some(ColorSpace::Cmyk),
                        _ => None,
                    }
                }
                b"Indexed" | b"I" => {
                    let base = resolve_color_space(doc, arr.get(1)?)?;
                    let lookup = match arr.get(3)? {
                        Object::String(bytes, _) => bytes.clone(),
                        Object::Reference(id) => match doc.get_object(*id) {
                            Ok(Object::Stream(s)) => decompress_stream(s),
                            _ => return None,
                        },
                        Object::Stream(s) => decompress_stream(s),
                        _ => return None,
                    };
                    Some(ColorSpace::Indexed { base: Box::new(base), lookup })
                }
                b"CalRGB" => Some(ColorSpace::Rgb),
                b"CalGray" => Some(ColorSpace::Gray),
                _ => None,
            }
        }
        _ => None,
    }
}

/// Build an [`ImageResource`] from an image XObject stream. Soft masks carry
/// grayscale alpha, so a missing colorspace on a mask defaults to gray.
fn image_resource_from_stream(
    doc: &Document,
    id: ObjectId,
    stream: &Stream,
    is_smask: bool,
) -> ImageResource {
    let width = dict_u32(&stream.dict, b"Width").unwrap_or(0);
    let height = dict_u32(&stream.dict, b"Height").unwrap_or(0);
    let bits_per_component = dict_u32(&stream.dict, b"BitsPerComponent").unwrap_or(8);

    let mut color_space = stream
        .dict
        .get(b"ColorSpace")
        .ok()
        .and_then(|cs| resolve_color_space(doc, cs));
    if color_space.is_none() && is_smask {
        color_space = Some(ColorSpace::Gray);
    }

    ImageResource {
        id,
        width,
        height,
        bits_per_component,
        color_space,
        filters: extract_filters(&stream.dict),
        predictor: extract_predictor(doc, &stream.dict),
        data: stream.content.clone(),
    }
}

/// Resolve a resources entry to its dictionary
fn resolve_dict<'a>(doc: &'a Document, obj: &'a Object) -> Option<&'a Dictionary> {
    match obj {
        Object::Dictionary(d) => Some(d),
        Object::Reference(id) => match doc.get_object(*id) {
            Ok(Object::Dictionary(d)) => Some(d),
            _ => None,
        },
        _ => None,
    }
}

/// XObject references from a resources object, in dictionary order so that
/// traversal (and therefore output and logs) stays reproducible
fn xobjects_in_resources(doc: &Document, resources: &Object) -> Vec<ObjectId> {
    let mut ids = Vec::new();
    if let Some(res_dict) = resolve_dict(doc, resources) {
        if let Ok(xobjects) = res_dict.get(b"XObject") {
            if let Some(xobj_dict) = resolve_dict(doc, xobjects) {
                for (_, value) in xobj_dict.iter() {
                    if let Object::Reference(obj_id) = value {
                        ids.push(*obj_id);
                    }
                }
            }
        }
    }
    ids
}

/// Get resources for a page, falling back to the parent node's inherited
/// resources
fn page_resources(doc: &Document, page_dict: &Dictionary) -> Object {
    if let Ok(resources) = page_dict.get(b"Resources") {
        return resources.clone();
    }
    if let Ok(Object::Reference(parent_id)) = page_dict.get(b"Parent") {
        if let Ok(Object::Dictionary(parent_dict)) = doc.get_object(*parent_id) {
            if let Ok(resources) = parent_dict.get(b"Resources") {
                return resources.clone();
            }
        }
    }
    Object::Null
}

/// Recursively collect image resources from an XObject (handles Form
/// XObjects and follows soft-mask references)
fn collect_images_recursive(
    doc: &Document,
    obj_id: ObjectId,
    is_smask: bool,
    out: &mut Vec<ImageResource>,
    seen: &mut HashSet<ObjectId>,
) {
    if !seen.insert(obj_id) {
        return;
    }

    let stream = match doc.get_object(obj_id) {
        Ok(Object::Stream(s)) => s,
        _ => {
            log::warn!("skipping unresolvable XObject {:?}", obj_id);
            return;
        }
    };

    let subtype = stream.dict.get(b"Subtype").ok().and_then(|s| match s {
        Object::Name(n) => Some(String::from_utf8_lossy(n).to_string()),
        _ => None,
    });

    match subtype.as_deref() {
        Some("Image") => {
            let smask_id = match stream.dict.get(b"SMask") {
                Ok(Object::Reference(id)) => Some(*id),
                _ => None,
            };
            out.push(image_resource_from_stream(doc, obj_id, stream, is_smask));
            if let Some(smask_id) = smask_id {
                collect_images_recursive(doc, smask_id, true, out, seen);
            }
        }
        Some("Form") => {
            if let Ok(resources) = stream.dict.get(b"Resources") {
                for child_id in xobjects_in_resources(doc, resources) {
                    collect_images_recursive(doc, child_id, false, out, seen);
                }
            }
        }
        _ => {}
    }
}

/// Locate every embedded image in the document, in page traversal order.
///
/// Each image appears once (first reference wins). Malformed resource entries
/// are logged and skipped without aborting the traversal.
pub fn locate_images(doc: &Document) -> Vec<ImageResource> {
    let mut out = Vec::new();
    let mut seen: HashSet<ObjectId> = HashSet::new();

    for (page_num, &page_id) in doc.get_pages().iter() {
        let page_dict = match doc.get_object(page_id) {
            Ok(Object::Dictionary(d)) => d.clone(),
            _ => {
                log::warn!("page {}: unreadable page dictionary, skipping", page_num);
                continue;
            }
        };

        let resources = page_resources(doc, &page_dict);
        for xobj_id in xobjects_in_resources(doc, &resources) {
            collect_images_recursive(doc, xobj_id, false, &mut out, &mut seen);
        }
    }

    out
}

/// Expand byte-padded 1-bit rows to 8-bit grayscale (1 = white)
fn expand_bilevel(data: &[u8], width: u32, height: u32) -> Result<Vec<u8>, String> {
    let row_bytes = (width as usize).div_ceil(8);
    let expected = row_bytes * height as usize;
    if data.len() < expected {
        return Err(format!(
            "bilevel data too short: got {} expected {}",
            data.len(),
            expected
        ));
    }
    let mut out = Vec::with_capacity((width as usize) * (height as usize));
    for row in 0..height as usize {
        let row_data = &data[row * row_bytes..row * row_bytes + row_bytes];
        for col in 0..width as usize {
            let bit = (row_data[col / 8] >> (7 - (col % 8))) & 1;
            out.push(if bit == 1 { 255 } else { 0 });
        }
    }
    Ok(out)
}

/// Resolve palette indices through an Indexed colorspace's lookup table
fn resolve_indexed(
    indices: &[u8],
    width: u32,
    height: u32,
    base: &ColorSpace,
    lookup: &[u8],
) -> Result<DecodedRaster, String> {
    let count = (width as usize) * (height as usize);
    if indices.len() < count {
        return Err(format!(
            "indexed data too short: got {} expected {}",
            indices.len(),
            count
        ));
    }

    let entry = |idx: u8, channels: usize| -> Result<&[u8], String> {
        let start = idx as usize * channels;
        lookup
            .get(start..start + channels)
            .ok_or_else(|| format!("palette entry {} out of range", idx))
    };

    match base {
        ColorSpace::Gray => {
            let mut pixels = Vec::with_capacity(count);
            for &idx in &indices[..count] {
                pixels.push(entry(idx, 1)?[0]);
            }
            DecodedRaster::new(pixels, width, height, ColorModel::Gray)
        }
        ColorSpace::Rgb => {
            let mut pixels = Vec::with_capacity(count * 3);
            for &idx in &indices[..count] {
                pixels.extend_from_slice(entry(idx, 3)?);
            }
            DecodedRaster::new(pixels, width, height, ColorModel::Rgb)
        }
        ColorSpace::Cmyk => {
            let mut pixels = Vec::with_capacity(count * 3);
            for &idx in &indices[..count] {
                let e = entry(idx, 4)?;
                let [r, g, b] = cmyk_pixel_to_rgb(e[0], e[1], e[2], e[3]);
                pixels.extend_from_slice(&[r, g, b]);
            }
            DecodedRaster::new(pixels, width, height, ColorModel::Rgb)
        }
        ColorSpace::Indexed { .. } => Err("nested indexed colorspace".to_string()),
    }
}

/// Strategy 1: reinterpret raw (possibly flate-compressed) samples using the
/// declared geometry and colorspace
fn decode_raw(res: &ImageResource) -> Result<DecodedRaster, String> {
    if classify_encoding(&res.filters) != ImageEncoding::RawRaster {
        return Err("filter chain is not a raw raster".to_string());
    }
    if let Some(predictor) = res.predictor.filter(|&p| p > 1) {
        return Err(format!("predictor {} not supported", predictor));
    }

    let mut data = res.data.clone();
    for _ in &res.filters {
        data = inflate(&data)?;
    }

    let color_space = match &res.color_space {
        Some(cs) => cs.clone(),
        None if res.bits_per_component == 1 => ColorSpace::Gray,
        None => return Err("no declared colorspace".to_string()),
    };

    let (width, height) = (res.width, res.height);
    let check = |expected: usize| -> Result<(), String> {
        if data.len() < expected {
            Err(format!(
                "raw data too short: got {} expected {}",
                data.len(),
                expected
            ))
        } else {
            Ok(())
        }
    };

    match (&color_space, res.bits_per_component) {
        (ColorSpace::Gray, 8) => {
            let expected = (width as usize) * (height as usize);
            check(expected)?;
            DecodedRaster::new(data[..expected].to_vec(), width, height, ColorModel::Gray)
        }
        (ColorSpace::Gray, 1) => {
            let pixels = expand_bilevel(&data, width, height)?;
            DecodedRaster::new(pixels, width, height, ColorModel::Gray)
        }
        (ColorSpace::Rgb, 8) => {
            let expected = (width as usize) * (height as usize) * 3;
            check(expected)?;
            DecodedRaster::new(data[..expected].to_vec(), width, height, ColorModel::Rgb)
        }
        (ColorSpace::Cmyk, 8) => {
            let expected = (width as usize) * (height as usize) * 4;
            check(expected)?;
            DecodedRaster::new(data[..expected].to_vec(), width, height, ColorModel::Cmyk)
        }
        (ColorSpace::Indexed { base, lookup }, 8) => {
            resolve_indexed(&data, width, height, base, lookup)
        }
        (_, bits) => Err(format!("unsupported {}-bit {:?} raster", bits, color_space)),
    }
}

/// Strategy 2: decode an embedded JPEG payload, peeling any flate layers
/// wrapped around it
fn decode_jpeg(res: &ImageResource) -> Result<DecodedRaster, String> {
    let dct_pos = res
        .filters
        .iter()
        .position(|f| f == "DCTDecode")
        .ok_or_else(|| "no DCTDecode filter".to_string())?;

    let mut data = res.data.clone();
    for name in &res.filters[..dct_pos] {
        if name == "FlateDecode" {
            data = inflate(&data)?;
        } else {
            return Err(format!("cannot peel {} ahead of DCTDecode", name));
        }
    }

    let img = image::load_from_memory_with_format(&data, ImageFormat::Jpeg)
        .map_err(|e| format!("JPEG decode failed: {}", e))?;
    DecodedRaster::from_dynamic(img)
}

/// Strategy 3: let the image library sniff the format, trying the inflated
/// bytes as well when a flate layer is declared
fn decode_library(res: &ImageResource) -> Result<DecodedRaster, String> {
    if let Ok(img) = image::load_from_memory(&res.data) {
        return DecodedRaster::from_dynamic(img);
    }
    if res.filters.iter().any(|f| f == "FlateDecode") {
        let data = inflate(&res.data)?;
        let img = image::load_from_memory(&data)
            .map_err(|e| format!("format sniffing failed: {}", e))?;
        return DecodedRaster::from_dynamic(img);
    }
    Err("no decodable image signature".to_string())
}

/// Decode an image resource, trying each strategy in order until one
/// produces a validated raster
pub fn decode_resource(
    res: &ImageResource,
    order: &[DecodeStrategy],
) -> Result<DecodedRaster, String> {
    let mut failures = Vec::new();
    for strategy in order {
        let attempt = match strategy {
            DecodeStrategy::Raw => decode_raw(res),
            DecodeStrategy::Jpeg => decode_jpeg(res),
            DecodeStrategy::Library => decode_library(res),
        };
        match attempt {
            Ok(raster) => return Ok(raster),
            Err(e) => {
                log::debug!("{:?}: {:?} strategy failed: {}", res.id, strategy, e);
                failures.push(format!("{:?}: {}", strategy, e));
            }
        }
    }
    Err(failures.join("; "))
}

fn cmyk_pixel_to_rgb(c: u8, m: u8, y: u8, k: u8) -> [u8; 3] {
    let c = c as f32 / 255.0;
    let m = m as f32 / 255.0;
    let y = y as f32 / 255.0;
    let k = k as f32 / 255.0;
    [
        ((1.0 - c) * (1.0 - k) * 255.0) as u8,
        ((1.0 - m) * (1.0 - k) * 255.0) as u8,
        ((1.0 - y) * (1.0 - k) * 255.0) as u8,
    ]
}

/// Approximate CMYK ink values as RGB
fn cmyk_to_rgb(pixels: &[u8], width: u32, height: u32) -> Result<RgbImage, String> {
    let mut rgb = Vec::with_capacity((width as usize) * (height as usize) * 3);
    for chunk in pixels.chunks_exact(4) {
        let [r, g, b] = cmyk_pixel_to_rgb(chunk[0], chunk[1], chunk[2], chunk[3]);
        rgb.extend_from_slice(&[r, g, b]);
    }
    RgbImage::from_raw(width, height, rgb)
        .ok_or_else(|| "failed to build RGB image from CMYK data".to_string())
}

/// Flatten RGBA onto a white background
fn flatten_alpha(pixels: &[u8], width: u32, height: u32) -> Result<RgbImage, String> {
    let mut rgb = Vec::with_capacity((width as usize) * (height as usize) * 3);
    for chunk in pixels.chunks_exact(4) {
        let alpha = chunk[3] as u32;
        for &channel in &chunk[..3] {
            rgb.push(((channel as u32 * alpha + 255 * (255 - alpha)) / 255) as u8);
        }
    }
    RgbImage::from_raw(width, height, rgb)
        .ok_or_else(|| "failed to build RGB image from RGBA data".to_string())
}

/// Re-encode a decoded raster as a JPEG stream.
///
/// Grayscale stays grayscale and uses the grayscale quality. RGBA is
/// flattened onto white and CMYK is converted to an RGB approximation, both
/// under the color quality; the distinction lives in the raster's color-model
/// tag, never in the channel count alone. Downscales (aspect-preserving,
/// Lanczos3) when a dimension exceeds the configured bound; never upscales.
pub fn recompress(
    raster: &DecodedRaster,
    options: &CompressOptions,
) -> Result<EncodedImage, String> {
    let quality = match raster.model {
        ColorModel::Gray => options.grayscale_quality(),
        _ => options.quality,
    };

    let mut working: DynamicImage = match raster.model {
        ColorModel::Gray => DynamicImage::ImageLuma8(
            GrayImage::from_raw(raster.width, raster.height, raster.pixels.clone())
                .ok_or_else(|| "failed to build grayscale image".to_string())?,
        ),
        ColorModel::Rgb => DynamicImage::ImageRgb8(
            RgbImage::from_raw(raster.width, raster.height, raster.pixels.clone())
                .ok_or_else(|| "failed to build RGB image".to_string())?,
        ),
        ColorModel::Rgba => {
            DynamicImage::ImageRgb8(flatten_alpha(&raster.pixels, raster.width, raster.height)?)
        }
        ColorModel::Cmyk => {
            DynamicImage::ImageRgb8(cmyk_to_rgb(&raster.pixels, raster.width, raster.height)?)
        }
    };

    let bound_w = if options.max_width == 0 { u32::MAX } else { options.max_width };
    let bound_h = if options.max_height == 0 { u32::MAX } else { options.max_height };
    if working.width() > bound_w || working.height() > bound_h {
        working = working.resize(bound_w, bound_h, image::imageops::FilterType::Lanczos3);
    }

    let (width, height) = (working.width(), working.height());
    if width > u16::MAX as u32 || height > u16::MAX as u32 {
        return Err(format!("{}x{} exceeds JPEG dimension limit", width, height));
    }

    let mut jpeg_bytes = Vec::new();
    match &working {
        DynamicImage::ImageLuma8(gray) => {
            let encoder = jpeg_encoder::Encoder::new(&mut jpeg_bytes, quality);
            encoder
                .encode(
                    gray.as_raw(),
                    width as u16,
                    height as u16,
                    jpeg_encoder::ColorType::Luma,
                )
                .map_err(|e| format!("failed to encode JPEG: {}", e))?;
            Ok(EncodedImage {
                data: jpeg_bytes,
                color_space: "DeviceGray",
                width,
                height,
            })
        }
        DynamicImage::ImageRgb8(rgb) => {
            let mut encoder = jpeg_encoder::Encoder::new(&mut jpeg_bytes, quality);
            encoder.set_sampling_factor(jpeg_encoder::SamplingFactor::R_4_2_0);
            encoder
                .encode(
                    rgb.as_raw(),
                    width as u16,
                    height as u16,
                    jpeg_encoder::ColorType::Rgb,
                )
                .map_err(|e| format!("failed to encode JPEG: {}", e))?;
            Ok(EncodedImage {
                data: jpeg_bytes,
                color_space: "DeviceRGB",
                width,
                height,
            })
        }
        _ => Err("unexpected working buffer type".to_string()),
    }
}

/// Run sniff/decode/recompress for one resource. Returns the replacement
/// stream, or the reason the image must stay untouched.
fn compress_resource(
    res: &ImageResource,
    options: &CompressOptions,
) -> Result<EncodedImage, SkipReason> {
    if res.width == 0 || res.height == 0 {
        return Err(SkipReason::InvalidDimensions);
    }

    if classify_encoding(&res.filters) == ImageEncoding::Unsupported {
        log::debug!("{:?}: unsupported filter chain {:?}", res.id, res.filters);
        return Err(SkipReason::Unsupported);
    }

    let raster = decode_resource(res, &options.decode_order).map_err(|e| {
        log::debug!("{:?}: decode failed: {}", res.id, e);
        SkipReason::DecodeFailed
    })?;

    let encoded = recompress(&raster, options).map_err(|e| {
        log::debug!("{:?}: encode failed: {}", res.id, e);
        SkipReason::EncodeFailed
    })?;

    let reduction = (1.0 - encoded.data.len() as f64 / res.data.len() as f64) * 100.0;
    if reduction < options.min_reduction as f64 {
        log::debug!(
            "{:?}: keeping original, replacement saves only {:.1}%",
            res.id,
            reduction
        );
        return Err(SkipReason::InsufficientGain);
    }

    Ok(encoded)
}

/// Replace an image stream's bytes and encoding-related keys in place.
///
/// Only the keys tied to the replaced encoding are touched (Filter,
/// ColorSpace, Width, Height, BitsPerComponent, Length, and the now-stale
/// DecodeParms/Decode entries); everything else in the dictionary, such as
/// SMask, Mask or Intent, is preserved.
fn apply_replacement(doc: &mut Document, id: ObjectId, encoded: &EncodedImage) -> bool {
    let Some(Object::Stream(stream)) = doc.objects.get_mut(&id) else {
        return false;
    };
    stream.dict.set("Filter", Object::Name(b"DCTDecode".to_vec()));
    stream.dict.set(
        "ColorSpace",
        Object::Name(encoded.color_space.as_bytes().to_vec()),
    );
    stream.dict.set("Width", Object::Integer(encoded.width as i64));
    stream.dict.set("Height", Object::Integer(encoded.height as i64));
    stream.dict.set("BitsPerComponent", Object::Integer(8));
    stream.dict.set("Length", Object::Integer(encoded.data.len() as i64));
    stream.dict.remove(b"DecodeParms");
    stream.dict.remove(b"DP");
    stream.dict.remove(b"Decode");
    stream.content = encoded.data.clone();
    true
}

/// Process every located image: decode and re-encode in parallel, then apply
/// the replacements in a single serial pass over the document
fn process_images_in_doc(doc: &mut Document, options: &CompressOptions) -> CompressReport {
    let resources = locate_images(doc);
    log::info!("found {} image XObjects", resources.len());

    // Decoding and JPEG encoding dominate run time and touch only their own
    // resource, so they fan out across the thread pool; the document itself
    // is mutated by this thread alone, below.
    let results: Vec<(ObjectId, usize, Result<EncodedImage, SkipReason>)> = resources
        .par_iter()
        .map(|res| (res.id, res.data.len(), compress_resource(res, options)))
        .collect();

    let mut report = CompressReport::default();
    for (id, original_size, result) in results {
        let outcome = match result {
            Ok(encoded) => {
                let new_size = encoded.data.len();
                if apply_replacement(doc, id, &encoded) {
                    log::debug!(
                        "{:?}: {} -> {} bytes ({:.1}% reduction)",
                        id,
                        original_size,
                        new_size,
                        (1.0 - new_size as f64 / original_size as f64) * 100.0
                    );
                    ImageResult::Compressed { new_size }
                } else {
                    log::warn!("{:?}: image object disappeared before rewrite", id);
                    ImageResult::Skipped(SkipReason::EncodeFailed)
                }
            }
            Err(reason) => {
                log::debug!("{:?}: left unchanged ({})", id, reason);
                ImageResult::Skipped(reason)
            }
        };
        report.images.push(ImageOutcome {
            object_id: id,
            original_size,
            outcome,
        });
    }
    report
}

/// Empty the document info dictionary and drop the catalog's XMP metadata
fn strip_metadata(doc: &mut Document) {
    if let Ok(Object::Reference(info_id)) = doc.trailer.get(b"Info") {
        let info_id = *info_id;
        doc.objects
            .insert(info_id, Object::Dictionary(Dictionary::new()));
        log::debug!("cleared document info dictionary");
    }
    if let Ok(Object::Reference(root_id)) = doc.trailer.get(b"Root") {
        let root_id = *root_id;
        if let Some(Object::Dictionary(catalog)) = doc.objects.get_mut(&root_id) {
            if catalog.remove(b"Metadata").is_some() {
                log::debug!("removed XMP metadata");
            }
        }
    }
}

/// Compress a PDF held in memory and return the rewritten bytes plus the
/// per-image report
pub fn compress_pdf_bytes(
    input_bytes: &[u8],
    options: &CompressOptions,
) -> Result<(Vec<u8>, CompressReport), CompressError> {
    options.validate()?;

    let mut doc =
        Document::load_mem(input_bytes).map_err(|e| CompressError::Load(e.to_string()))?;

    let report = process_images_in_doc(&mut doc, options);

    if options.strip_metadata {
        strip_metadata(&mut doc);
    }
    if options.compress_streams {
        doc.compress();
    }

    let mut output_bytes = Vec::new();
    doc.save_to(&mut output_bytes)
        .map_err(|e| CompressError::Save(e.to_string()))?;

    Ok((output_bytes, report))
}

pub mod file_ops {
    use super::*;
    use std::path::Path;

    /// Compress a PDF from file path to file path
    pub fn compress_pdf_file(
        input_path: &Path,
        output_path: &Path,
        options: &CompressOptions,
    ) -> Result<CompressReport, CompressError> {
        options.validate()?;

        let mut doc = Document::load(input_path)
            .map_err(|e| CompressError::Load(format!("{:?}: {}", input_path, e)))?;

        let report = process_images_in_doc(&mut doc, options);

        if options.strip_metadata {
            strip_metadata(&mut doc);
        }
        if options.compress_streams {
            doc.compress();
        }

        doc.save(output_path)
            .map_err(|e| CompressError::Save(format!("{:?}: {}", output_path, e)))?;

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::ZlibEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn deflate(data: &[u8]) -> Vec<u8> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    fn noise(len: usize, seed: u32) -> Vec<u8> {
        let mut state = seed;
        (0..len)
            .map(|_| {
                state = state.wrapping_mul(1664525).wrapping_add(1013904223);
                (state >> 24) as u8
            })
            .collect()
    }

    fn raw_resource(
        width: u32,
        height: u32,
        color_space: ColorSpace,
        pixels: &[u8],
    ) -> ImageResource {
        ImageResource {
            id: (1, 0),
            width,
            height,
            bits_per_component: 8,
            color_space: Some(color_space),
            filters: vec!["FlateDecode".to_string()],
            predictor: None,
            data: deflate(pixels),
        }
    }

    // classify_encoding

    #[test]
    fn empty_filter_chain_is_raw_raster() {
        assert_eq!(classify_encoding(&[]), ImageEncoding::RawRaster);
    }

    #[test]
    fn flate_only_chain_is_raw_raster() {
        let filters = vec!["FlateDecode".to_string()];
        assert_eq!(classify_encoding(&filters), ImageEncoding::RawRaster);
    }

    #[test]
    fn dct_anywhere_is_embedded_jpeg() {
        let plain = vec!["DCTDecode".to_string()];
        assert_eq!(classify_encoding(&plain), ImageEncoding::EmbeddedJpeg);

        let wrapped = vec!["FlateDecode".to_string(), "DCTDecode".to_string()];
        assert_eq!(classify_encoding(&wrapped), ImageEncoding::EmbeddedJpeg);
    }

    #[test]
    fn other_filters_are_unsupported() {
        for name in ["CCITTFaxDecode", "JPXDecode", "LZWDecode", "JBIG2Decode"] {
            let filters = vec![name.to_string()];
            assert_eq!(classify_encoding(&filters), ImageEncoding::Unsupported);
        }
    }

    // resolve_color_space

    #[test]
    fn device_names_resolve() {
        let doc = Document::with_version("1.5");
        let cases = [
            (&b"DeviceGray"[..], ColorSpace::Gray),
            (&b"CalGray"[..], ColorSpace::Gray),
            (&b"DeviceRGB"[..], ColorSpace::Rgb),
            (&b"CalRGB"[..], ColorSpace::Rgb),
            (&b"DeviceCMYK"[..], ColorSpace::Cmyk),
        ];
        for (name, expected) in cases {
            let obj = Object::Name(name.to_vec());
            assert_eq!(resolve_color_space(&doc, &obj), Some(expected));
        }
    }

    #[test]
    fn icc_based_resolves_by_component_count() {
        let mut doc = Document::with_version("1.5");
        let mut dict = Dictionary::new();
        dict.set("N", Object::Integer(3));
        let icc_id = doc.add_object(Object::Stream(Stream::new(dict, vec![0u8; 16])));

        let obj = Object::Array(vec![
            Object::Name(b"ICCBased".to_vec()),
            Object::Reference(icc_id),
        ]);
        assert_eq!(resolve_color_space(&doc, &obj), Some(ColorSpace::Rgb));
    }

    #[test]
    fn indexed_with_inline_lookup_resolves() {
        let doc = Document::with_version("1.5");
        let obj = Object::Array(vec![
            Object::Name(b"Indexed".to_vec()),
            Object::Name(b"DeviceRGB".to_vec()),
            Object::Integer(1),
            Object::String(vec![0, 0, 0, 255, 255, 255], lopdf::StringFormat::Literal),
        ]);
        match resolve_color_space(&doc, &obj) {
            Some(ColorSpace::Indexed { base, lookup }) => {
                assert_eq!(*base, ColorSpace::Rgb);
                assert_eq!(lookup.len(), 6);
            }
            other => panic!("expected indexed colorspace, got {:?}", other),
        }
    }

    #[test]
    fn separation_is_unresolvable() {
        let doc = Document::with_version("1.5");
        let obj = Object::Array(vec![
            Object::Name(b"Separation".to_vec()),
            Object::Name(b"All".to_vec()),
        ]);
        assert_eq!(resolve_color_space(&doc, &obj), None);
    }

    // DecodedRaster

    #[test]
    fn raster_rejects_wrong_buffer_size() {
        assert!(DecodedRaster::new(vec![0u8; 11], 2, 2, ColorModel::Rgb).is_err());
        assert!(DecodedRaster::new(vec![0u8; 12], 2, 2, ColorModel::Rgb).is_ok());
    }

    #[test]
    fn raster_rejects_zero_dimension() {
        assert!(DecodedRaster::new(Vec::new(), 0, 4, ColorModel::Gray).is_err());
    }

    // decoding

    #[test]
    fn raw_gray_decodes_as_single_channel() {
        let pixels = noise(64 * 48, 7);
        let res = raw_resource(64, 48, ColorSpace::Gray, &pixels);

        let raster = decode_resource(&res, &DEFAULT_DECODE_ORDER).unwrap();
        assert_eq!(raster.model(), ColorModel::Gray);
        assert_eq!(raster.pixels(), &pixels[..]);
    }

    #[test]
    fn raw_cmyk_keeps_its_tag() {
        let pixels = noise(16 * 16 * 4, 11);
        let res = raw_resource(16, 16, ColorSpace::Cmyk, &pixels);

        let raster = decode_resource(&res, &DEFAULT_DECODE_ORDER).unwrap();
        assert_eq!(raster.model(), ColorModel::Cmyk);
        assert_eq!(raster.model().channels(), 4);
    }

    #[test]
    fn truncated_raw_data_fails_decode() {
        let pixels = noise(32 * 32 * 3 - 100, 3);
        let res = raw_resource(32, 32, ColorSpace::Rgb, &pixels);
        assert!(decode_resource(&res, &DEFAULT_DECODE_ORDER).is_err());
    }

    #[test]
    fn predictor_blocks_raw_reinterpretation() {
        let pixels = noise(8 * 8, 5);
        let mut res = raw_resource(8, 8, ColorSpace::Gray, &pixels);
        res.predictor = Some(12);
        assert!(decode_raw(&res).is_err());
    }

    #[test]
    fn bilevel_rows_expand_with_padding() {
        // 10 pixels per row -> 2 bytes per row, 2 rows
        let data = [0b1010_1010, 0b1100_0000, 0b0101_0101, 0b0000_0000];
        let pixels = expand_bilevel(&data, 10, 2).unwrap();
        assert_eq!(pixels.len(), 20);
        assert_eq!(&pixels[..4], &[255, 0, 255, 0]);
        assert_eq!(&pixels[8..10], &[255, 255]);
        assert_eq!(&pixels[10..14], &[0, 255, 0, 255]);
    }

    #[test]
    fn one_bit_without_colorspace_is_gray() {
        let data = [0b1000_0000u8, 0b0000_0001u8];
        let res = ImageResource {
            id: (1, 0),
            width: 8,
            height: 2,
            bits_per_component: 1,
            color_space: None,
            filters: Vec::new(),
            predictor: None,
            data: data.to_vec(),
        };
        let raster = decode_raw(&res).unwrap();
        assert_eq!(raster.model(), ColorModel::Gray);
        assert_eq!(raster.pixels()[0], 255);
        assert_eq!(raster.pixels()[15], 255);
    }

    #[test]
    fn indexed_resolves_through_palette() {
        let lookup = vec![10, 20, 30, 200, 210, 220];
        let indices = vec![0u8, 1, 1, 0];
        let res = ImageResource {
            id: (1, 0),
            width: 2,
            height: 2,
            bits_per_component: 8,
            color_space: Some(ColorSpace::Indexed {
                base: Box::new(ColorSpace::Rgb),
                lookup,
            }),
            filters: Vec::new(),
            predictor: None,
            data: indices,
        };
        let raster = decode_raw(&res).unwrap();
        assert_eq!(raster.model(), ColorModel::Rgb);
        assert_eq!(&raster.pixels()[..3], &[10, 20, 30]);
        assert_eq!(&raster.pixels()[3..6], &[200, 210, 220]);
    }

    #[test]
    fn palette_index_out_of_range_fails() {
        let res = ImageResource {
            id: (1, 0),
            width: 2,
            height: 1,
            bits_per_component: 8,
            color_space: Some(ColorSpace::Indexed {
                base: Box::new(ColorSpace::Rgb),
                lookup: vec![1, 2, 3],
            }),
            filters: Vec::new(),
            predictor: None,
            data: vec![0, 5],
        };
        assert!(decode_raw(&res).is_err());
    }

    #[test]
    fn embedded_jpeg_round_trips_through_decoder() {
        let pixels = noise(32 * 32 * 3, 21);
        let raster = DecodedRaster::new(pixels, 32, 32, ColorModel::Rgb).unwrap();
        let encoded = recompress(&raster, &CompressOptions::default()).unwrap();

        let res = ImageResource {
            id: (1, 0),
            width: 32,
            height: 32,
            bits_per_component: 8,
            color_space: Some(ColorSpace::Rgb),
            filters: vec!["DCTDecode".to_string()],
            predictor: None,
            data: encoded.data,
        };
        let decoded = decode_resource(&res, &DEFAULT_DECODE_ORDER).unwrap();
        assert_eq!(decoded.model(), ColorModel::Rgb);
        assert_eq!(decoded.width(), 32);
        assert_eq!(decoded.height(), 32);
    }

    // recompression

    #[test]
    fn grayscale_stays_grayscale() {
        let pixels = noise(64 * 64, 17);
        let raster = DecodedRaster::new(pixels, 64, 64, ColorModel::Gray).unwrap();

        let encoded = recompress(&raster, &CompressOptions::default()).unwrap();
        assert_eq!(encoded.color_space, "DeviceGray");

        let back = image::load_from_memory(&encoded.data).unwrap();
        assert!(!back.color().has_color());
    }

    #[test]
    fn cmyk_converts_to_rgb_never_rgba() {
        let pixels = noise(32 * 32 * 4, 23);
        let raster = DecodedRaster::new(pixels, 32, 32, ColorModel::Cmyk).unwrap();

        let encoded = recompress(&raster, &CompressOptions::default()).unwrap();
        assert_eq!(encoded.color_space, "DeviceRGB");

        let back = image::load_from_memory(&encoded.data).unwrap();
        assert!(back.color().has_color());
    }

    #[test]
    fn cmyk_corner_values_map_as_expected() {
        assert_eq!(cmyk_pixel_to_rgb(0, 0, 0, 255), [0, 0, 0]);
        assert_eq!(cmyk_pixel_to_rgb(0, 0, 0, 0), [255, 255, 255]);
        assert_eq!(cmyk_pixel_to_rgb(255, 0, 0, 0), [0, 255, 255]);
    }

    #[test]
    fn opaque_alpha_flattens_to_the_same_pixels() {
        let rgba = vec![10, 20, 30, 255, 40, 50, 60, 255];
        let rgb = flatten_alpha(&rgba, 2, 1).unwrap();
        assert_eq!(rgb.as_raw(), &vec![10, 20, 30, 40, 50, 60]);
    }

    #[test]
    fn transparent_alpha_flattens_to_white() {
        let rgba = vec![10, 20, 30, 0];
        let rgb = flatten_alpha(&rgba, 1, 1).unwrap();
        assert_eq!(rgb.as_raw(), &vec![255, 255, 255]);
    }

    #[test]
    fn oversized_image_is_downscaled_with_aspect_kept() {
        let pixels = noise(2400 * 1200, 31);
        let raster = DecodedRaster::new(pixels, 2400, 1200, ColorModel::Gray).unwrap();

        let encoded = recompress(&raster, &CompressOptions::default()).unwrap();
        assert_eq!(encoded.width, 1200);
        assert_eq!(encoded.height, 600);
    }

    #[test]
    fn image_within_bounds_is_not_resized() {
        let pixels = noise(800 * 600, 37);
        let raster = DecodedRaster::new(pixels, 800, 600, ColorModel::Gray).unwrap();

        let encoded = recompress(&raster, &CompressOptions::default()).unwrap();
        assert_eq!((encoded.width, encoded.height), (800, 600));
    }

    #[test]
    fn small_image_is_never_upscaled() {
        let pixels = noise(100 * 50 * 3, 41);
        let raster = DecodedRaster::new(pixels, 100, 50, ColorModel::Rgb).unwrap();

        let encoded = recompress(&raster, &CompressOptions::default()).unwrap();
        assert_eq!((encoded.width, encoded.height), (100, 50));
    }

    #[test]
    fn zero_bound_means_no_limit() {
        let pixels = noise(2000 * 100, 43);
        let raster = DecodedRaster::new(pixels, 2000, 100, ColorModel::Gray).unwrap();

        let options = CompressOptions {
            max_width: 0,
            max_height: 0,
            ..CompressOptions::default()
        };
        let encoded = recompress(&raster, &options).unwrap();
        assert_eq!((encoded.width, encoded.height), (2000, 100));
    }

    #[test]
    fn lower_quality_does_not_grow_output() {
        // smooth gradient so quantization has something to discard
        let mut pixels = Vec::with_capacity(64 * 64 * 3);
        for y in 0..64u32 {
            for x in 0..64u32 {
                pixels.push((x * 4) as u8);
                pixels.push((y * 4) as u8);
                pixels.push(((x + y) * 2) as u8);
            }
        }
        let raster = DecodedRaster::new(pixels, 64, 64, ColorModel::Rgb).unwrap();

        let low = recompress(
            &raster,
            &CompressOptions { quality: 20, ..CompressOptions::default() },
        )
        .unwrap();
        let high = recompress(
            &raster,
            &CompressOptions { quality: 80, ..CompressOptions::default() },
        )
        .unwrap();
        assert!(low.data.len() <= high.data.len());
    }

    #[test]
    fn gray_quality_is_applied_to_grayscale() {
        let pixels = noise(64 * 64, 47);
        let raster = DecodedRaster::new(pixels, 64, 64, ColorModel::Gray).unwrap();

        let aggressive = recompress(
            &raster,
            &CompressOptions { gray_quality: Some(10), ..CompressOptions::default() },
        )
        .unwrap();
        let gentle = recompress(
            &raster,
            &CompressOptions { gray_quality: Some(90), ..CompressOptions::default() },
        )
        .unwrap();
        assert!(aggressive.data.len() < gentle.data.len());
    }

    // pipeline pieces

    #[test]
    fn unsupported_chain_is_reported_as_such() {
        let res = ImageResource {
            id: (1, 0),
            width: 8,
            height: 8,
            bits_per_component: 8,
            color_space: Some(ColorSpace::Gray),
            filters: vec!["CCITTFaxDecode".to_string()],
            predictor: None,
            data: vec![0u8; 64],
        };
        assert_eq!(
            compress_resource(&res, &CompressOptions::default()),
            Err(SkipReason::Unsupported)
        );
    }

    #[test]
    fn tiny_image_is_skipped_for_insufficient_gain() {
        // 16 raw bytes can't beat JPEG header overhead
        let pixels = noise(16, 53);
        let res = raw_resource(4, 4, ColorSpace::Gray, &pixels);
        assert_eq!(
            compress_resource(&res, &CompressOptions::default()),
            Err(SkipReason::InsufficientGain)
        );
    }

    #[test]
    fn zero_dimension_is_invalid() {
        let res = ImageResource {
            id: (1, 0),
            width: 0,
            height: 8,
            bits_per_component: 8,
            color_space: Some(ColorSpace::Gray),
            filters: Vec::new(),
            predictor: None,
            data: Vec::new(),
        };
        assert_eq!(
            compress_resource(&res, &CompressOptions::default()),
            Err(SkipReason::InvalidDimensions)
        );
    }

    // options

    #[test]
    fn quality_bounds_are_enforced() {
        let zero = CompressOptions { quality: 0, ..CompressOptions::default() };
        assert!(matches!(zero.validate(), Err(CompressError::InvalidQuality)));

        let over = CompressOptions { quality: 101, ..CompressOptions::default() };
        assert!(matches!(over.validate(), Err(CompressError::InvalidQuality)));

        let gray_over = CompressOptions {
            gray_quality: Some(101),
            ..CompressOptions::default()
        };
        assert!(matches!(gray_over.validate(), Err(CompressError::InvalidQuality)));

        assert!(CompressOptions::default().validate().is_ok());
    }

    #[test]
    fn gray_quality_falls_back_to_color_quality() {
        let options = CompressOptions { quality: 25, ..CompressOptions::default() };
        assert_eq!(options.grayscale_quality(), 25);

        let distinct = CompressOptions {
            quality: 25,
            gray_quality: Some(40),
            ..CompressOptions::default()
        };
        assert_eq!(distinct.grayscale_quality(), 40);
    }

    #[test]
    fn tier_presets_match_documented_pairs() {
        assert_eq!(QualityTier::High.qualities(), (60, 70));
        assert_eq!(QualityTier::Balanced.qualities(), (45, 55));
        assert_eq!(QualityTier::Compact.qualities(), (30, 40));
    }

    // report

    #[test]
    fn report_aggregates_sizes_and_reasons() {
        let report = CompressReport {
            images: vec![
                ImageOutcome {
                    object_id: (1, 0),
                    original_size: 1000,
                    outcome: ImageResult::Compressed { new_size: 400 },
                },
                ImageOutcome {
                    object_id: (2, 0),
                    original_size: 500,
                    outcome: ImageResult::Skipped(SkipReason::Unsupported),
                },
                ImageOutcome {
                    object_id: (3, 0),
                    original_size: 500,
                    outcome: ImageResult::Skipped(SkipReason::DecodeFailed),
                },
            ],
        };
        assert_eq!(report.total_images(), 3);
        assert_eq!(report.compressed_images(), 1);
        assert_eq!(report.skipped_images(), 2);
        assert_eq!(report.skip_count(SkipReason::Unsupported), 1);
        assert_eq!(report.skip_count(SkipReason::EncodeFailed), 0);
        assert_eq!(report.original_image_bytes(), 2000);
        assert_eq!(report.final_image_bytes(), 1400);
        assert!((report.reduction_percent() - 30.0).abs() < 0.001);
    }

    #[test]
    fn empty_report_has_zero_reduction() {
        let report = CompressReport::default();
        assert_eq!(report.reduction_percent(), 0.0);
    }
}
