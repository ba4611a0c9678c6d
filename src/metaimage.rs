/// Reader for the MetaImage format (.mha with embedded data, .mhd with a detached data file).
/// A MetaImage file is a plain text header of `Key = Value` lines terminated by the
/// `ElementDataFile` line, followed (for .mha) directly by the raw or zlib compressed voxels.
///
/// Only the first 2-D slice is decoded; the classifier works on single radiographs and
/// volumes in the training set carry the image in their first slice.

use std::io::Read;
use std::path::Path;

use flate2::read::ZlibDecoder;
use log::debug;
use ndarray::Array2;
use rustc_hash::FxHashMap;

use crate::models::DecodedImage;

const LOCAL_DATA_FILE: &str = "LOCAL";

#[derive(Debug, thiserror::Error)]
pub enum MetaImageError
{
    #[error("header is missing the {0} field")]
    MissingField(&'static str),
    #[error("header field {field} has an invalid value {value:?}")]
    InvalidField { field: &'static str, value: String },
    #[error("unsupported element type {0}")]
    UnsupportedElementType(String),
    #[error("header is not terminated by an ElementDataFile line")]
    UnterminatedHeader,
    #[error("pixel data is truncated: expected {expected} bytes, found {found}")]
    Truncated { expected: usize, found: usize },
    #[error("detached data file {0} is not available for an in-memory upload")]
    DetachedData(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementType
{
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    F32,
    F64,
}

impl ElementType
{
    pub fn from_name(name: &str) -> Option<ElementType>
    {
        match name
        {
            "MET_UCHAR" => Some(ElementType::U8),
            "MET_CHAR" => Some(ElementType::I8),
            "MET_USHORT" => Some(ElementType::U16),
            "MET_SHORT" => Some(ElementType::I16),
            "MET_UINT" => Some(ElementType::U32),
            "MET_INT" => Some(ElementType::I32),
            "MET_FLOAT" => Some(ElementType::F32),
            "MET_DOUBLE" => Some(ElementType::F64),
            _ => None,
        }
    }

    pub fn size(&self) -> usize
    {
        match self
        {
            ElementType::U8 | ElementType::I8 => 1,
            ElementType::U16 | ElementType::I16 => 2,
            ElementType::U32 | ElementType::I32 | ElementType::F32 => 4,
            ElementType::F64 => 8,
        }
    }

    /// Reads one element. `bytes` must be exactly `self.size()` long.
    fn read(&self, bytes: &[u8], big_endian: bool) -> f32
    {
        macro_rules! read_as {
            ($t:ty, $n:expr) => {{
                let mut raw = [0u8; $n];
                raw.copy_from_slice(bytes);
                if big_endian { <$t>::from_be_bytes(raw) } else { <$t>::from_le_bytes(raw) }
            }};
        }

        match self
        {
            ElementType::U8 => bytes[0] as f32,
            ElementType::I8 => bytes[0] as i8 as f32,
            ElementType::U16 => read_as!(u16, 2) as f32,
            ElementType::I16 => read_as!(i16, 2) as f32,
            ElementType::U32 => read_as!(u32, 4) as f32,
            ElementType::I32 => read_as!(i32, 4) as f32,
            ElementType::F32 => read_as!(f32, 4),
            ElementType::F64 => read_as!(f64, 8) as f32,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetaHeader
{
    /// Extent per axis, fastest varying (x) first.
    pub dim_size: Vec<usize>,
    pub element_type: ElementType,
    /// Spacing per axis in the same order as `dim_size`, if the header declares it.
    pub element_spacing: Option<Vec<f64>>,
    pub channels: usize,
    pub big_endian: bool,
    pub compressed: bool,
    /// Bytes to skip at the start of a detached data file; -1 means the data sits at its end.
    pub header_size: Option<i64>,
    pub data_file: String,
}

impl MetaHeader
{
    pub fn width(&self) -> usize
    {
        self.dim_size[0]
    }

    pub fn height(&self) -> usize
    {
        self.dim_size[1]
    }

    /// Byte length of the first slice, or an error if the header's extents overflow.
    fn slice_bytes(&self) -> Result<usize, MetaImageError>
    {
        self.byte_length(&self.dim_size[..2])
    }

    fn volume_bytes(&self) -> Result<usize, MetaImageError>
    {
        self.byte_length(&self.dim_size)
    }

    fn byte_length(&self, dims: &[usize]) -> Result<usize, MetaImageError>
    {
        dims.iter()
            .chain([self.channels, self.element_type.size()].iter())
            .try_fold(1usize, |total, n| total.checked_mul(*n))
            .ok_or_else(|| MetaImageError::InvalidField { field: "DimSize", value: format!("{:?}", self.dim_size) })
    }
}

/// Parses the text header. Returns the header and the byte offset at which embedded data starts.
pub fn parse_header(bytes: &[u8]) -> Result<(MetaHeader, usize), MetaImageError>
{
    let mut fields: FxHashMap<String, String> = FxHashMap::default();
    let mut position = 0;
    let mut data_offset = None;

    while position < bytes.len()
    {
        let line_end = bytes[position..]
            .iter()
            .position(|b| *b == b'\n')
            .map(|offset| position + offset)
            .unwrap_or(bytes.len());
        let line = String::from_utf8_lossy(&bytes[position..line_end]);
        let next = (line_end + 1).min(bytes.len());

        if let Some((key, value)) = line.split_once('=')
        {
            let key = key.trim().to_string();
            let is_last = key == "ElementDataFile";
            fields.insert(key, value.trim().to_string());
            if is_last
            {
                data_offset = Some(next);
                break;
            }
        }
        position = next;
    }

    let data_offset = data_offset.ok_or(MetaImageError::UnterminatedHeader)?;

    let dim_size = parse_list::<usize>(&fields, "DimSize")?
        .ok_or(MetaImageError::MissingField("DimSize"))?;
    if dim_size.len() < 2 || dim_size.iter().any(|d| *d == 0)
    {
        return Err(MetaImageError::InvalidField { field: "DimSize", value: fields["DimSize"].clone() });
    }
    if let Some(ndims) = parse_single::<usize>(&fields, "NDims")?
    {
        if ndims != dim_size.len()
        {
            return Err(MetaImageError::InvalidField { field: "NDims", value: ndims.to_string() });
        }
    }

    let element_type_name = fields.get("ElementType").ok_or(MetaImageError::MissingField("ElementType"))?;
    let element_type = ElementType::from_name(element_type_name)
        .ok_or_else(|| MetaImageError::UnsupportedElementType(element_type_name.clone()))?;

    let element_spacing = parse_list::<f64>(&fields, "ElementSpacing")?;
    let channels = parse_single::<usize>(&fields, "ElementNumberOfChannels")?.unwrap_or(1).max(1);

    // Both spellings occur in the wild.
    let big_endian = parse_bool(&fields, "BinaryDataByteOrderMSB")?
        .or(parse_bool(&fields, "ElementByteOrderMSB")?)
        .unwrap_or(false);
    let compressed = parse_bool(&fields, "CompressedData")?.unwrap_or(false);
    let header_size = parse_single::<i64>(&fields, "HeaderSize")?;
    let data_file = fields["ElementDataFile"].clone();

    Ok((
        MetaHeader {
            dim_size,
            element_type,
            element_spacing,
            channels,
            big_endian,
            compressed,
            header_size,
            data_file,
        },
        data_offset,
    ))
}

/// Reads the first slice of a MetaImage file.
/// `origin` is the on-disk location of the header, used to resolve a detached data file.
pub fn read(bytes: &[u8], origin: Option<&Path>, default_spacing: (f64, f64)) -> Result<DecodedImage, MetaImageError>
{
    let (header, data_offset) = parse_header(bytes)?;
    debug!(
        "MetaImage header: dims {:?}, type {:?}, channels {}, compressed {}, data file {}",
        header.dim_size, header.element_type, header.channels, header.compressed, header.data_file
    );

    let detached;
    let data: &[u8] = if header.data_file == LOCAL_DATA_FILE {
        &bytes[data_offset..]
    } else {
        let origin = origin.ok_or_else(|| MetaImageError::DetachedData(header.data_file.clone()))?;
        let path = origin
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(&header.data_file);
        detached = std::fs::read(&path)?;
        skip_detached_header(&detached, &header)?
    };

    let expected = header.slice_bytes()?;
    let raw = if header.compressed {
        // Grows with what the stream actually yields; the header's size is untrusted.
        let mut decompressed = Vec::new();
        ZlibDecoder::new(data)
            .take(expected as u64)
            .read_to_end(&mut decompressed)?;
        decompressed
    } else {
        data.get(..expected).map(|slice| slice.to_vec()).unwrap_or_else(|| data.to_vec())
    };

    if raw.len() < expected
    {
        return Err(MetaImageError::Truncated { expected, found: raw.len() });
    }

    let element_size = header.element_type.size();
    let samples: Vec<f32> = raw
        .chunks_exact(element_size)
        .map(|chunk| header.element_type.read(chunk, header.big_endian))
        .collect();

    // Interleaved channels are averaged down to one intensity.
    let intensities: Vec<f32> = if header.channels == 1 {
        samples
    } else {
        samples
            .chunks_exact(header.channels)
            .map(|pixel| pixel.iter().sum::<f32>() / header.channels as f32)
            .collect()
    };

    let pixels = Array2::from_shape_vec((header.height(), header.width()), intensities)
        .map_err(|e| MetaImageError::InvalidField { field: "DimSize", value: e.to_string() })?;

    let spacing = match &header.element_spacing
    {
        Some(spacing) if spacing.len() >= 2 => (spacing[1], spacing[0]),
        _ => default_spacing,
    };

    Ok(DecodedImage { pixels, spacing })
}

fn skip_detached_header<'a>(data: &'a [u8], header: &MetaHeader) -> Result<&'a [u8], MetaImageError>
{
    Ok(match header.header_size
    {
        Some(-1) if !header.compressed => {
            // The whole volume sits at the end; the first slice starts where the volume does.
            let volume_bytes = header.volume_bytes()?.max(header.slice_bytes()?);
            &data[data.len().saturating_sub(volume_bytes)..]
        },
        Some(skip) if skip > 0 => &data[usize::try_from(skip).unwrap_or(usize::MAX).min(data.len())..],
        _ => data,
    })
}

fn parse_single<T: std::str::FromStr>(fields: &FxHashMap<String, String>, field: &'static str) -> Result<Option<T>, MetaImageError>
{
    match fields.get(field)
    {
        Some(value) => value
            .parse::<T>()
            .map(Some)
            .map_err(|_| MetaImageError::InvalidField { field, value: value.clone() }),
        None => Ok(None),
    }
}

fn parse_list<T: std::str::FromStr>(fields: &FxHashMap<String, String>, field: &'static str) -> Result<Option<Vec<T>>, MetaImageError>
{
    match fields.get(field)
    {
        Some(value) => value
            .split_whitespace()
            .map(|item| item.parse::<T>())
            .collect::<Result<Vec<T>, _>>()
            .map(Some)
            .map_err(|_| MetaImageError::InvalidField { field, value: value.clone() }),
        None => Ok(None),
    }
}

fn parse_bool(fields: &FxHashMap<String, String>, field: &'static str) -> Result<Option<bool>, MetaImageError>
{
    match fields.get(field).map(|v| v.to_ascii_lowercase())
    {
        Some(value) if value == "true" => Ok(Some(true)),
        Some(value) if value == "false" => Ok(Some(false)),
        Some(value) => Err(MetaImageError::InvalidField { field, value }),
        None => Ok(None),
    }
}
