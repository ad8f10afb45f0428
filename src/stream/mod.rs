//! Volume import/export stream format
//!
//! A stream starts with an 8 byte little-endian size in bytes, always a
//! multiple of 1024, followed by the payload. The payload depends on the
//! format:
//!
//! * `raw+size`: exactly `size` bytes of raw image data
//! * `qcow2+size`, `vmdk+size`: the image file until end of stream, `size`
//!   is its virtual size
//! * `tar+size`: a tar archive of a container subvolume
//! * `zfs`: a native `zfs send` stream, without size header

pub mod tcp;

use crate::error::{Error, Result};
use crate::types::VolumeFormat;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{ErrorKind, Read, Write};
use std::str::FromStr;

/// Length of the size header
pub const HEADER_LEN: usize = 8;

/// Write the size header
pub fn write_size_header<W: Write + ?Sized>(out: &mut W, size: u64) -> Result<()> {
    if size % 1024 != 0 {
        return Err(Error::StreamFormat(format!(
            "size {} is not a multiple of 1024",
            size
        )));
    }
    out.write_all(&size.to_le_bytes())?;
    Ok(())
}

/// Read and validate the size header
pub fn read_size_header<R: Read + ?Sized>(input: &mut R) -> Result<u64> {
    let mut buf = [0u8; HEADER_LEN];
    input.read_exact(&mut buf).map_err(|e| {
        if e.kind() == ErrorKind::UnexpectedEof {
            Error::StreamFormat("truncated size header".to_string())
        } else {
            Error::Io(e)
        }
    })?;
    let size = u64::from_le_bytes(buf);
    if size % 1024 != 0 {
        return Err(Error::StreamFormat(format!(
            "import size {} is not a multiple of 1024",
            size
        )));
    }
    Ok(size)
}

/// Wire format of an export stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamFormat {
    #[serde(rename = "raw+size")]
    RawSize,
    #[serde(rename = "qcow2+size")]
    Qcow2Size,
    #[serde(rename = "vmdk+size")]
    VmdkSize,
    #[serde(rename = "tar+size")]
    TarSize,
    #[serde(rename = "zfs")]
    Zfs,
}

impl StreamFormat {
    pub const ALL: [StreamFormat; 5] = [
        StreamFormat::RawSize,
        StreamFormat::Qcow2Size,
        StreamFormat::VmdkSize,
        StreamFormat::TarSize,
        StreamFormat::Zfs,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StreamFormat::RawSize => "raw+size",
            StreamFormat::Qcow2Size => "qcow2+size",
            StreamFormat::VmdkSize => "vmdk+size",
            StreamFormat::TarSize => "tar+size",
            StreamFormat::Zfs => "zfs",
        }
    }

    pub fn has_size_header(&self) -> bool {
        !matches!(self, StreamFormat::Zfs)
    }

    /// Volume format the payload restores to, `None` for native streams
    pub fn data_format(&self) -> Option<VolumeFormat> {
        match self {
            StreamFormat::RawSize => Some(VolumeFormat::Raw),
            StreamFormat::Qcow2Size => Some(VolumeFormat::Qcow2),
            StreamFormat::VmdkSize => Some(VolumeFormat::Vmdk),
            StreamFormat::TarSize => Some(VolumeFormat::Subvol),
            StreamFormat::Zfs => None,
        }
    }

    /// The `+size` format carrying volumes of `format`
    pub fn sized(format: VolumeFormat) -> StreamFormat {
        match format {
            VolumeFormat::Raw => StreamFormat::RawSize,
            VolumeFormat::Qcow2 => StreamFormat::Qcow2Size,
            VolumeFormat::Vmdk => StreamFormat::VmdkSize,
            VolumeFormat::Subvol => StreamFormat::TarSize,
        }
    }
}

impl fmt::Display for StreamFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for StreamFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        StreamFormat::ALL
            .iter()
            .copied()
            .find(|f| f.as_str() == s)
            .ok_or_else(|| Error::StreamFormat(format!("unknown stream format '{}'", s)))
    }
}

/// First export format the importing side accepts
pub fn negotiate(export: &[StreamFormat], import: &[StreamFormat]) -> Option<StreamFormat> {
    export.iter().copied().find(|f| import.contains(f))
}

/// Copy exactly `size` bytes, failing on a short stream
pub fn copy_exact<R, W>(input: &mut R, out: &mut W, size: u64) -> Result<()>
where
    R: Read + ?Sized,
    W: Write + ?Sized,
{
    let copied = std::io::copy(&mut (&mut *input).take(size), out)?;
    if copied != size {
        return Err(Error::StreamFormat(format!(
            "unexpected end of stream after {} of {} bytes",
            copied, size
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_header_round_trip() {
        let mut buf = Vec::new();
        write_size_header(&mut buf, 1024 * 1024).unwrap();
        assert_eq!(buf.len(), HEADER_LEN);
        assert_eq!(buf, (1024u64 * 1024).to_le_bytes());
        assert_eq!(read_size_header(&mut Cursor::new(buf)).unwrap(), 1024 * 1024);
    }

    #[test]
    fn test_header_rejects_non_multiple() {
        let mut buf = Vec::new();
        assert!(write_size_header(&mut buf, 1000).is_err());

        let bytes = 1000u64.to_le_bytes();
        let err = read_size_header(&mut Cursor::new(bytes)).unwrap_err();
        assert!(matches!(err, Error::StreamFormat(_)));
    }

    #[test]
    fn test_header_truncated() {
        let err = read_size_header(&mut Cursor::new(vec![0u8; 5])).unwrap_err();
        assert!(matches!(err, Error::StreamFormat(_)));
    }

    #[test]
    fn test_format_names() {
        for f in StreamFormat::ALL {
            assert_eq!(f.as_str().parse::<StreamFormat>().unwrap(), f);
        }
        assert!("btrfs".parse::<StreamFormat>().is_err());
        assert!(!StreamFormat::Zfs.has_size_header());
        assert_eq!(StreamFormat::TarSize.data_format(), Some(VolumeFormat::Subvol));
    }

    #[test]
    fn test_negotiate_prefers_export_order() {
        let export = [StreamFormat::Zfs, StreamFormat::RawSize];
        assert_eq!(
            negotiate(&export, &[StreamFormat::RawSize, StreamFormat::Zfs]),
            Some(StreamFormat::Zfs)
        );
        assert_eq!(negotiate(&export, &[StreamFormat::RawSize]), Some(StreamFormat::RawSize));
        assert_eq!(negotiate(&export, &[StreamFormat::TarSize]), None);
    }

    #[test]
    fn test_copy_exact_short_stream() {
        let mut out = Vec::new();
        let err = copy_exact(&mut Cursor::new(vec![1u8; 10]), &mut out, 20).unwrap_err();
        assert!(matches!(err, Error::StreamFormat(_)));

        let mut out = Vec::new();
        copy_exact(&mut Cursor::new(vec![1u8; 30]), &mut out, 20).unwrap();
        assert_eq!(out.len(), 20);
    }
}
