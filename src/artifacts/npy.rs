//! Minimal reader/writer for 1-D NPY string arrays.
//!
//! `ndarray-npy` handles the numeric arrays but has no element type for
//! NumPy's fixed-width `<U` / `|S` strings, which is how image path lists
//! and string identity codes are saved.

use std::io::{self, Read, Write};

const MAGIC: &[u8; 6] = b"\x93NUMPY";
const HEADER_ALIGN: usize = 64;
/// Upper bound on the bytes of one element; longer strings mean a corrupt header.
const MAX_ELEMENT_BYTES: usize = 1 << 20;
/// Elements reserved up front; longer arrays grow as they are read.
const MAX_PREALLOC: usize = 1 << 16;

#[derive(Debug, thiserror::Error)]
pub enum NpyStrError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("not an NPY file (bad magic)")]
    BadMagic,

    #[error("unsupported NPY format version {0}.{1}")]
    UnsupportedVersion(u8, u8),

    #[error("malformed NPY header: {0}")]
    Header(String),

    #[error("object arrays (pickled, dtype |O) are not supported; save paths as a fixed-width string array")]
    ObjectArray,

    #[error("unsupported dtype {0:?} for a string array")]
    UnsupportedDtype(String),

    #[error("expected a 1-D array, got shape {0:?}")]
    NotOneDimensional(Vec<usize>),

    #[error("invalid UTF-32 code point {0:#x}")]
    InvalidCodePoint(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StrKind {
    Unicode { little_endian: bool },
    Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Header {
    kind: StrKind,
    /// Characters per element for unicode, bytes per element for byte strings.
    width: usize,
    shape: Vec<usize>,
}

/// Reads a 1-D `<U*` or `|S*` array. Trailing NULs of each element are dropped.
pub fn read_string_npy<R: Read>(mut reader: R) -> Result<Vec<String>, NpyStrError> {
    let header = read_header(&mut reader)?;
    let &[len] = header.shape.as_slice() else {
        return Err(NpyStrError::NotOneDimensional(header.shape.clone()));
    };

    let unit = match header.kind {
        StrKind::Unicode { .. } => 4,
        StrKind::Bytes => 1,
    };
    let stride = header
        .width
        .checked_mul(unit)
        .filter(|&n| n <= MAX_ELEMENT_BYTES)
        .ok_or_else(|| NpyStrError::Header(format!("element width {} too large", header.width)))?;
    let mut buf = vec![0u8; stride];
    let mut out = Vec::with_capacity(len.min(MAX_PREALLOC));

    for _ in 0..len {
        reader.read_exact(&mut buf)?;
        let s = match header.kind {
            StrKind::Unicode { little_endian } => decode_utf32(&buf, little_endian)?,
            StrKind::Bytes => {
                let end = buf.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
                String::from_utf8_lossy(&buf[..end]).into_owned()
            }
        };
        out.push(s);
    }

    Ok(out)
}

fn decode_utf32(buf: &[u8], little_endian: bool) -> Result<String, NpyStrError> {
    let mut s = String::new();
    for chunk in buf.chunks_exact(4) {
        let bytes = [chunk[0], chunk[1], chunk[2], chunk[3]];
        let cp = if little_endian {
            u32::from_le_bytes(bytes)
        } else {
            u32::from_be_bytes(bytes)
        };
        if cp == 0 {
            break;
        }
        s.push(char::from_u32(cp).ok_or(NpyStrError::InvalidCodePoint(cp))?);
    }
    Ok(s)
}

fn read_header<R: Read>(reader: &mut R) -> Result<Header, NpyStrError> {
    let mut magic = [0u8; 6];
    reader.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(NpyStrError::BadMagic);
    }

    let mut version = [0u8; 2];
    reader.read_exact(&mut version)?;

    // Header length field: 2 bytes in v1, 4 bytes in v2/v3
    let header_len = match version[0] {
        1 => {
            let mut b = [0u8; 2];
            reader.read_exact(&mut b)?;
            u16::from_le_bytes(b) as usize
        }
        2 | 3 => {
            let mut b = [0u8; 4];
            reader.read_exact(&mut b)?;
            u32::from_le_bytes(b) as usize
        }
        _ => return Err(NpyStrError::UnsupportedVersion(version[0], version[1])),
    };

    let mut raw = vec![0u8; header_len];
    reader.read_exact(&mut raw)?;
    let text = String::from_utf8_lossy(&raw);
    parse_header(&text)
}

fn dict_value<'a>(header: &'a str, key: &str) -> Result<&'a str, NpyStrError> {
    let needle = format!("'{key}':");
    let start = header
        .find(&needle)
        .ok_or_else(|| NpyStrError::Header(format!("missing key {key:?}")))?;
    Ok(header[start + needle.len()..].trim_start())
}

fn parse_header(header: &str) -> Result<Header, NpyStrError> {
    // Example: "{'descr': '<U12', 'fortran_order': False, 'shape': (5,), }"
    let descr_rest = dict_value(header, "descr")?;
    let descr = descr_rest
        .strip_prefix('\'')
        .and_then(|s| s.split('\'').next())
        .ok_or_else(|| NpyStrError::Header("descr is not a quoted string".to_string()))?;
    let (kind, width) = parse_descr(descr)?;

    let shape_rest = dict_value(header, "shape")?;
    let inner = shape_rest
        .strip_prefix('(')
        .and_then(|s| s.split(')').next())
        .ok_or_else(|| NpyStrError::Header("shape is not a tuple".to_string()))?;
    let shape = inner
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.trim_end_matches('L')
                .parse::<usize>()
                .map_err(|e| NpyStrError::Header(format!("bad shape entry {s:?}: {e}")))
        })
        .collect::<Result<Vec<usize>, _>>()?;

    Ok(Header { kind, width, shape })
}

fn parse_descr(descr: &str) -> Result<(StrKind, usize), NpyStrError> {
    let unsupported = || NpyStrError::UnsupportedDtype(descr.to_string());
    let mut chars = descr.chars();
    let (order, code) = match (chars.next(), chars.next()) {
        (Some(o @ ('<' | '>' | '|' | '=')), Some(c)) => (o, c),
        _ => return Err(unsupported()),
    };
    let width: usize = chars.as_str().parse().map_err(|_| {
        if code == 'O' {
            NpyStrError::ObjectArray
        } else {
            unsupported()
        }
    })?;

    let kind = match code {
        'U' => StrKind::Unicode {
            little_endian: order != '>',
        },
        'S' | 'a' => StrKind::Bytes,
        _ => return Err(unsupported()),
    };
    Ok((kind, width))
}

/// Writes `items` as a version 1.0 `<U*` array, the layout `numpy.save` uses
/// for a list of Python strings.
pub fn write_string_npy<W: Write>(mut writer: W, items: &[String]) -> io::Result<()> {
    let width = items
        .iter()
        .map(|s| s.chars().count())
        .max()
        .unwrap_or(0)
        .max(1);

    let mut header = format!(
        "{{'descr': '<U{width}', 'fortran_order': False, 'shape': ({},), }}",
        items.len()
    );
    // magic + version + u16 length + header + '\n' must be a multiple of HEADER_ALIGN
    let preamble = MAGIC.len() + 2 + 2;
    let unpadded = preamble + header.len() + 1;
    let padding = (HEADER_ALIGN - unpadded % HEADER_ALIGN) % HEADER_ALIGN;
    header.extend(std::iter::repeat_n(' ', padding));
    header.push('\n');

    let header_len = u16::try_from(header.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "NPY header too long"))?;

    writer.write_all(MAGIC)?;
    writer.write_all(&[1, 0])?;
    writer.write_all(&header_len.to_le_bytes())?;
    writer.write_all(header.as_bytes())?;

    for item in items {
        let mut n = 0;
        for ch in item.chars() {
            writer.write_all(&(ch as u32).to_le_bytes())?;
            n += 1;
        }
        for _ in n..width {
            writer.write_all(&0u32.to_le_bytes())?;
        }
    }
    writer.flush()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn unicode_array_survives_write_and_read() {
        let items = strings(&["data/q/0002_c002_1.jpg", "g/ä.jpg", ""]);
        let mut buf = Vec::new();
        write_string_npy(&mut buf, &items).expect("write");
        assert_eq!(&buf[..6], MAGIC);
        assert_eq!((buf.len() - (items.len() * 22 * 4)) % HEADER_ALIGN, 0);

        let back = read_string_npy(buf.as_slice()).expect("read");
        assert_eq!(back, items);
    }

    #[test]
    fn reads_byte_string_arrays() {
        let buf = raw_npy(
            "{'descr': '|S4', 'fortran_order': False, 'shape': (2,), }",
            b"ab\0\0abcd",
        );

        let back = read_string_npy(buf.as_slice()).expect("read");
        assert_eq!(back, strings(&["ab", "abcd"]));
    }

    #[test]
    fn object_arrays_are_rejected() {
        let err = parse_header("{'descr': '|O', 'fortran_order': False, 'shape': (3,), }")
            .expect_err("object dtype");
        assert!(matches!(err, NpyStrError::ObjectArray));
    }

    #[test]
    fn numeric_dtype_is_rejected() {
        let err = parse_header("{'descr': '<f8', 'fortran_order': False, 'shape': (3,), }")
            .expect_err("float dtype");
        assert!(matches!(err, NpyStrError::UnsupportedDtype(_)));
    }

    #[test]
    fn header_shape_parses_multi_dim() {
        let h = parse_header("{'descr': '>U3', 'fortran_order': False, 'shape': (2, 5), }")
            .expect("header");
        assert_eq!(h.shape, vec![2, 5]);
        assert_eq!(h.width, 3);
        assert_eq!(h.kind, StrKind::Unicode { little_endian: false });
    }

    fn raw_npy(header: &str, body: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(MAGIC);
        buf.extend_from_slice(&[1, 0]);
        buf.extend_from_slice(&(header.len() as u16).to_le_bytes());
        buf.extend_from_slice(header.as_bytes());
        buf.extend_from_slice(body);
        buf
    }

    #[test]
    fn huge_shape_fails_on_missing_data() {
        let buf = raw_npy(
            "{'descr': '<U2', 'fortran_order': False, 'shape': (18446744073709551615,), }",
            &[b'a', 0, 0, 0, 0, 0, 0, 0],
        );
        let err = read_string_npy(buf.as_slice()).expect_err("truncated data");
        assert!(matches!(err, NpyStrError::Io(_)), "{err}");
    }

    #[test]
    fn huge_element_width_is_a_header_error() {
        for descr in ["<U18446744073709551615", "<U4611686018427387904", "|S4294967296"] {
            let header = format!("{{'descr': '{descr}', 'fortran_order': False, 'shape': (1,), }}");
            let err = read_string_npy(raw_npy(&header, b"").as_slice()).expect_err(descr);
            assert!(matches!(err, NpyStrError::Header(_)), "{descr}: {err}");
        }
    }

    #[test]
    fn bad_magic_is_reported() {
        let err = read_string_npy(&b"PK\x03\x04xxxxxxxx"[..]).expect_err("magic");
        assert!(matches!(err, NpyStrError::BadMagic));
    }
}
