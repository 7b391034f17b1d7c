//! Binary wire format of the file transport.
//!
//! All integers and floats are little-endian.
//!
//! ```text
//! header:  magic "CSIO" | version u8 | kind u8 (1 = field, 2 = mesh)
//! field:   count u64 | count x f64
//! mesh:    num_nodes u64 | num_nodes x (f64, f64, f64)
//!          num_elements u64 | num_elements x (vtk type u8 | n u32 | n x u64)
//! ```
//!
//! Decoding validates every count against the bytes actually present; trailing bytes are an
//! error.

use std::io::{self, Write};

use crate::data::{ElementType, FieldData, MeshData, Payload};

pub const MAGIC: &[u8; 4] = b"CSIO";
pub const FORMAT_VERSION: u8 = 1;

const KIND_FIELD: u8 = 1;
const KIND_MESH: u8 = 2;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("bad magic bytes {0:?}")]
    BadMagic([u8; 4]),
    #[error("unsupported format version {0}")]
    UnsupportedVersion(u8),
    #[error("unknown payload kind {0}")]
    UnknownKind(u8),
    #[error("unknown element type code {0}")]
    UnknownElementType(u8),
    #[error("truncated: needed {needed} bytes for {what}, {available} left")]
    Truncated {
        what: &'static str,
        needed: usize,
        available: usize,
    },
    #[error("{0} trailing bytes after payload")]
    TrailingBytes(usize),
    #[error("{what} {value} does not fit this platform")]
    Overflow { what: &'static str, value: u64 },
}

/// Encode `payload` into `w`.
pub fn encode(w: &mut impl Write, payload: &Payload) -> io::Result<()> {
    w.write_all(MAGIC)?;
    w.write_all(&[FORMAT_VERSION])?;
    match payload {
        Payload::Field(field) => {
            w.write_all(&[KIND_FIELD])?;
            w.write_all(&(field.len() as u64).to_le_bytes())?;
            for v in field.values() {
                w.write_all(&v.to_le_bytes())?;
            }
        }
        Payload::Mesh(mesh) => {
            w.write_all(&[KIND_MESH])?;
            w.write_all(&(mesh.nodes.len() as u64).to_le_bytes())?;
            for coord in mesh.nodes.iter().flatten() {
                w.write_all(&coord.to_le_bytes())?;
            }
            w.write_all(&(mesh.connectivities.len() as u64).to_le_bytes())?;
            for (element_type, conn) in mesh.elements() {
                w.write_all(&[element_type.vtk_code()])?;
                w.write_all(&node_count(conn.len())?.to_le_bytes())?;
                for &idx in conn {
                    w.write_all(&(idx as u64).to_le_bytes())?;
                }
            }
        }
    }
    Ok(())
}

/// Node count of one element as written on the wire.
fn node_count(len: usize) -> io::Result<u32> {
    u32::try_from(len).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("element with {len} nodes exceeds the wire format"),
        )
    })
}

/// Decode a complete payload from `bytes`.
pub fn decode(bytes: &[u8]) -> Result<Payload, CodecError> {
    let mut r = Reader { bytes };

    let magic = r.array::<4>("magic")?;
    if &magic != MAGIC {
        return Err(CodecError::BadMagic(magic));
    }
    let version = r.u8("version")?;
    if version != FORMAT_VERSION {
        return Err(CodecError::UnsupportedVersion(version));
    }

    let payload = match r.u8("kind")? {
        KIND_FIELD => {
            let count = r.count(8, "field values")?;
            let values = (0..count)
                .map(|_| r.f64("field value"))
                .collect::<Result<Vec<_>, _>>()?;
            Payload::Field(FieldData::new(values))
        }
        KIND_MESH => {
            let num_nodes = r.count(24, "node coordinates")?;
            let nodes = (0..num_nodes)
                .map(|_| -> Result<[f64; 3], CodecError> {
                    Ok([r.f64("x")?, r.f64("y")?, r.f64("z")?])
                })
                .collect::<Result<Vec<_>, _>>()?;

            // every element carries at least a type tag and a node count
            let num_elements = r.count(5, "elements")?;
            let mut connectivities = Vec::with_capacity(num_elements);
            let mut element_types = Vec::with_capacity(num_elements);
            for _ in 0..num_elements {
                let code = r.u8("element type")?;
                let element_type =
                    ElementType::from_vtk(code).ok_or(CodecError::UnknownElementType(code))?;
                let n = r.u32("element node count")?;
                let n = usize::try_from(n).map_err(|_| CodecError::Overflow {
                    what: "element node count",
                    value: n.into(),
                })?;
                r.ensure(n.saturating_mul(8), "connectivity")?;
                let conn = (0..n)
                    .map(|_| {
                        let idx = r.u64("node index")?;
                        usize::try_from(idx).map_err(|_| CodecError::Overflow {
                            what: "node index",
                            value: idx,
                        })
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                element_types.push(element_type);
                connectivities.push(conn);
            }
            Payload::Mesh(MeshData::new(nodes, connectivities, element_types))
        }
        other => return Err(CodecError::UnknownKind(other)),
    };

    if !r.bytes.is_empty() {
        return Err(CodecError::TrailingBytes(r.bytes.len()));
    }
    Ok(payload)
}

struct Reader<'a> {
    bytes: &'a [u8],
}

impl<'a> Reader<'a> {
    fn ensure(&self, needed: usize, what: &'static str) -> Result<(), CodecError> {
        if needed > self.bytes.len() {
            Err(CodecError::Truncated {
                what,
                needed,
                available: self.bytes.len(),
            })
        } else {
            Ok(())
        }
    }

    fn take(&mut self, n: usize, what: &'static str) -> Result<&'a [u8], CodecError> {
        self.ensure(n, what)?;
        let (head, tail) = self.bytes.split_at(n);
        self.bytes = tail;
        Ok(head)
    }

    fn u8(&mut self, what: &'static str) -> Result<u8, CodecError> {
        Ok(self.take(1, what)?[0])
    }

    fn array<const N: usize>(&mut self, what: &'static str) -> Result<[u8; N], CodecError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N, what)?);
        Ok(out)
    }

    fn u32(&mut self, what: &'static str) -> Result<u32, CodecError> {
        self.array(what).map(u32::from_le_bytes)
    }

    fn u64(&mut self, what: &'static str) -> Result<u64, CodecError> {
        self.array(what).map(u64::from_le_bytes)
    }

    fn f64(&mut self, what: &'static str) -> Result<f64, CodecError> {
        self.array(what).map(f64::from_le_bytes)
    }

    /// Read a u64 count and check that `count * item_size` bytes could follow, so a corrupt
    /// header never drives a huge allocation.
    fn count(&mut self, item_size: usize, what: &'static str) -> Result<usize, CodecError> {
        let count = self.u64(what)?;
        let count = usize::try_from(count).unwrap_or(usize::MAX);
        self.ensure(count.saturating_mul(item_size), what)?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_to_vec(payload: &Payload) -> Vec<u8> {
        let mut buf = Vec::new();
        encode(&mut buf, payload).unwrap();
        buf
    }

    fn mesh() -> MeshData {
        MeshData::new(
            vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.5]],
            vec![vec![0, 1, 2], vec![1, 2]],
            vec![ElementType::Triangle, ElementType::Line],
        )
    }

    #[test]
    fn test_field_layout() {
        let bytes = encode_to_vec(&Payload::Field(FieldData::new(vec![1.5, -2.0])));
        assert_eq!(&bytes[..4], MAGIC);
        assert_eq!(bytes[4], FORMAT_VERSION);
        assert_eq!(bytes[5], KIND_FIELD);
        assert_eq!(u64::from_le_bytes(bytes[6..14].try_into().unwrap()), 2);
        assert_eq!(bytes.len(), 14 + 16);
    }

    #[test]
    fn test_mesh_decodes_identically() {
        let payload = Payload::Mesh(mesh());
        assert_eq!(decode(&encode_to_vec(&payload)).unwrap(), payload);
    }

    #[test]
    fn test_truncated_field() {
        let bytes = encode_to_vec(&Payload::Field(FieldData::new(vec![1.0, 2.0, 3.0])));
        let err = decode(&bytes[..bytes.len() - 3]).unwrap_err();
        assert!(matches!(err, CodecError::Truncated { .. }), "{err}");
    }

    #[test]
    fn test_oversized_count_is_rejected_before_allocating() {
        let mut bytes = encode_to_vec(&Payload::Field(FieldData::new(vec![1.0])));
        bytes[6..14].copy_from_slice(&u64::MAX.to_le_bytes());
        assert!(matches!(
            decode(&bytes),
            Err(CodecError::Truncated { what: "field values", .. })
        ));
    }

    #[test]
    fn test_trailing_bytes() {
        let mut bytes = encode_to_vec(&Payload::Field(FieldData::new(vec![1.0])));
        bytes.push(0);
        assert_eq!(decode(&bytes), Err(CodecError::TrailingBytes(1)));
    }

    #[test]
    fn test_unknown_element_type() {
        let mut bytes = encode_to_vec(&Payload::Mesh(mesh()));
        // first element tag sits right after the node block and the element count
        let offset = 6 + 8 + 3 * 24 + 8;
        assert_eq!(bytes[offset], ElementType::Triangle.vtk_code());
        bytes[offset] = 2;
        assert_eq!(decode(&bytes), Err(CodecError::UnknownElementType(2)));
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn test_element_node_count_must_fit_the_wire() {
        assert_eq!(node_count(3).unwrap(), 3);
        let err = node_count(u32::MAX as usize + 1).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[cfg(target_pointer_width = "32")]
    #[test]
    fn test_node_index_must_fit_the_platform() {
        let mut bytes = encode_to_vec(&Payload::Mesh(mesh()));
        // first node index of the first element
        let offset = 6 + 8 + 3 * 24 + 8 + 1 + 4;
        bytes[offset..offset + 8].copy_from_slice(&u64::MAX.to_le_bytes());
        assert_eq!(
            decode(&bytes),
            Err(CodecError::Overflow {
                what: "node index",
                value: u64::MAX
            })
        );
    }

    #[test]
    fn test_bad_header() {
        assert!(matches!(
            decode(b"CSIX\x01\x01"),
            Err(CodecError::BadMagic(_))
        ));
        assert_eq!(decode(b"CSIO\x07\x01"), Err(CodecError::UnsupportedVersion(7)));
        assert_eq!(decode(b"CSIO\x01\x09"), Err(CodecError::UnknownKind(9)));
    }
}
