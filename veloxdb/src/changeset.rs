//! The changeset wire format (§6 "Changeset block format"): the one
//! bit-exact contract the object model and the storage engine must agree
//! on. Grounded on the teacher crate's `codec::bytes_codec` — a `BytesMut`
//! writer paired with a `Cursor` + `byteorder` reader — but the layout here
//! is fixed by the spec rather than carrying arbitrary `serde` payloads.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use bytes::{BufMut, BytesMut};
use std::io::{Cursor, Read};

use crate::engine::Changeset;
use crate::error::{Error, Result};
use crate::ids::{ClassId, ObjectId, PropertyId};
use crate::value::{ArrayElementKind, ArrayValue, PropertyValue};

const TAG_INSERT: u8 = 1;
const TAG_UPDATE: u8 = 2;
const TAG_DELETE: u8 = 3;
const TAG_END: u8 = 0xFF;
const ROW_MARKER: u8 = 0xFE;

/// Builds a [`Changeset`] block by block. One insert/update/delete block is
/// emitted per touched object (§4.C6 `ApplyChanges` step 2), which keeps
/// each block's property-id header exactly describing that one row.
pub struct ChangesetWriter {
    buf: BytesMut,
}

impl ChangesetWriter {
    pub fn new() -> Self {
        ChangesetWriter { buf: BytesMut::with_capacity(256) }
    }

    pub fn insert_block(&mut self, class_id: ClassId, id: ObjectId, prop_ids: &[PropertyId], values: &[PropertyValue]) {
        self.buf.put_u8(TAG_INSERT);
        self.buf.put_u16_le(class_id);
        self.buf.put_u16_le(prop_ids.len() as u16);
        for p in prop_ids {
            self.buf.put_u16_le(*p);
        }
        self.buf.put_u64_le(0); // prev_version_placeholder
        self.buf.put_u64_le(id.raw());
        for v in values {
            write_value(&mut self.buf, v);
        }
        self.buf.put_u8(ROW_MARKER);
    }

    pub fn update_block(&mut self, class_id: ClassId, id: ObjectId, prop_ids: &[PropertyId], values: &[PropertyValue]) {
        self.buf.put_u8(TAG_UPDATE);
        self.buf.put_u16_le(class_id);
        self.buf.put_u16_le(prop_ids.len() as u16);
        for p in prop_ids {
            self.buf.put_u16_le(*p);
        }
        self.buf.put_u64_le(0); // prev_version_placeholder
        self.buf.put_u64_le(id.raw());
        for v in values {
            write_value(&mut self.buf, v);
        }
        self.buf.put_u8(ROW_MARKER);
    }

    pub fn delete_block(&mut self, class_id: ClassId, id: ObjectId) {
        self.buf.put_u8(TAG_DELETE);
        self.buf.put_u16_le(class_id);
        self.buf.put_u64_le(id.raw());
        self.buf.put_u8(ROW_MARKER);
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn finish(mut self) -> Changeset {
        self.buf.put_u8(TAG_END);
        Changeset { bytes: self.buf.to_vec() }
    }
}

impl Default for ChangesetWriter {
    fn default() -> Self {
        Self::new()
    }
}

fn write_value(buf: &mut BytesMut, value: &PropertyValue) {
    match value {
        PropertyValue::Bool(v) => buf.put_u8(*v as u8),
        PropertyValue::Byte(v) => buf.put_u8(*v),
        PropertyValue::Short(v) => buf.put_i16_le(*v),
        PropertyValue::Int(v) => buf.put_i32_le(*v),
        PropertyValue::Long(v) => buf.put_i64_le(*v),
        PropertyValue::Float(v) => buf.put_f32_le(*v),
        PropertyValue::Double(v) => buf.put_f64_le(*v),
        PropertyValue::DateTime(v) => buf.put_i64_le(*v),
        PropertyValue::Reference(id) => buf.put_u64_le(id.raw()),
        PropertyValue::String(s) => {
            buf.put_u32_le(s.len() as u32);
            buf.put_slice(s.as_bytes());
        }
        PropertyValue::ReferenceArray(ids) => {
            buf.put_u32_le(ids.len() as u32);
            for id in ids {
                buf.put_u64_le(id.raw());
            }
        }
        PropertyValue::Array(arr) => write_array(buf, arr),
    }
}

fn write_array(buf: &mut BytesMut, arr: &ArrayValue) {
    buf.put_u32_le(arr.len() as u32);
    match arr {
        ArrayValue::Bool(v) => v.iter().for_each(|x| buf.put_u8(*x as u8)),
        ArrayValue::Byte(v) => buf.put_slice(v),
        ArrayValue::Short(v) => v.iter().for_each(|x| buf.put_i16_le(*x)),
        ArrayValue::Int(v) => v.iter().for_each(|x| buf.put_i32_le(*x)),
        ArrayValue::Long(v) => v.iter().for_each(|x| buf.put_i64_le(*x)),
        ArrayValue::Float(v) => v.iter().for_each(|x| buf.put_f32_le(*x)),
        ArrayValue::Double(v) => v.iter().for_each(|x| buf.put_f64_le(*x)),
        ArrayValue::DateTime(v) => v.iter().for_each(|x| buf.put_i64_le(*x)),
        ArrayValue::String(v) => {
            for s in v {
                buf.put_u32_le(s.len() as u32);
                buf.put_slice(s.as_bytes());
            }
        }
    }
}

/// One decoded block, used by `mock_engine` to apply a changeset.
pub enum Block {
    Insert { class_id: ClassId, id: ObjectId, prop_ids: Vec<PropertyId>, values: Vec<PropertyValue> },
    Update { class_id: ClassId, id: ObjectId, prop_ids: Vec<PropertyId>, values: Vec<PropertyValue> },
    Delete { class_id: ClassId, id: ObjectId },
}

/// Decodes a changeset into its blocks. `value_kind` tells the reader the
/// declared kind of the Nth property id in a block's header, since the wire
/// format carries no type tags of its own (the engine is expected to know
/// its own schema, same as the object model does).
pub fn decode<'a, F>(changeset: &'a Changeset, mut value_kind: F) -> Result<Vec<Block>>
where
    F: FnMut(ClassId, PropertyId) -> Option<crate::value::PropertyKind>,
{
    let mut cursor = Cursor::new(changeset.bytes.as_slice());
    let mut blocks = Vec::new();
    loop {
        let tag = read_u8(&mut cursor)?;
        match tag {
            TAG_END => break,
            TAG_INSERT | TAG_UPDATE => {
                let class_id = read_u16(&mut cursor)?;
                let prop_count = read_u16(&mut cursor)?;
                let mut prop_ids = Vec::with_capacity(prop_count as usize);
                for _ in 0..prop_count {
                    prop_ids.push(read_u16(&mut cursor)?);
                }
                let _prev_version_placeholder = read_u64(&mut cursor)?;
                let id = ObjectId::from_raw(read_u64(&mut cursor)?);
                let mut values = Vec::with_capacity(prop_ids.len());
                for prop_id in &prop_ids {
                    let kind = value_kind(class_id, *prop_id)
                        .ok_or_else(|| Error::EngineError(Box::new(std::io::Error::new(
                            std::io::ErrorKind::InvalidData,
                            format!("unknown property {prop_id} on class {class_id} in changeset"),
                        ))))?;
                    values.push(read_value(&mut cursor, kind)?);
                }
                expect_row_marker(&mut cursor)?;
                if tag == TAG_INSERT {
                    blocks.push(Block::Insert { class_id, id, prop_ids, values });
                } else {
                    blocks.push(Block::Update { class_id, id, prop_ids, values });
                }
            }
            TAG_DELETE => {
                let class_id = read_u16(&mut cursor)?;
                let id = ObjectId::from_raw(read_u64(&mut cursor)?);
                expect_row_marker(&mut cursor)?;
                blocks.push(Block::Delete { class_id, id });
            }
            other => {
                return Err(Error::EngineError(Box::new(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("unknown changeset block tag {other}"),
                ))));
            }
        }
    }
    Ok(blocks)
}

fn read_value(cursor: &mut Cursor<&[u8]>, kind: crate::value::PropertyKind) -> Result<PropertyValue> {
    use crate::value::{IndirectKind, PropertyKind, SimpleKind};
    let value = match kind {
        PropertyKind::Simple(SimpleKind::Bool) => PropertyValue::Bool(read_u8(cursor)? != 0),
        PropertyKind::Simple(SimpleKind::Byte) => PropertyValue::Byte(read_u8(cursor)?),
        PropertyKind::Simple(SimpleKind::Short) => PropertyValue::Short(cursor.read_i16::<LittleEndian>().map_err(io_err)?),
        PropertyKind::Simple(SimpleKind::Int) => PropertyValue::Int(cursor.read_i32::<LittleEndian>().map_err(io_err)?),
        PropertyKind::Simple(SimpleKind::Long) => PropertyValue::Long(cursor.read_i64::<LittleEndian>().map_err(io_err)?),
        PropertyKind::Simple(SimpleKind::Float) => PropertyValue::Float(cursor.read_f32::<LittleEndian>().map_err(io_err)?),
        PropertyKind::Simple(SimpleKind::Double) => PropertyValue::Double(cursor.read_f64::<LittleEndian>().map_err(io_err)?),
        PropertyKind::Simple(SimpleKind::DateTime) => PropertyValue::DateTime(cursor.read_i64::<LittleEndian>().map_err(io_err)?),
        PropertyKind::Simple(SimpleKind::Reference) => PropertyValue::Reference(ObjectId::from_raw(read_u64(cursor)?)),
        PropertyKind::Indirect(IndirectKind::String) => PropertyValue::String(read_string(cursor)?),
        PropertyKind::Indirect(IndirectKind::ReferenceArray) => {
            let count = read_u32(cursor)?;
            let mut ids = Vec::with_capacity(count as usize);
            for _ in 0..count {
                ids.push(ObjectId::from_raw(read_u64(cursor)?));
            }
            PropertyValue::ReferenceArray(ids)
        }
        PropertyKind::Indirect(IndirectKind::Array(element)) => PropertyValue::Array(read_array(cursor, element)?),
        PropertyKind::InverseReferenceSet => {
            return Err(Error::EngineError(Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "inverse-reference views are never stored in a changeset",
            ))));
        }
    };
    Ok(value)
}

fn read_array(cursor: &mut Cursor<&[u8]>, element: ArrayElementKind) -> Result<ArrayValue> {
    let count = read_u32(cursor)? as usize;
    let value = match element {
        ArrayElementKind::Bool => ArrayValue::Bool((0..count).map(|_| read_u8(cursor).map(|b| b != 0)).collect::<Result<_>>()?),
        ArrayElementKind::Byte => {
            let mut v = vec![0u8; count];
            cursor.read_exact(&mut v).map_err(io_err)?;
            ArrayValue::Byte(v)
        }
        ArrayElementKind::Short => ArrayValue::Short((0..count).map(|_| cursor.read_i16::<LittleEndian>().map_err(io_err)).collect::<Result<_>>()?),
        ArrayElementKind::Int => ArrayValue::Int((0..count).map(|_| cursor.read_i32::<LittleEndian>().map_err(io_err)).collect::<Result<_>>()?),
        ArrayElementKind::Long => ArrayValue::Long((0..count).map(|_| cursor.read_i64::<LittleEndian>().map_err(io_err)).collect::<Result<_>>()?),
        ArrayElementKind::Float => ArrayValue::Float((0..count).map(|_| cursor.read_f32::<LittleEndian>().map_err(io_err)).collect::<Result<_>>()?),
        ArrayElementKind::Double => ArrayValue::Double((0..count).map(|_| cursor.read_f64::<LittleEndian>().map_err(io_err)).collect::<Result<_>>()?),
        ArrayElementKind::DateTime => ArrayValue::DateTime((0..count).map(|_| cursor.read_i64::<LittleEndian>().map_err(io_err)).collect::<Result<_>>()?),
        ArrayElementKind::String => {
            let mut v = Vec::with_capacity(count);
            for _ in 0..count {
                v.push(read_string(cursor)?);
            }
            ArrayValue::String(v)
        }
    };
    Ok(value)
}

fn read_string(cursor: &mut Cursor<&[u8]>) -> Result<String> {
    let len = read_u32(cursor)? as usize;
    let mut bytes = vec![0u8; len];
    cursor.read_exact(&mut bytes).map_err(io_err)?;
    String::from_utf8(bytes).map_err(|e| Error::EngineError(Box::new(e)))
}

fn expect_row_marker(cursor: &mut Cursor<&[u8]>) -> Result<()> {
    let marker = read_u8(cursor)?;
    if marker != ROW_MARKER {
        return Err(Error::EngineError(Box::new(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "missing last_value_written row marker",
        ))));
    }
    Ok(())
}

fn io_err(e: std::io::Error) -> Error {
    Error::EngineError(Box::new(e))
}

fn read_u8(c: &mut Cursor<&[u8]>) -> Result<u8> {
    c.read_u8().map_err(io_err)
}
fn read_u16(c: &mut Cursor<&[u8]>) -> Result<u16> {
    c.read_u16::<LittleEndian>().map_err(io_err)
}
fn read_u32(c: &mut Cursor<&[u8]>) -> Result<u32> {
    c.read_u32::<LittleEndian>().map_err(io_err)
}
fn read_u64(c: &mut Cursor<&[u8]>) -> Result<u64> {
    c.read_u64::<LittleEndian>().map_err(io_err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{PropertyKind, SimpleKind};

    #[test]
    fn round_trips_insert_and_delete() {
        let mut w = ChangesetWriter::new();
        let id = ObjectId::new(3, 1);
        w.insert_block(3, id, &[2, 3], &[PropertyValue::Int(7), PropertyValue::String("nyc".into())]);
        w.delete_block(3, ObjectId::new(3, 2));
        let cs = w.finish();

        let blocks = decode(&cs, |_class, prop| {
            Some(if prop == 2 {
                PropertyKind::Simple(SimpleKind::Int)
            } else {
                PropertyKind::Indirect(crate::value::IndirectKind::String)
            })
        })
        .unwrap();
        assert_eq!(blocks.len(), 2);
        match &blocks[0] {
            Block::Insert { id: got, values, .. } => {
                assert_eq!(*got, id);
                assert_eq!(values[0], PropertyValue::Int(7));
                assert_eq!(values[1], PropertyValue::String("nyc".into()));
            }
            _ => panic!("expected insert"),
        }
        match &blocks[1] {
            Block::Delete { id, .. } => assert_eq!(*id, ObjectId::new(3, 2)),
            _ => panic!("expected delete"),
        }
    }
}
