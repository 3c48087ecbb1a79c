//! Record buffer layout (§4.C2): `[modification_bitmap | id(8) | version(8) |
//! property_0 | property_1 | ...]`. All multi-byte fields are little-endian.
//! Indirect properties (string/array/reference-array) store an 8-byte
//! *handle*: zero means "absent/default", a positive handle indexes the
//! engine's string/array store, a negative handle (`-(i+1)`) indexes the
//! session-local pool for property `i`.

use byteorder::{ByteOrder, LittleEndian};

use crate::ids::ObjectId;
use crate::schema::{ClassDescriptor, PropertyDescriptor};
use crate::value::{PropertyValue, SimpleKind};

/// Allocates a zeroed buffer sized for `class`.
pub fn alloc_buffer(class: &ClassDescriptor) -> Vec<u8> {
    vec![0u8; class.buffer_size()]
}

pub fn get_id(buffer: &[u8], class: &ClassDescriptor) -> ObjectId {
    let off = class.id_offset();
    ObjectId::from_raw(LittleEndian::read_u64(&buffer[off..off + 8]))
}

pub fn set_id(buffer: &mut [u8], class: &ClassDescriptor, id: ObjectId) {
    let off = class.id_offset();
    LittleEndian::write_u64(&mut buffer[off..off + 8], id.raw());
}

pub fn get_version(buffer: &[u8], class: &ClassDescriptor) -> u64 {
    let off = class.version_offset();
    LittleEndian::read_u64(&buffer[off..off + 8])
}

pub fn set_version(buffer: &mut [u8], class: &ClassDescriptor, version: u64) {
    let off = class.version_offset();
    LittleEndian::write_u64(&mut buffer[off..off + 8], version);
}

/// Is `prop`'s modification bit set?
pub fn bit_set(buffer: &[u8], prop: &PropertyDescriptor) -> bool {
    match prop.bit_index() {
        None => false,
        Some(bit) => {
            let byte = bit / 8;
            let mask = 1u8 << (bit % 8);
            buffer[byte] & mask != 0
        }
    }
}

/// Sets `prop`'s modification bit. No-op for properties that aren't
/// bit-tracked (id, version, inverse-reference views).
pub fn set_bit(buffer: &mut [u8], prop: &PropertyDescriptor) {
    if let Some(bit) = prop.bit_index() {
        let byte = bit / 8;
        let mask = 1u8 << (bit % 8);
        buffer[byte] |= mask;
    }
}

pub fn clear_bitmap(buffer: &mut [u8], class: &ClassDescriptor) {
    for b in &mut buffer[..class.bitmap_bytes] {
        *b = 0;
    }
}

pub fn any_bit_set(buffer: &[u8], class: &ClassDescriptor) -> bool {
    buffer[..class.bitmap_bytes].iter().any(|&b| b != 0)
}

/// Reads a simple (fixed-width) property's value from the buffer.
pub fn read_simple(buffer: &[u8], class: &ClassDescriptor, prop: &PropertyDescriptor) -> PropertyValue {
    let kind = match prop.kind {
        crate::value::PropertyKind::Simple(k) => k,
        _ => panic!("read_simple called on non-simple property {}", prop.name),
    };
    let off = class.absolute_offset(prop);
    match kind {
        SimpleKind::Bool => PropertyValue::Bool(buffer[off] != 0),
        SimpleKind::Byte => PropertyValue::Byte(buffer[off]),
        SimpleKind::Short => PropertyValue::Short(LittleEndian::read_i16(&buffer[off..off + 2])),
        SimpleKind::Int => PropertyValue::Int(LittleEndian::read_i32(&buffer[off..off + 4])),
        SimpleKind::Long => PropertyValue::Long(LittleEndian::read_i64(&buffer[off..off + 8])),
        SimpleKind::Float => PropertyValue::Float(LittleEndian::read_f32(&buffer[off..off + 4])),
        SimpleKind::Double => PropertyValue::Double(LittleEndian::read_f64(&buffer[off..off + 8])),
        SimpleKind::DateTime => PropertyValue::DateTime(LittleEndian::read_i64(&buffer[off..off + 8])),
        SimpleKind::Reference => {
            PropertyValue::Reference(ObjectId::from_raw(LittleEndian::read_u64(&buffer[off..off + 8])))
        }
    }
}

/// Writes a simple property's value into the buffer. Does not touch the
/// modification bitmap; callers set the bit once access has been validated.
pub fn write_simple(buffer: &mut [u8], class: &ClassDescriptor, prop: &PropertyDescriptor, value: &PropertyValue) {
    let off = class.absolute_offset(prop);
    match value {
        PropertyValue::Bool(v) => buffer[off] = *v as u8,
        PropertyValue::Byte(v) => buffer[off] = *v,
        PropertyValue::Short(v) => LittleEndian::write_i16(&mut buffer[off..off + 2], *v),
        PropertyValue::Int(v) => LittleEndian::write_i32(&mut buffer[off..off + 4], *v),
        PropertyValue::Long(v) => LittleEndian::write_i64(&mut buffer[off..off + 8], *v),
        PropertyValue::Float(v) => LittleEndian::write_f32(&mut buffer[off..off + 4], *v),
        PropertyValue::Double(v) => LittleEndian::write_f64(&mut buffer[off..off + 8], *v),
        PropertyValue::DateTime(v) => LittleEndian::write_i64(&mut buffer[off..off + 8], *v),
        PropertyValue::Reference(id) => LittleEndian::write_u64(&mut buffer[off..off + 8], id.raw()),
        other => panic!("write_simple called with non-simple value {:?}", other),
    }
}

/// Reads the 8-byte handle stored for an indirect (string/array/
/// reference-array) property. Interpreting the handle (session pool vs.
/// engine store) is the session's job — see `session::resolve_handle`.
pub fn read_handle(buffer: &[u8], class: &ClassDescriptor, prop: &PropertyDescriptor) -> i64 {
    let off = class.absolute_offset(prop);
    LittleEndian::read_i64(&buffer[off..off + 8])
}

pub fn write_handle(buffer: &mut [u8], class: &ClassDescriptor, prop: &PropertyDescriptor, handle: i64) {
    let off = class.absolute_offset(prop);
    LittleEndian::write_i64(&mut buffer[off..off + 8], handle);
}

/// Encodes a session-local pool index as a negative handle.
pub fn session_handle(index: usize) -> i64 {
    -(index as i64) - 1
}

/// Decodes a negative handle back into a session-local pool index, or
/// `None` if `handle` actually names an engine-store handle (or is the
/// absent/zero sentinel).
pub fn as_session_index(handle: i64) -> Option<usize> {
    if handle < 0 {
        Some((-(handle + 1)) as usize)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ClassDef, ModelBuilder, PropertyDef};
    use crate::value::PropertyValue;

    fn sample_model() -> crate::schema::Model {
        ModelBuilder::new()
            .class(
                ClassDef::new(1, "Station")
                    .property(PropertyDef::simple("elevation", SimpleKind::Int))
                    .property(PropertyDef::string("name")),
            )
            .build()
    }

    #[test]
    fn round_trips_simple_and_bitmap() {
        let model = sample_model();
        let class = model.class(1).unwrap();
        let mut buf = alloc_buffer(class);
        let id = ObjectId::new(1, 42);
        set_id(&mut buf, class, id);
        assert_eq!(get_id(&buf, class), id);

        let prop = class.property_by_name("elevation").unwrap();
        assert!(!bit_set(&buf, prop));
        write_simple(&mut buf, class, prop, &PropertyValue::Int(1200));
        set_bit(&mut buf, prop);
        assert!(bit_set(&buf, prop));
        assert_eq!(read_simple(&buf, class, prop), PropertyValue::Int(1200));
    }

    #[test]
    fn session_handles_round_trip() {
        assert_eq!(as_session_index(session_handle(0)), Some(0));
        assert_eq!(as_session_index(session_handle(7)), Some(7));
        assert_eq!(as_session_index(5), None);
        assert_eq!(as_session_index(0), None);
    }
}
