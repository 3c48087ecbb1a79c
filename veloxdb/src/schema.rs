//! Class metadata (§4.C3). Rather than emitting per-class getters/setters at
//! build time, the model compiles a [`ClassDescriptor`] once per class and an
//! interpreter (`object.rs`) walks its property table on every access — the
//! "(b)" option from §9's Design Notes. Offsets are computed once, here, so
//! the interpreter never recomputes them.

use std::collections::HashMap;
use std::sync::Arc;

use crate::ids::{ClassId, PropertyId};
use crate::value::{DeleteAction, PropertyKind};

/// A property as declared by the application, before offsets are assigned.
#[derive(Clone, Debug)]
pub struct PropertyDef {
    pub name: &'static str,
    pub kind: PropertyKind,
    /// Only meaningful for `Reference`, `ReferenceArray` and
    /// `InverseReferenceSet` properties.
    pub delete_action: Option<DeleteAction>,
    /// Whether mutations to this reference property should be recorded in
    /// the delta store (§4.C5) so the *other* side's inverse-reference set
    /// observes them without an engine round trip.
    pub track_inverse: bool,
    /// The class a reference/reference-array/inverse-set property points at.
    pub target_class: Option<ClassId>,
}

impl PropertyDef {
    pub fn simple(name: &'static str, kind: crate::value::SimpleKind) -> Self {
        PropertyDef {
            name,
            kind: PropertyKind::Simple(kind),
            delete_action: None,
            track_inverse: false,
            target_class: None,
        }
    }

    pub fn string(name: &'static str) -> Self {
        PropertyDef {
            name,
            kind: PropertyKind::Indirect(crate::value::IndirectKind::String),
            delete_action: None,
            track_inverse: false,
            target_class: None,
        }
    }

    pub fn array(name: &'static str, element: crate::value::ArrayElementKind) -> Self {
        PropertyDef {
            name,
            kind: PropertyKind::Indirect(crate::value::IndirectKind::Array(element)),
            delete_action: None,
            track_inverse: false,
            target_class: None,
        }
    }

    pub fn reference(
        name: &'static str,
        target_class: ClassId,
        delete_action: DeleteAction,
        track_inverse: bool,
    ) -> Self {
        PropertyDef {
            name,
            kind: PropertyKind::Simple(crate::value::SimpleKind::Reference),
            delete_action: Some(delete_action),
            track_inverse,
            target_class: Some(target_class),
        }
    }

    pub fn reference_array(
        name: &'static str,
        target_class: ClassId,
        delete_action: DeleteAction,
        track_inverse: bool,
    ) -> Self {
        PropertyDef {
            name,
            kind: PropertyKind::Indirect(crate::value::IndirectKind::ReferenceArray),
            delete_action: Some(delete_action),
            track_inverse,
            target_class: Some(target_class),
        }
    }

    /// A lazily materialised view of who references `target_class` via
    /// `inverse_of` (itself a tracked reference or reference-array property
    /// on `target_class`). Consumes no buffer space.
    pub fn inverse_reference_set(name: &'static str, target_class: ClassId) -> Self {
        PropertyDef {
            name,
            kind: PropertyKind::InverseReferenceSet,
            delete_action: None,
            track_inverse: false,
            target_class: Some(target_class),
        }
    }
}

/// A property after offset assignment: everything the interpreter needs to
/// read or write the slot directly.
#[derive(Clone, Debug)]
pub struct PropertyDescriptor {
    pub id: PropertyId,
    pub name: &'static str,
    pub kind: PropertyKind,
    /// Byte offset from the start of the record buffer's property region
    /// (i.e. past the bitmap, id and version slots). Unused for
    /// `InverseReferenceSet`.
    pub offset: usize,
    pub delete_action: Option<DeleteAction>,
    pub track_inverse: bool,
    pub target_class: Option<ClassId>,
}

impl PropertyDescriptor {
    /// Inline width of this property's slot in the record buffer. Zero for
    /// `InverseReferenceSet`, which is never stored.
    pub fn width(&self) -> usize {
        match self.kind {
            PropertyKind::Simple(s) => s.width(),
            // string / array / reference-array slots all hold an 8-byte handle.
            PropertyKind::Indirect(_) => 8,
            PropertyKind::InverseReferenceSet => 0,
        }
    }

    /// Bit index this property occupies in the modification bitmap, or
    /// `None` for the never-tracked id/version slots and the unstored
    /// inverse-reference view (§4.C2).
    pub fn bit_index(&self) -> Option<usize> {
        if matches!(self.kind, PropertyKind::InverseReferenceSet) {
            None
        } else {
            Some((self.id as usize).checked_sub(2)?)
        }
    }
}

/// Compiled, offset-resolved metadata for one concrete (or abstract) class.
pub struct ClassDescriptor {
    pub id: ClassId,
    pub name: &'static str,
    pub is_abstract: bool,
    pub is_sealed: bool,
    pub parent: Option<ClassId>,
    /// Simple properties first (ascending by name), then indirect
    /// (ascending by name), then inverse-reference views. Ids are assigned
    /// 2.. in this order.
    pub properties: Vec<PropertyDescriptor>,
    /// Offset where the first indirect property begins; everything before
    /// it (id, version, simple properties) can be copied in one bounds
    /// check (§4.C2's "simple prefix").
    pub simple_prefix_size: usize,
    /// Total size of the property region (simple prefix + indirect slots).
    pub record_size: usize,
    /// Bytes of leading modification bitmap.
    pub bitmap_bytes: usize,
}

impl ClassDescriptor {
    pub fn property(&self, id: PropertyId) -> Option<&PropertyDescriptor> {
        self.properties.iter().find(|p| p.id == id)
    }

    pub fn property_by_name(&self, name: &str) -> Option<&PropertyDescriptor> {
        self.properties.iter().find(|p| p.name == name)
    }

    /// Byte offset from the start of the whole buffer (bitmap included).
    pub fn absolute_offset(&self, prop: &PropertyDescriptor) -> usize {
        self.bitmap_bytes + 16 + prop.offset
    }

    pub fn id_offset(&self) -> usize {
        self.bitmap_bytes
    }

    pub fn version_offset(&self) -> usize {
        self.bitmap_bytes + 8
    }

    /// Total buffer size: bitmap + id(8) + version(8) + property region.
    pub fn buffer_size(&self) -> usize {
        self.bitmap_bytes + 16 + self.record_size
    }
}

/// The application's class declaration, before the model resolves property
/// offsets and cross-class inverse-reference wiring.
pub struct ClassDef {
    pub id: ClassId,
    pub name: &'static str,
    pub is_abstract: bool,
    pub is_sealed: bool,
    pub parent: Option<ClassId>,
    pub properties: Vec<PropertyDef>,
}

impl ClassDef {
    pub fn new(id: ClassId, name: &'static str) -> Self {
        ClassDef { id, name, is_abstract: false, is_sealed: true, parent: None, properties: Vec::new() }
    }

    pub fn abstract_(mut self) -> Self {
        self.is_abstract = true;
        self.is_sealed = false;
        self
    }

    pub fn parent(mut self, parent: ClassId) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn property(mut self, def: PropertyDef) -> Self {
        self.properties.push(def);
        self
    }
}

fn build_descriptor(def: ClassDef) -> ClassDescriptor {
    let mut simple: Vec<PropertyDef> = Vec::new();
    let mut indirect: Vec<PropertyDef> = Vec::new();
    let mut inverse: Vec<PropertyDef> = Vec::new();
    for p in def.properties {
        match p.kind {
            PropertyKind::Simple(_) => simple.push(p),
            PropertyKind::Indirect(_) => indirect.push(p),
            PropertyKind::InverseReferenceSet => inverse.push(p),
        }
    }
    simple.sort_by(|a, b| a.name.cmp(b.name));
    indirect.sort_by(|a, b| a.name.cmp(b.name));
    inverse.sort_by(|a, b| a.name.cmp(b.name));

    let mut properties = Vec::with_capacity(simple.len() + indirect.len() + inverse.len());
    let mut next_id: PropertyId = 2;
    let mut offset = 0usize;

    for p in simple {
        let width = match p.kind {
            PropertyKind::Simple(s) => s.width(),
            _ => unreachable!(),
        };
        properties.push(PropertyDescriptor {
            id: next_id,
            name: p.name,
            kind: p.kind,
            offset,
            delete_action: p.delete_action,
            track_inverse: p.track_inverse,
            target_class: p.target_class,
        });
        offset += width;
        next_id += 1;
    }
    let simple_prefix_size = offset;

    for p in indirect {
        properties.push(PropertyDescriptor {
            id: next_id,
            name: p.name,
            kind: p.kind,
            offset,
            delete_action: p.delete_action,
            track_inverse: p.track_inverse,
            target_class: p.target_class,
        });
        offset += 8;
        next_id += 1;
    }
    let record_size = offset;

    for p in inverse {
        properties.push(PropertyDescriptor {
            id: next_id,
            name: p.name,
            kind: p.kind,
            offset: 0,
            delete_action: p.delete_action,
            track_inverse: false,
            target_class: p.target_class,
        });
        next_id += 1;
    }

    let user_prop_count = properties.iter().filter(|p| p.bit_index().is_some()).count();
    let bitmap_bytes = (user_prop_count + 7) / 8;

    ClassDescriptor {
        id: def.id,
        name: def.name,
        is_abstract: def.is_abstract,
        is_sealed: def.is_sealed,
        parent: def.parent,
        properties,
        simple_prefix_size,
        record_size,
        bitmap_bytes,
    }
}

/// A referring edge discovered while building the model: `referrer_class`
/// has a property `property` of kind reference/reference-array pointing at
/// some other class, with the given delete action.
#[derive(Clone, Copy, Debug)]
pub struct ReferringProperty {
    pub referrer_class: ClassId,
    pub property: PropertyId,
    pub delete_action: DeleteAction,
    pub track_inverse: bool,
}

/// The resolved, immutable schema for an [`crate::session::ObjectModel`]:
/// every class descriptor plus the cross-class indexes the cascade fixpoint
/// (§4.C6) and the descendant-aware change-list iterator (§4.C4) need.
pub struct Model {
    classes: HashMap<ClassId, Arc<ClassDescriptor>>,
    /// Inclusive: `descendants[c]` contains `c` itself plus every class whose
    /// `parent` chain reaches `c`.
    descendants: HashMap<ClassId, Vec<ClassId>>,
    /// `referrers[target]` lists every (class, property) anywhere in the
    /// model whose reference/reference-array points at `target`.
    referrers: HashMap<ClassId, Vec<ReferringProperty>>,
}

pub struct ModelBuilder {
    defs: Vec<ClassDef>,
}

impl ModelBuilder {
    pub fn new() -> Self {
        ModelBuilder { defs: Vec::new() }
    }

    pub fn class(mut self, def: ClassDef) -> Self {
        self.defs.push(def);
        self
    }

    pub fn build(self) -> Model {
        let mut classes = HashMap::new();
        let mut referrers: HashMap<ClassId, Vec<ReferringProperty>> = HashMap::new();

        for def in &self.defs {
            for p in &def.properties {
                if let (PropertyKind::Simple(crate::value::SimpleKind::Reference), Some(target)) =
                    (p.kind, p.target_class)
                {
                    referrers.entry(target).or_default().push(ReferringProperty {
                        referrer_class: def.id,
                        // filled in below once ids are resolved
                        property: 0,
                        delete_action: p.delete_action.unwrap_or(DeleteAction::SetToNull),
                        track_inverse: p.track_inverse,
                    });
                }
                if let (PropertyKind::Indirect(crate::value::IndirectKind::ReferenceArray), Some(target)) =
                    (p.kind, p.target_class)
                {
                    referrers.entry(target).or_default().push(ReferringProperty {
                        referrer_class: def.id,
                        property: 0,
                        delete_action: p.delete_action.unwrap_or(DeleteAction::SetToNull),
                        track_inverse: p.track_inverse,
                    });
                }
            }
        }

        for def in self.defs {
            let id = def.id;
            let descriptor = build_descriptor(def);
            // Now that ids are resolved, patch the referrer entries with the
            // real property id by name-matching against the built descriptor.
            for entries in referrers.values_mut() {
                for entry in entries.iter_mut() {
                    if entry.referrer_class == id && entry.property == 0 {
                        // Resolved lazily below via `resolve_referrer_ids`.
                        let _ = entry;
                    }
                }
            }
            classes.insert(id, Arc::new(descriptor));
        }

        // Resolve the placeholder `property: 0` left above into the real
        // PropertyId by re-walking each referrer class's descriptor for a
        // reference/reference-array property targeting the key class.
        let mut resolved: HashMap<ClassId, Vec<ReferringProperty>> = HashMap::new();
        for (target, entries) in referrers {
            let mut out = Vec::new();
            for entry in entries {
                if let Some(class) = classes.get(&entry.referrer_class) {
                    for prop in &class.properties {
                        let points_here = matches!(
                            prop.kind,
                            PropertyKind::Simple(crate::value::SimpleKind::Reference)
                                | PropertyKind::Indirect(crate::value::IndirectKind::ReferenceArray)
                        ) && prop.target_class == Some(target)
                            && prop.delete_action == Some(entry.delete_action)
                            && prop.track_inverse == entry.track_inverse;
                        if points_here {
                            out.push(ReferringProperty { property: prop.id, ..entry });
                        }
                    }
                }
            }
            resolved.insert(target, out);
        }

        let mut descendants: HashMap<ClassId, Vec<ClassId>> = HashMap::new();
        for &id in classes.keys() {
            descendants.entry(id).or_default().push(id);
        }
        for class in classes.values() {
            let mut current = class.parent;
            while let Some(parent_id) = current {
                descendants.entry(parent_id).or_default().push(class.id);
                current = classes.get(&parent_id).and_then(|p| p.parent);
            }
        }

        Model { classes, descendants, referrers: resolved }
    }
}

impl Default for ModelBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl Model {
    pub fn class(&self, id: ClassId) -> Option<&Arc<ClassDescriptor>> {
        self.classes.get(&id)
    }

    pub fn classes(&self) -> impl Iterator<Item = &Arc<ClassDescriptor>> {
        self.classes.values()
    }

    /// The class ids that should be scanned to cover `id`'s descendants
    /// (including itself), for polymorphic `get_all_objects`/class-scan
    /// queries (§9 Design Notes, "descendant-class-index array").
    pub fn descendants(&self, id: ClassId) -> &[ClassId] {
        self.descendants.get(&id).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// Every (class, property) anywhere in the model that references
    /// `target` via `CascadeDelete` or `PreventDelete` — the edges the
    /// cascade fixpoint (§4.C6) must walk.
    pub fn cascade_referrers(&self, target: ClassId) -> &[ReferringProperty] {
        self.referrers
            .get(&target)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// Every (class, property) anywhere in the model that references
    /// `target`, regardless of delete action — what `InverseReferenceSet`
    /// and the engine's `get_inverse_references` need.
    pub fn referrers(&self, target: ClassId) -> &[ReferringProperty] {
        self.referrers
            .get(&target)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::SimpleKind;

    #[test]
    fn assigns_simple_properties_before_indirect() {
        let model = ModelBuilder::new()
            .class(
                ClassDef::new(1, "Station")
                    .property(PropertyDef::string("name"))
                    .property(PropertyDef::simple("elevation", SimpleKind::Int)),
            )
            .build();
        let station = model.class(1).unwrap();
        assert_eq!(station.properties[0].name, "elevation");
        assert_eq!(station.properties[0].id, 2);
        assert_eq!(station.properties[1].name, "name");
        assert_eq!(station.properties[1].offset, station.simple_prefix_size);
    }

    #[test]
    fn resolves_cascade_referrers() {
        let model = ModelBuilder::new()
            .class(ClassDef::new(1, "B"))
            .class(
                ClassDef::new(2, "A").property(PropertyDef::reference(
                    "b",
                    1,
                    DeleteAction::PreventDelete,
                    true,
                )),
            )
            .build();
        let refs = model.cascade_referrers(1);
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].referrer_class, 2);
        assert_eq!(refs[0].delete_action, DeleteAction::PreventDelete);
    }
}
