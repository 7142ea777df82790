//! Struct and union layout computation.
//!
//! Layouts are computed lazily on first query and cached. Bit-fields pack
//! into 32-bit words: a field that would cross the current word starts a new
//! one at the next 4-byte boundary. Inheritance flattens the base struct's
//! fields, in order, ahead of the derived fields. Union members all live at
//! offset zero and the union is as large as its largest member.

use indexmap::IndexMap;

use crate::{
    ast::{Field, Primitive, StructDecl, TypeRef, UnionDecl},
    source::Location,
};

/// Size of the word bit-fields pack into.
const BITFIELD_WORD_BITS: u32 = 32;
const BITFIELD_WORD_BYTES: u32 = 4;

/// Layout of a single field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldLayout {
    pub name: String,
    /// Byte offset from the aggregate base. For bit-fields, the offset of
    /// the containing 32-bit word.
    pub byte_offset: u32,
    /// Storage size in bytes; zero for bit-fields.
    pub size: u32,
    /// First bit within the containing word (bit-fields only).
    pub bit_offset: u32,
    /// Width in bits; zero marks a regular field.
    pub bit_width: u32,
    /// Whether the field was flattened in from a base struct.
    pub is_base: bool,
}

impl FieldLayout {
    /// Whether this field is a bit-field.
    pub fn is_bit_field(&self) -> bool {
        self.bit_width > 0
    }
}

/// Computed layout of a struct or union.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructLayout {
    pub name: String,
    pub total_size: u32,
    pub alignment: u32,
    pub fields: IndexMap<String, FieldLayout>,
    pub base: Option<String>,
    pub is_union: bool,
}

/// Layout computation failures.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LayoutError {
    #[error("unknown struct or union '{0}'")]
    UnknownAggregate(String),
    #[error("{location}: bit-field '{field}' has invalid width {width}")]
    InvalidBitWidth {
        field: String,
        width: u32,
        location: Location,
    },
    #[error("circular inheritance or containment through '{0}'")]
    Circular(String),
    #[error("{location}: duplicate field '{field}' in '{aggregate}'")]
    DuplicateField {
        aggregate: String,
        field: String,
        location: Location,
    },
}

#[derive(Debug, Clone)]
struct AggregateDecl {
    fields: Vec<Field>,
    base: Option<String>,
    is_union: bool,
}

/// Registry of aggregate declarations plus a cache of computed layouts.
#[derive(Debug, Default)]
pub struct StructLayoutTable {
    decls: IndexMap<String, AggregateDecl>,
    cache: IndexMap<String, StructLayout>,
    in_progress: Vec<String>,
}

impl StructLayoutTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a struct declaration for later layout queries.
    pub fn register_struct(&mut self, decl: &StructDecl) {
        self.decls.insert(
            decl.name.clone(),
            AggregateDecl {
                fields: decl.fields.clone(),
                base: decl.base.clone(),
                is_union: false,
            },
        );
        self.cache.shift_remove(&decl.name);
    }

    /// Register a union declaration for later layout queries.
    pub fn register_union(&mut self, decl: &UnionDecl) {
        self.decls.insert(
            decl.name.clone(),
            AggregateDecl {
                fields: decl.fields.clone(),
                base: None,
                is_union: true,
            },
        );
        self.cache.shift_remove(&decl.name);
    }

    /// Whether `name` refers to a registered aggregate.
    pub fn is_known(&self, name: &str) -> bool {
        self.decls.contains_key(name)
    }

    /// Names of every registered aggregate, in declaration order.
    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.decls.keys()
    }

    /// Compute (or fetch the cached) layout for an aggregate.
    pub fn layout(&mut self, name: &str) -> Result<StructLayout, LayoutError> {
        if let Some(layout) = self.cache.get(name) {
            return Ok(layout.clone());
        }

        if self.in_progress.iter().any(|n| n == name) {
            return Err(LayoutError::Circular(name.to_owned()));
        }

        let decl = self
            .decls
            .get(name)
            .cloned()
            .ok_or_else(|| LayoutError::UnknownAggregate(name.to_owned()))?;

        self.in_progress.push(name.to_owned());
        let result = if decl.is_union {
            self.compute_union(name, &decl)
        } else {
            self.compute_struct(name, &decl)
        };
        self.in_progress.pop();

        let layout = result?;
        self.cache.insert(name.to_owned(), layout.clone());
        Ok(layout)
    }

    /// Total size in bytes of an aggregate.
    pub fn size_of(&mut self, name: &str) -> Result<u32, LayoutError> {
        Ok(self.layout(name)?.total_size)
    }

    /// Byte offset of a (possibly inherited) field.
    pub fn field_offset(&mut self, name: &str, field: &str) -> Result<u32, LayoutError> {
        let layout = self.layout(name)?;
        layout
            .fields
            .get(field)
            .map(|f| f.byte_offset)
            .ok_or_else(|| LayoutError::UnknownAggregate(format!("{name}.{field}")))
    }

    /// Bit-field info `(byte_offset, bit_offset, bit_width)` if the field is
    /// a bit-field.
    pub fn bit_field_info(&mut self, name: &str, field: &str) -> Option<(u32, u32, u32)> {
        let layout = self.layout(name).ok()?;
        let field = layout.fields.get(field)?;
        field
            .is_bit_field()
            .then_some((field.byte_offset, field.bit_offset, field.bit_width))
    }

    /// Declared type name of a field (`int`, `Point`, `int*`, `char[4]`),
    /// searching base structs as well.
    pub fn field_type_name(&self, name: &str, field: &str) -> Option<String> {
        let decl = self.decls.get(name)?;
        if let Some(f) = decl.fields.iter().find(|f| f.name == field) {
            return Some(f.ty.type_name());
        }
        decl.base
            .as_deref()
            .and_then(|base| self.field_type_name(base, field))
    }

    /// Declared type of a field, searching base structs as well.
    pub fn field_type_ref(&self, name: &str, field: &str) -> Option<TypeRef> {
        let decl = self.decls.get(name)?;
        if let Some(f) = decl.fields.iter().find(|f| f.name == field) {
            return Some(f.ty.clone());
        }
        decl.base
            .as_deref()
            .and_then(|base| self.field_type_ref(base, field))
    }

    /// Default initializer expressions `(field, offset, expr)` declared on
    /// the aggregate's fields, base structs included.
    pub fn field_defaults(&self, name: &str) -> Vec<(String, Field)> {
        let Some(decl) = self.decls.get(name) else {
            return Vec::new();
        };
        let mut defaults = decl
            .base
            .as_deref()
            .map(|base| self.field_defaults(base))
            .unwrap_or_default();
        for field in &decl.fields {
            if field.default.is_some() {
                defaults.push((field.name.clone(), field.clone()));
            }
        }
        defaults
    }

    /// Find the unique aggregate containing a field of this name. Used as a
    /// last resort when a variable's declared type is unknown; ambiguity
    /// returns `None`.
    pub fn sole_owner_of_field(&self, field: &str) -> Option<&str> {
        let mut owner = None;
        for (name, decl) in &self.decls {
            if decl.fields.iter().any(|f| f.name == field) {
                if owner.is_some() {
                    return None;
                }
                owner = Some(name.as_str());
            }
        }
        owner
    }

    fn compute_struct(
        &mut self,
        name: &str,
        decl: &AggregateDecl,
    ) -> Result<StructLayout, LayoutError> {
        let mut fields: IndexMap<String, FieldLayout> = IndexMap::new();
        let mut offset = 0u32;
        let mut bit_offset = 0u32;
        let mut alignment = 1u32;

        // Inherited fields come first, preserving base order.
        if let Some(base) = &decl.base {
            let base_layout = self.layout(base)?;
            for (field_name, field) in &base_layout.fields {
                fields.insert(
                    field_name.clone(),
                    FieldLayout {
                        is_base: true,
                        ..field.clone()
                    },
                );
            }
            offset = base_layout.total_size;
            alignment = alignment.max(base_layout.alignment);
        }

        // Anonymous-union groups overlap at a shared base offset; walk the
        // declaration in order so grouped and plain fields interleave the
        // way they were written.
        let mut i = 0;
        while i < decl.fields.len() {
            let field = &decl.fields[i];

            if let Some(group) = field.union_group {
                if bit_offset > 0 {
                    offset += BITFIELD_WORD_BYTES;
                    bit_offset = 0;
                }

                let group_fields: Vec<&Field> = decl.fields[i..]
                    .iter()
                    .take_while(|f| f.union_group == Some(group))
                    .collect();

                let mut group_alignment = 1u32;
                let mut group_size = 0u32;
                for member in &group_fields {
                    group_alignment = group_alignment.max(self.alignment_of(&member.ty)?);
                }
                offset = align_up(offset, group_alignment);

                for member in &group_fields {
                    let size = self.size_of_type(&member.ty)?;
                    let layout = match member.bit_width {
                        Some(width) => {
                            check_width(member, width)?;
                            group_size = group_size.max(BITFIELD_WORD_BYTES);
                            FieldLayout {
                                name: member.name.clone(),
                                byte_offset: offset,
                                size: 0,
                                bit_offset: 0,
                                bit_width: width,
                                is_base: false,
                            }
                        }
                        None => {
                            group_size = group_size.max(size);
                            FieldLayout {
                                name: member.name.clone(),
                                byte_offset: offset,
                                size,
                                bit_offset: 0,
                                bit_width: 0,
                                is_base: false,
                            }
                        }
                    };
                    insert_field(&mut fields, name, layout, &member.location)?;
                }

                offset += group_size;
                alignment = alignment.max(group_alignment);
                i += group_fields.len();
                continue;
            }

            match field.bit_width {
                Some(width) => {
                    check_width(field, width)?;
                    // Bit-field runs start word-aligned; overflow opens the
                    // next word.
                    if bit_offset == 0 {
                        offset = align_up(offset, BITFIELD_WORD_BYTES);
                    } else if bit_offset + width > BITFIELD_WORD_BITS {
                        offset += BITFIELD_WORD_BYTES;
                        bit_offset = 0;
                    }
                    insert_field(
                        &mut fields,
                        name,
                        FieldLayout {
                            name: field.name.clone(),
                            byte_offset: offset,
                            size: 0,
                            bit_offset,
                            bit_width: width,
                            is_base: false,
                        },
                        &field.location,
                    )?;
                    bit_offset += width;
                    alignment = alignment.max(BITFIELD_WORD_BYTES);
                }
                None => {
                    if bit_offset > 0 {
                        offset += BITFIELD_WORD_BYTES;
                        bit_offset = 0;
                    }
                    let size = self.size_of_type(&field.ty)?;
                    let field_alignment = self.alignment_of(&field.ty)?;
                    offset = align_up(offset, field_alignment);
                    insert_field(
                        &mut fields,
                        name,
                        FieldLayout {
                            name: field.name.clone(),
                            byte_offset: offset,
                            size,
                            bit_offset: 0,
                            bit_width: 0,
                            is_base: false,
                        },
                        &field.location,
                    )?;
                    offset += size;
                    alignment = alignment.max(field_alignment);
                }
            }

            i += 1;
        }

        if bit_offset > 0 {
            offset += BITFIELD_WORD_BYTES;
        }
        let total_size = align_up(offset.max(1), alignment);

        Ok(StructLayout {
            name: name.to_owned(),
            total_size,
            alignment,
            fields,
            base: decl.base.clone(),
            is_union: false,
        })
    }

    fn compute_union(
        &mut self,
        name: &str,
        decl: &AggregateDecl,
    ) -> Result<StructLayout, LayoutError> {
        let mut fields = IndexMap::new();
        let mut max_size = 0u32;
        let mut alignment = 1u32;

        for field in &decl.fields {
            let layout = match field.bit_width {
                Some(width) => {
                    check_width(field, width)?;
                    max_size = max_size.max(BITFIELD_WORD_BYTES);
                    alignment = alignment.max(BITFIELD_WORD_BYTES);
                    FieldLayout {
                        name: field.name.clone(),
                        byte_offset: 0,
                        size: 0,
                        bit_offset: 0,
                        bit_width: width,
                        is_base: false,
                    }
                }
                None => {
                    let size = self.size_of_type(&field.ty)?;
                    max_size = max_size.max(size);
                    alignment = alignment.max(self.alignment_of(&field.ty)?);
                    FieldLayout {
                        name: field.name.clone(),
                        byte_offset: 0,
                        size,
                        bit_offset: 0,
                        bit_width: 0,
                        is_base: false,
                    }
                }
            };
            insert_field(&mut fields, name, layout, &field.location)?;
        }

        Ok(StructLayout {
            name: name.to_owned(),
            total_size: align_up(max_size.max(1), alignment),
            alignment,
            fields,
            base: None,
            is_union: true,
        })
    }

    /// Storage size of a type reference in bytes.
    pub fn size_of_type(&mut self, ty: &TypeRef) -> Result<u32, LayoutError> {
        Ok(match ty {
            TypeRef::Primitive(p) => p.size(),
            TypeRef::Struct(name) | TypeRef::Union(name) => self.size_of(name)?,
            TypeRef::Array { element, size } => {
                self.size_of_type(element)? * size.unwrap_or(1)
            }
            TypeRef::Pointer { .. } => 8,
        })
    }

    fn alignment_of(&mut self, ty: &TypeRef) -> Result<u32, LayoutError> {
        Ok(match ty {
            TypeRef::Primitive(Primitive::Char) | TypeRef::Primitive(Primitive::Bool) => 1,
            TypeRef::Primitive(Primitive::Void) => 1,
            TypeRef::Primitive(_) => 4,
            TypeRef::Struct(name) | TypeRef::Union(name) => self.layout(name)?.alignment,
            TypeRef::Array { element, .. } => self.alignment_of(element)?,
            TypeRef::Pointer { .. } => 8,
        })
    }
}

fn align_up(value: u32, alignment: u32) -> u32 {
    debug_assert!(alignment > 0);
    value.div_ceil(alignment) * alignment
}

fn check_width(field: &Field, width: u32) -> Result<(), LayoutError> {
    if width == 0 || width > BITFIELD_WORD_BITS {
        return Err(LayoutError::InvalidBitWidth {
            field: field.name.clone(),
            width,
            location: field.location.clone(),
        });
    }
    Ok(())
}

fn insert_field(
    fields: &mut IndexMap<String, FieldLayout>,
    aggregate: &str,
    layout: FieldLayout,
    location: &Location,
) -> Result<(), LayoutError> {
    let name = layout.name.clone();
    if fields.insert(name.clone(), layout).is_some() {
        return Err(LayoutError::DuplicateField {
            aggregate: aggregate.to_owned(),
            field: name,
            location: location.clone(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{lexer::Lexer, parser::Parser};
    use crate::ast::Decl;

    fn table_for(source: &str) -> StructLayoutTable {
        let tokens = Lexer::new(source, "test.rtmc").tokenize().expect("lexes");
        let program = Parser::new(tokens).parse().expect("parses");
        let mut table = StructLayoutTable::new();
        for decl in &program.declarations {
            match decl {
                Decl::Struct(s) => table.register_struct(s),
                Decl::Union(u) => table.register_union(u),
                _ => {}
            }
        }
        table
    }

    #[test]
    fn bitfields_pack_into_one_word() {
        let mut table = table_for("struct R { int a:4; int b:12; int c:16; };");
        let layout = table.layout("R").unwrap();
        assert_eq!(layout.total_size, 4);

        let a = &layout.fields["a"];
        let b = &layout.fields["b"];
        let c = &layout.fields["c"];
        assert_eq!((a.byte_offset, a.bit_offset, a.bit_width), (0, 0, 4));
        assert_eq!((b.byte_offset, b.bit_offset, b.bit_width), (0, 4, 12));
        assert_eq!((c.byte_offset, c.bit_offset, c.bit_width), (0, 16, 16));
    }

    #[test]
    fn bitfield_overflow_opens_next_word() {
        let mut table = table_for("struct R { int a:20; int b:20; };");
        let layout = table.layout("R").unwrap();
        let b = &layout.fields["b"];
        assert_eq!((b.byte_offset, b.bit_offset), (4, 0));
        assert_eq!(layout.total_size, 8);
    }

    #[test]
    fn regular_field_after_bitfields_starts_new_byte() {
        let mut table = table_for("struct R { int a:3; int x; };");
        let layout = table.layout("R").unwrap();
        assert_eq!(layout.fields["x"].byte_offset, 4);
        assert_eq!(layout.total_size, 8);
    }

    #[test]
    fn char_packing_and_alignment() {
        let mut table = table_for("struct S { char c; int x; char d; };");
        let layout = table.layout("S").unwrap();
        assert_eq!(layout.fields["c"].byte_offset, 0);
        assert_eq!(layout.fields["x"].byte_offset, 4);
        assert_eq!(layout.fields["d"].byte_offset, 8);
        assert_eq!(layout.alignment, 4);
        assert_eq!(layout.total_size, 12);
    }

    #[test]
    fn union_members_overlap() {
        let mut table = table_for("union U { int i; char b[4]; };");
        let layout = table.layout("U").unwrap();
        assert!(layout.is_union);
        assert_eq!(layout.total_size, 4);
        assert!(layout.fields.values().all(|f| f.byte_offset == 0));
    }

    #[test]
    fn inheritance_prepends_base_fields() {
        let mut table =
            table_for("struct B { int x; int y; }; struct D : B { int z; };");
        let layout = table.layout("D").unwrap();
        let names: Vec<&String> = layout.fields.keys().collect();
        assert_eq!(names, ["x", "y", "z"]);
        assert!(layout.fields["x"].is_base);
        assert_eq!(layout.fields["z"].byte_offset, 8);
        assert_eq!(layout.total_size, 12);
    }

    #[test]
    fn anonymous_union_group_overlaps_inside_struct() {
        let mut table =
            table_for("struct S { int head; union { int i; float f; }; int tail; };");
        let layout = table.layout("S").unwrap();
        assert_eq!(layout.fields["i"].byte_offset, 4);
        assert_eq!(layout.fields["f"].byte_offset, 4);
        assert_eq!(layout.fields["tail"].byte_offset, 8);
        assert_eq!(layout.total_size, 12);
    }

    #[test]
    fn nested_struct_field_sizes() {
        let mut table =
            table_for("struct Inner { int a; int b; }; struct Outer { struct Inner inner; int c; };");
        let layout = table.layout("Outer").unwrap();
        assert_eq!(layout.fields["inner"].size, 8);
        assert_eq!(layout.fields["c"].byte_offset, 8);
    }

    #[test]
    fn invalid_bit_width_is_an_error() {
        let mut table = table_for("struct R { int a:33; };");
        assert!(matches!(
            table.layout("R"),
            Err(LayoutError::InvalidBitWidth { width: 33, .. })
        ));
    }

    #[test]
    fn unknown_struct_is_an_error() {
        let mut table = StructLayoutTable::new();
        assert!(matches!(
            table.layout("Nope"),
            Err(LayoutError::UnknownAggregate(_))
        ));
    }

    #[test]
    fn layout_invariants_hold_for_samples() {
        let sources = [
            "struct A { int x; char c; float f; };",
            "struct B { int a:1; int b:31; int c:5; };",
            "struct C { char a; char b; char c; };",
            "union U { float f; int i; char c; };",
        ];
        for source in sources {
            let mut table = table_for(source);
            let names: Vec<String> = table.names().cloned().collect();
            for name in names {
                let layout = table.layout(&name).unwrap();
                assert_eq!(layout.total_size % layout.alignment, 0);
                for field in layout.fields.values() {
                    assert!(field.byte_offset < layout.total_size);
                    if !field.is_bit_field() {
                        assert!(field.byte_offset + field.size <= layout.total_size);
                    } else {
                        assert!(field.bit_offset + field.bit_width <= 32);
                    }
                    if layout.is_union {
                        assert_eq!(field.byte_offset, 0);
                    }
                }
            }
        }
    }
}
