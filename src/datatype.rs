//! The runtime type model.
//!
//! Types come in two shapes. *Definitions* ([`TypesDef`] and friends) are
//! the wire form a caller submits, referring to other types by name. Resolved
//! types ([`DataType`]) are what the [`crate::registry::TypeRegistry`] keeps:
//! attribute types are resolved to an [`AttributeType`] that still refers to
//! named types by `(category, name)`, so that mutually referencing classes
//! never own each other. Hierarchical types carry a flattened, memoized
//! [`FieldMapping`] computed once at registration.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

// enum ordinals and values are looked up in both directions
use bimap::BiMap;
use indexmap::IndexMap;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{CatalogError, Result};

lazy_static! {
    static ref ARRAY_TYPE: Regex = Regex::new(r"^array<\s*(.+)\s*>$").unwrap();
    static ref MAP_TYPE: Regex = Regex::new(r"^map<\s*([^,]+?)\s*,\s*(.+?)\s*>$").unwrap();
}

// ------------- Category -------------
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TypeCategory {
    Primitive,
    Array,
    Map,
    Enum,
    Struct,
    Class,
    Trait,
}
impl TypeCategory {
    pub fn is_hierarchical(&self) -> bool {
        matches!(self, Self::Class | Self::Trait)
    }
}
impl fmt::Display for TypeCategory {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Self::Primitive => "primitive",
            Self::Array => "array",
            Self::Map => "map",
            Self::Enum => "enum",
            Self::Struct => "struct",
            Self::Class => "class",
            Self::Trait => "trait",
        };
        write!(f, "{}", name)
    }
}

// ------------- Primitives -------------
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PrimitiveKind {
    Boolean,
    Byte,
    Short,
    Int,
    Long,
    Float,
    Double,
    BigInteger,
    BigDecimal,
    Date,
    String,
}
impl PrimitiveKind {
    pub const ALL: [PrimitiveKind; 11] = [
        Self::Boolean,
        Self::Byte,
        Self::Short,
        Self::Int,
        Self::Long,
        Self::Float,
        Self::Double,
        Self::BigInteger,
        Self::BigDecimal,
        Self::Date,
        Self::String,
    ];
    pub fn name(&self) -> &'static str {
        match self {
            Self::Boolean => "boolean",
            Self::Byte => "byte",
            Self::Short => "short",
            Self::Int => "int",
            Self::Long => "long",
            Self::Float => "float",
            Self::Double => "double",
            Self::BigInteger => "biginteger",
            Self::BigDecimal => "bigdecimal",
            Self::Date => "date",
            Self::String => "string",
        }
    }
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|kind| kind.name() == name)
    }
    pub fn is_numeric(&self) -> bool {
        !matches!(self, Self::Boolean | Self::Date | Self::String)
    }
}
impl fmt::Display for PrimitiveKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

// ------------- Multiplicity -------------
/// Cardinality bounds of an attribute. `is_unique` is a store-level constraint
/// ("no two instances of the owning type share this value"), it does not
/// imply set semantics for collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Multiplicity {
    pub lower: u32,
    pub upper: u32,
    pub is_unique: bool,
}
impl Multiplicity {
    pub const UNBOUNDED: u32 = u32::MAX;
    pub const REQUIRED: Multiplicity = Multiplicity { lower: 1, upper: 1, is_unique: false };
    pub const OPTIONAL: Multiplicity = Multiplicity { lower: 0, upper: 1, is_unique: false };
    pub const COLLECTION: Multiplicity = Multiplicity {
        lower: 0,
        upper: Self::UNBOUNDED,
        is_unique: false,
    };

    pub fn new(lower: u32, upper: u32, is_unique: bool) -> Result<Self> {
        if lower > upper || upper == 0 {
            return Err(CatalogError::InvalidTypeDefinition(format!(
                "invalid multiplicity {}..{}",
                lower, upper
            )));
        }
        Ok(Self { lower, upper, is_unique })
    }
    pub fn unique(self) -> Self {
        Self { is_unique: true, ..self }
    }
    pub fn is_required(&self) -> bool {
        self.lower > 0
    }
    pub fn is_many(&self) -> bool {
        self.upper > 1
    }
}
impl fmt::Display for Multiplicity {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.upper == Self::UNBOUNDED {
            write!(f, "{}..N", self.lower)
        } else {
            write!(f, "{}..{}", self.lower, self.upper)
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MultiplicityWire {
    lower: u32,
    #[serde(default)]
    upper: Option<u32>,
    #[serde(default)]
    is_unique: bool,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum MultiplicityInput {
    Named(String),
    Bounds(MultiplicityWire),
}

impl Serialize for Multiplicity {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        MultiplicityWire {
            lower: self.lower,
            upper: if self.upper == Self::UNBOUNDED { None } else { Some(self.upper) },
            is_unique: self.is_unique,
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Multiplicity {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        use serde::de::Error;
        match MultiplicityInput::deserialize(deserializer)? {
            MultiplicityInput::Named(name) => match name.to_lowercase().as_str() {
                "required" => Ok(Self::REQUIRED),
                "optional" => Ok(Self::OPTIONAL),
                "collection" => Ok(Self::COLLECTION),
                other => Err(D::Error::custom(format!("unknown multiplicity '{}'", other))),
            },
            MultiplicityInput::Bounds(wire) => Multiplicity::new(
                wire.lower,
                wire.upper.unwrap_or(Self::UNBOUNDED),
                wire.is_unique,
            )
            .map_err(D::Error::custom),
        }
    }
}

// ------------- Definitions (wire form) -------------
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttributeDefinition {
    pub name: String,
    pub data_type_name: String,
    pub multiplicity: Multiplicity,
    #[serde(default)]
    pub is_composite: bool,
    #[serde(default)]
    pub reverse_attribute_name: Option<String>,
}
impl AttributeDefinition {
    pub fn new(name: &str, data_type_name: &str, multiplicity: Multiplicity) -> Self {
        Self {
            name: name.to_string(),
            data_type_name: data_type_name.to_string(),
            multiplicity,
            is_composite: false,
            reverse_attribute_name: None,
        }
    }
    pub fn required(name: &str, data_type_name: &str) -> Self {
        Self::new(name, data_type_name, Multiplicity::REQUIRED)
    }
    pub fn optional(name: &str, data_type_name: &str) -> Self {
        Self::new(name, data_type_name, Multiplicity::OPTIONAL)
    }
    pub fn collection(name: &str, data_type_name: &str) -> Self {
        Self::new(name, data_type_name, Multiplicity::COLLECTION)
    }
    pub fn composite(mut self) -> Self {
        self.is_composite = true;
        self
    }
    pub fn unique(mut self) -> Self {
        self.multiplicity = self.multiplicity.unique();
        self
    }
    pub fn reverse(mut self, reverse_attribute_name: &str) -> Self {
        self.reverse_attribute_name = Some(reverse_attribute_name.to_string());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EnumValue {
    pub value: String,
    pub ordinal: i32,
}
impl EnumValue {
    pub fn new(value: &str, ordinal: i32) -> Self {
        Self { value: value.to_string(), ordinal }
    }
}
impl fmt::Display for EnumValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnumTypeDefinition {
    pub name: String,
    pub enum_values: Vec<EnumValue>,
}
impl EnumTypeDefinition {
    pub fn new(name: &str, enum_values: Vec<EnumValue>) -> Self {
        Self { name: name.to_string(), enum_values }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StructTypeDefinition {
    pub type_name: String,
    #[serde(default)]
    pub attribute_definitions: Vec<AttributeDefinition>,
}
impl StructTypeDefinition {
    pub fn new(type_name: &str, attribute_definitions: Vec<AttributeDefinition>) -> Self {
        Self { type_name: type_name.to_string(), attribute_definitions }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HierarchicalTypeDefinition {
    pub type_name: String,
    #[serde(default)]
    pub super_types: Vec<String>,
    #[serde(default)]
    pub attribute_definitions: Vec<AttributeDefinition>,
}
impl HierarchicalTypeDefinition {
    pub fn new(type_name: &str, super_types: &[&str], attribute_definitions: Vec<AttributeDefinition>) -> Self {
        Self {
            type_name: type_name.to_string(),
            super_types: super_types.iter().map(|s| s.to_string()).collect(),
            attribute_definitions,
        }
    }
}

/// One batch of type definitions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypesDef {
    #[serde(default)]
    pub enum_types: Vec<EnumTypeDefinition>,
    #[serde(default)]
    pub struct_types: Vec<StructTypeDefinition>,
    #[serde(default)]
    pub trait_types: Vec<HierarchicalTypeDefinition>,
    #[serde(default)]
    pub class_types: Vec<HierarchicalTypeDefinition>,
}
impl TypesDef {
    pub fn new(
        enum_types: Vec<EnumTypeDefinition>,
        struct_types: Vec<StructTypeDefinition>,
        trait_types: Vec<HierarchicalTypeDefinition>,
        class_types: Vec<HierarchicalTypeDefinition>,
    ) -> Self {
        Self { enum_types, struct_types, trait_types, class_types }
    }
    pub fn is_empty(&self) -> bool {
        self.enum_types.is_empty()
            && self.struct_types.is_empty()
            && self.trait_types.is_empty()
            && self.class_types.is_empty()
    }
    /// Appends another batch, keeping category order.
    pub fn extend(&mut self, other: TypesDef) {
        self.enum_types.extend(other.enum_types);
        self.struct_types.extend(other.struct_types);
        self.trait_types.extend(other.trait_types);
        self.class_types.extend(other.class_types);
    }
    /// Every `(category, name)` defined in this batch, in definition order.
    pub fn keys(&self) -> Vec<(TypeCategory, String)> {
        let mut keys = Vec::new();
        keys.extend(self.enum_types.iter().map(|d| (TypeCategory::Enum, d.name.clone())));
        keys.extend(self.struct_types.iter().map(|d| (TypeCategory::Struct, d.type_name.clone())));
        keys.extend(self.trait_types.iter().map(|d| (TypeCategory::Trait, d.type_name.clone())));
        keys.extend(self.class_types.iter().map(|d| (TypeCategory::Class, d.type_name.clone())));
        keys
    }
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

// ------------- Type names -------------
/// The syntactic shape of a `dataTypeName`, before any lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeName {
    Primitive(PrimitiveKind),
    Array(Box<TypeName>),
    Map(Box<TypeName>, Box<TypeName>),
    Named(String),
}
impl TypeName {
    pub fn parse(name: &str) -> Result<TypeName> {
        let name = name.trim();
        if name.is_empty() {
            return Err(CatalogError::InvalidTypeDefinition("empty type name".to_string()));
        }
        if let Some(kind) = PrimitiveKind::from_name(name) {
            return Ok(TypeName::Primitive(kind));
        }
        if let Some(captures) = MAP_TYPE.captures(name) {
            return Ok(TypeName::Map(
                Box::new(TypeName::parse(&captures[1])?),
                Box::new(TypeName::parse(&captures[2])?),
            ));
        }
        if let Some(captures) = ARRAY_TYPE.captures(name) {
            return Ok(TypeName::Array(Box::new(TypeName::parse(&captures[1])?)));
        }
        if name.contains('<') || name.contains('>') || name.contains(',') {
            return Err(CatalogError::InvalidTypeDefinition(format!(
                "malformed type name '{}'",
                name
            )));
        }
        Ok(TypeName::Named(name.to_string()))
    }
}

// ------------- Resolved attribute types -------------
/// A resolved attribute type. Named types are referenced by category and
/// name and looked up in the registry snapshot when needed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AttributeType {
    Primitive(PrimitiveKind),
    Array(Box<AttributeType>),
    Map(Box<AttributeType>, Box<AttributeType>),
    Named { category: TypeCategory, name: String },
}
impl AttributeType {
    pub fn name(&self) -> String {
        match self {
            Self::Primitive(kind) => kind.name().to_string(),
            Self::Array(element) => format!("array<{}>", element.name()),
            Self::Map(key, value) => format!("map<{},{}>", key.name(), value.name()),
            Self::Named { name, .. } => name.clone(),
        }
    }
    pub fn category(&self) -> TypeCategory {
        match self {
            Self::Primitive(_) => TypeCategory::Primitive,
            Self::Array(_) => TypeCategory::Array,
            Self::Map(_, _) => TypeCategory::Map,
            Self::Named { category, .. } => *category,
        }
    }
    /// The type reached by following this attribute, looking through arrays
    /// and map values.
    pub fn element(&self) -> &AttributeType {
        match self {
            Self::Array(element) => element.element(),
            Self::Map(_, value) => value.element(),
            other => other,
        }
    }
    /// True when values are stored as edges rather than vertex properties.
    pub fn is_edge(&self) -> bool {
        matches!(
            self.element().category(),
            TypeCategory::Class | TypeCategory::Struct | TypeCategory::Trait
        )
    }
    pub fn is_class_reference(&self) -> bool {
        self.element().category() == TypeCategory::Class
    }
    /// The named class, struct, or trait reached through this attribute.
    pub fn target_name(&self) -> Option<&str> {
        match self.element() {
            Self::Named { category, name } if *category != TypeCategory::Enum => Some(name),
            _ => None,
        }
    }
}
impl fmt::Display for AttributeType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AttributeInfo {
    pub name: String,
    pub data_type: AttributeType,
    pub multiplicity: Multiplicity,
    pub is_composite: bool,
    pub reverse_attribute_name: Option<String>,
    /// The type that declares the attribute; inherited attributes keep the
    /// supertype here so that every subtype stores them under the same key.
    pub declaring_type: String,
}
impl AttributeInfo {
    /// Vertex property key or edge label used for this attribute.
    pub fn property_key(&self) -> String {
        format!("{}.{}", self.declaring_type, self.name)
    }
    /// Same attribute regardless of where it was declared.
    pub fn same_shape(&self, other: &AttributeInfo) -> bool {
        self.name == other.name
            && self.data_type == other.data_type
            && self.multiplicity == other.multiplicity
            && self.is_composite == other.is_composite
            && self.reverse_attribute_name == other.reverse_attribute_name
    }
    pub fn to_definition(&self) -> AttributeDefinition {
        AttributeDefinition {
            name: self.name.clone(),
            data_type_name: self.data_type.name(),
            multiplicity: self.multiplicity,
            is_composite: self.is_composite,
            reverse_attribute_name: self.reverse_attribute_name.clone(),
        }
    }
}

/// The flattened attributes of a type: inherited attributes first, in
/// supertype declaration order, then the type's own attributes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldMapping {
    fields: IndexMap<String, AttributeInfo>,
}
impl FieldMapping {
    pub fn new() -> Self {
        Self { fields: IndexMap::new() }
    }
    pub fn get(&self, name: &str) -> Option<&AttributeInfo> {
        self.fields.get(name)
    }
    pub fn contains(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }
    pub fn iter(&self) -> impl Iterator<Item = &AttributeInfo> {
        self.fields.values()
    }
    pub fn names(&self) -> Vec<String> {
        self.fields.keys().cloned().collect()
    }
    pub fn len(&self) -> usize {
        self.fields.len()
    }
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
    /// Adds an inherited attribute; an identical attribute reached through
    /// another supertype is kept once.
    pub(crate) fn inherit(&mut self, type_name: &str, attribute: &AttributeInfo) -> Result<()> {
        match self.fields.get(&attribute.name) {
            Some(existing) if existing.same_shape(attribute) => Ok(()),
            Some(_) => Err(CatalogError::IncompatibleField {
                type_name: type_name.to_string(),
                attribute: attribute.name.clone(),
            }),
            None => {
                self.fields.insert(attribute.name.clone(), attribute.clone());
                Ok(())
            }
        }
    }
    pub(crate) fn declare(&mut self, type_name: &str, attribute: AttributeInfo) -> Result<()> {
        if self.fields.contains_key(&attribute.name) {
            return Err(CatalogError::IncompatibleField {
                type_name: type_name.to_string(),
                attribute: attribute.name,
            });
        }
        self.fields.insert(attribute.name.clone(), attribute);
        Ok(())
    }
}

// ------------- Named types -------------
#[derive(Debug, Clone)]
pub struct EnumType {
    name: String,
    values: BiMap<i32, String>,
    order: Vec<i32>,
}
impl EnumType {
    pub fn new(definition: &EnumTypeDefinition) -> Result<Self> {
        let mut values = BiMap::new();
        let mut order = Vec::new();
        for value in &definition.enum_values {
            if values.insert_no_overwrite(value.ordinal, value.value.clone()).is_err() {
                return Err(CatalogError::InvalidTypeDefinition(format!(
                    "enum '{}' repeats value '{}' or ordinal {}",
                    definition.name, value.value, value.ordinal
                )));
            }
            order.push(value.ordinal);
        }
        Ok(Self { name: definition.name.clone(), values, order })
    }
    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn from_ordinal(&self, ordinal: i32) -> Option<EnumValue> {
        self.values
            .get_by_left(&ordinal)
            .map(|value| EnumValue { value: value.clone(), ordinal })
    }
    pub fn from_value(&self, value: &str) -> Option<EnumValue> {
        let value = value.trim();
        self.values
            .get_by_right(value)
            .map(|ordinal| EnumValue { value: value.to_string(), ordinal: *ordinal })
    }
    pub fn values(&self) -> Vec<EnumValue> {
        self.order.iter().filter_map(|ordinal| self.from_ordinal(*ordinal)).collect()
    }
    pub fn to_definition(&self) -> EnumTypeDefinition {
        EnumTypeDefinition { name: self.name.clone(), enum_values: self.values() }
    }
}
impl PartialEq for EnumType {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.values() == other.values()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StructType {
    pub name: String,
    pub field_mapping: Arc<FieldMapping>,
}
impl StructType {
    pub fn to_definition(&self) -> StructTypeDefinition {
        StructTypeDefinition {
            type_name: self.name.clone(),
            attribute_definitions: self.field_mapping.iter().map(|a| a.to_definition()).collect(),
        }
    }
}

/// A class or trait type.
#[derive(Debug, Clone, PartialEq)]
pub struct HierarchicalType {
    pub name: String,
    pub category: TypeCategory,
    /// Direct supertypes as declared.
    pub super_types: Vec<String>,
    /// Every transitive supertype.
    pub all_super_types: BTreeSet<String>,
    pub field_mapping: Arc<FieldMapping>,
}
impl HierarchicalType {
    pub fn is_subtype_of(&self, name: &str) -> bool {
        self.name == name || self.all_super_types.contains(name)
    }
    /// Attributes declared by this type itself.
    pub fn own_attributes(&self) -> impl Iterator<Item = &AttributeInfo> {
        self.field_mapping.iter().filter(move |a| a.declaring_type == self.name)
    }
    pub fn to_definition(&self) -> HierarchicalTypeDefinition {
        HierarchicalTypeDefinition {
            type_name: self.name.clone(),
            super_types: self.super_types.clone(),
            attribute_definitions: self.own_attributes().map(|a| a.to_definition()).collect(),
        }
    }
}

/// A resolved type.
#[derive(Debug, Clone, PartialEq)]
pub enum DataType {
    Primitive(PrimitiveKind),
    Array(AttributeType),
    Map(AttributeType, AttributeType),
    Enum(EnumType),
    Struct(StructType),
    Class(HierarchicalType),
    Trait(HierarchicalType),
}
impl DataType {
    pub fn name(&self) -> String {
        match self {
            Self::Primitive(kind) => kind.name().to_string(),
            Self::Array(element) => format!("array<{}>", element.name()),
            Self::Map(key, value) => format!("map<{},{}>", key.name(), value.name()),
            Self::Enum(e) => e.name.clone(),
            Self::Struct(s) => s.name.clone(),
            Self::Class(h) | Self::Trait(h) => h.name.clone(),
        }
    }
    pub fn category(&self) -> TypeCategory {
        match self {
            Self::Primitive(_) => TypeCategory::Primitive,
            Self::Array(_) => TypeCategory::Array,
            Self::Map(_, _) => TypeCategory::Map,
            Self::Enum(_) => TypeCategory::Enum,
            Self::Struct(_) => TypeCategory::Struct,
            Self::Class(_) => TypeCategory::Class,
            Self::Trait(_) => TypeCategory::Trait,
        }
    }
    pub fn field_mapping(&self) -> Option<&Arc<FieldMapping>> {
        match self {
            Self::Struct(s) => Some(&s.field_mapping),
            Self::Class(h) | Self::Trait(h) => Some(&h.field_mapping),
            _ => None,
        }
    }
    pub fn as_hierarchical(&self) -> Option<&HierarchicalType> {
        match self {
            Self::Class(h) | Self::Trait(h) => Some(h),
            _ => None,
        }
    }
}
