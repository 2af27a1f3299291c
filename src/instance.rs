//! Instances and value conversion.
//!
//! Callers build *untyped* values ([`Struct`], [`Referenceable`]) freely.
//! Typed values ([`TypedStruct`], [`TypedInstance`]) only come out of
//! conversion against a [`TypeCatalog`], so anything stored under an attribute
//! of a typed value already satisfies the attribute's type and multiplicity.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use bigdecimal::{BigDecimal, FromPrimitive, ToPrimitive};
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use indexmap::IndexMap;
use tracing::debug;

use crate::datatype::{
    AttributeInfo, AttributeType, DataType, EnumValue, FieldMapping, Multiplicity, PrimitiveKind,
    TypeCategory,
};
use crate::error::{CatalogError, Result};
use crate::identity::Id;
use crate::registry::TypeCatalog;

static NULL: Value = Value::Null;

/// Attribute access shared by every kind of instance.
pub trait Instance {
    fn type_name(&self) -> &str;
    fn get(&self, attribute: &str) -> Result<&Value>;
    fn set(&mut self, attribute: &str, value: Value) -> Result<()>;
}

// ------------- Values -------------
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Boolean(bool),
    Byte(i8),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    BigInteger(BigDecimal),
    BigDecimal(BigDecimal),
    Date(DateTime<Utc>),
    String(String),
    Enum(EnumValue),
    Array(Vec<Value>),
    Map(Vec<(Value, Value)>),
    Struct(Struct),
    Referenceable(Referenceable),
    TypedStruct(TypedStruct),
    Instance(Box<TypedInstance>),
    Id(Id),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Byte(v) => Some(*v as i64),
            Value::Short(v) => Some(*v as i64),
            Value::Int(v) => Some(*v as i64),
            Value::Long(v) => Some(*v),
            Value::Float(v) if v.fract() == 0.0 => v.to_i64(),
            Value::Double(v) if v.fract() == 0.0 => v.to_i64(),
            Value::BigInteger(v) | Value::BigDecimal(v) if v.is_integer() => v.to_i64(),
            _ => None,
        }
    }
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v as f64),
            Value::Double(v) => Some(*v),
            Value::BigInteger(v) | Value::BigDecimal(v) => v.to_f64(),
            other => other.as_i64().map(|v| v as f64),
        }
    }
    fn as_big_decimal(&self) -> Option<BigDecimal> {
        match self {
            Value::BigInteger(v) | Value::BigDecimal(v) => Some(v.clone()),
            Value::Float(v) => BigDecimal::from_f32(*v),
            Value::Double(v) => BigDecimal::from_f64(*v),
            other => other.as_i64().map(BigDecimal::from),
        }
    }
    /// The entity id this value refers to, if it is a reference.
    pub fn as_id(&self) -> Option<&Id> {
        match self {
            Value::Id(id) => Some(id),
            Value::Referenceable(r) => Some(&r.id),
            Value::Instance(i) => Some(&i.id),
            _ => None,
        }
    }
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Boolean(_) => "boolean",
            Value::Byte(_) => "byte",
            Value::Short(_) => "short",
            Value::Int(_) => "int",
            Value::Long(_) => "long",
            Value::Float(_) => "float",
            Value::Double(_) => "double",
            Value::BigInteger(_) => "biginteger",
            Value::BigDecimal(_) => "bigdecimal",
            Value::Date(_) => "date",
            Value::String(_) => "string",
            Value::Enum(_) => "enum",
            Value::Array(_) => "array",
            Value::Map(_) => "map",
            Value::Struct(_) => "struct",
            Value::Referenceable(_) => "referenceable",
            Value::TypedStruct(_) => "typed struct",
            Value::Instance(_) => "instance",
            Value::Id(_) => "id",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Boolean(v) => write!(f, "{}", v),
            Value::Byte(v) => write!(f, "{}", v),
            Value::Short(v) => write!(f, "{}", v),
            Value::Int(v) => write!(f, "{}", v),
            Value::Long(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Double(v) => write!(f, "{}", v),
            Value::BigInteger(v) | Value::BigDecimal(v) => write!(f, "{}", v),
            Value::Date(v) => write!(f, "{}", v.to_rfc3339()),
            Value::String(v) => write!(f, "{}", v),
            Value::Enum(v) => write!(f, "{}", v),
            Value::Array(values) => {
                let items: Vec<String> = values.iter().map(|v| v.to_string()).collect();
                write!(f, "[{}]", items.join(", "))
            }
            Value::Map(entries) => {
                let items: Vec<String> = entries.iter().map(|(k, v)| format!("{}: {}", k, v)).collect();
                write!(f, "{{{}}}", items.join(", "))
            }
            Value::Struct(s) => write!(f, "{}{{..}}", s.type_name),
            Value::Referenceable(r) => write!(f, "{}", r.id),
            Value::TypedStruct(s) => write!(f, "{}{{..}}", s.type_name),
            Value::Instance(i) => write!(f, "{}", i.id),
            Value::Id(id) => write!(f, "{}", id),
        }
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}
impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}
impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}
impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v)
    }
}
impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Long(v)
    }
}
impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}
impl From<Id> for Value {
    fn from(v: Id) -> Self {
        Value::Id(v)
    }
}
impl From<Struct> for Value {
    fn from(v: Struct) -> Self {
        Value::Struct(v)
    }
}
impl From<Referenceable> for Value {
    fn from(v: Referenceable) -> Self {
        Value::Referenceable(v)
    }
}
impl From<TypedInstance> for Value {
    fn from(v: TypedInstance) -> Self {
        Value::Instance(Box::new(v))
    }
}
impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Value::Array(v.into_iter().map(Into::into).collect())
    }
}

// ------------- Untyped -------------
/// A bag of attribute values tagged with a type name.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Struct {
    pub type_name: String,
    pub values: IndexMap<String, Value>,
}
impl Struct {
    pub fn new(type_name: &str) -> Self {
        Self { type_name: type_name.to_string(), values: IndexMap::new() }
    }
    pub fn with(mut self, attribute: &str, value: impl Into<Value>) -> Self {
        self.values.insert(attribute.to_string(), value.into());
        self
    }
}
impl Instance for Struct {
    fn type_name(&self) -> &str {
        &self.type_name
    }
    fn get(&self, attribute: &str) -> Result<&Value> {
        Ok(self.values.get(attribute).unwrap_or(&NULL))
    }
    fn set(&mut self, attribute: &str, value: Value) -> Result<()> {
        self.values.insert(attribute.to_string(), value);
        Ok(())
    }
}

/// An untyped entity: a struct with an identity and attached traits.
#[derive(Debug, Clone, PartialEq)]
pub struct Referenceable {
    pub id: Id,
    pub type_name: String,
    pub values: IndexMap<String, Value>,
    pub traits: IndexMap<String, Struct>,
}
impl Referenceable {
    pub fn new(type_name: &str) -> Self {
        Self::with_id(Id::unassigned(type_name))
    }
    pub fn with_id(id: Id) -> Self {
        Self {
            type_name: id.type_name().to_string(),
            id,
            values: IndexMap::new(),
            traits: IndexMap::new(),
        }
    }
    /// Attaches an empty trait of the given name.
    pub fn with_trait_name(self, trait_name: &str) -> Self {
        self.with_trait(Struct::new(trait_name))
    }
    pub fn with_trait(mut self, trait_struct: Struct) -> Self {
        self.traits.insert(trait_struct.type_name.clone(), trait_struct);
        self
    }
    pub fn with(mut self, attribute: &str, value: impl Into<Value>) -> Self {
        self.values.insert(attribute.to_string(), value.into());
        self
    }
    pub fn trait_names(&self) -> Vec<String> {
        self.traits.keys().cloned().collect()
    }
}
impl Instance for Referenceable {
    fn type_name(&self) -> &str {
        &self.type_name
    }
    fn get(&self, attribute: &str) -> Result<&Value> {
        Ok(self.values.get(attribute).unwrap_or(&NULL))
    }
    fn set(&mut self, attribute: &str, value: Value) -> Result<()> {
        self.values.insert(attribute.to_string(), value);
        Ok(())
    }
}

// ------------- Typed -------------
/// A struct whose values have been validated against its type's fields.
#[derive(Debug, Clone)]
pub struct TypedStruct {
    type_name: String,
    fields: Arc<FieldMapping>,
    values: IndexMap<String, Value>,
}
impl TypedStruct {
    pub fn values(&self) -> &IndexMap<String, Value> {
        &self.values
    }
    pub fn fields(&self) -> &FieldMapping {
        &self.fields
    }
    pub fn to_struct(&self) -> Struct {
        Struct {
            type_name: self.type_name.clone(),
            values: self.values.iter().map(|(k, v)| (k.clone(), untyped(v))).collect(),
        }
    }
    /// Sets an attribute of any type, checking the value against the catalog
    /// exactly as conversion would. Typed input is checked again too.
    pub fn set_converted(&mut self, attribute: &str, value: &Value, catalog: &TypeCatalog) -> Result<()> {
        let converted = self.attribute(attribute)?.convert(&untyped(value), catalog)?;
        self.values.insert(attribute.to_string(), converted);
        Ok(())
    }
    fn attribute(&self, attribute: &str) -> Result<&AttributeInfo> {
        self.fields.get(attribute).ok_or_else(|| CatalogError::UnknownProperty {
            type_name: self.type_name.clone(),
            property: attribute.to_string(),
        })
    }
}
impl PartialEq for TypedStruct {
    fn eq(&self, other: &Self) -> bool {
        self.type_name == other.type_name && self.values == other.values
    }
}
impl Instance for TypedStruct {
    fn type_name(&self) -> &str {
        &self.type_name
    }
    fn get(&self, attribute: &str) -> Result<&Value> {
        self.attribute(attribute)?;
        Ok(self.values.get(attribute).unwrap_or(&NULL))
    }
    /// Converts and sets attributes built from primitives alone. Enum, struct
    /// and reference attributes need the catalog: see [`TypedStruct::set_converted`].
    fn set(&mut self, attribute: &str, value: Value) -> Result<()> {
        let info = self.attribute(attribute)?;
        if !value.is_null() && !is_plain(&info.data_type) {
            return Err(CatalogError::conversion(
                &info.data_type.name(),
                value.kind(),
                "values of this type must be converted through the type catalog",
            ));
        }
        let converted = info.convert(&value, &TypeCatalog::new())?;
        self.values.insert(attribute.to_string(), converted);
        Ok(())
    }
}

/// A typed entity: a typed struct with an identity and typed traits.
#[derive(Debug, Clone, PartialEq)]
pub struct TypedInstance {
    pub id: Id,
    data: TypedStruct,
    traits: IndexMap<String, TypedStruct>,
}
impl TypedInstance {
    pub fn values(&self) -> &IndexMap<String, Value> {
        self.data.values()
    }
    pub fn fields(&self) -> &FieldMapping {
        self.data.fields()
    }
    pub fn trait_names(&self) -> Vec<String> {
        self.traits.keys().cloned().collect()
    }
    pub fn traits(&self) -> &IndexMap<String, TypedStruct> {
        &self.traits
    }
    pub fn get_trait(&self, trait_name: &str) -> Option<&TypedStruct> {
        self.traits.get(trait_name)
    }
    /// Replaces the identity, keeping the type name.
    pub fn with_id(mut self, id: Id) -> Self {
        self.id = id;
        self
    }
    pub fn set_converted(&mut self, attribute: &str, value: &Value, catalog: &TypeCatalog) -> Result<()> {
        self.data.set_converted(attribute, value, catalog)
    }
    pub fn to_referenceable(&self) -> Referenceable {
        Referenceable {
            id: self.id.clone(),
            type_name: self.data.type_name.clone(),
            values: self.data.to_struct().values,
            traits: self.traits.iter().map(|(k, t)| (k.clone(), t.to_struct())).collect(),
        }
    }
}
impl Instance for TypedInstance {
    fn type_name(&self) -> &str {
        &self.data.type_name
    }
    fn get(&self, attribute: &str) -> Result<&Value> {
        self.data.get(attribute)
    }
    fn set(&mut self, attribute: &str, value: Value) -> Result<()> {
        self.data.set(attribute, value)
    }
}

// ------------- Identity rewriting -------------
impl Value {
    /// A copy with every entity id passed through `f`, including the ids of
    /// nested instances.
    pub fn map_ids(&self, f: &dyn Fn(&Id) -> Id) -> Value {
        match self {
            Value::Id(id) => Value::Id(f(id)),
            Value::Instance(i) => Value::Instance(Box::new(i.map_ids(f))),
            Value::TypedStruct(s) => Value::TypedStruct(s.map_ids(f)),
            Value::Array(values) => Value::Array(values.iter().map(|v| v.map_ids(f)).collect()),
            Value::Map(entries) => Value::Map(entries.iter().map(|(k, v)| (k.clone(), v.map_ids(f))).collect()),
            other => other.clone(),
        }
    }
}
impl TypedStruct {
    pub fn map_ids(&self, f: &dyn Fn(&Id) -> Id) -> TypedStruct {
        TypedStruct {
            type_name: self.type_name.clone(),
            fields: Arc::clone(&self.fields),
            values: self.values.iter().map(|(k, v)| (k.clone(), v.map_ids(f))).collect(),
        }
    }
}
impl TypedInstance {
    pub fn map_ids(&self, f: &dyn Fn(&Id) -> Id) -> TypedInstance {
        TypedInstance {
            id: f(&self.id),
            data: self.data.map_ids(f),
            traits: self.traits.iter().map(|(k, t)| (k.clone(), t.map_ids(f))).collect(),
        }
    }
}

// types a value can be checked against without a catalog
fn is_plain(data_type: &AttributeType) -> bool {
    match data_type {
        AttributeType::Primitive(_) => true,
        AttributeType::Array(element) => is_plain(element),
        AttributeType::Map(key, value) => is_plain(key) && is_plain(value),
        AttributeType::Named { .. } => false,
    }
}

fn untyped(value: &Value) -> Value {
    match value {
        Value::TypedStruct(s) => Value::Struct(s.to_struct()),
        Value::Instance(i) => Value::Referenceable(i.to_referenceable()),
        Value::Array(values) => Value::Array(values.iter().map(untyped).collect()),
        Value::Map(entries) => Value::Map(entries.iter().map(|(k, v)| (untyped(k), untyped(v))).collect()),
        other => other.clone(),
    }
}

// ------------- Conversion -------------
fn check_null(attribute: &str, multiplicity: Multiplicity) -> Result<Value> {
    if multiplicity.is_required() {
        Err(CatalogError::NullRequiredAttribute { attribute: attribute.to_string() })
    } else {
        Ok(Value::Null)
    }
}

fn out_of_range(kind: PrimitiveKind, value: &Value) -> CatalogError {
    CatalogError::conversion(kind.name(), value, "value out of range or not a whole number")
}

/// Converts a non-null value to the given primitive.
pub fn convert_primitive(kind: PrimitiveKind, value: &Value) -> Result<Value> {
    let mismatch = || CatalogError::conversion(kind.name(), value, &format!("cannot convert from {}", value.kind()));
    if let Value::String(text) = value {
        let text = text.trim();
        return match kind {
            PrimitiveKind::String => Ok(Value::String(value.to_string())),
            PrimitiveKind::Boolean => match text.to_lowercase().as_str() {
                "true" => Ok(Value::Boolean(true)),
                "false" => Ok(Value::Boolean(false)),
                _ => Err(mismatch()),
            },
            PrimitiveKind::Date => parse_date(text).ok_or_else(mismatch),
            _ => {
                let parsed = BigDecimal::from_str(text).map_err(|_| mismatch())?;
                convert_primitive(kind, &Value::BigDecimal(parsed))
            }
        };
    }
    match kind {
        PrimitiveKind::Boolean => match value {
            Value::Boolean(b) => Ok(Value::Boolean(*b)),
            _ => Err(mismatch()),
        },
        PrimitiveKind::Byte => {
            let v = value.as_i64().ok_or_else(|| out_of_range(kind, value))?;
            i8::try_from(v).map(Value::Byte).map_err(|_| out_of_range(kind, value))
        }
        PrimitiveKind::Short => {
            let v = value.as_i64().ok_or_else(|| out_of_range(kind, value))?;
            i16::try_from(v).map(Value::Short).map_err(|_| out_of_range(kind, value))
        }
        PrimitiveKind::Int => {
            let v = value.as_i64().ok_or_else(|| out_of_range(kind, value))?;
            i32::try_from(v).map(Value::Int).map_err(|_| out_of_range(kind, value))
        }
        PrimitiveKind::Long => value.as_i64().map(Value::Long).ok_or_else(|| out_of_range(kind, value)),
        PrimitiveKind::Float => value
            .as_f64()
            .map(|v| Value::Float(v as f32))
            .ok_or_else(mismatch),
        PrimitiveKind::Double => value.as_f64().map(Value::Double).ok_or_else(mismatch),
        PrimitiveKind::BigInteger => match value.as_big_decimal() {
            Some(v) if v.is_integer() => Ok(Value::BigInteger(v)),
            Some(_) => Err(out_of_range(kind, value)),
            None => Err(mismatch()),
        },
        PrimitiveKind::BigDecimal => value.as_big_decimal().map(Value::BigDecimal).ok_or_else(mismatch),
        PrimitiveKind::Date => match value {
            Value::Date(d) => Ok(Value::Date(*d)),
            // epoch milliseconds
            other => other
                .as_i64()
                .and_then(|millis| Utc.timestamp_millis_opt(millis).single())
                .map(Value::Date)
                .ok_or_else(mismatch),
        },
        PrimitiveKind::String => match value {
            Value::Boolean(_)
            | Value::Byte(_)
            | Value::Short(_)
            | Value::Int(_)
            | Value::Long(_)
            | Value::Float(_)
            | Value::Double(_)
            | Value::BigInteger(_)
            | Value::BigDecimal(_)
            | Value::Date(_)
            | Value::Enum(_) => Ok(Value::String(value.to_string())),
            _ => Err(mismatch()),
        },
    }
}

fn parse_date(text: &str) -> Option<Value> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
        return Some(Value::Date(parsed.with_timezone(&Utc)));
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| Value::Date(Utc.from_utc_datetime(&naive)))
}

impl AttributeType {
    /// Converts a raw value to this type under the given multiplicity.
    pub fn convert(&self, value: &Value, multiplicity: Multiplicity, catalog: &TypeCatalog) -> Result<Value> {
        self.convert_named(&self.name(), value, multiplicity, catalog)
    }

    fn convert_named(
        &self,
        attribute: &str,
        value: &Value,
        multiplicity: Multiplicity,
        catalog: &TypeCatalog,
    ) -> Result<Value> {
        if value.is_null() {
            return check_null(attribute, multiplicity);
        }
        match self {
            AttributeType::Primitive(kind) => convert_primitive(*kind, value),
            AttributeType::Array(element) => {
                let Value::Array(values) = value else {
                    return Err(CatalogError::conversion(&self.name(), value, "expected a collection"));
                };
                if multiplicity.is_many()
                    && (values.len() < multiplicity.lower as usize || values.len() > multiplicity.upper as usize)
                {
                    return Err(CatalogError::conversion(
                        &self.name(),
                        format!("{} elements", values.len()),
                        &format!("multiplicity is {}", multiplicity),
                    ));
                }
                values
                    .iter()
                    .map(|v| element.convert_named(attribute, v, Multiplicity::REQUIRED, catalog))
                    .collect::<Result<Vec<_>>>()
                    .map(Value::Array)
            }
            AttributeType::Map(key_type, value_type) => {
                let entries: Vec<(Value, Value)> = match value {
                    Value::Map(entries) => entries.clone(),
                    Value::Struct(s) if s.type_name.is_empty() => s
                        .values
                        .iter()
                        .map(|(k, v)| (Value::String(k.clone()), v.clone()))
                        .collect(),
                    _ => return Err(CatalogError::conversion(&self.name(), value, "expected a map")),
                };
                entries
                    .iter()
                    .map(|(k, v)| {
                        Ok((
                            key_type.convert_named(attribute, k, Multiplicity::REQUIRED, catalog)?,
                            value_type.convert_named(attribute, v, Multiplicity::OPTIONAL, catalog)?,
                        ))
                    })
                    .collect::<Result<Vec<_>>>()
                    .map(Value::Map)
            }
            AttributeType::Named { category, name } => match category {
                TypeCategory::Enum => {
                    let enum_type = catalog.enum_type(name).ok_or_else(|| CatalogError::TypeNotFound {
                        category: Some(TypeCategory::Enum),
                        name: name.clone(),
                    })?;
                    let resolved = match value {
                        Value::Enum(e) => enum_type.from_value(&e.value).filter(|c| c.ordinal == e.ordinal),
                        Value::String(s) => enum_type.from_value(s),
                        other => other
                            .as_i64()
                            .and_then(|o| i32::try_from(o).ok())
                            .and_then(|o| enum_type.from_ordinal(o)),
                    };
                    resolved
                        .map(Value::Enum)
                        .ok_or_else(|| CatalogError::conversion(name, value, "no such enum value or ordinal"))
                }
                TypeCategory::Struct | TypeCategory::Trait => {
                    catalog.convert_struct(*category, name, value).map(Value::TypedStruct)
                }
                TypeCategory::Class => convert_reference(name, value, catalog),
                _ => Err(CatalogError::conversion(name, value, "unsupported attribute type")),
            },
        }
    }
}

impl AttributeInfo {
    pub fn convert(&self, value: &Value, catalog: &TypeCatalog) -> Result<Value> {
        self.data_type.convert_named(&self.name, value, self.multiplicity, catalog)
    }
}

fn convert_reference(class_name: &str, value: &Value, catalog: &TypeCatalog) -> Result<Value> {
    let actual = match value {
        Value::Id(id) => id.type_name().to_string(),
        Value::Referenceable(r) => r.type_name.clone(),
        Value::Instance(i) => i.type_name().to_string(),
        other => return Err(CatalogError::conversion(class_name, other, "expected a reference or an instance")),
    };
    if !catalog.is_subtype(&actual, class_name) {
        return Err(CatalogError::conversion(
            class_name,
            value,
            &format!("'{}' is not a subtype of '{}'", actual, class_name),
        ));
    }
    match value {
        Value::Referenceable(r) => Ok(Value::Instance(Box::new(catalog.convert_instance(r)?))),
        other => Ok(other.clone()),
    }
}

fn convert_fields(
    type_name: &str,
    fields: &FieldMapping,
    raw: &IndexMap<String, Value>,
    catalog: &TypeCatalog,
) -> Result<IndexMap<String, Value>> {
    for extra in raw.keys().filter(|k| !fields.contains(k)) {
        debug!("Ignoring attribute '{}' not defined on '{}'", extra, type_name);
    }
    fields
        .iter()
        .map(|info| {
            let raw_value = raw.get(&info.name).unwrap_or(&NULL);
            Ok((info.name.clone(), info.convert(raw_value, catalog)?))
        })
        .collect()
}

impl TypeCatalog {
    /// Converts a raw value to a struct or trait of the given name.
    pub fn convert_struct(&self, category: TypeCategory, name: &str, value: &Value) -> Result<TypedStruct> {
        let fields = match self.get(category, name) {
            Some(DataType::Struct(s)) => Arc::clone(&s.field_mapping),
            Some(DataType::Trait(h)) => Arc::clone(&h.field_mapping),
            _ => {
                return Err(CatalogError::TypeNotFound {
                    category: Some(category),
                    name: name.to_string(),
                })
            }
        };
        let raw = match value {
            Value::TypedStruct(s) if s.type_name == name => return Ok(s.clone()),
            Value::Struct(s) if s.type_name.is_empty() || s.type_name == name => s.values.clone(),
            Value::TypedStruct(TypedStruct { type_name, .. }) | Value::Struct(Struct { type_name, .. }) => {
                return Err(CatalogError::conversion(name, value, &format!("a '{}' is not a '{}'", type_name, name)));
            }
            Value::Map(entries) => entries
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
            other => return Err(CatalogError::conversion(name, other, "expected a struct")),
        };
        Ok(TypedStruct {
            type_name: name.to_string(),
            values: convert_fields(name, &fields, &raw, self)?,
            fields,
        })
    }

    /// Converts an untyped entity, including its traits, to a typed instance
    /// of its own class.
    pub fn convert_instance(&self, raw: &Referenceable) -> Result<TypedInstance> {
        let class = self.require_class(&raw.type_name)?;
        let fields = Arc::clone(&class.field_mapping);
        let values = convert_fields(&raw.type_name, &fields, &raw.values, self)?;
        let mut traits = IndexMap::new();
        for (trait_name, trait_struct) in &raw.traits {
            self.require_trait(trait_name)?;
            let typed = self.convert_struct(TypeCategory::Trait, trait_name, &Value::Struct(trait_struct.clone()))?;
            traits.insert(trait_name.clone(), typed);
        }
        let id = if raw.id.type_name() == raw.type_name {
            raw.id.clone()
        } else {
            Id::new(raw.id.id(), raw.id.version(), raw.type_name.clone())
        };
        Ok(TypedInstance {
            id,
            data: TypedStruct { type_name: raw.type_name.clone(), fields, values },
            traits,
        })
    }

    /// Converts a trait struct on its own, for attaching to an entity later.
    pub fn convert_trait(&self, raw: &Struct) -> Result<TypedStruct> {
        self.require_trait(&raw.type_name)?;
        self.convert_struct(TypeCategory::Trait, &raw.type_name, &Value::Struct(raw.clone()))
    }
}
