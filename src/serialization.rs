//! JSON forms of values and instances.
//!
//! Instances travel as `{typeName, id, values, traits}`; nested entities use
//! the same shape, plain references are bare ids and structs are
//! `{typeName, values}`. Reading JSON yields *untyped* values; types are
//! applied afterwards by converting against the catalog.

use std::str::FromStr;

use bigdecimal::BigDecimal;
use indexmap::IndexMap;
use serde_json::{Map, Number, Value as Json, json};

use crate::datatype::EnumValue;
use crate::error::{CatalogError, Result};
use crate::identity::Id;
use crate::instance::{Referenceable, Struct, TypedInstance, TypedStruct, Value};

// ------------- Writing -------------
pub fn value_to_json(value: &Value) -> Json {
    match value {
        Value::Null => Json::Null,
        Value::Boolean(v) => Json::Bool(*v),
        Value::Byte(v) => json!(v),
        Value::Short(v) => json!(v),
        Value::Int(v) => json!(v),
        Value::Long(v) => json!(v),
        Value::Float(v) => Number::from_f64(*v as f64).map(Json::Number).unwrap_or(Json::Null),
        Value::Double(v) => Number::from_f64(*v).map(Json::Number).unwrap_or(Json::Null),
        // kept as text so no precision is lost
        Value::BigInteger(v) | Value::BigDecimal(v) => Json::String(v.to_string()),
        Value::Date(v) => Json::String(v.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)),
        Value::String(v) => Json::String(v.clone()),
        Value::Enum(v) => json!({ "value": v.value, "ordinal": v.ordinal }),
        Value::Array(values) => Json::Array(values.iter().map(value_to_json).collect()),
        Value::Map(entries) => {
            let mut object = Map::new();
            for (k, v) in entries {
                let key = match k {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                object.insert(key, value_to_json(v));
            }
            Json::Object(object)
        }
        Value::Struct(s) => struct_to_json(s),
        Value::TypedStruct(s) => typed_struct_to_json(s),
        Value::Referenceable(r) => referenceable_to_json(r),
        Value::Instance(i) => instance_to_json(i),
        Value::Id(id) => id_to_json(id),
    }
}

fn id_to_json(id: &Id) -> Json {
    serde_json::to_value(id).unwrap_or(Json::Null)
}

fn values_to_json(values: &IndexMap<String, Value>) -> Json {
    Json::Object(values.iter().map(|(k, v)| (k.clone(), value_to_json(v))).collect())
}

pub fn struct_to_json(s: &Struct) -> Json {
    json!({ "typeName": s.type_name, "values": values_to_json(&s.values) })
}

pub fn typed_struct_to_json(s: &TypedStruct) -> Json {
    struct_to_json(&s.to_struct())
}

pub fn referenceable_to_json(r: &Referenceable) -> Json {
    let traits: Map<String, Json> = r
        .traits
        .iter()
        .map(|(name, t)| (name.clone(), struct_to_json(t)))
        .collect();
    json!({
        "typeName": r.type_name,
        "id": id_to_json(&r.id),
        "values": values_to_json(&r.values),
        "traits": Json::Object(traits),
    })
}

pub fn instance_to_json(instance: &TypedInstance) -> Json {
    referenceable_to_json(&instance.to_referenceable())
}

// ------------- Reading -------------
/// Reads a JSON value into an untyped value.
///
/// Numbers become a long when they fit, a big integer when they are whole but
/// past `i64`, and a double otherwise. Objects are matched against these
/// shapes in order, falling back to a map:
///
/// - `id` and `values`: an instance
/// - `typeName` and `values`: a struct
/// - `id` and `typeName` with at most `version` and `state` beside them: an id
/// - exactly `value` and `ordinal`: an enum value
///
/// A map whose keys happen to form one of these shapes is read as that shape;
/// conversion against the attribute type then decides whether it fits.
pub fn json_to_value(json: &Json) -> Result<Value> {
    Ok(match json {
        Json::Null => Value::Null,
        Json::Bool(b) => Value::Boolean(*b),
        Json::Number(n) => {
            if let Some(v) = n.as_i64() {
                Value::Long(v)
            } else if let Some(v) = n.as_u64() {
                Value::BigInteger(BigDecimal::from(v))
            } else if let Some(v) = n.as_f64() {
                Value::Double(v)
            } else {
                Value::BigDecimal(
                    BigDecimal::from_str(&n.to_string()).map_err(|e| CatalogError::Serialization(e.to_string()))?,
                )
            }
        }
        Json::String(s) => Value::String(s.clone()),
        Json::Array(items) => Value::Array(items.iter().map(json_to_value).collect::<Result<_>>()?),
        Json::Object(object) => {
            let has = |key: &str| object.contains_key(key);
            if has("id") && has("values") {
                Value::Referenceable(referenceable_from_object(object)?)
            } else if has("typeName") && has("values") {
                Value::Struct(struct_from_object(object)?)
            } else if has("id") && has("typeName") && object.len() <= 4 {
                Value::Id(serde_json::from_value(json.clone())?)
            } else if has("value") && has("ordinal") && object.len() == 2 {
                Value::Enum(serde_json::from_value::<EnumValue>(json.clone())?)
            } else {
                Value::Map(
                    object
                        .iter()
                        .map(|(k, v)| Ok((Value::String(k.clone()), json_to_value(v)?)))
                        .collect::<Result<_>>()?,
                )
            }
        }
    })
}

fn values_from(object: &Map<String, Json>) -> Result<IndexMap<String, Value>> {
    match object.get("values") {
        Some(Json::Object(values)) => values
            .iter()
            .map(|(k, v)| Ok((k.clone(), json_to_value(v)?)))
            .collect(),
        Some(Json::Null) | None => Ok(IndexMap::new()),
        Some(other) => Err(CatalogError::Serialization(format!("'values' must be an object, not {}", other))),
    }
}

fn type_name_from(object: &Map<String, Json>) -> Result<String> {
    object
        .get("typeName")
        .and_then(Json::as_str)
        .map(str::to_string)
        .ok_or_else(|| CatalogError::Serialization("missing 'typeName'".to_string()))
}

fn struct_from_object(object: &Map<String, Json>) -> Result<Struct> {
    Ok(Struct { type_name: type_name_from(object)?, values: values_from(object)? })
}

fn referenceable_from_object(object: &Map<String, Json>) -> Result<Referenceable> {
    let id: Id = match object.get("id") {
        Some(Json::String(guid)) => {
            let type_name = type_name_from(object)?;
            Id::new(guid.clone(), 0, type_name)
        }
        Some(id @ Json::Object(_)) => serde_json::from_value(id.clone())?,
        _ => return Err(CatalogError::Serialization("'id' must be an id object or a guid".to_string())),
    };
    let type_name = match object.get("typeName").and_then(Json::as_str) {
        Some(name) => name.to_string(),
        None => id.type_name().to_string(),
    };
    Ok(Referenceable { id, type_name, values: values_from(object)?, traits: traits_from(object)? })
}

fn traits_from(object: &Map<String, Json>) -> Result<IndexMap<String, Struct>> {
    let mut traits = IndexMap::new();
    let Some(Json::Object(trait_objects)) = object.get("traits") else {
        return Ok(traits);
    };
    for (name, t) in trait_objects {
        let trait_struct = match t {
            Json::Object(o) if o.contains_key("values") => struct_from_object(o)?,
            Json::Object(o) => Struct {
                type_name: name.clone(),
                values: o.iter().map(|(k, v)| Ok((k.clone(), json_to_value(v)?))).collect::<Result<_>>()?,
            },
            Json::Null => Struct::new(name),
            other => {
                return Err(CatalogError::Serialization(format!("trait '{}' must be an object, not {}", name, other)))
            }
        };
        traits.insert(name.clone(), trait_struct);
    }
    Ok(traits)
}

/// Parses instance JSON into an untyped entity.
pub fn referenceable_from_json(text: &str) -> Result<Referenceable> {
    let json: Json = serde_json::from_str(text)?;
    match &json {
        Json::Object(object) if object.contains_key("typeName") => {
            if object.contains_key("id") {
                referenceable_from_object(object)
            } else {
                let type_name = type_name_from(object)?;
                let mut r = Referenceable::new(&type_name);
                r.values = values_from(object)?;
                r.traits = traits_from(object)?;
                Ok(r)
            }
        }
        _ => Err(CatalogError::Serialization("instance JSON must be an object with a 'typeName'".to_string())),
    }
}

/// Parses `{typeName, values}` into an untyped struct, used for traits.
pub fn struct_from_json(text: &str) -> Result<Struct> {
    match serde_json::from_str::<Json>(text)? {
        Json::Object(object) => struct_from_object(&object),
        _ => Err(CatalogError::Serialization("struct JSON must be an object".to_string())),
    }
}
