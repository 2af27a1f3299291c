//! The type registry.
//!
//! A [`TypeRegistry`] owns every resolved type. Readers take a snapshot, an
//! `Arc<TypeCatalog>`, and resolve against it for as long as they like.
//! Writers build a complete new catalog off to the side, validate it, run the
//! commit hook and only then swap it in, all while holding the write lock.
//! A batch that fails anywhere along the way leaves the registry untouched.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, RwLock};

use indexmap::IndexMap;
use tracing::{debug, info, warn};

use crate::datatype::{
    AttributeDefinition, AttributeInfo, AttributeType, DataType, EnumType, FieldMapping,
    HierarchicalType, HierarchicalTypeDefinition, PrimitiveKind, StructType, TypeCategory,
    TypeName, TypesDef,
};
use crate::error::{CatalogError, Result};

// named types are resolved in this order when only a name is given
const NAMED_CATEGORIES: [TypeCategory; 4] = [
    TypeCategory::Enum,
    TypeCategory::Struct,
    TypeCategory::Class,
    TypeCategory::Trait,
];

// ------------- Catalog -------------
/// An immutable set of resolved types.
#[derive(Debug, Clone, Default)]
pub struct TypeCatalog {
    types: IndexMap<(TypeCategory, String), DataType>,
}
impl TypeCatalog {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn get(&self, category: TypeCategory, name: &str) -> Option<&DataType> {
        self.types.get(&(category, name.to_string()))
    }
    pub fn contains(&self, category: TypeCategory, name: &str) -> bool {
        self.get(category, name).is_some()
    }
    pub fn len(&self) -> usize {
        self.types.len()
    }
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
    pub fn iter(&self) -> impl Iterator<Item = &DataType> {
        self.types.values()
    }
    pub fn names(&self, category: TypeCategory) -> Vec<String> {
        self.types
            .keys()
            .filter(|(c, _)| *c == category)
            .map(|(_, name)| name.clone())
            .collect()
    }
    /// The category a bare name resolves to, if any.
    pub fn category_of(&self, name: &str) -> Option<TypeCategory> {
        NAMED_CATEGORIES
            .iter()
            .copied()
            .find(|category| self.contains(*category, name))
    }
    pub fn class(&self, name: &str) -> Option<&HierarchicalType> {
        match self.get(TypeCategory::Class, name) {
            Some(DataType::Class(h)) => Some(h),
            _ => None,
        }
    }
    pub fn trait_type(&self, name: &str) -> Option<&HierarchicalType> {
        match self.get(TypeCategory::Trait, name) {
            Some(DataType::Trait(h)) => Some(h),
            _ => None,
        }
    }
    pub fn struct_type(&self, name: &str) -> Option<&StructType> {
        match self.get(TypeCategory::Struct, name) {
            Some(DataType::Struct(s)) => Some(s),
            _ => None,
        }
    }
    pub fn enum_type(&self, name: &str) -> Option<&EnumType> {
        match self.get(TypeCategory::Enum, name) {
            Some(DataType::Enum(e)) => Some(e),
            _ => None,
        }
    }
    /// A class or, failing that, a trait of this name.
    pub fn hierarchical(&self, name: &str) -> Option<&HierarchicalType> {
        self.class(name).or_else(|| self.trait_type(name))
    }
    pub fn require_class(&self, name: &str) -> Result<&HierarchicalType> {
        self.class(name).ok_or_else(|| CatalogError::TypeNotFound {
            category: Some(TypeCategory::Class),
            name: name.to_string(),
        })
    }
    pub fn require_trait(&self, name: &str) -> Result<&HierarchicalType> {
        self.trait_type(name).ok_or_else(|| CatalogError::TypeNotFound {
            category: Some(TypeCategory::Trait),
            name: name.to_string(),
        })
    }
    /// True when `sub` is `sup` or inherits from it, within one category.
    pub fn is_subtype(&self, sub: &str, sup: &str) -> bool {
        sub == sup
            || self
                .hierarchical(sub)
                .map(|h| h.all_super_types.contains(sup))
                .unwrap_or(false)
    }
    /// `name` itself plus every class that inherits from it.
    pub fn class_and_subtypes(&self, name: &str) -> Vec<String> {
        self.types
            .values()
            .filter_map(|t| match t {
                DataType::Class(h) if h.is_subtype_of(name) => Some(h.name.clone()),
                _ => None,
            })
            .collect()
    }
    /// Resolves any type name, including `array<..>` and `map<..,..>` forms.
    pub fn get_data_type(&self, name: &str) -> Result<DataType> {
        match TypeName::parse(name)? {
            TypeName::Primitive(kind) => Ok(DataType::Primitive(kind)),
            TypeName::Array(element) => Ok(DataType::Array(self.resolve_name(name, &element)?)),
            TypeName::Map(key, value) => Ok(DataType::Map(
                self.resolve_name(name, &key)?,
                self.resolve_name(name, &value)?,
            )),
            TypeName::Named(named) => self
                .category_of(&named)
                .and_then(|category| self.get(category, &named))
                .cloned()
                .ok_or(CatalogError::TypeNotFound { category: None, name: named }),
        }
    }
    fn resolve_name(&self, whole: &str, type_name: &TypeName) -> Result<AttributeType> {
        resolve(type_name, &|name| self.category_of(name)).ok_or_else(|| {
            CatalogError::TypeNotFound {
                category: None,
                name: whole.to_string(),
            }
        })
    }
    /// The wire definition of one named type.
    pub fn types_def(&self, name: &str) -> Result<TypesDef> {
        let category = self.category_of(name).ok_or(CatalogError::TypeNotFound {
            category: None,
            name: name.to_string(),
        })?;
        let mut defs = TypesDef::default();
        match self.get(category, name) {
            Some(DataType::Enum(e)) => defs.enum_types.push(e.to_definition()),
            Some(DataType::Struct(s)) => defs.struct_types.push(s.to_definition()),
            Some(DataType::Trait(h)) => defs.trait_types.push(h.to_definition()),
            Some(DataType::Class(h)) => defs.class_types.push(h.to_definition()),
            _ => {}
        }
        Ok(defs)
    }
    /// Wire definitions of every registered type, in registration order.
    pub fn all_types_def(&self) -> TypesDef {
        let mut defs = TypesDef::default();
        for data_type in self.types.values() {
            match data_type {
                DataType::Enum(e) => defs.enum_types.push(e.to_definition()),
                DataType::Struct(s) => defs.struct_types.push(s.to_definition()),
                DataType::Trait(h) => defs.trait_types.push(h.to_definition()),
                DataType::Class(h) => defs.class_types.push(h.to_definition()),
                _ => {}
            }
        }
        defs
    }
    fn insert(&mut self, data_type: DataType) {
        self.types.insert((data_type.category(), data_type.name()), data_type);
    }
}

fn resolve(type_name: &TypeName, category_of: &dyn Fn(&str) -> Option<TypeCategory>) -> Option<AttributeType> {
    match type_name {
        TypeName::Primitive(kind) => Some(AttributeType::Primitive(*kind)),
        TypeName::Array(element) => Some(AttributeType::Array(Box::new(resolve(element, category_of)?))),
        TypeName::Map(key, value) => Some(AttributeType::Map(
            Box::new(resolve(key, category_of)?),
            Box::new(resolve(value, category_of)?),
        )),
        TypeName::Named(name) => category_of(name).map(|category| AttributeType::Named {
            category,
            name: name.clone(),
        }),
    }
}

// ------------- Batch builder -------------
// Builds one batch on top of a cloned catalog. Hierarchical types are built
// depth first so that supertypes in the same batch are ready before their
// subtypes flatten them.
struct BatchBuilder<'d> {
    catalog: TypeCatalog,
    // categories of every named type in the batch
    pending: HashMap<String, Vec<TypeCategory>>,
    traits: HashMap<&'d str, &'d HierarchicalTypeDefinition>,
    classes: HashMap<&'d str, &'d HierarchicalTypeDefinition>,
    visiting: HashSet<(TypeCategory, String)>,
    defined: Vec<(TypeCategory, String)>,
}

impl<'d> BatchBuilder<'d> {
    fn new(catalog: TypeCatalog, defs: &'d TypesDef) -> Result<Self> {
        let mut seen = HashSet::new();
        let mut pending: HashMap<String, Vec<TypeCategory>> = HashMap::new();
        for (category, name) in defs.keys() {
            if catalog.contains(category, &name) || !seen.insert((category, name.clone())) {
                return Err(CatalogError::DuplicateType { category, name });
            }
            if PrimitiveKind::from_name(&name).is_some() || TypeName::parse(&name)? != TypeName::Named(name.clone()) {
                return Err(CatalogError::InvalidTypeDefinition(format!(
                    "'{}' is reserved and cannot name a {} type",
                    name, category
                )));
            }
            pending.entry(name).or_default().push(category);
        }
        Ok(Self {
            catalog,
            pending,
            traits: defs.trait_types.iter().map(|d| (d.type_name.as_str(), d)).collect(),
            classes: defs.class_types.iter().map(|d| (d.type_name.as_str(), d)).collect(),
            visiting: HashSet::new(),
            defined: Vec::new(),
        })
    }

    fn category_of(&self, name: &str) -> Option<TypeCategory> {
        NAMED_CATEGORIES.iter().copied().find(|category| {
            self.catalog.contains(*category, name)
                || self
                    .pending
                    .get(name)
                    .map(|categories| categories.contains(category))
                    .unwrap_or(false)
        })
    }

    fn attribute(&self, owner: &str, definition: &AttributeDefinition) -> Result<AttributeInfo> {
        let unresolved = || CatalogError::UnresolvedReference {
            type_name: owner.to_string(),
            attribute: definition.name.clone(),
            referenced: definition.data_type_name.clone(),
        };
        let parsed = TypeName::parse(&definition.data_type_name)?;
        let data_type = resolve(&parsed, &|name| self.category_of(name)).ok_or_else(unresolved)?;
        let multiplicity = definition.multiplicity;
        if definition.name.trim().is_empty() {
            return Err(CatalogError::InvalidTypeDefinition(format!(
                "attribute of '{}' has an empty name",
                owner
            )));
        }
        if multiplicity.is_many()
            && !matches!(data_type, AttributeType::Array(_) | AttributeType::Map(_, _))
        {
            return Err(CatalogError::InvalidTypeDefinition(format!(
                "attribute '{}.{}' has multiplicity {} but type {} is not a collection",
                owner, definition.name, multiplicity, data_type
            )));
        }
        if definition.is_composite && !data_type.is_edge() {
            return Err(CatalogError::InvalidTypeDefinition(format!(
                "composite attribute '{}.{}' must refer to a class or struct, not {}",
                owner, definition.name, data_type
            )));
        }
        if multiplicity.is_unique && (multiplicity.is_many() || data_type.is_edge()) {
            warn!(
                "isUnique on '{}.{}' ({}) is ambiguous; it is enforced as a uniqueness constraint on scalar values only",
                owner, definition.name, data_type
            );
        }
        Ok(AttributeInfo {
            name: definition.name.clone(),
            data_type,
            multiplicity,
            is_composite: definition.is_composite,
            reverse_attribute_name: definition.reverse_attribute_name.clone(),
            declaring_type: owner.to_string(),
        })
    }

    fn build_enums(&mut self, defs: &TypesDef) -> Result<()> {
        for definition in &defs.enum_types {
            let enum_type = EnumType::new(definition)?;
            self.finish(DataType::Enum(enum_type));
        }
        Ok(())
    }

    fn build_structs(&mut self, defs: &TypesDef) -> Result<()> {
        for definition in &defs.struct_types {
            let mut field_mapping = FieldMapping::new();
            for attribute in &definition.attribute_definitions {
                let info = self.attribute(&definition.type_name, attribute)?;
                field_mapping.declare(&definition.type_name, info)?;
            }
            self.finish(DataType::Struct(StructType {
                name: definition.type_name.clone(),
                field_mapping: Arc::new(field_mapping),
            }));
        }
        Ok(())
    }

    fn build_hierarchical(&mut self, category: TypeCategory, name: &str) -> Result<()> {
        if self.catalog.contains(category, name) {
            return Ok(());
        }
        let definition = match category {
            TypeCategory::Trait => self.traits.get(name).copied(),
            _ => self.classes.get(name).copied(),
        };
        let Some(definition) = definition else {
            return Err(CatalogError::UnresolvedReference {
                type_name: name.to_string(),
                attribute: "superTypes".to_string(),
                referenced: name.to_string(),
            });
        };
        if !self.visiting.insert((category, name.to_string())) {
            return Err(CatalogError::InvalidTypeDefinition(format!(
                "{} '{}' inherits from itself",
                category, name
            )));
        }
        let mut field_mapping = FieldMapping::new();
        let mut all_super_types = BTreeSet::new();
        for super_type in &definition.super_types {
            let known = self.catalog.contains(category, super_type)
                || match category {
                    TypeCategory::Trait => self.traits.contains_key(super_type.as_str()),
                    _ => self.classes.contains_key(super_type.as_str()),
                };
            if !known {
                return Err(CatalogError::UnresolvedReference {
                    type_name: name.to_string(),
                    attribute: "superTypes".to_string(),
                    referenced: super_type.clone(),
                });
            }
            self.build_hierarchical(category, super_type)?;
            let Some(parent) = self.catalog.get(category, super_type).and_then(|t| t.as_hierarchical()) else {
                continue;
            };
            all_super_types.insert(parent.name.clone());
            all_super_types.extend(parent.all_super_types.iter().cloned());
            for attribute in parent.field_mapping.iter() {
                field_mapping.inherit(name, attribute)?;
            }
        }
        for attribute in &definition.attribute_definitions {
            let info = self.attribute(name, attribute)?;
            field_mapping.declare(name, info)?;
        }
        let resolved = HierarchicalType {
            name: name.to_string(),
            category,
            super_types: definition.super_types.clone(),
            all_super_types,
            field_mapping: Arc::new(field_mapping),
        };
        self.visiting.remove(&(category, name.to_string()));
        self.finish(match category {
            TypeCategory::Trait => DataType::Trait(resolved),
            _ => DataType::Class(resolved),
        });
        Ok(())
    }

    fn finish(&mut self, data_type: DataType) {
        self.defined.push((data_type.category(), data_type.name()));
        self.catalog.insert(data_type);
    }

    fn check_reverse_attributes(&self) {
        for (category, name) in &self.defined {
            let Some(field_mapping) = self.catalog.get(*category, name).and_then(|t| t.field_mapping()) else {
                continue;
            };
            for attribute in field_mapping.iter() {
                let Some(reverse) = &attribute.reverse_attribute_name else {
                    continue;
                };
                let found = attribute
                    .data_type
                    .target_name()
                    .and_then(|target| self.catalog.hierarchical(target))
                    .map(|target| target.field_mapping.contains(reverse))
                    .unwrap_or(false);
                if !found {
                    warn!(
                        "reverse attribute '{}' of '{}.{}' does not exist on {}",
                        reverse, name, attribute.name, attribute.data_type
                    );
                }
            }
        }
    }

    fn build(mut self, defs: &TypesDef) -> Result<(TypeCatalog, Vec<DataType>)> {
        self.build_enums(defs)?;
        self.build_structs(defs)?;
        for definition in &defs.trait_types {
            self.build_hierarchical(TypeCategory::Trait, &definition.type_name)?;
        }
        for definition in &defs.class_types {
            self.build_hierarchical(TypeCategory::Class, &definition.type_name)?;
        }
        self.check_reverse_attributes();
        // report in the order the batch listed them
        let defined = defs
            .keys()
            .into_iter()
            .filter_map(|(category, name)| self.catalog.get(category, &name).cloned())
            .collect();
        Ok((self.catalog, defined))
    }
}

// ------------- Registry -------------
#[derive(Debug, Default)]
pub struct TypeRegistry {
    catalog: RwLock<Arc<TypeCatalog>>,
}
impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }
    /// The current catalog; later definitions are not visible through it.
    pub fn snapshot(&self) -> Result<Arc<TypeCatalog>> {
        Ok(Arc::clone(&*self.catalog.read()?))
    }
    /// Defines one batch of types, returning them in definition order.
    pub fn define_types(&self, defs: &TypesDef) -> Result<Vec<DataType>> {
        self.define_types_committing(defs, |_| Ok(()))
    }
    /// Defines one batch, calling `commit` with the batch after it has been
    /// validated and before it becomes visible. An error from `commit`
    /// abandons the batch.
    pub fn define_types_committing<F>(&self, defs: &TypesDef, commit: F) -> Result<Vec<DataType>>
    where
        F: FnOnce(&TypesDef) -> Result<()>,
    {
        let mut guard = self.catalog.write()?;
        let builder = BatchBuilder::new(TypeCatalog::clone(&guard), defs)?;
        let (catalog, defined) = builder.build(defs)?;
        commit(defs)?;
        *guard = Arc::new(catalog);
        info!(
            "Defined {} types: {}",
            defined.len(),
            defined.iter().map(|t| t.name()).collect::<Vec<_>>().join(", ")
        );
        Ok(defined)
    }
    pub fn get_type(&self, category: TypeCategory, name: &str) -> Result<DataType> {
        self.snapshot()?
            .get(category, name)
            .cloned()
            .ok_or_else(|| CatalogError::TypeNotFound {
                category: Some(category),
                name: name.to_string(),
            })
    }
    pub fn get_data_type(&self, name: &str) -> Result<DataType> {
        self.snapshot()?.get_data_type(name)
    }
    /// Names of every enum, struct, trait and class.
    pub fn type_names(&self) -> Result<Vec<String>> {
        let catalog = self.snapshot()?;
        // one entry per name, even when categories share it
        let mut seen = HashSet::new();
        Ok(catalog.iter().map(|t| t.name()).filter(|name| seen.insert(name.clone())).collect())
    }
    pub fn trait_names(&self) -> Result<Vec<String>> {
        Ok(self.snapshot()?.names(TypeCategory::Trait))
    }
    pub fn class_names(&self) -> Result<Vec<String>> {
        Ok(self.snapshot()?.names(TypeCategory::Class))
    }
    pub fn is_registered(&self, name: &str) -> Result<bool> {
        Ok(self.snapshot()?.category_of(name).is_some())
    }
    /// Forgets every type. Meant for tests that reuse a registry.
    pub fn reset(&self) -> Result<()> {
        let mut guard = self.catalog.write()?;
        *guard = Arc::new(TypeCatalog::new());
        debug!("Type registry reset");
        Ok(())
    }
}
