use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::payload::FieldKind;
use crate::error::CoreError;

fn default_required() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct FieldSpec {
    pub name: String,
    #[serde(default)]
    pub kind: FieldKind,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default = "default_required")]
    pub required: bool,
    #[serde(default)]
    pub description: Option<String>,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            aliases: Vec::new(),
            required: true,
            description: None,
        }
    }

    pub fn with_aliases<I, S>(mut self, aliases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.aliases.extend(aliases.into_iter().map(Into::into));
        self
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct CategorySpec {
    pub name: String,
    #[serde(default)]
    pub fields: Vec<FieldSpec>,
}

impl CategorySpec {
    pub fn new(name: impl Into<String>, fields: Vec<FieldSpec>) -> Self {
        Self {
            name: name.into(),
            fields,
        }
    }
}

/// The closed set of categories and fields extracted data is arranged into.
///
/// Loaded from configuration. Field names and aliases are matched after
/// [`normalize_field_name`], so `Total Revenue`, `total_revenue` and
/// `TotalRevenue` all resolve to the same field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct Taxonomy {
    pub categories: Vec<CategorySpec>,
}

impl Default for Taxonomy {
    fn default() -> Self {
        use FieldKind::*;
        Self {
            categories: vec![
                CategorySpec::new(
                    "Income Statement",
                    vec![
                        FieldSpec::new("revenue", Currency)
                            .with_aliases(["total revenue", "sales", "net sales", "turnover"]),
                        FieldSpec::new("operating_income", Currency)
                            .with_aliases(["operating profit", "ebit"]),
                        FieldSpec::new("net_income", Currency)
                            .with_aliases(["net profit", "profit after tax", "net earnings"]),
                    ],
                ),
                CategorySpec::new(
                    "Balance Sheet",
                    vec![
                        FieldSpec::new("total_assets", Currency).with_aliases(["assets"]),
                        FieldSpec::new("total_liabilities", Currency)
                            .with_aliases(["liabilities"]),
                        FieldSpec::new("shareholders_equity", Currency)
                            .with_aliases(["total equity", "equity"]),
                    ],
                ),
                CategorySpec::new(
                    "Cash Flow",
                    vec![
                        FieldSpec::new("operating_cash_flow", Currency)
                            .with_aliases(["cash from operations"]),
                        FieldSpec::new("free_cash_flow", Currency).optional(),
                    ],
                ),
            ],
        }
    }
}

impl Taxonomy {
    pub fn new(categories: Vec<CategorySpec>) -> Self {
        Self { categories }
    }

    pub fn field_count(&self) -> usize {
        self.categories.iter().map(|c| c.fields.len()).sum()
    }

    /// Reject empty taxonomies, duplicate category names and any field name
    /// or alias that would resolve to more than one field.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.categories.is_empty() {
            return Err(CoreError::InvalidTaxonomy("no categories declared".into()));
        }
        let mut categories = HashMap::new();
        for category in &self.categories {
            if category.name.trim().is_empty() {
                return Err(CoreError::InvalidTaxonomy("category with empty name".into()));
            }
            if categories.insert(category.name.as_str(), ()).is_some() {
                return Err(CoreError::InvalidTaxonomy(format!(
                    "category '{}' declared twice",
                    category.name
                )));
            }
        }

        let mut owners: HashMap<String, (usize, usize)> = HashMap::new();
        for (ci, category) in self.categories.iter().enumerate() {
            for (fi, field) in category.fields.iter().enumerate() {
                let keys = std::iter::once(&field.name).chain(field.aliases.iter());
                for key in keys {
                    let normalized = normalize_field_name(key);
                    if normalized.is_empty() {
                        return Err(CoreError::InvalidTaxonomy(format!(
                            "empty field name or alias in '{}'",
                            category.name
                        )));
                    }
                    if let Some((oc, of)) = owners.insert(normalized, (ci, fi)) {
                        if (oc, of) != (ci, fi) {
                            let owner = &self.categories[oc].fields[of].name;
                            return Err(CoreError::InvalidTaxonomy(format!(
                                "'{}' is ambiguous between '{}' and '{}'",
                                key, owner, field.name
                            )));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Build a lookup from normalized name or alias to (category, field)
    /// indices.
    pub fn index(&self) -> HashMap<String, (usize, usize)> {
        let mut index = HashMap::new();
        for (ci, category) in self.categories.iter().enumerate() {
            for (fi, field) in category.fields.iter().enumerate() {
                index
                    .entry(normalize_field_name(&field.name))
                    .or_insert((ci, fi));
                for alias in &field.aliases {
                    index.entry(normalize_field_name(alias)).or_insert((ci, fi));
                }
            }
        }
        index
    }

    pub fn resolve(&self, name: &str) -> Option<(&CategorySpec, &FieldSpec)> {
        let wanted = normalize_field_name(name);
        self.categories.iter().find_map(|category| {
            category
                .fields
                .iter()
                .find(|field| {
                    normalize_field_name(&field.name) == wanted
                        || field
                            .aliases
                            .iter()
                            .any(|alias| normalize_field_name(alias) == wanted)
                })
                .map(|field| (category, field))
        })
    }
}

/// Lowercase, split camelCase, and collapse every run of non-alphanumeric
/// characters into a single underscore.
pub fn normalize_field_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut prev_lower = false;
    let mut pending_sep = false;
    for ch in name.chars() {
        if ch.is_alphanumeric() {
            if ch.is_uppercase() && prev_lower {
                pending_sep = true;
            }
            if pending_sep && !out.is_empty() {
                out.push('_');
            }
            pending_sep = false;
            prev_lower = ch.is_lowercase() || ch.is_numeric();
            out.extend(ch.to_lowercase());
        } else {
            pending_sep = true;
            prev_lower = false;
        }
    }
    out
}
