//! Request signatures
//!
//! A request signature is the set of request parameters that identifies a
//! cacheable unit of work. Field order comes from a [`SignatureSchema`], never
//! from the order in which callers supplied the fields.

use crate::{Error, Result};
use std::collections::BTreeMap;

mod catalog;
mod defaults;
mod route;

pub(crate) use route::{encode_query, encode_segment};

pub use catalog::{accepted_params, restrict_to_metric, COMMON_PARAMS, KNOWN_METRICS};
pub use defaults::{apply_defaults, normalize_date, DATETIME_FORMAT, DEFAULT_INTERVAL_DAYS};

/// Separates field name and value inside a composite cache key,
/// e.g. `"metric <==> threshold"`
pub const KEY_DELIMITER: &str = " <==> ";

/// Base fields of the metrics API, in canonical order
pub const BASE_FIELDS: &[&str] = &["cohort_expr", "metric"];

/// Optional fields of the metrics API, in canonical order
pub const OPTIONAL_FIELDS: &[&str] = &[
    "aggregator",
    "time_series",
    "project",
    "namespace",
    "date_start",
    "date_end",
    "interval",
    "t",
    "n",
    "time_unit",
    "time_unit_count",
    "look_ahead",
    "look_back",
    "threshold_type",
    "restrict",
];

/// One schema entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: String,
    pub required: bool,
}

impl FieldSpec {
    /// A base field: must be present and non-empty
    pub fn base(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            required: true,
        }
    }

    /// An optional field: part of the key path only when present
    pub fn optional(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            required: false,
        }
    }
}

/// Ordered list of signature fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureSchema {
    fields: Vec<FieldSpec>,
}

impl SignatureSchema {
    /// Build a schema, rejecting duplicate or malformed field names and
    /// schemas without any base field.
    pub fn new(fields: Vec<FieldSpec>) -> Result<Self> {
        if !fields.iter().any(|f| f.required) {
            return Err(Error::Config(
                "signature schema needs at least one base field".to_string(),
            ));
        }

        for (i, field) in fields.iter().enumerate() {
            if field.name.is_empty()
                || field.name.contains(KEY_DELIMITER)
                || field.name.contains(['=', '&', '?', '/'])
            {
                return Err(Error::Config(format!(
                    "invalid signature field name {:?}",
                    field.name
                )));
            }
            if fields[..i].iter().any(|f| f.name == field.name) {
                return Err(Error::Config(format!(
                    "duplicate signature field '{}'",
                    field.name
                )));
            }
        }

        Ok(Self { fields })
    }

    /// Schema used by the metrics API
    pub fn metrics_api() -> Self {
        let fields = BASE_FIELDS
            .iter()
            .map(|name| FieldSpec::base(*name))
            .chain(OPTIONAL_FIELDS.iter().map(|name| FieldSpec::optional(*name)))
            .collect();
        Self { fields }
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    pub fn base_fields(&self) -> impl Iterator<Item = &FieldSpec> {
        self.fields.iter().filter(|f| f.required)
    }

    pub fn optional_fields(&self) -> impl Iterator<Item = &FieldSpec> {
        self.fields.iter().filter(|f| !f.required)
    }

    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Position of `name` in schema order
    pub fn position(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    /// Ordered composite keys for `signature`: base fields first, then the
    /// optional fields that are present, each group in schema order.
    ///
    /// Fails with [`Error::InvalidSignature`] when a base field is missing
    /// or empty.
    pub fn key_path(&self, signature: &RequestSignature) -> Result<Vec<String>> {
        let mut keys = Vec::with_capacity(self.fields.len());

        for field in self.base_fields() {
            match signature.present(&field.name) {
                Some(value) => keys.push(composite_key(&field.name, value)),
                None => {
                    return Err(Error::InvalidSignature {
                        field: field.name.clone(),
                    })
                }
            }
        }

        for field in self.optional_fields() {
            if let Some(value) = signature.present(&field.name) {
                keys.push(composite_key(&field.name, value));
            }
        }

        Ok(keys)
    }
}

impl Default for SignatureSchema {
    fn default() -> Self {
        Self::metrics_api()
    }
}

/// `field + KEY_DELIMITER + value`
pub fn composite_key(field: &str, value: &str) -> String {
    format!("{}{}{}", field, KEY_DELIMITER, value)
}

/// Split a composite key back into field name and value
pub fn split_composite_key(key: &str) -> Option<(&str, &str)> {
    key.split_once(KEY_DELIMITER)
}

/// Request parameters as supplied by a caller.
///
/// A field is *supplied* once it has been set, even to an empty string. It
/// is *present* only when supplied with a non-empty value; only present
/// fields take part in key paths.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestSignature {
    fields: BTreeMap<String, String>,
}

impl RequestSignature {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style [`set`](Self::set)
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(name, value);
        self
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.fields.insert(name.into(), value.into());
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.fields.remove(name)
    }

    /// Value as supplied, including empty values
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    /// Value when supplied and non-empty
    pub fn present(&self, name: &str) -> Option<&str> {
        self.get(name).filter(|v| !v.is_empty())
    }

    pub fn is_supplied(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Supplied fields with non-empty values, the ones a key path is built from
    pub fn present_fields(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields().filter(|(_, v)| !v.is_empty())
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Parse a canonical route `<root>/<base>/<base>?<field>=<value>&...`.
    ///
    /// Path segments map to the schema's base fields in order; query
    /// parameters map to optional fields. Unknown query parameters are ignored.
    /// Components are percent-decoded.
    ///
    /// Parsing the route of a cached entry gives back its present fields.
    /// Optional fields that were supplied empty never reach a key path, so
    /// they are not supplied on the parsed signature.
    pub fn from_route(schema: &SignatureSchema, route: &str, root: &str) -> Result<Self> {
        route::parse_route(schema, route, root)
    }
}
