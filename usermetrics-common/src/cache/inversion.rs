//! Key path inversion: rebuild a canonical route from stored cache keys

use crate::request::{encode_query, encode_segment, split_composite_key, SignatureSchema};
use crate::{Error, Result};

/// Compose a route from a key path.
///
/// Base-field values become path segments under `root` and optional fields
/// become `field=value` query parameters, each in schema order. Keys whose
/// field is not in the schema are ignored. Values are percent-escaped so
/// [`RequestSignature::from_route`](crate::RequestSignature::from_route)
/// reads back the stored values.
pub fn route_from_keys(schema: &SignatureSchema, keys: &[String], root: &str) -> Result<String> {
    let mut segments: Vec<(usize, &str)> = Vec::new();
    let mut params: Vec<(usize, &str, &str)> = Vec::new();

    for key in keys {
        let (field, value) = split_composite_key(key)
            .ok_or_else(|| Error::InvalidInput(format!("malformed cache key {:?}", key)))?;
        let Some(position) = schema.position(field) else {
            continue;
        };
        if schema.fields()[position].required {
            segments.push((position, value));
        } else {
            params.push((position, field, value));
        }
    }

    if segments.is_empty() {
        return Err(Error::InvalidInput(
            "key path has no base fields to build a route from".to_string(),
        ));
    }

    segments.sort_by_key(|(position, _)| *position);
    params.sort_by_key(|(position, _, _)| *position);

    let mut route = root.trim_end_matches('/').to_string();
    for (_, value) in segments {
        route.push('/');
        route.push_str(&encode_segment(value));
    }

    if !params.is_empty() {
        let query: Vec<String> = params
            .into_iter()
            .map(|(_, field, value)| format!("{}={}", encode_query(field), encode_query(value)))
            .collect();
        route.push('?');
        route.push_str(&query.join("&"));
    }

    Ok(route)
}
