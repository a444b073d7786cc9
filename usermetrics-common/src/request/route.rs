//! Route parsing: canonical identifier back into a signature

use super::{RequestSignature, SignatureSchema};
use crate::{Error, Result};
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};
use tracing::debug;

/// Escaped in path segments. `&` and `~` stay readable in cohort expressions.
const SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'?')
    .add(b'<')
    .add(b'>')
    .add(b'`')
    .add(b'{')
    .add(b'}');

/// Escaped in query parameter names and values
const QUERY: &AsciiSet = &SEGMENT.add(b'&').add(b'=').add(b'+');

pub(crate) fn encode_segment(value: &str) -> String {
    utf8_percent_encode(value, SEGMENT).to_string()
}

pub(crate) fn encode_query(value: &str) -> String {
    utf8_percent_encode(value, QUERY).to_string()
}

fn decode(value: &str) -> Result<String> {
    percent_decode_str(value)
        .decode_utf8()
        .map(|decoded| decoded.into_owned())
        .map_err(|e| Error::InvalidInput(format!("bad escape in {:?}: {}", value, e)))
}

pub(super) fn parse_route(
    schema: &SignatureSchema,
    route: &str,
    root: &str,
) -> Result<RequestSignature> {
    let rest = route
        .strip_prefix(root)
        .filter(|rest| rest.is_empty() || rest.starts_with('/') || rest.starts_with('?'))
        .ok_or_else(|| {
            Error::InvalidInput(format!("route {:?} is not under {:?}", route, root))
        })?;

    let (path, query) = match rest.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (rest, None),
    };

    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    let base: Vec<_> = schema.base_fields().collect();
    if segments.len() != base.len() {
        return Err(Error::InvalidInput(format!(
            "route {:?} has {} path segments, expected {}",
            route,
            segments.len(),
            base.len()
        )));
    }

    let mut signature = RequestSignature::new();
    for (field, value) in base.into_iter().zip(segments) {
        signature.set(field.name.clone(), decode(value)?);
    }

    for pair in query.into_iter().flat_map(|q| q.split('&')) {
        if pair.is_empty() {
            continue;
        }
        let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
        let name = decode(name)?;
        match schema.field(&name) {
            Some(field) if !field.required => signature.set(name, decode(value)?),
            _ => debug!("Ignoring query parameter '{}' not in signature schema", name),
        }
    }

    Ok(signature)
}
