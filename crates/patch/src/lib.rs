//! Canonical object encoding and RFC 7386 merge-patch computation.
//!
//! Objects are diffed on their canonical JSON encoding rather than on
//! structural equality, so a transform that reproduces the current state
//! (possibly with a different field order) yields an empty patch.

#![forbid(unsafe_code)]

use serde::Serialize;
use serde_json::{Map, Value as Json};

/// The literal empty merge-patch document.
pub const EMPTY_PATCH: &[u8] = b"{}";

#[derive(Debug, thiserror::Error)]
pub enum PatchError {
    #[error("encoding object: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("decoding document: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("merge patch requires JSON objects on both sides (got {original} and {modified})")]
    NotAnObject { original: &'static str, modified: &'static str },
}

/// Serialize `obj` to its canonical JSON bytes.
///
/// Going through [`serde_json::Value`] sorts object keys, so two values that
/// differ only in field order encode identically.
pub fn canonical<T: Serialize + ?Sized>(obj: &T) -> Result<Vec<u8>, PatchError> {
    let v = serde_json::to_value(obj).map_err(PatchError::Encode)?;
    serde_json::to_vec(&v).map_err(PatchError::Encode)
}

/// Compute the merge patch that turns `original` into `modified`.
///
/// Both inputs are JSON documents whose top level is an object. Returns the
/// serialized patch; `{}` when nothing differs.
pub fn create_merge_patch(original: &[u8], modified: &[u8]) -> Result<Vec<u8>, PatchError> {
    let orig: Json = serde_json::from_slice(original).map_err(PatchError::Decode)?;
    let modi: Json = serde_json::from_slice(modified).map_err(PatchError::Decode)?;
    let patch = match (&orig, &modi) {
        (Json::Object(o), Json::Object(m)) => diff_objects(o, m),
        (o, m) => return Err(PatchError::NotAnObject { original: type_name(o), modified: type_name(m) }),
    };
    serde_json::to_vec(&Json::Object(patch)).map_err(PatchError::Encode)
}

/// True for the zero-length document and for `{}`.
pub fn is_empty_patch(patch: &[u8]) -> bool {
    patch.is_empty() || patch == EMPTY_PATCH
}

fn diff_objects(orig: &Map<String, Json>, modi: &Map<String, Json>) -> Map<String, Json> {
    let mut out = Map::new();
    for (k, mv) in modi.iter() {
        match (orig.get(k), mv) {
            (None, _) => {
                out.insert(k.clone(), mv.clone());
            }
            (Some(ov), _) if ov == mv => {}
            (Some(Json::Object(oo)), Json::Object(mo)) => {
                let sub = diff_objects(oo, mo);
                if !sub.is_empty() {
                    out.insert(k.clone(), Json::Object(sub));
                }
            }
            // Scalars, arrays and type changes are replaced wholesale
            (Some(_), _) => {
                out.insert(k.clone(), mv.clone());
            }
        }
    }
    for k in orig.keys() {
        if !modi.contains_key(k) {
            out.insert(k.clone(), Json::Null);
        }
    }
    out
}

fn type_name(v: &Json) -> &'static str {
    match v {
        Json::Null => "null",
        Json::Bool(_) => "bool",
        Json::Number(_) => "number",
        Json::String(_) => "string",
        Json::Array(_) => "array",
        Json::Object(_) => "object",
    }
}
