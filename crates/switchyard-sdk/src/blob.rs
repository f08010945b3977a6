// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Blob extraction.
//!
//! Handlers return binary data by embedding [`BlobData`] values anywhere in
//! their result. Before the result is persisted those leaves are lifted out of
//! the tree and uploaded separately, keyed by job id. The inline result keeps a
//! small `{"$blobRef": <name>}` reference in the same position so sibling keys
//! keep their order.

use std::fmt;

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64_STANDARD};
use serde::Serialize;
use serde_json::{Map, Value};

/// Key marking a blob leaf in a result tree.
pub const BLOB_MARKER: &str = "$switchyardBlob";

/// Key of the reference left behind for an extracted blob.
pub const BLOB_REF: &str = "$blobRef";

/// Binary payload a handler places in its result.
#[derive(Clone, PartialEq, Eq)]
pub struct BlobData {
    pub name: String,
    pub mime_type: String,
    pub data: Vec<u8>,
}

impl BlobData {
    pub fn new(name: impl Into<String>, mime_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            mime_type: mime_type.into(),
            data,
        }
    }

    /// JSON leaf that [`extract_blobs`] recognises.
    pub fn into_value(self) -> Value {
        let mut inner = Map::with_capacity(3);
        inner.insert("name".to_string(), Value::String(self.name));
        inner.insert("type".to_string(), Value::String(self.mime_type));
        inner.insert(
            "data".to_string(),
            Value::String(BASE64_STANDARD.encode(&self.data)),
        );

        let mut outer = Map::with_capacity(1);
        outer.insert(BLOB_MARKER.to_string(), Value::Object(inner));
        Value::Object(outer)
    }

    /// Parse a blob leaf. Anything that is not exactly a well-formed leaf is
    /// ordinary content.
    fn from_value(value: &Value) -> Option<Self> {
        let map = value.as_object()?;
        if map.len() != 1 {
            return None;
        }
        let inner = map.get(BLOB_MARKER)?.as_object()?;
        let name = inner.get("name")?.as_str()?;
        let mime_type = inner.get("type")?.as_str()?;
        let data = BASE64_STANDARD.decode(inner.get("data")?.as_str()?).ok()?;
        Some(Self::new(name, mime_type, data))
    }
}

impl fmt::Debug for BlobData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlobData")
            .field("name", &self.name)
            .field("mime_type", &self.mime_type)
            .field("len", &self.data.len())
            .finish()
    }
}

/// One step from a parent value to a child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

/// A blob lifted out of a result, with the location it was taken from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blob {
    pub data: BlobData,
    pub path: Vec<PathSegment>,
}

impl Blob {
    /// Request body for the blob upload endpoint.
    pub fn to_upload(&self) -> BlobUpload {
        BlobUpload {
            name: self.data.name.clone(),
            mime_type: self.data.mime_type.clone(),
            encoding: "base64",
            size: self.data.data.len(),
            data: BASE64_STANDARD.encode(&self.data.data),
        }
    }
}

/// Wire shape of a blob upload.
#[derive(Debug, Clone, Serialize)]
pub struct BlobUpload {
    pub name: String,
    #[serde(rename = "type")]
    pub mime_type: String,
    pub encoding: &'static str,
    pub size: usize,
    pub data: String,
}

/// Result of [`extract_blobs`].
#[derive(Debug, Clone, PartialEq)]
pub struct Extracted {
    /// Content with every blob leaf replaced by a reference.
    pub content: Value,
    /// Extracted blobs in document order.
    pub blobs: Vec<Blob>,
}

/// Lift every blob leaf out of `content`, depth first.
pub fn extract_blobs(content: Value) -> Extracted {
    let mut blobs = Vec::new();
    let mut path = Vec::new();
    let content = walk(content, &mut path, &mut blobs);
    Extracted { content, blobs }
}

fn walk(value: Value, path: &mut Vec<PathSegment>, blobs: &mut Vec<Blob>) -> Value {
    if let Some(data) = BlobData::from_value(&value) {
        let reference = blob_reference(&data.name);
        blobs.push(Blob {
            data,
            path: path.clone(),
        });
        return reference;
    }

    match value {
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (key, child) in map {
                path.push(PathSegment::Key(key.clone()));
                out.insert(key, walk(child, path, blobs));
                path.pop();
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .enumerate()
                .map(|(i, child)| {
                    path.push(PathSegment::Index(i));
                    let child = walk(child, path, blobs);
                    path.pop();
                    child
                })
                .collect(),
        ),
        other => other,
    }
}

fn blob_reference(name: &str) -> Value {
    let mut map = Map::with_capacity(1);
    map.insert(BLOB_REF.to_string(), Value::String(name.to_string()));
    Value::Object(map)
}

/// Put blobs back at the paths they were extracted from.
///
/// Paths that no longer exist in `content` are skipped.
pub fn reinsert_blobs(mut content: Value, blobs: &[Blob]) -> Value {
    for blob in blobs {
        if blob.path.is_empty() {
            content = blob.data.clone().into_value();
            continue;
        }
        if let Some(slot) = slot_mut(&mut content, &blob.path) {
            *slot = blob.data.clone().into_value();
        }
    }
    content
}

fn slot_mut<'a>(root: &'a mut Value, path: &[PathSegment]) -> Option<&'a mut Value> {
    path.iter().try_fold(root, |node, segment| match segment {
        PathSegment::Key(key) => node.as_object_mut()?.get_mut(key),
        PathSegment::Index(i) => node.as_array_mut()?.get_mut(*i),
    })
}
