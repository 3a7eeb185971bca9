//! Task input model: object values, the `Objects` tuple and its stable `TaskId`.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Closed set of object kinds a task field may hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectKind {
    Text,
    Image,
    Audio,
    Video,
    Bool,
    Int,
}

/// Fixed capability flags per object kind.
pub trait Capabilities {
    /// Whether values of this kind reference external media.
    fn is_media(&self) -> bool;
}

impl Capabilities for ObjectKind {
    fn is_media(&self) -> bool {
        match self {
            ObjectKind::Image | ObjectKind::Audio | ObjectKind::Video => true,
            ObjectKind::Text | ObjectKind::Bool | ObjectKind::Int => false,
        }
    }
}

impl ObjectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::Text => "text",
            ObjectKind::Image => "image",
            ObjectKind::Audio => "audio",
            ObjectKind::Video => "video",
            ObjectKind::Bool => "bool",
            ObjectKind::Int => "int",
        }
    }
}

/// A single task input value. Media variants hold a URL or storage reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ObjectValue {
    Text(String),
    Image(String),
    Audio(String),
    Video(String),
    Bool(bool),
    Int(i64),
}

impl ObjectValue {
    pub fn kind(&self) -> ObjectKind {
        match self {
            ObjectValue::Text(_) => ObjectKind::Text,
            ObjectValue::Image(_) => ObjectKind::Image,
            ObjectValue::Audio(_) => ObjectKind::Audio,
            ObjectValue::Video(_) => ObjectKind::Video,
            ObjectValue::Bool(_) => ObjectKind::Bool,
            ObjectValue::Int(_) => ObjectKind::Int,
        }
    }

    pub fn text(value: impl Into<String>) -> Self {
        ObjectValue::Text(value.into())
    }

    pub fn audio(reference: impl Into<String>) -> Self {
        ObjectValue::Audio(reference.into())
    }

    pub fn image(reference: impl Into<String>) -> Self {
        ObjectValue::Image(reference.into())
    }
}

impl Capabilities for ObjectValue {
    fn is_media(&self) -> bool {
        self.kind().is_media()
    }
}

/// Stable identity of an `Objects` tuple.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short prefix for log lines.
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Ordered, immutable tuple of values forming one task's input.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Objects(Vec<ObjectValue>);

impl Objects {
    pub fn new(values: Vec<ObjectValue>) -> Self {
        Self(values)
    }

    pub fn values(&self) -> &[ObjectValue] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<&ObjectValue> {
        self.0.get(idx)
    }

    pub fn kinds(&self) -> Vec<ObjectKind> {
        self.0.iter().map(ObjectValue::kind).collect()
    }

    pub fn has_media(&self) -> bool {
        self.0.iter().any(Capabilities::is_media)
    }

    /// Copy of this tuple with positions `a` and `b` exchanged.
    pub fn with_swapped(&self, a: usize, b: usize) -> Self {
        let mut values = self.0.clone();
        if a < values.len() && b < values.len() {
            values.swap(a, b);
        }
        Self(values)
    }

    /// blake3 over a length-prefixed encoding of every (kind, value) pair.
    ///
    /// Depends only on the tuple contents, never on vote history.
    pub fn task_id(&self) -> TaskId {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&(self.0.len() as u64).to_le_bytes());
        for value in &self.0 {
            hasher.update(value.kind().as_str().as_bytes());
            hasher.update(b"\x1f");
            let encoded = match value {
                ObjectValue::Text(s)
                | ObjectValue::Image(s)
                | ObjectValue::Audio(s)
                | ObjectValue::Video(s) => s.clone(),
                ObjectValue::Bool(b) => b.to_string(),
                ObjectValue::Int(i) => i.to_string(),
            };
            hasher.update(&(encoded.len() as u64).to_le_bytes());
            hasher.update(encoded.as_bytes());
        }
        TaskId(hasher.finalize().to_hex().to_string())
    }
}

impl From<Vec<ObjectValue>> for Objects {
    fn from(values: Vec<ObjectValue>) -> Self {
        Self(values)
    }
}
