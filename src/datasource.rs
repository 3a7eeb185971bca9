//! JSONL input rows parsed against a task specification.
//!
//! Each line is a JSON object with one key per input field and an optional
//! label key holding a known answer (ground truth or golden).

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::labels::{Label, LabelSpace};
use crate::objects::{ObjectKind, ObjectValue, Objects};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub kind: ObjectKind,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, kind: ObjectKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

fn default_label_field() -> String {
    "label".to_string()
}

/// Input field kinds plus the closed label space of a task type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub inputs: Vec<FieldSpec>,
    pub labels: LabelSpace,
    #[serde(default = "default_label_field")]
    pub label_field: String,
}

impl TaskSpec {
    pub fn new(inputs: Vec<FieldSpec>, labels: LabelSpace) -> Self {
        Self {
            inputs,
            labels,
            label_field: default_label_field(),
        }
    }

    pub fn kinds(&self) -> Vec<ObjectKind> {
        self.inputs.iter().map(|f| f.kind).collect()
    }

    /// Human-readable row schema for error messages.
    pub fn schema(&self) -> String {
        let mut parts: Vec<String> = self
            .inputs
            .iter()
            .map(|f| format!("\"{}\": {}", f.name, f.kind.as_str()))
            .collect();
        parts.push(format!(
            "\"{}\"?: one of [{}]",
            self.label_field,
            self.labels.describe()
        ));
        format!("{{{}}}", parts.join(", "))
    }

    pub fn matches(&self, objects: &Objects) -> bool {
        objects.kinds() == self.kinds()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DataError {
    #[error("line {line}: {message}; expected {schema}")]
    Row {
        line: usize,
        message: String,
        schema: String,
    },
    #[error("failed to read rows: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub objects: Objects,
    pub label: Option<Label>,
}

pub fn read_rows(spec: &TaskSpec, path: impl AsRef<Path>) -> Result<Vec<Row>, DataError> {
    let file = File::open(path)?;
    parse_rows(spec, BufReader::new(file))
}

/// Parse every non-blank line; stops at the first malformed row.
pub fn parse_rows(spec: &TaskSpec, reader: impl BufRead) -> Result<Vec<Row>, DataError> {
    let mut rows = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let row = parse_row(spec, &line).map_err(|message| DataError::Row {
            line: idx + 1,
            message,
            schema: spec.schema(),
        })?;
        rows.push(row);
    }
    Ok(rows)
}

fn parse_row(spec: &TaskSpec, line: &str) -> Result<Row, String> {
    let value: Value = serde_json::from_str(line).map_err(|e| format!("invalid JSON: {e}"))?;
    let Value::Object(map) = value else {
        return Err("row is not a JSON object".to_string());
    };

    let mut values = Vec::with_capacity(spec.inputs.len());
    for field in &spec.inputs {
        let raw = map
            .get(&field.name)
            .ok_or_else(|| format!("missing field '{}'", field.name))?;
        values.push(parse_value(field, raw)?);
    }

    let label = match map.get(&spec.label_field) {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(spec.labels.parse(s).map_err(|e| e.to_string())?),
        Some(other) => {
            return Err(format!(
                "field '{}' must be a string, got {other}",
                spec.label_field
            ))
        }
    };

    Ok(Row {
        objects: Objects::new(values),
        label,
    })
}

fn parse_value(field: &FieldSpec, raw: &Value) -> Result<ObjectValue, String> {
    let wrong = || {
        format!(
            "field '{}' must be {}, got {raw}",
            field.name,
            field.kind.as_str()
        )
    };
    let value = match field.kind {
        ObjectKind::Text => ObjectValue::Text(raw.as_str().ok_or_else(wrong)?.to_string()),
        ObjectKind::Image => ObjectValue::Image(raw.as_str().ok_or_else(wrong)?.to_string()),
        ObjectKind::Audio => ObjectValue::Audio(raw.as_str().ok_or_else(wrong)?.to_string()),
        ObjectKind::Video => ObjectValue::Video(raw.as_str().ok_or_else(wrong)?.to_string()),
        ObjectKind::Bool => ObjectValue::Bool(raw.as_bool().ok_or_else(wrong)?),
        ObjectKind::Int => ObjectValue::Int(raw.as_i64().ok_or_else(wrong)?),
    };
    Ok(value)
}
