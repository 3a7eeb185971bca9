//! Closed label spaces, including spaces combined from several questions.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// One answer value from a task type's closed label space.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Label(String);

impl Label {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Label {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for Label {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// A question with its own answer enumeration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Question {
    pub id: String,
    pub answers: Vec<String>,
}

impl Question {
    pub fn new(id: impl Into<String>, answers: &[&str]) -> Self {
        Self {
            id: id.into(),
            answers: answers.iter().map(|a| a.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LabelError {
    #[error("label space must contain at least one label")]
    Empty,
    #[error("duplicate label in label space: {0}")]
    Duplicate(String),
    #[error("question '{0}' has no answers")]
    EmptyQuestion(String),
    #[error("label '{label}' is not part of the label space ({known})")]
    Unknown { label: String, known: String },
}

/// Separator between question id and answer in combined labels.
pub const COMBINED_SEPARATOR: &str = ":";

#[derive(Debug, Clone, PartialEq, Eq)]
struct Origin {
    question: usize,
    answer: String,
}

/// Serialized form: either a flat label list or a list of questions to combine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LabelSpaceSpec {
    Flat { labels: Vec<String> },
    Combined { questions: Vec<Question> },
}

/// Immutable, ordered enumeration of labels.
///
/// Combined spaces keep a lookup table from every label back to the question it
/// was synthesized from. The table is built once and never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "LabelSpaceSpec", into = "LabelSpaceSpec")]
pub struct LabelSpace {
    labels: Vec<Label>,
    index: HashMap<Label, usize>,
    questions: Vec<Question>,
    origin: Vec<Option<Origin>>,
}

impl LabelSpace {
    pub fn new<I, S>(labels: I) -> Result<Self, LabelError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let labels: Vec<Label> = labels.into_iter().map(|s| Label::new(s)).collect();
        let origin = vec![None; labels.len()];
        Self::build(labels, Vec::new(), origin)
    }

    /// Build one label space holding every (question, answer) pair as its own label.
    pub fn combine(questions: &[Question]) -> Result<Self, LabelError> {
        let mut labels = Vec::new();
        let mut origin = Vec::new();
        for (q_idx, question) in questions.iter().enumerate() {
            if question.answers.is_empty() {
                return Err(LabelError::EmptyQuestion(question.id.clone()));
            }
            for answer in &question.answers {
                labels.push(Label::new(format!(
                    "{}{COMBINED_SEPARATOR}{}",
                    question.id, answer
                )));
                origin.push(Some(Origin {
                    question: q_idx,
                    answer: answer.clone(),
                }));
            }
        }
        Self::build(labels, questions.to_vec(), origin)
    }

    fn build(
        labels: Vec<Label>,
        questions: Vec<Question>,
        origin: Vec<Option<Origin>>,
    ) -> Result<Self, LabelError> {
        if labels.is_empty() {
            return Err(LabelError::Empty);
        }
        let mut index = HashMap::with_capacity(labels.len());
        for (idx, label) in labels.iter().enumerate() {
            if index.insert(label.clone(), idx).is_some() {
                return Err(LabelError::Duplicate(label.0.clone()));
            }
        }
        Ok(Self {
            labels,
            index,
            questions,
            origin,
        })
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn labels(&self) -> &[Label] {
        &self.labels
    }

    pub fn contains(&self, label: &Label) -> bool {
        self.index.contains_key(label)
    }

    pub fn index_of(&self, label: &Label) -> Option<usize> {
        self.index.get(label).copied()
    }

    pub fn label(&self, idx: usize) -> Option<&Label> {
        self.labels.get(idx)
    }

    pub fn is_combined(&self) -> bool {
        !self.questions.is_empty()
    }

    /// Originating question id of a combined label.
    pub fn question_of(&self, label: &Label) -> Option<&str> {
        let idx = self.index_of(label)?;
        let origin = self.origin[idx].as_ref()?;
        Some(self.questions[origin.question].id.as_str())
    }

    /// Answer part of a combined label.
    pub fn answer_of(&self, label: &Label) -> Option<&str> {
        let idx = self.index_of(label)?;
        self.origin[idx].as_ref().map(|o| o.answer.as_str())
    }

    /// Look up a label by its string form, failing with the known set.
    pub fn parse(&self, raw: &str) -> Result<Label, LabelError> {
        let label = Label::new(raw);
        if self.contains(&label) {
            Ok(label)
        } else {
            Err(LabelError::Unknown {
                label: raw.to_string(),
                known: self.describe(),
            })
        }
    }

    pub fn describe(&self) -> String {
        self.labels
            .iter()
            .map(|l| l.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl TryFrom<LabelSpaceSpec> for LabelSpace {
    type Error = LabelError;

    fn try_from(spec: LabelSpaceSpec) -> Result<Self, Self::Error> {
        match spec {
            LabelSpaceSpec::Flat { labels } => LabelSpace::new(labels),
            LabelSpaceSpec::Combined { questions } => LabelSpace::combine(&questions),
        }
    }
}

impl From<LabelSpace> for LabelSpaceSpec {
    fn from(space: LabelSpace) -> Self {
        if space.is_combined() {
            LabelSpaceSpec::Combined {
                questions: space.questions,
            }
        } else {
            LabelSpaceSpec::Flat {
                labels: space.labels.into_iter().map(|l| l.0).collect(),
            }
        }
    }
}
