//! Match specifications for selective dequeue.

use serde_json::{Map, Value};

use super::job::Payload;
use crate::error::QueueError;

/// Selects queued jobs for removal.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchSpec {
    /// Any job of this class.
    Class(String),
    /// The job of this class with this id.
    Id { class: String, id: String },
    /// Jobs of this class whose argument mapping is covered by `args`.
    Args {
        class: String,
        args: Map<String, Value>,
    },
}

impl MatchSpec {
    pub fn class(class: impl Into<String>) -> Self {
        MatchSpec::Class(class.into())
    }

    pub fn id(class: impl Into<String>, id: impl Into<String>) -> Self {
        MatchSpec::Id {
            class: class.into(),
            id: id.into(),
        }
    }

    pub fn args(class: impl Into<String>, args: Map<String, Value>) -> Self {
        MatchSpec::Args {
            class: class.into(),
            args,
        }
    }

    /// Parses the JSON forms: `"Class"`, `{"Class": "id"}` and
    /// `{"Class": {"key": value}}`. An object yields one spec per entry.
    pub fn from_value(value: &Value) -> Result<Vec<MatchSpec>, QueueError> {
        match value {
            Value::String(class) => Ok(vec![MatchSpec::class(class.clone())]),
            Value::Object(entries) => entries
                .iter()
                .map(|(class, target)| match target {
                    Value::String(id) => Ok(MatchSpec::id(class.clone(), id.clone())),
                    Value::Object(args) => Ok(MatchSpec::args(class.clone(), args.clone())),
                    other => Err(QueueError::Validation(format!(
                        "match target for {class} must be an id or an argument mapping, got {other}"
                    ))),
                })
                .collect(),
            Value::Array(items) => {
                let mut specs = Vec::new();
                for item in items {
                    specs.extend(MatchSpec::from_value(item)?);
                }
                Ok(specs)
            }
            other => Err(QueueError::Validation(format!(
                "match spec must be a class name or an object, got {other}"
            ))),
        }
    }

    /// Whether the payload is selected by this spec.
    pub fn matches(&self, payload: &Payload) -> bool {
        match self {
            MatchSpec::Class(class) => payload.class == *class,
            MatchSpec::Id { class, id } => {
                payload.class == *class && payload.id.as_deref() == Some(id.as_str())
            }
            MatchSpec::Args { class, args } => {
                if payload.class != *class {
                    return false;
                }
                let Some(Value::Object(job_args)) = payload.args.first() else {
                    return false;
                };
                !job_args.is_empty()
                    && job_args
                        .iter()
                        .all(|(key, value)| args.get(key) == Some(value))
            }
        }
    }
}

/// First-match test of a raw queued item against `specs`. Items that are
/// not valid payloads never match.
pub fn match_item(item: &str, specs: &[MatchSpec]) -> bool {
    match serde_json::from_str::<Payload>(item) {
        Ok(payload) => specs.iter().any(|spec| spec.matches(&payload)),
        Err(_) => false,
    }
}
