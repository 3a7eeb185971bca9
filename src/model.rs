//! Optional automatic labeler whose votes join the human ones.

use crate::labels::{Label, LabelSpace};
use crate::objects::Objects;

#[derive(Debug, thiserror::Error)]
pub enum ModelContractError {
    #[error("model returned {actual} labels for {expected} inputs")]
    WrongCardinality { expected: usize, actual: usize },
    #[error("model returned label '{label}' outside the label space ({known})")]
    UnknownLabel { label: String, known: String },
    #[error("model failed: {0}")]
    Failed(String),
}

#[async_trait::async_trait]
pub trait ModelLabeler: Send + Sync {
    /// Worker id the model's votes are attributed to.
    fn worker_id(&self) -> &str;

    /// One label per input, in input order.
    async fn label(&self, batch: &[Objects]) -> Result<Vec<Label>, ModelContractError>;
}

/// Call the model and enforce its output contract.
pub async fn label_checked(
    model: &dyn ModelLabeler,
    space: &LabelSpace,
    batch: &[Objects],
) -> Result<Vec<Label>, ModelContractError> {
    if batch.is_empty() {
        return Ok(Vec::new());
    }
    let labels = model.label(batch).await?;
    if labels.len() != batch.len() {
        return Err(ModelContractError::WrongCardinality {
            expected: batch.len(),
            actual: labels.len(),
        });
    }
    if let Some(bad) = labels.iter().find(|l| !space.contains(l)) {
        return Err(ModelContractError::UnknownLabel {
            label: bad.to_string(),
            known: space.describe(),
        });
    }
    Ok(labels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::ObjectValue;

    struct Fixed(Vec<&'static str>);

    #[async_trait::async_trait]
    impl ModelLabeler for Fixed {
        fn worker_id(&self) -> &str {
            "model"
        }

        async fn label(&self, _batch: &[Objects]) -> Result<Vec<Label>, ModelContractError> {
            Ok(self.0.iter().map(|l| Label::new(*l)).collect())
        }
    }

    fn batch(n: usize) -> Vec<Objects> {
        (0..n)
            .map(|i| Objects::new(vec![ObjectValue::text(format!("item {i}"))]))
            .collect()
    }

    #[tokio::test]
    async fn contract_rejects_wrong_cardinality() {
        let space = LabelSpace::new(["yes", "no"]).unwrap();
        let err = label_checked(&Fixed(vec!["yes"]), &space, &batch(2))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ModelContractError::WrongCardinality {
                expected: 2,
                actual: 1
            }
        ));
    }

    #[tokio::test]
    async fn contract_rejects_labels_outside_space() {
        let space = LabelSpace::new(["yes", "no"]).unwrap();
        let err = label_checked(&Fixed(vec!["yes", "maybe"]), &space, &batch(2))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("maybe"));
    }

    #[tokio::test]
    async fn valid_output_passes_through() {
        let space = LabelSpace::new(["yes", "no"]).unwrap();
        let labels = label_checked(&Fixed(vec!["no", "yes"]), &space, &batch(2))
            .await
            .unwrap();
        assert_eq!(labels, vec![Label::new("no"), Label::new("yes")]);
    }
}
