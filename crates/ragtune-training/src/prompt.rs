//! Context-grounded QA prompt template.

use crate::dataset::QaRecord;

/// Render one record as a training text blob.
///
/// An empty context keeps its header with an empty body.
#[must_use]
pub fn format_prompt(record: &QaRecord) -> String {
    format!(
        "### Context:\n{}\n\n### Question:\nUsing only the context above, {}\n\n### Response:\n{}\n",
        record.context, record.instruction, record.response
    )
}

/// Stateless formatter handed to the trainer.
pub trait PromptFormatter: Send + Sync {
    fn format(&self, record: &QaRecord) -> String;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ContextQaFormatter;

impl PromptFormatter for ContextQaFormatter {
    fn format(&self, record: &QaRecord) -> String {
        format_prompt(record)
    }
}
