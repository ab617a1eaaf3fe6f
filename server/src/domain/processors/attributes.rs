//! Resource attribute actions

use super::{Processor, ProcessorError};
use crate::core::config::{AttributeActionKind, AttributesConfig};
use crate::domain::batch::Batch;

pub struct AttributesProcessor {
    config: AttributesConfig,
}

impl AttributesProcessor {
    pub fn new(config: AttributesConfig) -> Self {
        Self { config }
    }
}

impl Processor for AttributesProcessor {
    fn name(&self) -> &'static str {
        "attributes"
    }

    fn process(&self, mut batch: Batch) -> Result<Option<Batch>, ProcessorError> {
        for action in &self.config.actions {
            let present = batch.attributes().contains(&action.key);
            match action.action {
                AttributeActionKind::Insert if present => {}
                AttributeActionKind::Update if !present => {}
                AttributeActionKind::Insert
                | AttributeActionKind::Update
                | AttributeActionKind::Upsert => {
                    // Validation guarantees a value for setting actions
                    if let Some(value) = &action.value {
                        batch.set_attribute(&action.key, value.clone());
                    }
                }
                AttributeActionKind::Delete => {
                    batch.remove_attribute(&action.key);
                }
                AttributeActionKind::Require => {
                    if !present {
                        return Err(ProcessorError::MissingAttribute {
                            key: action.key.clone(),
                        });
                    }
                }
            }
        }
        Ok(Some(batch))
    }
}
