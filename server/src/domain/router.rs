//! Pipeline routing
//!
//! Rules are evaluated in configured order and the first match wins, so every
//! batch lands in exactly one pipeline. Routing only reads the batch's signal
//! kind and resource attributes, which makes it deterministic for a given rule
//! set.

use std::collections::{BTreeMap, HashMap};

use super::batch::{Batch, ResourceAttributes, SignalKind};
use crate::core::config::{PipelineConfig, RoutingConfig};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouteError {
    #[error("no pipeline accepts {kind} batch with attributes [{attributes}]")]
    NoRoute { kind: SignalKind, attributes: String },
}

#[derive(Debug, Clone)]
struct CompiledRule {
    pipeline: String,
    signal: Option<SignalKind>,
    match_attrs: BTreeMap<String, String>,
}

impl CompiledRule {
    fn matches(&self, kind: SignalKind, attrs: &ResourceAttributes) -> bool {
        if self.signal.is_some_and(|s| s != kind) {
            return false;
        }
        // Attribute rules never match an attribute-less batch
        if !self.match_attrs.is_empty() && attrs.is_empty() {
            return false;
        }
        self.match_attrs
            .iter()
            .all(|(key, expected)| attrs.get_str(key).as_deref() == Some(expected.as_str()))
    }
}

/// Maps (signal kind, resource attributes) to a pipeline name
#[derive(Debug, Clone)]
pub struct PipelineRouter {
    rules: Vec<CompiledRule>,
    fallback: Option<String>,
    /// Signals accepted by each pipeline
    accepts: HashMap<String, Vec<SignalKind>>,
}

impl PipelineRouter {
    pub fn new(routing: &RoutingConfig, pipelines: &[PipelineConfig]) -> Self {
        let accepts = pipelines
            .iter()
            .map(|p| (p.name.clone(), p.signals.clone()))
            .collect();
        let rules = routing
            .rules
            .iter()
            .map(|r| CompiledRule {
                pipeline: r.pipeline.clone(),
                signal: r.signal,
                match_attrs: r.match_attrs.clone(),
            })
            .collect();
        Self {
            rules,
            fallback: routing.fallback.clone(),
            accepts,
        }
    }

    fn accepts(&self, pipeline: &str, kind: SignalKind) -> bool {
        self.accepts
            .get(pipeline)
            .is_some_and(|signals| signals.contains(&kind))
    }

    /// Pick the pipeline for a signal kind and attribute set
    pub fn route_attrs(
        &self,
        kind: SignalKind,
        attrs: &ResourceAttributes,
    ) -> Result<&str, RouteError> {
        if let Some(rule) = self
            .rules
            .iter()
            .find(|rule| self.accepts(&rule.pipeline, kind) && rule.matches(kind, attrs))
        {
            return Ok(&rule.pipeline);
        }

        match &self.fallback {
            Some(fallback) if self.accepts(fallback, kind) => Ok(fallback),
            _ => Err(RouteError::NoRoute {
                kind,
                attributes: attrs
                    .iter()
                    .map(|(k, v)| format!("{}={}", k, v))
                    .collect::<Vec<_>>()
                    .join(", "),
            }),
        }
    }

    pub fn route(&self, batch: &Batch) -> Result<&str, RouteError> {
        self.route_attrs(batch.kind(), batch.attributes())
    }
}
