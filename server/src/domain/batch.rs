//! Batches: the unit of routing, processing and queueing
//!
//! A [`Batch`] holds the telemetry of one OTLP resource (one
//! `ResourceSpans`/`ResourceMetrics`/`ResourceLogs` entry). It keeps the
//! original `Resource` so export reproduces exactly what the client sent, plus
//! a flattened [`ResourceAttributes`] view used for routing and batching.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use opentelemetry_proto::tonic::collector::{
    logs::v1::ExportLogsServiceRequest, metrics::v1::ExportMetricsServiceRequest,
    trace::v1::ExportTraceServiceRequest,
};
use opentelemetry_proto::tonic::common::v1::{AnyValue, KeyValue, any_value};
use opentelemetry_proto::tonic::logs::v1::{ResourceLogs, ScopeLogs};
use opentelemetry_proto::tonic::metrics::v1::{ResourceMetrics, ScopeMetrics, metric};
use opentelemetry_proto::tonic::resource::v1::Resource;
use opentelemetry_proto::tonic::trace::v1::{ResourceSpans, ScopeSpans};
use prost::Message;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::utils::otlp::{any_value_to_string, make_attr, remove_attr, upsert_attr};

// ============================================================================
// SIGNAL KIND
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    Metrics,
    Logs,
    Traces,
}

impl SignalKind {
    pub fn all() -> [SignalKind; 3] {
        [SignalKind::Metrics, SignalKind::Logs, SignalKind::Traces]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SignalKind::Metrics => "metrics",
            SignalKind::Logs => "logs",
            SignalKind::Traces => "traces",
        }
    }

    /// Stable on-disk tag
    pub fn as_u32(self) -> u32 {
        match self {
            SignalKind::Metrics => 1,
            SignalKind::Logs => 2,
            SignalKind::Traces => 3,
        }
    }

    pub fn from_u32(tag: u32) -> Option<Self> {
        match tag {
            1 => Some(SignalKind::Metrics),
            2 => Some(SignalKind::Logs),
            3 => Some(SignalKind::Traces),
            _ => None,
        }
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SignalKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "metrics" => Ok(SignalKind::Metrics),
            "logs" => Ok(SignalKind::Logs),
            "traces" => Ok(SignalKind::Traces),
            _ => Err(format!(
                "Invalid signal kind '{}'. Expected one of: metrics, logs, traces",
                s
            )),
        }
    }
}

// ============================================================================
// RESOURCE ATTRIBUTES
// ============================================================================

/// Scalar attribute value used for routing decisions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    Bool(bool),
    Int(i64),
    Double(f64),
    Str(String),
}

impl AttrValue {
    fn from_any(value: &AnyValue) -> Option<Self> {
        match &value.value {
            Some(any_value::Value::StringValue(s)) => Some(AttrValue::Str(s.clone())),
            Some(any_value::Value::BoolValue(b)) => Some(AttrValue::Bool(*b)),
            Some(any_value::Value::IntValue(i)) => Some(AttrValue::Int(*i)),
            Some(any_value::Value::DoubleValue(d)) => Some(AttrValue::Double(*d)),
            Some(_) => Some(AttrValue::Str(any_value_to_string(value))),
            None => None,
        }
    }

    fn to_any(&self) -> any_value::Value {
        match self {
            AttrValue::Str(s) => any_value::Value::StringValue(s.clone()),
            AttrValue::Bool(b) => any_value::Value::BoolValue(*b),
            AttrValue::Int(i) => any_value::Value::IntValue(*i),
            AttrValue::Double(d) => any_value::Value::DoubleValue(*d),
        }
    }
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrValue::Str(s) => f.write_str(s),
            AttrValue::Bool(b) => write!(f, "{}", b),
            AttrValue::Int(i) => write!(f, "{}", i),
            AttrValue::Double(d) => write!(f, "{}", d),
        }
    }
}

impl From<&str> for AttrValue {
    fn from(s: &str) -> Self {
        AttrValue::Str(s.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(s: String) -> Self {
        AttrValue::Str(s)
    }
}

/// Resource attributes keyed by name. When a key repeats, the last value wins.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceAttributes(BTreeMap<String, AttrValue>);

impl ResourceAttributes {
    pub fn from_key_values(attrs: &[KeyValue]) -> Self {
        let map = attrs
            .iter()
            .filter_map(|kv| {
                let value = AttrValue::from_any(kv.value.as_ref()?)?;
                Some((kv.key.clone(), value))
            })
            .collect();
        Self(map)
    }

    pub fn get(&self, key: &str) -> Option<&AttrValue> {
        self.0.get(key)
    }

    /// String rendering of a value, as compared by routing rules
    pub fn get_str(&self, key: &str) -> Option<String> {
        self.0.get(key).map(ToString::to_string)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &AttrValue)> {
        self.0.iter()
    }

    /// Canonical string identifying this attribute set
    pub fn fingerprint(&self) -> String {
        let mut out = String::new();
        for (key, value) in &self.0 {
            out.push_str(key);
            out.push('=');
            out.push_str(&value.to_string());
            out.push('\u{1f}');
        }
        out
    }
}

impl<K: Into<String>, V: Into<AttrValue>> FromIterator<(K, V)> for ResourceAttributes {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

// ============================================================================
// BATCH
// ============================================================================

/// Telemetry records of a single kind
#[derive(Debug, Clone, PartialEq)]
pub enum Records {
    Metrics(Vec<ScopeMetrics>),
    Logs(Vec<ScopeLogs>),
    Spans(Vec<ScopeSpans>),
}

impl Records {
    pub fn kind(&self) -> SignalKind {
        match self {
            Records::Metrics(_) => SignalKind::Metrics,
            Records::Logs(_) => SignalKind::Logs,
            Records::Spans(_) => SignalKind::Traces,
        }
    }

    /// Metric data points, log records or spans
    pub fn count(&self) -> usize {
        match self {
            Records::Metrics(scopes) => scopes
                .iter()
                .flat_map(|s| &s.metrics)
                .map(|m| metric_point_count(m.data.as_ref()))
                .sum(),
            Records::Logs(scopes) => scopes.iter().map(|s| s.log_records.len()).sum(),
            Records::Spans(scopes) => scopes.iter().map(|s| s.spans.len()).sum(),
        }
    }

    /// Append the scopes of `other`. Returns it back when kinds differ.
    fn append(&mut self, other: Records) -> Result<(), Records> {
        match (self, other) {
            (Records::Metrics(a), Records::Metrics(b)) => a.extend(b),
            (Records::Logs(a), Records::Logs(b)) => a.extend(b),
            (Records::Spans(a), Records::Spans(b)) => a.extend(b),
            (_, other) => return Err(other),
        }
        Ok(())
    }
}

fn metric_point_count(data: Option<&metric::Data>) -> usize {
    match data {
        Some(metric::Data::Gauge(g)) => g.data_points.len(),
        Some(metric::Data::Sum(s)) => s.data_points.len(),
        Some(metric::Data::Histogram(h)) => h.data_points.len(),
        Some(metric::Data::ExponentialHistogram(h)) => h.data_points.len(),
        Some(metric::Data::Summary(s)) => s.data_points.len(),
        None => 0,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    seq: u64,
    attributes: ResourceAttributes,
    resource: Option<Resource>,
    schema_url: String,
    records: Records,
}

impl Batch {
    pub fn new(seq: u64, resource: Option<Resource>, schema_url: String, records: Records) -> Self {
        let attributes = resource
            .as_ref()
            .map(|r| ResourceAttributes::from_key_values(&r.attributes))
            .unwrap_or_default();
        Self {
            seq,
            attributes,
            resource,
            schema_url,
            records,
        }
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn kind(&self) -> SignalKind {
        self.records.kind()
    }

    pub fn attributes(&self) -> &ResourceAttributes {
        &self.attributes
    }

    pub fn records(&self) -> &Records {
        &self.records
    }

    pub fn records_mut(&mut self) -> &mut Records {
        &mut self.records
    }

    pub fn record_count(&self) -> usize {
        self.records.count()
    }

    pub fn is_empty(&self) -> bool {
        self.record_count() == 0
    }

    /// Set a resource attribute, replacing any existing value
    pub fn set_attribute(&mut self, key: &str, value: AttrValue) {
        let resource = self.resource.get_or_insert_with(Resource::default);
        upsert_attr(&mut resource.attributes, make_attr(key, value.to_any()));
        self.attributes.0.insert(key.to_string(), value);
    }

    /// Remove a resource attribute. Returns true if it was present.
    pub fn remove_attribute(&mut self, key: &str) -> bool {
        let removed = self
            .resource
            .as_mut()
            .is_some_and(|r| remove_attr(&mut r.attributes, key));
        self.attributes.0.remove(key).is_some() || removed
    }

    /// Merge another batch's records into this one. Both must share kind and
    /// resource attributes; the first batch's resource and seq are kept.
    pub fn absorb(&mut self, other: Batch) -> Result<(), Batch> {
        if other.kind() != self.kind() || other.attributes != self.attributes {
            return Err(other);
        }
        let Batch {
            seq,
            attributes,
            resource,
            schema_url,
            records,
        } = other;
        self.records.append(records).map_err(|records| Batch {
            seq,
            attributes,
            resource,
            schema_url,
            records,
        })
    }

    /// Size of [`Batch::encode`]'s output, computed without encoding
    pub fn encoded_len(&self) -> usize {
        use prost::encoding::{encoded_len_varint, key_len, message, string};

        // Resource{Metrics,Logs,Spans}: resource = 1, scopes = 2, schema_url = 3
        let mut inner = self
            .resource
            .as_ref()
            .map_or(0, |r| message::encoded_len(1, r));
        inner += match &self.records {
            Records::Metrics(scopes) => message::encoded_len_repeated(2, scopes),
            Records::Logs(scopes) => message::encoded_len_repeated(2, scopes),
            Records::Spans(scopes) => message::encoded_len_repeated(2, scopes),
        };
        if !self.schema_url.is_empty() {
            inner += string::encoded_len(3, &self.schema_url);
        }
        key_len(1) + encoded_len_varint(inner as u64) + inner
    }

    /// Encode as a single-resource OTLP export request (protobuf)
    pub fn encode(&self) -> Bytes {
        let resource = self.resource.clone();
        let schema_url = self.schema_url.clone();
        let body = match &self.records {
            Records::Metrics(scopes) => ExportMetricsServiceRequest {
                resource_metrics: vec![ResourceMetrics {
                    resource,
                    scope_metrics: scopes.clone(),
                    schema_url,
                }],
            }
            .encode_to_vec(),
            Records::Logs(scopes) => ExportLogsServiceRequest {
                resource_logs: vec![ResourceLogs {
                    resource,
                    scope_logs: scopes.clone(),
                    schema_url,
                }],
            }
            .encode_to_vec(),
            Records::Spans(scopes) => ExportTraceServiceRequest {
                resource_spans: vec![ResourceSpans {
                    resource,
                    scope_spans: scopes.clone(),
                    schema_url,
                }],
            }
            .encode_to_vec(),
        };
        Bytes::from(body)
    }
}

/// Hands out batch sequence numbers, starting at 1
#[derive(Debug)]
pub struct SequenceGenerator(AtomicU64);

impl SequenceGenerator {
    pub fn new() -> Self {
        Self::starting_after(0)
    }

    /// Continue after the highest number already handed out (e.g. recovered
    /// from the queues)
    pub fn starting_after(last: u64) -> Self {
        Self(AtomicU64::new(last.saturating_add(1)))
    }

    pub fn next_seq(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for SequenceGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Builders for batches used across domain tests

    use super::*;
    use opentelemetry_proto::tonic::logs::v1::LogRecord;
    use opentelemetry_proto::tonic::metrics::v1::{Gauge, Metric, NumberDataPoint};
    use opentelemetry_proto::tonic::trace::v1::{Span, Status, status};

    use crate::utils::otlp::make_string_attr;

    pub fn resource(attrs: &[(&str, &str)]) -> Resource {
        Resource {
            attributes: attrs.iter().map(|(k, v)| make_string_attr(k, v)).collect(),
            ..Default::default()
        }
    }

    pub fn gauge_scope(points: usize) -> ScopeMetrics {
        ScopeMetrics {
            metrics: vec![Metric {
                name: "cpu.usage".into(),
                data: Some(metric::Data::Gauge(Gauge {
                    data_points: vec![NumberDataPoint::default(); points],
                })),
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    pub fn log_scope(severities: &[i32]) -> ScopeLogs {
        ScopeLogs {
            log_records: severities
                .iter()
                .map(|&severity_number| LogRecord {
                    severity_number,
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }
    }

    /// Spans flagged true carry an error status
    pub fn span_scope(errors: &[bool]) -> ScopeSpans {
        ScopeSpans {
            spans: errors
                .iter()
                .map(|&error| Span {
                    name: "op".into(),
                    status: error.then(|| Status {
                        code: status::StatusCode::Error as i32,
                        ..Default::default()
                    }),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }
    }

    pub fn metrics_batch(seq: u64, attrs: &[(&str, &str)], points: usize) -> Batch {
        Batch::new(
            seq,
            Some(resource(attrs)),
            String::new(),
            Records::Metrics(vec![gauge_scope(points)]),
        )
    }

    pub fn logs_batch(seq: u64, attrs: &[(&str, &str)], severities: &[i32]) -> Batch {
        Batch::new(
            seq,
            Some(resource(attrs)),
            String::new(),
            Records::Logs(vec![log_scope(severities)]),
        )
    }

    pub fn traces_batch(seq: u64, attrs: &[(&str, &str)], errors: &[bool]) -> Batch {
        Batch::new(
            seq,
            Some(resource(attrs)),
            String::new(),
            Records::Spans(vec![span_scope(errors)]),
        )
    }
}
