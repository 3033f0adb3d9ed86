//! Message trigger filters and the catalog of dispatchable flows.

use std::path::Path;
use std::sync::Arc;

use regex::Regex;
use tracing::{debug, info};

use flowgate_core::error::{FlowgateError, Result};
use flowgate_core::flow::{Flow, StepKind};
use flowgate_core::types::InboundMessage;

/// One `op:value` filter.
#[derive(Debug, Clone)]
pub enum TriggerFilter {
    Contains(String),
    Equals(String),
    StartsWith(String),
    EndsWith(String),
    Regex(Regex),
    Sender(String),
    Channel(String),
}

impl TriggerFilter {
    /// Parse `op:value`. A bare value means `contains`. Quotes around the
    /// value are stripped.
    pub fn parse(raw: &str) -> Result<Self> {
        let (op, value) = match raw.split_once(':') {
            Some((op, value)) if is_op(op) => (op.trim().to_lowercase(), value),
            _ => ("contains".to_string(), raw),
        };
        let value = unquote(value.trim());
        if value.is_empty() {
            return Err(FlowgateError::InvalidFlow(vec![format!("filter '{}' has no value", raw)]));
        }
        let lower = value.to_lowercase();
        Ok(match op.as_str() {
            "contains" => Self::Contains(lower),
            "equals" => Self::Equals(lower),
            "starts_with" => Self::StartsWith(lower),
            "ends_with" => Self::EndsWith(lower),
            "sender" => Self::Sender(lower),
            "channel" => Self::Channel(lower),
            _ => Self::Regex(Regex::new(value).map_err(|e| {
                FlowgateError::InvalidFlow(vec![format!("filter '{}': {}", raw, e)])
            })?),
        })
    }

    pub fn matches(&self, message: &InboundMessage) -> bool {
        let text = message.text.trim().to_lowercase();
        match self {
            Self::Contains(v) => text.contains(v.as_str()),
            Self::Equals(v) => text == *v,
            Self::StartsWith(v) => text.starts_with(v.as_str()),
            Self::EndsWith(v) => text.ends_with(v.as_str()),
            Self::Regex(re) => re.is_match(&message.text),
            Self::Sender(v) => message.sender.eq_ignore_ascii_case(v),
            Self::Channel(v) => message.channel.eq_ignore_ascii_case(v),
        }
    }
}

fn is_op(op: &str) -> bool {
    matches!(
        op.trim().to_lowercase().as_str(),
        "contains" | "equals" | "starts_with" | "ends_with" | "regex" | "sender" | "channel"
    )
}

fn unquote(value: &str) -> &str {
    for q in ['"', '\''] {
        if let Some(inner) = value.strip_prefix(q).and_then(|v| v.strip_suffix(q)) {
            return inner;
        }
    }
    value
}

/// A flow with its trigger filters compiled.
#[derive(Debug, Clone)]
pub struct CatalogEntry {
    pub flow: Arc<Flow>,
    filters: Vec<TriggerFilter>,
}

impl CatalogEntry {
    pub fn new(flow: Flow) -> Result<Self> {
        let filters = flow
            .trigger
            .filters
            .iter()
            .map(|f| TriggerFilter::parse(f))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            flow: Arc::new(flow),
            filters,
        })
    }

    /// Flows that start from inbound messages: those with a message trigger,
    /// or with no trigger node at all.
    pub fn accepts_messages(&self) -> bool {
        self.started_by(StepKind::MessageTrigger)
    }

    /// Same rule for the webhook entry point.
    pub fn accepts_webhooks(&self) -> bool {
        self.started_by(StepKind::WebhookTrigger)
    }

    fn started_by(&self, kind: StepKind) -> bool {
        let mut triggers = self
            .flow
            .nodes
            .iter()
            .map(|n| n.kind)
            .filter(|k| k.is_trigger())
            .peekable();
        triggers.peek().is_none() || triggers.any(|k| k == kind)
    }

    /// Enabled, channel allowed, and every filter matches.
    pub fn matches(&self, message: &InboundMessage) -> bool {
        if !self.flow.enabled || !self.accepts_messages() {
            return false;
        }
        let channels = &self.flow.trigger.channels;
        if !channels.is_empty() && !channels.iter().any(|c| c.eq_ignore_ascii_case(&message.channel)) {
            return false;
        }
        self.filters.iter().all(|f| f.matches(message))
    }
}

/// All known flows, highest priority first (stable within a priority).
#[derive(Debug, Clone, Default)]
pub struct FlowCatalog {
    entries: Vec<CatalogEntry>,
}

impl FlowCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, flow: Flow) -> Result<()> {
        if self.get(&flow.id).is_some() {
            return Err(FlowgateError::InvalidFlow(vec![format!("duplicate flow id '{}'", flow.id)]));
        }
        let entry = CatalogEntry::new(flow)?;
        let pos = self
            .entries
            .iter()
            .position(|e| e.flow.priority < entry.flow.priority)
            .unwrap_or(self.entries.len());
        self.entries.insert(pos, entry);
        Ok(())
    }

    pub fn with_flow(mut self, flow: Flow) -> Result<Self> {
        self.add(flow)?;
        Ok(self)
    }

    /// Load every `*.json` flow document in `dir`, in file-name order.
    pub fn load_dir(dir: &Path) -> Result<Self> {
        let mut paths: Vec<_> = std::fs::read_dir(dir)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        paths.sort();

        let mut catalog = Self::new();
        for path in paths {
            let json = std::fs::read_to_string(&path)?;
            let flow = Flow::from_json(&json)
                .map_err(|e| FlowgateError::Config(format!("{}: {}", path.display(), e)))?;
            debug!(flow_id = %flow.id, path = %path.display(), "Loaded flow");
            catalog.add(flow)?;
        }
        info!(dir = %dir.display(), flows = catalog.len(), "Flow catalog loaded");
        Ok(catalog)
    }

    pub fn get(&self, flow_id: &str) -> Option<&CatalogEntry> {
        self.entries.iter().find(|e| e.flow.id == flow_id)
    }

    /// First matching flow with priority in `range`, by priority.
    pub fn first_match(
        &self,
        message: &InboundMessage,
        range: std::ops::RangeInclusive<u8>,
    ) -> Option<Arc<Flow>> {
        self.entries
            .iter()
            .filter(|e| range.contains(&e.flow.priority))
            .find(|e| e.matches(message))
            .map(|e| e.flow.clone())
    }

    pub fn flows(&self) -> impl Iterator<Item = &Arc<Flow>> {
        self.entries.iter().map(|e| &e.flow)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
