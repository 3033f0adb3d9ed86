//! Skill-based delegation to specialized personas.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

use flowgate_core::config::PersonaConfig;
use flowgate_core::error::{FlowgateError, Result};
use flowgate_core::types::InboundMessage;

/// A specialized persona that can take over a message.
#[derive(Debug, Clone)]
pub struct Persona {
    pub id: String,
    pub name: String,
    /// Lowercased skill tags.
    pub skills: Vec<String>,
    pub description: Option<String>,
}

impl Persona {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            skills: vec![],
            description: None,
        }
    }

    pub fn with_skills(mut self, skills: &[&str]) -> Self {
        self.skills = skills.iter().map(|s| s.trim().to_lowercase()).collect();
        self
    }

    /// One point per skill tag present in the text as a whole word or phrase.
    pub fn match_score(&self, text: &str) -> f64 {
        let padded = format!(
            " {} ",
            text.to_lowercase()
                .split(|c: char| !c.is_alphanumeric())
                .filter(|w| !w.is_empty())
                .collect::<Vec<_>>()
                .join(" ")
        );
        self.skills
            .iter()
            .filter(|s| !s.is_empty() && padded.contains(&format!(" {} ", s.replace(['-', '_'], " "))))
            .count() as f64
    }
}

impl From<&PersonaConfig> for Persona {
    fn from(config: &PersonaConfig) -> Self {
        Self {
            id: config.id.clone(),
            name: config.name.clone(),
            skills: config.skills.iter().map(|s| s.trim().to_lowercase()).collect(),
            description: config.description.clone(),
        }
    }
}

/// Registered personas, consulted in registration order.
#[derive(Debug, Clone, Default)]
pub struct PersonaRegistry {
    personas: Vec<Persona>,
}

impl PersonaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_configs(configs: &[PersonaConfig]) -> Self {
        Self {
            personas: configs.iter().map(Persona::from).collect(),
        }
    }

    pub fn register(&mut self, persona: Persona) {
        self.personas.retain(|p| p.id != persona.id);
        self.personas.push(persona);
    }

    pub fn is_empty(&self) -> bool {
        self.personas.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Persona> {
        self.personas.iter().find(|p| p.id == id)
    }

    /// Highest-scoring persona at or above `min_score`. Ties go to the
    /// earlier registration.
    pub fn best_match(&self, text: &str, min_score: f64) -> Option<(&Persona, f64)> {
        let mut best: Option<(&Persona, f64)> = None;
        for persona in &self.personas {
            let score = persona.match_score(text);
            debug!(persona = %persona.id, score, "Persona scored");
            if score >= min_score && score > 0.0 && best.map_or(true, |(_, s)| score > s) {
                best = Some((persona, score));
            }
        }
        best
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelegationStatus {
    Queued,
    Accepted,
}

/// Proof that a message was handed off. Not a final answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelegationReceipt {
    pub delegation_id: String,
    pub persona_id: String,
    pub persona_name: String,
    pub status: DelegationStatus,
    pub score: f64,
    pub created_at: DateTime<Utc>,
}

impl DelegationReceipt {
    pub fn new(persona: &Persona, score: f64, status: DelegationStatus) -> Self {
        Self {
            delegation_id: Uuid::new_v4().to_string(),
            persona_id: persona.id.clone(),
            persona_name: persona.name.clone(),
            status,
            score,
            created_at: Utc::now(),
        }
    }
}

/// Hands a message to a persona's worker.
pub trait Delegator: Send + Sync + 'static {
    fn delegate<'a>(
        &'a self,
        persona: &'a Persona,
        score: f64,
        message: &'a InboundMessage,
    ) -> BoxFuture<'a, Result<DelegationReceipt>>;
}

/// A queued hand-off, as seen by the persona worker.
#[derive(Debug, Clone)]
pub struct DelegationRequest {
    pub receipt: DelegationReceipt,
    pub message: InboundMessage,
}

/// Delegates by queueing onto a bounded channel read by persona workers.
pub struct ChannelDelegator {
    tx: mpsc::Sender<DelegationRequest>,
}

impl ChannelDelegator {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<DelegationRequest>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl Delegator for ChannelDelegator {
    fn delegate<'a>(
        &'a self,
        persona: &'a Persona,
        score: f64,
        message: &'a InboundMessage,
    ) -> BoxFuture<'a, Result<DelegationReceipt>> {
        Box::pin(async move {
            let receipt = DelegationReceipt::new(persona, score, DelegationStatus::Queued);
            self.tx
                .send(DelegationRequest {
                    receipt: receipt.clone(),
                    message: message.clone(),
                })
                .await
                .map_err(|_| FlowgateError::Delegation(format!("no worker for persona '{}'", persona.id)))?;
            info!(
                delegation_id = %receipt.delegation_id,
                persona = %persona.id,
                score,
                "Message delegated"
            );
            Ok(receipt)
        })
    }
}
