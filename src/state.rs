//! Application state: cartridge registries, AI clients, prompts and per-session submission tracking.
//!
//! This module owns:
//!   - one validated `RuleRegistry` per cartridge (config file first, then built-in seeds)
//!   - the outbound AI grading client (shared by every concurrent field)
//!   - the optional OpenAI client backing our own `/api/ai/grade`
//!   - the submission tracker that discards results overtaken by a newer submission

use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tokio::sync::RwLock;
use tracing::{debug, error, info, instrument, warn};

use crate::ai::AiGradingClient;
use crate::config::{load_config_from_env, Prompts};
use crate::domain::CompositeResult;
use crate::openai::OpenAI;
use crate::rules::RuleRegistry;
use crate::seeds::seed_cartridges;

/// Sessions remembered at once unless `SESSION_CAPACITY` says otherwise.
pub const DEFAULT_SESSION_CAPACITY: usize = 10_000;

#[derive(Debug, Default)]
struct SessionSlot {
    ticket: u64,
    latest: Option<CompositeResult>,
}

/// Slots plus a ticket-ordered index; the session with the oldest ticket is evicted first.
#[derive(Debug, Default)]
struct Sessions {
    slots: HashMap<String, SessionSlot>,
    by_ticket: BTreeMap<u64, String>,
}

/// Orders submissions per session so a slow, older grading run can never
/// overwrite the outcome of a newer one.
///
/// At most `capacity` sessions are kept. When a new session would exceed it, the
/// least recently submitted session is forgotten; an in-flight submission for that
/// session then commits as stale.
#[derive(Clone)]
pub struct SubmissionTracker {
    counter: Arc<AtomicU64>,
    capacity: usize,
    sessions: Arc<RwLock<Sessions>>,
}

impl Default for SubmissionTracker {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_SESSION_CAPACITY)
    }
}

impl SubmissionTracker {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            counter: Arc::new(AtomicU64::new(0)),
            capacity: capacity.max(1),
            sessions: Arc::new(RwLock::new(Sessions::default())),
        }
    }

    /// Start a submission; any in-flight submission for the session becomes stale.
    pub async fn begin(&self, session_id: &str) -> u64 {
        let ticket = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let mut sessions = self.sessions.write().await;
        let Sessions { slots, by_ticket } = &mut *sessions;

        let slot = slots.entry(session_id.to_string()).or_default();
        by_ticket.remove(&slot.ticket);
        slot.ticket = ticket;
        by_ticket.insert(ticket, session_id.to_string());

        while slots.len() > self.capacity {
            let Some((_, evicted)) = by_ticket.pop_first() else { break };
            slots.remove(&evicted);
            debug!(target: "grading", session_id = %evicted, "Forgetting least recently submitted session");
        }
        ticket
    }

    /// Record the result if `ticket` is still the newest for the session.
    pub async fn commit(&self, session_id: &str, ticket: u64, result: &CompositeResult) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.slots.get_mut(session_id) {
            Some(slot) if slot.ticket == ticket => {
                slot.latest = Some(result.clone());
                true
            }
            _ => false,
        }
    }

    pub async fn latest(&self, session_id: &str) -> Option<CompositeResult> {
        self.sessions.read().await.slots.get(session_id).and_then(|s| s.latest.clone())
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.slots.len()
    }
}

#[derive(Clone)]
pub struct AppState {
    pub registries: Arc<HashMap<String, RuleRegistry>>,
    pub ai: Option<AiGradingClient>,
    pub openai: Option<OpenAI>,
    pub prompts: Prompts,
    pub submissions: SubmissionTracker,
}

impl AppState {
    /// Build state from env: load config, add seed cartridges, init AI clients.
    #[instrument(level = "info", skip_all)]
    pub fn new(port: u16) -> Self {
        let loaded = load_config_from_env();
        let prompts = loaded.as_ref().map(|(c, _)| c.prompts.clone()).unwrap_or_default();
        let mut registries: Vec<RuleRegistry> = loaded.map(|(_, r)| r).unwrap_or_default();

        // Seeds never shadow a configured cartridge with the same id.
        for def in seed_cartridges() {
            if registries.iter().any(|r| r.id() == def.id) {
                continue;
            }
            let id = def.id.clone();
            match RuleRegistry::new(def) {
                Ok(reg) => registries.push(reg),
                Err(e) => error!(target: "stargrade_backend", %id, error = %e, "Skipping invalid seed cartridge"),
            }
        }

        for reg in &registries {
            info!(target: "stargrade_backend", cartridge = %reg.id(), mode = %reg.mode(), fields = reg.entries().count(), "Cartridge ready");
        }

        let ai = AiGradingClient::from_env(&format!("http://127.0.0.1:{}", port));
        if let Some(c) = &ai {
            info!(target: "stargrade_backend", server_url = %c.server_url(), "AI grading delegation enabled.");
        }

        let openai = OpenAI::from_env();
        if let Some(oa) = &openai {
            info!(target: "stargrade_backend", base_url = %oa.base_url, model = %oa.model, "OpenAI enabled for /api/ai/grade.");
        } else {
            info!(target: "stargrade_backend", "OpenAI disabled (no OPENAI_API_KEY). /api/ai/grade will report unavailable.");
        }

        let mut state = Self::from_parts(registries, ai, openai, prompts);
        state.submissions = SubmissionTracker::with_capacity(session_capacity_from_env());
        state
    }

    pub fn from_parts(
        registries: Vec<RuleRegistry>,
        ai: Option<AiGradingClient>,
        openai: Option<OpenAI>,
        prompts: Prompts,
    ) -> Self {
        let registries = registries.into_iter().map(|r| (r.id().to_string(), r)).collect();
        Self {
            registries: Arc::new(registries),
            ai,
            openai,
            prompts,
            submissions: SubmissionTracker::default(),
        }
    }

    pub fn registry(&self, cartridge_id: &str) -> Option<&RuleRegistry> {
        self.registries.get(cartridge_id)
    }
}

fn session_capacity_from_env() -> usize {
    match std::env::var("SESSION_CAPACITY") {
        Ok(raw) => match raw.trim().parse::<usize>() {
            Ok(n) if n > 0 => n,
            _ => {
                warn!(target: "stargrade_backend", value = %raw, default = DEFAULT_SESSION_CAPACITY, "Ignoring invalid SESSION_CAPACITY");
                DEFAULT_SESSION_CAPACITY
            }
        },
        Err(_) => DEFAULT_SESSION_CAPACITY,
    }
}
