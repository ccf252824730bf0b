//! Active script state.
//!
//! Each bearer token owns one [`ScriptStore`]. Loading, selecting and
//! snapshotting all go through the store's lock, so a load either fully
//! precedes or fully follows any matching pass, and cursors and counters
//! advance exactly once per matched request.

use crate::budget::CallBudget;
use crate::error::ScriptError;
use crate::matcher::{first_pattern_match, MatchContext};
use crate::policy::{UnmatchedPolicy, UnmatchedReason};
use crate::request::RequestDescriptor;
use crate::script::{RuleResponse, Script, ScriptDefinition, SimpleReply, SimpleScript};
use crate::sequencer::{Advance, Sequencer};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

/// What a matching pass decided.
#[derive(Debug, Clone)]
pub enum Selection {
    Rule {
        rule_id: String,
        response: RuleResponse,
        context: MatchContext,
    },
    Simple {
        index: usize,
        reply: SimpleReply,
    },
    Unmatched {
        reason: UnmatchedReason,
        policy: UnmatchedPolicy,
        default_content: Option<String>,
    },
}

impl Selection {
    /// Outcome for a token with no active script.
    pub fn no_script() -> Self {
        Selection::Unmatched {
            reason: UnmatchedReason::NoScript,
            policy: UnmatchedPolicy::Error,
            default_content: None,
        }
    }
}

/// Result of a successful load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LoadSummary {
    pub rules: usize,
    pub responses: usize,
    pub extended: bool,
}

/// Point-in-time view of a store, for the state endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ScriptSnapshot {
    pub rules: Vec<RuleState>,
    pub responses: usize,
    pub responses_served: usize,
    pub cursor: usize,
    pub rounds: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct RuleState {
    pub id: String,
    pub used: u32,
    pub remaining: Option<u32>,
}

struct ActiveScript {
    script: Arc<Script>,
    sequencer: Sequencer,
    budget: CallBudget,
}

impl ActiveScript {
    fn new(script: Script) -> Self {
        let sequencer = Sequencer::new(script.sequence().map_or(0, <[_]>::len));
        let budget = CallBudget::new(script.rules.len());
        Self {
            script: Arc::new(script),
            sequencer,
            budget,
        }
    }

    fn extend(&mut self, addition: Script) -> Result<(), ScriptError> {
        let added_rules = addition.rules.len();
        let added_entries = addition.sequence().map_or(0, <[_]>::len);
        let merged = self.script.extend(addition)?;

        self.budget.extend(added_rules);
        self.sequencer.extend(added_entries);
        self.script = Arc::new(merged);
        Ok(())
    }

    fn select(&mut self, req: &RequestDescriptor) -> Selection {
        let script = Arc::clone(&self.script);
        let user_text = req.user_text();

        for (index, rule) in script.rules.iter().enumerate() {
            if !self.budget.is_available(index, rule.times) {
                continue;
            }
            if let Some(context) = rule.predicate.evaluate(req, &user_text) {
                self.budget.consume(index);
                return Selection::Rule {
                    rule_id: rule.id.clone(),
                    response: rule.response.clone(),
                    context,
                };
            }
        }

        let reason = if !req.endpoint().is_generation() {
            UnmatchedReason::NoMatch
        } else {
            match &script.simple {
                Some(SimpleScript::Sequence(entries)) => {
                    match self
                        .sequencer
                        .advance(entries, &user_text, script.defaults.on_exhausted)
                    {
                        Advance::Served(index) => {
                            return Selection::Simple {
                                index,
                                reply: entries[index].reply().clone(),
                            }
                        }
                        Advance::NoMatch => UnmatchedReason::NoMatch,
                        Advance::Exhausted => UnmatchedReason::Exhausted,
                    }
                }
                Some(SimpleScript::Patterns(patterns)) => {
                    match first_pattern_match(patterns, &user_text) {
                        Some(index) => {
                            return Selection::Simple {
                                index,
                                reply: SimpleReply::Content(patterns[index].content.clone()),
                            }
                        }
                        None => UnmatchedReason::NoMatch,
                    }
                }
                None => UnmatchedReason::NoMatch,
            }
        };

        Selection::Unmatched {
            reason,
            policy: script.defaults.on_unmatched,
            default_content: script.defaults.content.clone(),
        }
    }

    fn snapshot(&self) -> ScriptSnapshot {
        ScriptSnapshot {
            rules: self
                .script
                .rules
                .iter()
                .enumerate()
                .map(|(i, rule)| RuleState {
                    id: rule.id.clone(),
                    used: self.budget.used(i),
                    remaining: self.budget.remaining(i, rule.times),
                })
                .collect(),
            responses: self.script.response_count(),
            responses_served: self.sequencer.served(),
            cursor: self.sequencer.cursor(),
            rounds: self.sequencer.rounds(),
        }
    }
}

/// Holds one token's active script together with its cursor and counters.
#[derive(Default)]
pub struct ScriptStore {
    state: Mutex<Option<ActiveScript>>,
}

impl ScriptStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compile and install a script.
    ///
    /// With `reset: true`, or when nothing is loaded, the script replaces the
    /// active one and all cursors and counters start over. Otherwise it is
    /// appended. On error the active script is left untouched.
    pub async fn load(&self, def: &ScriptDefinition) -> Result<LoadSummary, ScriptError> {
        let compiled = Script::compile(def)?;
        let mut state = self.state.lock().await;

        let (script, extended) = match state.as_mut() {
            Some(active) if !def.reset => {
                active.extend(compiled)?;
                (Arc::clone(&active.script), true)
            }
            _ => {
                let active = ActiveScript::new(compiled);
                let script = Arc::clone(&active.script);
                *state = Some(active);
                (script, false)
            }
        };

        Ok(LoadSummary {
            rules: script.rules.len(),
            responses: script.response_count(),
            extended,
        })
    }

    /// Install an already compiled script, replacing any active one.
    pub async fn install(&self, script: Script) {
        *self.state.lock().await = Some(ActiveScript::new(script));
    }

    /// Drop the active script.
    pub async fn clear(&self) {
        *self.state.lock().await = None;
    }

    /// Immutable view of the active script.
    pub async fn current(&self) -> Option<Arc<Script>> {
        let state = self.state.lock().await;
        state.as_ref().map(|active| Arc::clone(&active.script))
    }

    pub async fn snapshot(&self) -> Option<ScriptSnapshot> {
        let state = self.state.lock().await;
        state.as_ref().map(ActiveScript::snapshot)
    }

    /// Run one matching pass, committing cursor and counter updates.
    pub async fn select(&self, req: &RequestDescriptor) -> Selection {
        let mut state = self.state.lock().await;
        match state.as_mut() {
            Some(active) => active.select(req),
            None => Selection::no_script(),
        }
    }
}

/// Maps bearer tokens to their isolated stores.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<ScriptStore>>>,
    preload: Option<Arc<Script>>,
}

impl SessionRegistry {
    /// `preload` is installed into every new session.
    pub fn new(preload: Option<Script>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            preload: preload.map(Arc::new),
        }
    }

    /// Store for `token`, created on first use.
    pub async fn store_for(&self, token: &str) -> Arc<ScriptStore> {
        if let Some(store) = self.sessions.read().await.get(token) {
            return Arc::clone(store);
        }

        let mut sessions = self.sessions.write().await;
        // Double-check after acquiring the write lock
        if let Some(store) = sessions.get(token) {
            return Arc::clone(store);
        }

        let store = Arc::new(ScriptStore::new());
        if let Some(preload) = &self.preload {
            store.install(Script::clone(preload)).await;
        }
        debug!(sessions = sessions.len() + 1, "Created session");
        sessions.insert(token.to_string(), Arc::clone(&store));
        store
    }

    /// Store to match a request against.
    ///
    /// Without a preload script a token that never loaded one has nothing to
    /// match, so no session is created for it.
    pub async fn for_request(&self, token: &str) -> Option<Arc<ScriptStore>> {
        if self.preload.is_some() {
            return Some(self.store_for(token).await);
        }
        self.get(token).await
    }

    /// Store for `token` if one exists.
    pub async fn get(&self, token: &str) -> Option<Arc<ScriptStore>> {
        self.sessions.read().await.get(token).cloned()
    }

    /// Forget everything about `token`.
    pub async fn reset(&self, token: &str) -> bool {
        self.sessions.write().await.remove(token).is_some()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
