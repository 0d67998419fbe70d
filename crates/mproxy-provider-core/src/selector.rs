//! Client selection policies over cooldown-filtered candidates.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::client::ClientId;
use crate::cooldown::CooldownTracker;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectPolicy {
    RoundRobin,
    FillFirst,
    Priority,
}

/// Candidate handed to the selector: id plus the client's priority
/// (higher wins).
#[derive(Debug, Clone)]
pub struct Candidate {
    pub client_id: ClientId,
    pub priority: i32,
}

pub struct Selector {
    policy: SelectPolicy,
    cursor: AtomicU64,
    in_flight: Mutex<HashMap<ClientId, usize>>,
}

impl Selector {
    pub fn new(policy: SelectPolicy) -> Self {
        Self {
            policy,
            cursor: AtomicU64::new(0),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Pick one Ready client from the candidates, or none. No lock is held
    /// on the chosen client; the rate limiter is the admission gate.
    pub fn select(
        &self,
        model: &str,
        candidates: &[Candidate],
        cooldown: &CooldownTracker,
    ) -> Option<ClientId> {
        let mut ready: Vec<&Candidate> = candidates
            .iter()
            .filter(|candidate| cooldown.state(&candidate.client_id, model).is_ready())
            .collect();
        if ready.is_empty() {
            return None;
        }
        // Stable sort keeps registration order as the tie-break.
        ready.sort_by(|a, b| b.priority.cmp(&a.priority));

        match self.policy {
            SelectPolicy::RoundRobin => {
                let index = self.cursor.fetch_add(1, Ordering::Relaxed) as usize % ready.len();
                Some(ready[index].client_id.clone())
            }
            SelectPolicy::Priority => {
                let top = ready[0].priority;
                let tier: Vec<&&Candidate> =
                    ready.iter().take_while(|c| c.priority == top).collect();
                let index = self.cursor.fetch_add(1, Ordering::Relaxed) as usize % tier.len();
                Some(tier[index].client_id.clone())
            }
            SelectPolicy::FillFirst => {
                let counts = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
                let idle = ready
                    .iter()
                    .find(|c| counts.get(&c.client_id).copied().unwrap_or(0) == 0);
                match idle {
                    Some(candidate) => Some(candidate.client_id.clone()),
                    None => ready
                        .iter()
                        .min_by_key(|c| counts.get(&c.client_id).copied().unwrap_or(0))
                        .map(|c| c.client_id.clone()),
                }
            }
        }
    }

    /// Track one in-flight request; the guard releases the slot on drop.
    pub fn begin(self: &Arc<Self>, client_id: &str) -> InFlightGuard {
        {
            let mut counts = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
            *counts.entry(client_id.to_string()).or_insert(0) += 1;
        }
        InFlightGuard {
            selector: Arc::clone(self),
            client_id: client_id.to_string(),
        }
    }

    pub fn in_flight(&self, client_id: &str) -> usize {
        let counts = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        counts.get(client_id).copied().unwrap_or(0)
    }

    fn release(&self, client_id: &str) {
        let mut counts = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(count) = counts.get_mut(client_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                counts.remove(client_id);
            }
        }
    }
}

pub struct InFlightGuard {
    selector: Arc<Selector>,
    client_id: ClientId,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.selector.release(&self.client_id);
    }
}
