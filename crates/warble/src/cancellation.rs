use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

use crate::errors::CancelError;

/// Process-wide map from conversation id to the cancellation flag of its
/// running turn. At most one turn per conversation holds a token.
#[derive(Debug, Default)]
pub struct CancellationRegistry {
    slots: Mutex<Slots>,
}

#[derive(Debug, Default)]
struct Slots {
    next_generation: u64,
    tokens: HashMap<String, (u64, CancellationToken)>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn slots(&self) -> MutexGuard<'_, Slots> {
        // The map holds no invariants a panicking holder could break
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Claim the turn slot for a conversation. The returned guard releases the
    /// slot when dropped.
    pub fn begin(self: &Arc<Self>, conversation_id: &str) -> Result<TurnGuard, CancelError> {
        let mut slots = self.slots();
        if slots.tokens.contains_key(conversation_id) {
            return Err(CancelError::AlreadyRunning(conversation_id.to_string()));
        }
        slots.next_generation += 1;
        let generation = slots.next_generation;
        let token = CancellationToken::new();
        slots
            .tokens
            .insert(conversation_id.to_string(), (generation, token.clone()));

        Ok(TurnGuard {
            registry: Arc::clone(self),
            conversation_id: conversation_id.to_string(),
            generation,
            token,
        })
    }

    /// Request cancellation. Returns whether a running turn was found.
    pub fn signal(&self, conversation_id: &str) -> bool {
        match self.slots().tokens.get(conversation_id) {
            Some((_, token)) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Forced release: clears the slot whichever turn holds it. Turns release
    /// their own slot by dropping their `TurnGuard`; a guard left behind after
    /// `end` no longer affects the slot.
    pub fn end(&self, conversation_id: &str) {
        self.slots().tokens.remove(conversation_id);
    }

    /// Release a slot only if it still belongs to the given turn
    fn release(&self, conversation_id: &str, generation: u64) {
        let mut slots = self.slots();
        if matches!(slots.tokens.get(conversation_id), Some((g, _)) if *g == generation) {
            slots.tokens.remove(conversation_id);
        }
    }

    pub fn is_running(&self, conversation_id: &str) -> bool {
        self.slots().tokens.contains_key(conversation_id)
    }
}

/// Ownership of a conversation's turn slot
#[derive(Debug)]
pub struct TurnGuard {
    registry: Arc<CancellationRegistry>,
    conversation_id: String,
    generation: u64,
    token: CancellationToken,
}

impl TurnGuard {
    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Drop for TurnGuard {
    fn drop(&mut self) {
        self.registry.release(&self.conversation_id, self.generation);
    }
}
