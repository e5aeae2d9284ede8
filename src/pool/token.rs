use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;

pub type TokenId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenState {
    Available,
    Cooling,
    Disabled,
}

/// One upstream credential and its health bookkeeping. Only the
/// [`CredentialPool`](super::CredentialPool) mutates these.
#[derive(Debug)]
pub struct Token {
    pub(super) id: TokenId,
    pub(super) secret: String,
    pub(super) state: TokenState,
    pub(super) usage_count: u64,
    pub(super) last_used_at: Option<Instant>,
    pub(super) last_used_wall: Option<DateTime<Utc>>,
    pub(super) consecutive_failures: u32,
    pub(super) cooldown_until: Option<Instant>,
    pub(super) in_flight: u32,
}

impl Token {
    pub(super) fn new(id: TokenId, secret: String) -> Self {
        Self {
            id,
            secret,
            state: TokenState::Available,
            usage_count: 0,
            last_used_at: None,
            last_used_wall: None,
            consecutive_failures: 0,
            cooldown_until: None,
            in_flight: 0,
        }
    }

    pub(super) fn cooldown_elapsed(&self, now: Instant) -> bool {
        self.cooldown_until.map_or(true, |until| until <= now)
    }

    /// State as an observer would see it right now, without running recovery.
    pub(super) fn effective_state(&self, now: Instant) -> TokenState {
        match self.state {
            TokenState::Cooling if self.cooldown_elapsed(now) => TokenState::Available,
            state => state,
        }
    }

    pub(super) fn snapshot(&self, now: Instant) -> TokenSnapshot {
        let cooldown_remaining_secs = match self.effective_state(now) {
            TokenState::Cooling => self
                .cooldown_until
                .map(|until| until.saturating_duration_since(now).as_secs()),
            _ => None,
        };

        TokenSnapshot {
            id: self.id,
            masked: mask_secret(&self.secret),
            state: self.effective_state(now),
            usage_count: self.usage_count,
            consecutive_failures: self.consecutive_failures,
            in_flight: self.in_flight,
            last_used: self.last_used_wall,
            cooldown_remaining_secs,
        }
    }
}

/// The part of a token handed to the upstream client for one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub id: TokenId,
    pub secret: String,
}

impl Credential {
    pub fn masked(&self) -> String {
        mask_secret(&self.secret)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TokenSnapshot {
    pub id: TokenId,
    pub masked: String,
    pub state: TokenState,
    pub usage_count: u64,
    pub consecutive_failures: u32,
    pub in_flight: u32,
    pub last_used: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cooldown_remaining_secs: Option<u64>,
}

/// Keep only the last six characters of a secret for logs and reports.
pub fn mask_secret(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 6 {
        return "***".to_string();
    }
    let tail: String = chars[chars.len() - 6..].iter().collect();
    format!("...{}", tail)
}
