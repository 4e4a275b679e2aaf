use serde::{Deserialize, Serialize};

/// Directional view of the block relation between two users, for UI
/// disambiguation. The send gate itself only cares about the symmetric OR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockState {
    None,
    BlockedByMe,
    BlockedByOther,
}

impl BlockState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockState::None => "none",
            BlockState::BlockedByMe => "blocked_by_me",
            BlockState::BlockedByOther => "blocked_by_other",
        }
    }
}
