use crate::CoreError;
use std::fmt;

/// Where a build is. Step 0 is the base layer; step `i` builds manifest `i`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildState {
    Init,
    LoadingManifests,
    Step { index: usize },
    Assembling,
    Done,
    Failed { reason: String },
}

impl BuildState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed { .. })
    }
}

impl fmt::Display for BuildState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Init => f.write_str("init"),
            Self::LoadingManifests => f.write_str("loading-manifests"),
            Self::Step { index } => write!(f, "step-{index}"),
            Self::Assembling => f.write_str("assembling"),
            Self::Done => f.write_str("done"),
            Self::Failed { .. } => f.write_str("failed"),
        }
    }
}

pub fn validate_transition(from: &BuildState, to: &BuildState) -> Result<(), CoreError> {
    let valid = match (from, to) {
        (BuildState::Step { index: a }, BuildState::Step { index: b }) => *b == a + 1,
        (from, BuildState::Failed { .. }) => !from.is_terminal(),
        _ => matches!(
            (from, to),
            (BuildState::Init, BuildState::LoadingManifests)
                | (BuildState::LoadingManifests, BuildState::Step { index: 0 })
                | (BuildState::Step { .. }, BuildState::Assembling)
                | (BuildState::Assembling, BuildState::Done)
        ),
    };

    if valid {
        Ok(())
    } else {
        Err(CoreError::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}
