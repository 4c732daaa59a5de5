use crate::ports::PortError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Active,
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionAction {
    Activate,
    Disconnect,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateTransition {
    pub from: SessionState,
    pub to: SessionState,
    pub reason: &'static str,
}

pub fn session_transition(
    from: SessionState,
    action: SessionAction,
) -> Result<(SessionState, StateTransition), PortError> {
    let (to, reason) = match (from, action) {
        (SessionState::Created, SessionAction::Activate) => {
            (SessionState::Active, "first_message")
        }
        (SessionState::Created, SessionAction::Disconnect)
        | (SessionState::Active, SessionAction::Disconnect) => {
            (SessionState::Disconnected, "disconnect")
        }
        _ => {
            return Err(PortError::Validation(format!(
                "illegal session transition: {from:?} --{action:?}-->"
            )))
        }
    };
    Ok((to, StateTransition { from, to, reason }))
}
