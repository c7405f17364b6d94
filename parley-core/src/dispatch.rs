//! Inbound event routing
//!
//! Maps signaling event names to the machine that handles them. The table is
//! filled when the transport connects and emptied when it disconnects, so
//! nothing is delivered to a machine outside the transport's lifetime.

use crate::signaling::events;
use std::collections::HashMap;

/// Which machine handles an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Route {
    /// [`CallSessionMachine`](crate::call::CallSessionMachine)
    Call,
    /// [`MatchSessionMachine`](crate::matching::MatchSessionMachine)
    Match,
}

/// Inbound events handled by the call machine
pub const CALL_EVENTS: &[&str] = &[
    events::CALL_INCOMING,
    events::CALL_ACCEPTED,
    events::CALL_REJECTED,
    events::CALL_ENDED,
    events::CALL_OFFER,
    events::CALL_ANSWER,
    events::CALL_ICE_CANDIDATE,
    events::CALL_TOGGLE_MUTE,
    events::CALL_TOGGLE_VIDEO,
    events::PARTICIPANT_JOINED,
    events::PARTICIPANT_LEFT,
];

/// Inbound events handled by the match machine
pub const MATCH_EVENTS: &[&str] = &[
    events::WAITING_FOR_PARTNER,
    events::MATCH_FOUND,
    events::SIGNAL_OFFER,
    events::SIGNAL_ANSWER,
    events::SIGNAL_ICE_CANDIDATE,
    events::MATCH_ENDED,
];

/// Event name to machine table
#[derive(Debug, Default, Clone)]
pub struct DispatchTable {
    routes: HashMap<&'static str, Route>,
}

impl DispatchTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every inbound call and match event
    pub fn register_defaults(&mut self) {
        for event in CALL_EVENTS {
            self.register(event, Route::Call);
        }
        for event in MATCH_EVENTS {
            self.register(event, Route::Match);
        }
    }

    /// Route `event` to `route`, replacing any previous route
    pub fn register(&mut self, event: &'static str, route: Route) {
        if let Some(previous) = self.routes.insert(event, route) {
            if previous != route {
                tracing::debug!(event, ?previous, ?route, "Event re-routed");
            }
        }
    }

    /// Drop every route
    pub fn clear(&mut self) {
        self.routes.clear();
    }

    /// Machine handling `event`
    pub fn route(&self, event: &str) -> Option<Route> {
        self.routes.get(event).copied()
    }

    /// Number of routed events
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Whether nothing is routed
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
