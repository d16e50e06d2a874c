//! Connection lifecycle as a pure state machine.
//!
//! One machine drives one socket. [`transition`] maps `(state, event)` to the
//! next state plus the effects the manager must apply, in order; nothing here
//! touches storage, the registry or the socket.

use tenant_messaging_core::{ConnectOutcome, Credentials, DisconnectReason};

/// Lifecycle state of one socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// Socket opened, identity not yet confirmed.
    Connecting { awaiting_scan: bool },
    Connected { phone_number: String },
    /// Terminal for this socket.
    Disconnected { reason: DisconnectReason },
}

/// Something the socket reported.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    CredentialsUpdated(Credentials),
    QrReceived(String),
    Opened { phone_number: String },
    Closed(DisconnectReason),
}

/// Side effect requested by a transition.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Write-through the rotated credentials before acknowledging.
    PersistCredentials(Credentials),
    /// Render the raw challenge, cache it, and resolve a pending connect.
    PublishQr(String),
    ClearQr,
    /// Settings: `{connected: true, phoneNumber, lastConnected: now}`.
    RecordConnected { phone_number: String },
    ResetReconnectAttempts,
    ResolvePending(ConnectOutcome),
    RemoveConnection,
    PurgeSession,
    /// Settings: `{connected: false, phoneNumber: ''}`.
    RecordLoggedOut,
    /// Reconnect after the backoff for `attempt` (1-based).
    ScheduleReconnect { attempt: u32 },
    /// Give up reconnecting; settings go offline, pairing is kept.
    MarkReconnectFailed { reason: String },
}

/// State plus the reconnect bookkeeping carried across sockets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionMachine {
    pub state: ConnectionState,
    /// Consecutive transient reconnects so far.
    pub reconnect_attempts: u32,
    pub max_attempts: u32,
}

impl SessionMachine {
    /// A machine for a freshly opened socket.
    #[must_use]
    pub const fn new(reconnect_attempts: u32, max_attempts: u32) -> Self {
        Self {
            state: ConnectionState::Connecting {
                awaiting_scan: false,
            },
            reconnect_attempts,
            max_attempts,
        }
    }

    /// Apply `event` in place, returning the effects.
    pub fn handle(&mut self, event: Event) -> Vec<Effect> {
        let (next, effects) = transition(self, event);
        *self = next;
        effects
    }

    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self.state, ConnectionState::Disconnected { .. })
    }
}

/// Pure transition function.
#[must_use]
pub fn transition(machine: &SessionMachine, event: Event) -> (SessionMachine, Vec<Effect>) {
    use ConnectionState::{Connected, Connecting, Disconnected};

    let mut next = machine.clone();
    let effects = match (&machine.state, event) {
        (
            Disconnected {
                reason: DisconnectReason::LoggedOut,
            },
            Event::CredentialsUpdated(_),
        ) => Vec::new(),
        (_, Event::CredentialsUpdated(credentials)) => {
            vec![Effect::PersistCredentials(credentials)]
        }

        (Disconnected { .. }, _) => Vec::new(),

        (Connecting { .. }, Event::QrReceived(raw)) => {
            next.state = Connecting {
                awaiting_scan: true,
            };
            vec![Effect::PublishQr(raw)]
        }
        (Connected { .. }, Event::QrReceived(_)) => Vec::new(),

        (_, Event::Opened { phone_number }) => {
            next.state = Connected {
                phone_number: phone_number.clone(),
            };
            next.reconnect_attempts = 0;
            vec![
                Effect::RecordConnected {
                    phone_number: phone_number.clone(),
                },
                Effect::ClearQr,
                Effect::ResetReconnectAttempts,
                Effect::ResolvePending(ConnectOutcome::Connected { phone_number }),
            ]
        }

        (_, Event::Closed(reason)) if reason.is_logged_out() => {
            next.state = Disconnected { reason };
            vec![
                Effect::RemoveConnection,
                Effect::ClearQr,
                Effect::PurgeSession,
                Effect::RecordLoggedOut,
                Effect::ResolvePending(ConnectOutcome::Failed("Logged out".to_string())),
            ]
        }
        (_, Event::Closed(reason)) => {
            next.state = Disconnected { reason };
            let attempt = machine.reconnect_attempts.saturating_add(1);
            next.reconnect_attempts = attempt;
            if attempt <= machine.max_attempts {
                vec![
                    Effect::RemoveConnection,
                    Effect::ScheduleReconnect { attempt },
                ]
            } else {
                let reason = format!(
                    "Reconnect failed after {} attempts ({reason})",
                    machine.max_attempts
                );
                vec![
                    Effect::RemoveConnection,
                    Effect::ClearQr,
                    Effect::MarkReconnectFailed {
                        reason: reason.clone(),
                    },
                    Effect::ResolvePending(ConnectOutcome::Failed(reason)),
                ]
            }
        }
    };

    (next, effects)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn connected(phone: &str) -> SessionMachine {
        SessionMachine {
            state: ConnectionState::Connected {
                phone_number: phone.to_string(),
            },
            reconnect_attempts: 0,
            max_attempts: 3,
        }
    }

    #[test]
    fn test_qr_moves_to_awaiting_scan() {
        let mut machine = SessionMachine::new(0, 3);
        let effects = machine.handle(Event::QrReceived("ref,key".to_string()));

        assert_eq!(effects, vec![Effect::PublishQr("ref,key".to_string())]);
        assert_eq!(
            machine.state,
            ConnectionState::Connecting {
                awaiting_scan: true
            }
        );
    }

    #[test]
    fn test_open_records_clears_qr_and_resolves() {
        let mut machine = SessionMachine::new(2, 3);
        machine.handle(Event::QrReceived("ref".to_string()));

        let effects = machine.handle(Event::Opened {
            phone_number: "923001234567".to_string(),
        });

        assert_eq!(
            effects,
            vec![
                Effect::RecordConnected {
                    phone_number: "923001234567".to_string()
                },
                Effect::ClearQr,
                Effect::ResetReconnectAttempts,
                Effect::ResolvePending(ConnectOutcome::Connected {
                    phone_number: "923001234567".to_string()
                }),
            ]
        );
        assert_eq!(machine.reconnect_attempts, 0);
    }

    #[test]
    fn test_logged_out_is_terminal_and_purges() {
        let mut machine = connected("923001234567");
        let effects = machine.handle(Event::Closed(DisconnectReason::LoggedOut));

        assert!(effects.contains(&Effect::PurgeSession));
        assert!(effects.contains(&Effect::RecordLoggedOut));
        assert!(effects.contains(&Effect::RemoveConnection));
        assert!(!effects.iter().any(|e| matches!(e, Effect::ScheduleReconnect { .. })));
        assert!(machine.is_terminal());

        // Nothing after logout touches storage again.
        let late = machine.handle(Event::CredentialsUpdated(Credentials::new(json!({}))));
        assert!(late.is_empty());
    }

    #[test]
    fn test_transient_close_schedules_reconnect() {
        let mut machine = connected("923001234567");
        let effects = machine.handle(Event::Closed(DisconnectReason::ConnectionLost));

        assert_eq!(
            effects,
            vec![
                Effect::RemoveConnection,
                Effect::ScheduleReconnect { attempt: 1 }
            ]
        );
        assert!(machine.is_terminal());
        assert_eq!(machine.reconnect_attempts, 1);
    }

    #[test]
    fn test_reconnects_capped() {
        let mut machine = SessionMachine::new(3, 3);
        let effects = machine.handle(Event::Closed(DisconnectReason::RestartRequired));

        assert!(effects.iter().any(|e| matches!(e, Effect::MarkReconnectFailed { .. })));
        assert!(effects.iter().any(|e| matches!(
            e,
            Effect::ResolvePending(ConnectOutcome::Failed(_))
        )));
        assert!(!effects.iter().any(|e| matches!(e, Effect::ScheduleReconnect { .. })));
        assert!(!effects.contains(&Effect::PurgeSession));
    }

    #[test]
    fn test_credentials_persisted_in_every_live_state() {
        let creds = Credentials::new(json!({"registered": true}));
        for mut machine in [SessionMachine::new(0, 3), connected("92300")] {
            let effects = machine.handle(Event::CredentialsUpdated(creds.clone()));
            assert_eq!(effects, vec![Effect::PersistCredentials(creds.clone())]);
        }
    }

    #[test]
    fn test_events_after_close_ignored() {
        let mut machine = connected("92300");
        machine.handle(Event::Closed(DisconnectReason::ConnectionLost));

        assert!(machine.handle(Event::QrReceived("x".to_string())).is_empty());
        assert!(
            machine
                .handle(Event::Opened {
                    phone_number: "92300".to_string()
                })
                .is_empty()
        );
    }

    #[test]
    fn test_transition_is_pure() {
        let machine = SessionMachine::new(0, 3);
        let (next, _) = transition(&machine, Event::QrReceived("x".to_string()));
        assert_eq!(machine, SessionMachine::new(0, 3));
        assert_ne!(next, machine);
    }
}
