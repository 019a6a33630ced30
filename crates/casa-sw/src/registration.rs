//! Worker registration state machine.
//!
//! A registration holds at most one installing, one waiting and one active
//! worker. All changes go through [`Registration::transition`], which either
//! applies the event and reports what happened, or rejects it and leaves the
//! state untouched.

use std::time::Instant;

use tracing::debug;
use url::Url;

use crate::{ServiceWorkerError, ServiceWorkerId, ServiceWorkerState};

// ==================== Service Worker ====================

/// A service worker version.
#[derive(Debug, Clone)]
pub struct ServiceWorker {
    /// Unique ID.
    pub id: ServiceWorkerId,

    /// Script URL.
    pub script_url: Url,

    /// Version tag of the build.
    pub version: String,

    /// Current state.
    pub state: ServiceWorkerState,

    /// Time of last state change.
    pub state_changed_at: Instant,
}

impl ServiceWorker {
    /// Create a new service worker.
    pub fn new(script_url: Url, version: impl Into<String>) -> Self {
        Self {
            id: ServiceWorkerId::new(),
            script_url,
            version: version.into(),
            state: ServiceWorkerState::Parsed,
            state_changed_at: Instant::now(),
        }
    }

    /// Set state.
    pub fn set_state(&mut self, state: ServiceWorkerState) {
        self.state = state;
        self.state_changed_at = Instant::now();
    }

    /// Check if active.
    pub fn is_active(&self) -> bool {
        self.state == ServiceWorkerState::Activated
    }

    /// Check if redundant.
    pub fn is_redundant(&self) -> bool {
        self.state == ServiceWorkerState::Redundant
    }
}

// ==================== State ====================

/// Registration state.
#[derive(Debug, Clone, Default)]
pub enum RegistrationState {
    #[default]
    Unregistered,
    /// A worker is installing; an older one may still be active.
    Installing {
        installing: ServiceWorker,
        active: Option<ServiceWorker>,
    },
    /// Installed and parked behind the active worker.
    Waiting {
        waiting: ServiceWorker,
        active: ServiceWorker,
    },
    Activating {
        activating: ServiceWorker,
    },
    Activated {
        active: ServiceWorker,
    },
}

impl RegistrationState {
    pub fn name(&self) -> &'static str {
        match self {
            RegistrationState::Unregistered => "unregistered",
            RegistrationState::Installing { .. } => "installing",
            RegistrationState::Waiting { .. } => "waiting",
            RegistrationState::Activating { .. } => "activating",
            RegistrationState::Activated { .. } => "activated",
        }
    }
}

/// Events driving the registration.
#[derive(Debug, Clone)]
pub enum RegistrationEvent {
    /// A new worker version starts installing.
    StartInstall(ServiceWorker),
    /// The install handler finished.
    InstallCompleted,
    /// The install handler failed; the worker is discarded.
    InstallFailed,
    /// Release the waiting worker.
    SkipWaiting,
    /// The activate handler finished.
    ActivateCompleted {
        /// Whether the worker asked to control already-open pages.
        claimed: bool,
    },
    Unregister,
}

impl RegistrationEvent {
    pub fn name(&self) -> &'static str {
        match self {
            RegistrationEvent::StartInstall(_) => "start-install",
            RegistrationEvent::InstallCompleted => "install-completed",
            RegistrationEvent::InstallFailed => "install-failed",
            RegistrationEvent::SkipWaiting => "skip-waiting",
            RegistrationEvent::ActivateCompleted { .. } => "activate-completed",
            RegistrationEvent::Unregister => "unregister",
        }
    }
}

/// What a transition did, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationNotice {
    UpdateFound(ServiceWorkerId),
    StateChanged {
        worker: ServiceWorkerId,
        state: ServiceWorkerState,
    },
    /// Fired once per controller swap.
    ControllerChanged(ServiceWorkerId),
}

// ==================== Registration ====================

/// A service worker registration.
#[derive(Debug)]
pub struct Registration {
    /// Scope URL.
    pub scope: Url,

    state: RegistrationState,

    /// Worker controlling the scope's pages.
    controller: Option<ServiceWorkerId>,
}

impl Registration {
    /// Create a new registration.
    pub fn new(scope: Url) -> Self {
        Self {
            scope,
            state: RegistrationState::Unregistered,
            controller: None,
        }
    }

    pub fn state(&self) -> &RegistrationState {
        &self.state
    }

    pub fn controller(&self) -> Option<ServiceWorkerId> {
        self.controller
    }

    pub fn installing(&self) -> Option<&ServiceWorker> {
        match &self.state {
            RegistrationState::Installing { installing, .. } => Some(installing),
            _ => None,
        }
    }

    pub fn waiting(&self) -> Option<&ServiceWorker> {
        match &self.state {
            RegistrationState::Waiting { waiting, .. } => Some(waiting),
            _ => None,
        }
    }

    /// The active worker, including one still activating.
    pub fn active(&self) -> Option<&ServiceWorker> {
        match &self.state {
            RegistrationState::Installing { active, .. } => active.as_ref(),
            RegistrationState::Waiting { active, .. } => Some(active),
            RegistrationState::Activating { activating } => Some(activating),
            RegistrationState::Activated { active } => Some(active),
            RegistrationState::Unregistered => None,
        }
    }

    /// Version tag of the newest worker held.
    pub fn newest_version(&self) -> Option<&str> {
        self.installing()
            .or_else(|| self.waiting())
            .or_else(|| self.active())
            .map(|w| w.version.as_str())
    }

    /// Apply an event.
    pub fn transition(
        &mut self,
        event: RegistrationEvent,
    ) -> Result<Vec<RegistrationNotice>, ServiceWorkerError> {
        use RegistrationEvent as E;
        use RegistrationState as S;

        let state = std::mem::take(&mut self.state);
        let state_name = state.name();
        let event_name = event.name();
        let mut notices = Vec::new();

        let next = match (state, event) {
            (S::Unregistered, E::StartInstall(mut worker)) => {
                set(&mut worker, ServiceWorkerState::Installing, &mut notices, true);
                S::Installing {
                    installing: worker,
                    active: None,
                }
            }
            (S::Activated { active }, E::StartInstall(mut worker)) => {
                if worker.id <= active.id {
                    self.state = S::Activated { active };
                    return Err(ServiceWorkerError::InvalidTransition {
                        state: state_name,
                        event: event_name,
                    });
                }
                set(&mut worker, ServiceWorkerState::Installing, &mut notices, true);
                S::Installing {
                    installing: worker,
                    active: Some(active),
                }
            }
            (S::Waiting { mut waiting, active }, E::StartInstall(mut worker)) => {
                if worker.id <= waiting.id {
                    self.state = S::Waiting { waiting, active };
                    return Err(ServiceWorkerError::InvalidTransition {
                        state: state_name,
                        event: event_name,
                    });
                }
                // The parked worker is superseded by the newer build.
                set(&mut waiting, ServiceWorkerState::Redundant, &mut notices, false);
                set(&mut worker, ServiceWorkerState::Installing, &mut notices, true);
                S::Installing {
                    installing: worker,
                    active: Some(active),
                }
            }
            (
                S::Installing {
                    mut installing,
                    active: None,
                },
                E::InstallCompleted,
            ) => {
                set(&mut installing, ServiceWorkerState::Installed, &mut notices, false);
                set(&mut installing, ServiceWorkerState::Activating, &mut notices, false);
                S::Activating {
                    activating: installing,
                }
            }
            (
                S::Installing {
                    mut installing,
                    active: Some(active),
                },
                E::InstallCompleted,
            ) => {
                set(&mut installing, ServiceWorkerState::Installed, &mut notices, false);
                S::Waiting {
                    waiting: installing,
                    active,
                }
            }
            (
                S::Installing {
                    mut installing,
                    active,
                },
                E::InstallFailed,
            ) => {
                set(&mut installing, ServiceWorkerState::Redundant, &mut notices, false);
                match active {
                    Some(active) => S::Activated { active },
                    None => S::Unregistered,
                }
            }
            (
                S::Waiting {
                    mut waiting,
                    mut active,
                },
                E::SkipWaiting,
            ) => {
                set(&mut active, ServiceWorkerState::Redundant, &mut notices, false);
                set(&mut waiting, ServiceWorkerState::Activating, &mut notices, false);
                S::Activating {
                    activating: waiting,
                }
            }
            (S::Activating { mut activating }, E::ActivateCompleted { claimed }) => {
                set(&mut activating, ServiceWorkerState::Activated, &mut notices, false);
                // Pages already under the old worker move over; a claim also
                // takes uncontrolled ones.
                if (claimed || self.controller.is_some())
                    && self.controller != Some(activating.id)
                {
                    self.controller = Some(activating.id);
                    notices.push(RegistrationNotice::ControllerChanged(activating.id));
                }
                S::Activated { active: activating }
            }
            (S::Unregistered, E::Unregister) => {
                self.state = S::Unregistered;
                return Err(ServiceWorkerError::InvalidTransition {
                    state: state_name,
                    event: event_name,
                });
            }
            (held, E::Unregister) => {
                for mut worker in held_workers(held) {
                    set(&mut worker, ServiceWorkerState::Redundant, &mut notices, false);
                }
                self.controller = None;
                S::Unregistered
            }
            (state, _) => {
                self.state = state;
                return Err(ServiceWorkerError::InvalidTransition {
                    state: state_name,
                    event: event_name,
                });
            }
        };

        debug!(
            scope = %self.scope,
            from = state_name,
            event = event_name,
            to = next.name(),
            "Registration transition"
        );
        self.state = next;
        Ok(notices)
    }
}

fn set(
    worker: &mut ServiceWorker,
    state: ServiceWorkerState,
    notices: &mut Vec<RegistrationNotice>,
    update_found: bool,
) {
    worker.set_state(state);
    if update_found {
        notices.push(RegistrationNotice::UpdateFound(worker.id));
    }
    notices.push(RegistrationNotice::StateChanged {
        worker: worker.id,
        state,
    });
}

fn held_workers(state: RegistrationState) -> Vec<ServiceWorker> {
    match state {
        RegistrationState::Unregistered => Vec::new(),
        RegistrationState::Installing { installing, active } => {
            std::iter::once(installing).chain(active).collect()
        }
        RegistrationState::Waiting { waiting, active } => vec![waiting, active],
        RegistrationState::Activating { activating } => vec![activating],
        RegistrationState::Activated { active } => vec![active],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope() -> Url {
        Url::parse("https://casas.example/").unwrap()
    }

    fn worker(version: &str) -> ServiceWorker {
        ServiceWorker::new(
            Url::parse("https://casas.example/service-worker.js").unwrap(),
            version,
        )
    }

    /// Registration with `v1` active and controlling.
    fn activated(version: &str) -> (Registration, ServiceWorkerId) {
        let mut registration = Registration::new(scope());
        let w = worker(version);
        let id = w.id;
        registration
            .transition(RegistrationEvent::StartInstall(w))
            .unwrap();
        registration
            .transition(RegistrationEvent::InstallCompleted)
            .unwrap();
        registration
            .transition(RegistrationEvent::ActivateCompleted { claimed: true })
            .unwrap();
        (registration, id)
    }

    #[test]
    fn test_service_worker_creation() {
        let w = worker("v1");
        assert_eq!(w.state, ServiceWorkerState::Parsed);
        assert_eq!(w.version, "v1");
        assert!(!w.is_active());
    }

    #[test]
    fn test_first_install_goes_straight_to_activating() {
        let mut registration = Registration::new(scope());
        let w = worker("v1");
        let id = w.id;

        let notices = registration
            .transition(RegistrationEvent::StartInstall(w))
            .unwrap();
        assert_eq!(
            notices,
            vec![
                RegistrationNotice::UpdateFound(id),
                RegistrationNotice::StateChanged {
                    worker: id,
                    state: ServiceWorkerState::Installing
                },
            ]
        );

        let notices = registration
            .transition(RegistrationEvent::InstallCompleted)
            .unwrap();
        assert_eq!(notices.len(), 2);
        assert!(matches!(
            registration.state(),
            RegistrationState::Activating { .. }
        ));
        assert!(registration.waiting().is_none());
    }

    #[test]
    fn test_first_activation_with_claim_takes_control() {
        let (registration, id) = activated("v1");
        assert_eq!(registration.controller(), Some(id));
        assert!(registration.active().unwrap().is_active());
    }

    #[test]
    fn test_first_activation_without_claim_controls_nothing() {
        let mut registration = Registration::new(scope());
        registration
            .transition(RegistrationEvent::StartInstall(worker("v1")))
            .unwrap();
        registration
            .transition(RegistrationEvent::InstallCompleted)
            .unwrap();
        let notices = registration
            .transition(RegistrationEvent::ActivateCompleted { claimed: false })
            .unwrap();

        assert_eq!(registration.controller(), None);
        assert!(!notices
            .iter()
            .any(|n| matches!(n, RegistrationNotice::ControllerChanged(_))));
    }

    #[test]
    fn test_update_parks_in_waiting() {
        let (mut registration, v1) = activated("v1");
        let v2 = worker("v2");
        let v2_id = v2.id;

        registration
            .transition(RegistrationEvent::StartInstall(v2))
            .unwrap();
        assert_eq!(registration.installing().unwrap().id, v2_id);
        assert_eq!(registration.active().unwrap().id, v1);

        let notices = registration
            .transition(RegistrationEvent::InstallCompleted)
            .unwrap();
        assert_eq!(
            notices,
            vec![RegistrationNotice::StateChanged {
                worker: v2_id,
                state: ServiceWorkerState::Installed
            }]
        );
        assert_eq!(registration.waiting().unwrap().id, v2_id);
        assert_eq!(registration.controller(), Some(v1));
        assert_eq!(registration.newest_version(), Some("v2"));
    }

    #[test]
    fn test_skip_waiting_swaps_controller_once() {
        let (mut registration, v1) = activated("v1");
        let v2 = worker("v2");
        let v2_id = v2.id;
        registration
            .transition(RegistrationEvent::StartInstall(v2))
            .unwrap();
        registration
            .transition(RegistrationEvent::InstallCompleted)
            .unwrap();

        let notices = registration
            .transition(RegistrationEvent::SkipWaiting)
            .unwrap();
        assert!(notices.contains(&RegistrationNotice::StateChanged {
            worker: v1,
            state: ServiceWorkerState::Redundant
        }));

        let notices = registration
            .transition(RegistrationEvent::ActivateCompleted { claimed: true })
            .unwrap();
        let swaps = notices
            .iter()
            .filter(|n| matches!(n, RegistrationNotice::ControllerChanged(_)))
            .count();
        assert_eq!(swaps, 1);
        assert_eq!(registration.controller(), Some(v2_id));
        assert_eq!(registration.active().unwrap().version, "v2");
    }

    #[test]
    fn test_controlled_pages_follow_even_without_claim() {
        let (mut registration, _) = activated("v1");
        let v2 = worker("v2");
        let v2_id = v2.id;
        registration
            .transition(RegistrationEvent::StartInstall(v2))
            .unwrap();
        registration
            .transition(RegistrationEvent::InstallCompleted)
            .unwrap();
        registration
            .transition(RegistrationEvent::SkipWaiting)
            .unwrap();
        let notices = registration
            .transition(RegistrationEvent::ActivateCompleted { claimed: false })
            .unwrap();

        assert!(notices.contains(&RegistrationNotice::ControllerChanged(v2_id)));
    }

    #[test]
    fn test_skip_waiting_without_waiting_worker_is_rejected() {
        let (mut registration, v1) = activated("v1");
        let err = registration
            .transition(RegistrationEvent::SkipWaiting)
            .unwrap_err();
        assert!(matches!(err, ServiceWorkerError::InvalidTransition { .. }));
        assert_eq!(registration.active().unwrap().id, v1);
        assert!(matches!(
            registration.state(),
            RegistrationState::Activated { .. }
        ));
    }

    #[test]
    fn test_newer_install_replaces_waiting_worker() {
        let (mut registration, _) = activated("v1");
        let v2 = worker("v2");
        let v2_id = v2.id;
        registration
            .transition(RegistrationEvent::StartInstall(v2))
            .unwrap();
        registration
            .transition(RegistrationEvent::InstallCompleted)
            .unwrap();

        let notices = registration
            .transition(RegistrationEvent::StartInstall(worker("v3")))
            .unwrap();
        assert_eq!(
            notices[0],
            RegistrationNotice::StateChanged {
                worker: v2_id,
                state: ServiceWorkerState::Redundant
            }
        );
        assert_eq!(registration.installing().unwrap().version, "v3");
    }

    #[test]
    fn test_install_failure_keeps_active() {
        let (mut registration, v1) = activated("v1");
        registration
            .transition(RegistrationEvent::StartInstall(worker("v2")))
            .unwrap();
        registration
            .transition(RegistrationEvent::InstallFailed)
            .unwrap();

        assert_eq!(registration.active().unwrap().id, v1);
        assert_eq!(registration.newest_version(), Some("v1"));
    }

    #[test]
    fn test_stale_worker_rejected() {
        let old = worker("v0");
        let (mut registration, _) = activated("v1");
        assert!(registration
            .transition(RegistrationEvent::StartInstall(old))
            .is_err());
        assert_eq!(registration.newest_version(), Some("v1"));
    }

    #[test]
    fn test_stale_worker_rejected_while_waiting() {
        let stale = worker("v0");
        let (mut registration, v1) = activated("v1");
        let v2 = worker("v2");
        let v2_id = v2.id;
        registration
            .transition(RegistrationEvent::StartInstall(v2))
            .unwrap();
        registration
            .transition(RegistrationEvent::InstallCompleted)
            .unwrap();

        let err = registration
            .transition(RegistrationEvent::StartInstall(stale))
            .unwrap_err();
        assert!(matches!(err, ServiceWorkerError::InvalidTransition { .. }));
        assert_eq!(registration.waiting().map(|w| w.id), Some(v2_id));
        assert_eq!(registration.active().map(|w| w.id), Some(v1));
        assert_eq!(registration.newest_version(), Some("v2"));
    }

    #[test]
    fn test_unregister() {
        let (mut registration, v1) = activated("v1");
        let notices = registration
            .transition(RegistrationEvent::Unregister)
            .unwrap();
        assert_eq!(
            notices,
            vec![RegistrationNotice::StateChanged {
                worker: v1,
                state: ServiceWorkerState::Redundant
            }]
        );
        assert!(registration.active().is_none());
        assert_eq!(registration.controller(), None);

        assert!(registration
            .transition(RegistrationEvent::Unregister)
            .is_err());
    }
}
