//! View model of the "new version available" panel.

use std::fmt;

use casa_sw::ServiceWorkerId;
use serde::Serialize;
use tokio::sync::watch;

use crate::monitor::{PendingUpdate, UpdateTrigger};

/// Buttons on the panel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationAction {
    UpdateNow,
    Later,
}

impl NotificationAction {
    pub fn label(&self) -> &'static str {
        match self {
            NotificationAction::UpdateNow => "Update now",
            NotificationAction::Later => "Later",
        }
    }
}

/// What the panel shows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotificationView {
    pub title: &'static str,
    pub message: &'static str,
    pub actions: [NotificationAction; 2],
}

impl Default for NotificationView {
    fn default() -> Self {
        Self {
            title: "New version available",
            message: "An updated version of the site is ready. Update now to load it.",
            actions: [NotificationAction::UpdateNow, NotificationAction::Later],
        }
    }
}

impl fmt::Display for NotificationView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.title, self.message)?;
        for action in &self.actions {
            write!(f, " [{}]", action.label())?;
        }
        Ok(())
    }
}

/// Update prompt driven by the monitor's pending flag.
#[derive(Debug)]
pub struct UpdateNotification {
    pending: watch::Receiver<PendingUpdate>,
    trigger: UpdateTrigger,
    /// Waiting worker the user said "later" to.
    dismissed_for: Option<ServiceWorkerId>,
}

impl UpdateNotification {
    pub fn new(pending: watch::Receiver<PendingUpdate>, trigger: UpdateTrigger) -> Self {
        Self {
            pending,
            trigger,
            dismissed_for: None,
        }
    }

    /// The panel, or `None` when there is nothing to show.
    pub fn view(&self) -> Option<NotificationView> {
        let pending = *self.pending.borrow();
        if !pending.available {
            return None;
        }
        if pending.waiting.is_some() && pending.waiting == self.dismissed_for {
            return None;
        }
        Some(NotificationView::default())
    }

    pub fn is_visible(&self) -> bool {
        self.view().is_some()
    }

    /// Apply a button press.
    pub fn act(&mut self, action: NotificationAction) -> casa_common::Result<()> {
        match action {
            NotificationAction::UpdateNow => self.update_now(),
            NotificationAction::Later => {
                self.later();
                Ok(())
            }
        }
    }

    /// Release the waiting worker and hide the panel.
    pub fn update_now(&mut self) -> casa_common::Result<()> {
        let waiting = self.pending.borrow().waiting;
        self.trigger.trigger_update()?;
        self.dismissed_for = waiting;
        Ok(())
    }

    /// Hide the panel for the current waiting worker. The flag stays set.
    pub fn later(&mut self) {
        let waiting = self.pending.borrow().waiting;
        log::debug!("Update prompt dismissed");
        self.dismissed_for = waiting;
    }

    /// Wait until the flag changes. Errors once the monitor is gone.
    pub async fn changed(&mut self) -> Result<(), watch::error::RecvError> {
        self.pending.changed().await
    }
}
