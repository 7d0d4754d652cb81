//! Configured automations run from load listeners.
//!
//! An image's `on_load_finished` and `on_error` lists are turned into
//! listeners that queue [`ImageAction`]s on the manager. Paths and log
//! messages may contain `{id}` (the image that fired) and `{code}` (the
//! error code, empty for finished loads); both are expanded when the
//! listener runs.

use crate::events::{ErrorListener, FinishedListener};
use crate::manager::{ActionSender, ImageAction};
use serde::{Deserialize, Serialize};

/// One configured action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action")]
pub enum Action {
    #[serde(rename = "local_image.load")]
    Load { id: String },

    #[serde(rename = "local_image.reload")]
    Reload {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<String>,
    },

    #[serde(rename = "local_image.release")]
    Release { id: String },

    #[serde(rename = "local_image.set_path")]
    SetPath { id: String, path: String },

    #[serde(rename = "logger.log")]
    Log { message: String },
}

impl Action {
    /// Image the action targets, if any
    pub fn target(&self) -> Option<&str> {
        match self {
            Action::Load { id }
            | Action::Reload { id, .. }
            | Action::Release { id }
            | Action::SetPath { id, .. } => Some(id),
            Action::Log { .. } => None,
        }
    }

    /// Expand templates for an event fired by `source`. Log actions are
    /// written out here and yield nothing to queue.
    pub fn render(&self, source: &str, code: Option<u8>) -> Option<ImageAction> {
        let expand = |template: &str| expand_template(template, source, code);
        match self {
            Action::Load { id } => Some(ImageAction::Load { id: id.clone() }),
            Action::Reload { id, path } => Some(ImageAction::Reload {
                id: id.clone(),
                path: path.as_deref().map(expand),
            }),
            Action::Release { id } => Some(ImageAction::Release { id: id.clone() }),
            Action::SetPath { id, path } => Some(ImageAction::SetPath {
                id: id.clone(),
                path: expand(path),
            }),
            Action::Log { message } => {
                tracing::info!("{}", expand(message));
                None
            }
        }
    }
}

/// Replace `{id}` and `{code}` in `template`
pub fn expand_template(template: &str, source: &str, code: Option<u8>) -> String {
    let code = code.map(|c| c.to_string()).unwrap_or_default();
    template.replace("{id}", source).replace("{code}", &code)
}

fn queue(actions: &[Action], source: &str, code: Option<u8>, sender: &ActionSender) {
    for action in actions {
        if let Some(action) = action.render(source, code) {
            if sender.send(action).is_err() {
                tracing::warn!("{}: action queue closed, dropping automation", source);
                return;
            }
        }
    }
}

/// Listener running `actions` after a successful load of `source`
pub fn finished_listener(actions: Vec<Action>, source: String, sender: ActionSender) -> FinishedListener {
    Box::new(move || queue(&actions, &source, None, &sender))
}

/// Listener running `actions` after a failed load of `source`
pub fn error_listener(actions: Vec<Action>, source: String, sender: ActionSender) -> ErrorListener {
    Box::new(move |code| queue(&actions, &source, Some(code), &sender))
}
