// Push notification handling
// Turns a push payload into something displayable and decides where a click should go

use log::warn;
use serde::Deserialize;
use serde_json::Value;

pub const DEFAULT_TITLE: &str = "roshLingua";
pub const DEFAULT_BODY: &str = "You have a new message";
pub const DEFAULT_CLICK_URL: &str = "/chat";

#[derive(Debug, Default, Deserialize)]
struct PushPayload {
    title: Option<String>,
    body: Option<String>,
    data: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PushNotification {
    pub title: String,
    pub body: String,
    pub data: Option<Value>,
}

/// What to do when the user clicks a notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClickAction {
    FocusExisting(String),
    OpenWindow(String),
}

impl PushNotification {
    /// Parse a push payload; absent or malformed payloads fall back to defaults.
    pub fn from_payload(payload: Option<&str>) -> Self {
        let parsed = match payload {
            Some(raw) => match serde_json::from_str::<PushPayload>(raw) {
                Ok(parsed) => parsed,
                Err(e) => {
                    warn!("Malformed push payload, using defaults: {}", e);
                    PushPayload::default()
                }
            },
            None => PushPayload::default(),
        };

        Self {
            title: parsed.title.filter(|t| !t.is_empty()).unwrap_or_else(|| DEFAULT_TITLE.to_string()),
            body: parsed.body.filter(|b| !b.is_empty()).unwrap_or_else(|| DEFAULT_BODY.to_string()),
            data: parsed.data,
        }
    }

    /// `data.url` if present, otherwise the chat list.
    pub fn click_target(&self) -> String {
        self.data
            .as_ref()
            .and_then(|data| data.get("url"))
            .and_then(Value::as_str)
            .filter(|url| !url.is_empty())
            .unwrap_or(DEFAULT_CLICK_URL)
            .to_string()
    }

    /// Focus an already open window showing the target, or open a new one.
    pub fn resolve_click<S: AsRef<str>>(&self, open_windows: &[S]) -> ClickAction {
        let target = self.click_target();
        if open_windows.iter().any(|url| same_location(url.as_ref(), &target)) {
            ClickAction::FocusExisting(target)
        } else {
            ClickAction::OpenWindow(target)
        }
    }
}

// Compare path parts only; open windows report absolute URLs
fn same_location(window_url: &str, target: &str) -> bool {
    fn path_of(url: &str) -> &str {
        let without_scheme = match url.find("://") {
            Some(idx) => &url[idx + 3..],
            None => return url,
        };
        match without_scheme.find('/') {
            Some(idx) => &without_scheme[idx..],
            None => "/",
        }
    }
    path_of(window_url) == path_of(target)
}
