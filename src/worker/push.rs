//! Push payloads and the notifications they produce.

use serde::{Deserialize, Serialize};

const DEFAULT_BODY: &str = "Nueva notificación";

/// What the server pushes. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PushPayload {
  pub title: Option<String>,
  pub body: Option<String>,
  pub url: Option<String>,
}

impl PushPayload {
  /// Parse push data. Data that isn't a JSON object is used as the body.
  pub fn from_data(data: &str) -> Self {
    serde_json::from_str(data).unwrap_or_else(|_| Self {
      body: Some(data.to_string()),
      ..Self::default()
    })
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationAction {
  Open,
  Close,
}

impl NotificationAction {
  pub fn title(&self) -> &'static str {
    match self {
      NotificationAction::Open => "Abrir",
      NotificationAction::Close => "Cerrar",
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
  pub title: String,
  pub body: String,
  /// Where "open" navigates to
  pub url: String,
  pub actions: Vec<NotificationAction>,
}

impl Notification {
  pub fn from_payload(payload: Option<PushPayload>, default_title: &str) -> Self {
    let payload = payload.unwrap_or_default();
    Self {
      title: payload.title.unwrap_or_else(|| default_title.to_string()),
      body: payload.body.unwrap_or_else(|| DEFAULT_BODY.to_string()),
      url: payload.url.unwrap_or_else(|| "/".to_string()),
      actions: vec![NotificationAction::Open, NotificationAction::Close],
    }
  }

  /// Handle a click. `None` (the notification body itself) and `"open"`
  /// navigate; `"close"` and unknown actions just dismiss.
  pub fn click(&self, action: Option<&str>) -> Option<&str> {
    match action {
      None | Some("open") => Some(self.url.as_str()),
      _ => None,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_payload_fields_used() {
    let payload = PushPayload::from_data(r#"{"title":"X","body":"Y","url":"/z"}"#);
    let notification = Notification::from_payload(Some(payload), "ERP");
    assert_eq!(notification.title, "X");
    assert_eq!(notification.body, "Y");
    assert_eq!(notification.click(Some("open")), Some("/z"));
    assert_eq!(
      notification.actions,
      vec![NotificationAction::Open, NotificationAction::Close]
    );
  }

  #[test]
  fn test_defaults() {
    let notification = Notification::from_payload(None, "ERP");
    assert_eq!(notification.title, "ERP");
    assert_eq!(notification.body, DEFAULT_BODY);
    assert_eq!(notification.click(None), Some("/"));
  }

  #[test]
  fn test_close_does_not_navigate() {
    let notification = Notification::from_payload(None, "ERP");
    assert_eq!(notification.click(Some("close")), None);
  }

  #[test]
  fn test_plain_text_payload_becomes_body() {
    let payload = PushPayload::from_data("Stock bajo en sucursal 2");
    assert_eq!(payload.body.as_deref(), Some("Stock bajo en sucursal 2"));
    assert!(payload.title.is_none());
  }
}
