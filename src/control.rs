//! Out-of-band control protocol for the hosting application.
//!
//! Messages are handled one at a time by an actor task that owns the
//! receiving end of an mpsc channel. Every message that carries a reply
//! channel gets an answer, including ones that fail.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};

use crate::lifecycle::Registration;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ControlError {
  #[error("unknown control message type '{0}'")]
  UnknownMessage(String),
  #[error("malformed control message: {0}")]
  Malformed(String),
  #[error("no active worker")]
  NoActiveWorker,
  #[error("control channel closed")]
  ChannelClosed,
}

pub type ReplyTo = Option<oneshot::Sender<ControlReply>>;

#[derive(Debug)]
pub enum ControlMessage {
  /// Promote the waiting worker without waiting for clients to release
  Activate { reply: ReplyTo },
  /// Report the active version (re-running precache first)
  QueryVersion { reply: ReplyTo },
  /// Drop all generations and auxiliary stores, then re-precache
  ClearCache { reply: ReplyTo },
}

/// Reply tokens, serialized in the wire format the hosting page expects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type")]
pub enum ControlReply {
  #[serde(rename = "ACTIVATE")]
  Activated { promoted: bool },
  #[serde(rename = "VERSION")]
  Version { version: String },
  #[serde(rename = "CLEAR_CACHE")]
  ClearCache { result: bool },
  #[serde(rename = "ERROR")]
  Error { reason: String },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum WireMessage {
  #[serde(rename = "ACTIVATE")]
  Activate,
  #[serde(rename = "VERSION")]
  Version,
  #[serde(rename = "CLEAR_CACHE")]
  ClearCache,
}

const KNOWN_TYPES: &[&str] = &["ACTIVATE", "VERSION", "CLEAR_CACHE"];

impl ControlMessage {
  /// Parse a wire message, attaching the given reply channel.
  pub fn from_json(raw: &str, reply: ReplyTo) -> Result<Self, ControlError> {
    let value: serde_json::Value =
      serde_json::from_str(raw).map_err(|e| ControlError::Malformed(e.to_string()))?;

    let tag = value
      .get("type")
      .and_then(|t| t.as_str())
      .ok_or_else(|| ControlError::Malformed("missing 'type' field".to_string()))?;
    if !KNOWN_TYPES.contains(&tag) {
      return Err(ControlError::UnknownMessage(tag.to_string()));
    }

    let wire: WireMessage =
      serde_json::from_value(value).map_err(|e| ControlError::Malformed(e.to_string()))?;
    Ok(match wire {
      WireMessage::Activate => ControlMessage::Activate { reply },
      WireMessage::Version => ControlMessage::QueryVersion { reply },
      WireMessage::ClearCache => ControlMessage::ClearCache { reply },
    })
  }
}

/// Sending side of the control channel.
#[derive(Clone)]
pub struct ControlHandle {
  tx: mpsc::UnboundedSender<ControlMessage>,
}

/// Spawn the control actor for a registration.
pub fn spawn(registration: Arc<Registration>) -> ControlHandle {
  let (tx, mut rx) = mpsc::unbounded_channel();

  tokio::spawn(async move {
    while let Some(message) = rx.recv().await {
      handle(&registration, message).await;
    }
  });

  ControlHandle { tx }
}

async fn handle(registration: &Registration, message: ControlMessage) {
  match message {
    ControlMessage::Activate { reply } => {
      if let Some(waiting) = registration.waiting().await {
        info!(version = %waiting.version(), "Activation requested");
      }
      let promoted = match registration.skip_waiting().await {
        Ok(promoted) => {
          promoted
        }
        Err(e) => {
          error!(error = %e, "Activation failed");
          false
        }
      };
      respond(reply, ControlReply::Activated { promoted });
    }
    ControlMessage::QueryVersion { reply } => {
      let answer = match registration.active().await {
        Some(worker) => {
          worker.precache().await;
          ControlReply::Version {
            version: worker.version().to_string(),
          }
        }
        None => ControlReply::Error {
          reason: ControlError::NoActiveWorker.to_string(),
        },
      };
      respond(reply, answer);
    }
    ControlMessage::ClearCache { reply } => {
      let result = match registration.active().await {
        Some(worker) => match worker.clear_cache().await {
          Ok(()) => true,
          Err(e) => {
            error!(error = %e, "Clear cache failed");
            false
          }
        },
        None => {
          warn!("Clear cache requested without an active worker");
          false
        }
      };
      respond(reply, ControlReply::ClearCache { result });
    }
  }
}

fn respond(reply: ReplyTo, answer: ControlReply) {
  if let Some(tx) = reply {
    // The caller may have stopped listening
    let _ = tx.send(answer);
  }
}

impl ControlHandle {
  /// Fire-and-forget.
  pub fn post(&self, message: ControlMessage) -> Result<(), ControlError> {
    self
      .tx
      .send(message)
      .map_err(|_| ControlError::ChannelClosed)
  }

  async fn request(
    &self,
    make: impl FnOnce(ReplyTo) -> ControlMessage,
  ) -> Result<ControlReply, ControlError> {
    let (tx, rx) = oneshot::channel();
    self.post(make(Some(tx)))?;
    rx.await.map_err(|_| ControlError::ChannelClosed)
  }

  /// Returns whether a waiting worker was promoted.
  pub async fn activate(&self) -> Result<bool, ControlError> {
    match self
      .request(|reply| ControlMessage::Activate { reply })
      .await?
    {
      ControlReply::Activated { promoted } => Ok(promoted),
      other => Err(unexpected(other)),
    }
  }

  pub async fn query_version(&self) -> Result<String, ControlError> {
    match self
      .request(|reply| ControlMessage::QueryVersion { reply })
      .await?
    {
      ControlReply::Version { version } => Ok(version),
      ControlReply::Error { .. } => Err(ControlError::NoActiveWorker),
      other => Err(unexpected(other)),
    }
  }

  pub async fn clear_cache(&self) -> Result<bool, ControlError> {
    match self
      .request(|reply| ControlMessage::ClearCache { reply })
      .await?
    {
      ControlReply::ClearCache { result } => Ok(result),
      other => Err(unexpected(other)),
    }
  }

  /// Dispatch a raw wire message. Rejected messages are answered with an
  /// `Error` reply rather than dropped.
  pub async fn dispatch_json(&self, raw: &str) -> ControlReply {
    let (tx, rx) = oneshot::channel();
    let message = match ControlMessage::from_json(raw, Some(tx)) {
      Ok(message) => message,
      Err(e) => {
        warn!(error = %e, "Rejected control message");
        return ControlReply::Error {
          reason: e.to_string(),
        };
      }
    };

    if let Err(e) = self.post(message) {
      return ControlReply::Error {
        reason: e.to_string(),
      };
    }
    rx.await.unwrap_or_else(|_| ControlReply::Error {
      reason: ControlError::ChannelClosed.to_string(),
    })
  }
}

fn unexpected(reply: ControlReply) -> ControlError {
  ControlError::Malformed(format!("unexpected reply {:?}", reply))
}
