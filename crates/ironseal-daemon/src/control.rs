//! JSON-lines control protocol spoken over the daemon's Unix socket.
//!
//! Each request is one JSON object per line tagged by `method`; each reply is
//! one JSON object per line. `subscribe` turns the connection into an event
//! stream.

use ironseal_core::error::{IronsealError, IronsealResult};
use ironseal_core::keyfile::KEY_LEN;
use ironseal_core::unlock::Admission;
use ironseal_core::{Credential, IronsealService, UpdateAction};
use ironseal_provider::DeviceBackend;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Mutex;
use std::time::Instant;
use zeroize::Zeroizing;

#[derive(Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum Request {
    Unlock {
        #[serde(default)]
        password: Option<String>,
        /// Hex-encoded raw key for key decryptors.
        #[serde(default)]
        key: Option<String>,
    },
    IsUnlocked,
    ChangePassword {
        current: String,
        new: String,
    },
    GetUpdates,
    GetUpdatesStatus,
    ApplyUpdates,
    Subscribe,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct Response {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    pub fn ok(result: Value) -> Self {
        Self {
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            result: None,
            error: Some(message.into()),
        }
    }

    pub fn to_line(&self) -> String {
        let mut line = serde_json::to_string(self)
            .unwrap_or_else(|err| format!(r#"{{"ok":false,"error":"encode failed: {err}"}}"#));
        line.push('\n');
        line
    }
}

impl From<IronsealResult<Value>> for Response {
    fn from(result: IronsealResult<Value>) -> Self {
        match result {
            Ok(value) => Response::ok(value),
            Err(err) => Response::error(err.to_string()),
        }
    }
}

/// Parse one request line; malformed input becomes an error response.
pub fn parse(line: &str) -> Result<Request, Response> {
    serde_json::from_str(line).map_err(|err| Response::error(format!("malformed request: {err}")))
}

pub fn credential(password: Option<String>, key: Option<String>) -> IronsealResult<Credential> {
    match (password, key) {
        (Some(password), None) => Ok(Credential::Password(Zeroizing::new(password))),
        (None, Some(key)) => {
            let key = Zeroizing::new(key);
            let bytes = Zeroizing::new(hex::decode(key.trim()).map_err(|err| {
                IronsealError::InvalidParameter {
                    name: "key".into(),
                    reason: err.to_string(),
                }
            })?);
            let array: [u8; KEY_LEN] =
                bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| IronsealError::InvalidParameter {
                        name: "key".into(),
                        reason: format!("expected {KEY_LEN} bytes, got {}", bytes.len()),
                    })?;
            Ok(Credential::key(array))
        }
        _ => Err(IronsealError::InvalidParameter {
            name: "credential".into(),
            reason: "provide exactly one of `password` or `key`".into(),
        }),
    }
}

fn admission_value(admission: Admission) -> Value {
    match admission {
        Admission::AlreadyUnlocked => json!({ "admission": "already_unlocked" }),
        Admission::Proceed => json!({ "admission": "started" }),
        Admission::InProgress => json!({ "admission": "in_progress" }),
        Admission::Rejected(reason) => json!({ "admission": "rejected", "reason": reason }),
    }
}

fn update_value((action, message): (UpdateAction, String)) -> Value {
    json!({ "action": action, "message": message })
}

/// Execute a non-streaming request against the shared service.
///
/// `Subscribe` is handled by the connection loop and answered here only as a
/// fallback.
pub fn dispatch<B>(service: &Mutex<IronsealService<B>>, request: Request) -> Response
where
    B: DeviceBackend + Send + Sync + 'static,
{
    let Ok(mut service) = service.lock() else {
        return Response::error("service state poisoned");
    };
    let result = match request {
        Request::Unlock { password, key } => credential(password, key)
            .map(|credential| admission_value(service.unlock(credential, Instant::now()))),
        Request::IsUnlocked => Ok(json!({ "unlocked": service.is_unlocked() })),
        Request::ChangePassword { current, new } => service
            .change_password(Zeroizing::new(current), Zeroizing::new(new))
            .map(|()| json!({ "started": true })),
        Request::GetUpdates => service.get_updates().map(update_value),
        Request::GetUpdatesStatus => Ok(update_value(service.get_updates_status())),
        Request::ApplyUpdates => service.apply_updates().map(update_value),
        Request::Subscribe => Ok(json!({ "subscribed": false })),
    };
    result.into()
}
