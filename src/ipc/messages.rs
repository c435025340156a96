//! IPC message types for client ↔ daemon communication
//!
//! A message is a tag plus an ordered list of primitive values. Requests carry
//! tags ending in `.req`, responses the same prefix with `.rsp`.

use anyhow::{anyhow, bail, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::constants::wire;

/// Primitive payload value
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Text(String),
    List(Vec<Value>),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

/// One framed message on the wire
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub tag: String,
    #[serde(default)]
    pub values: Vec<Value>,
}

impl Message {
    pub fn new(tag: impl Into<String>, values: Vec<Value>) -> Self {
        Self {
            tag: tag.into(),
            values,
        }
    }

    /// `<name>.req`
    pub fn request(name: &str, values: Vec<Value>) -> Self {
        Self::new(format!("{name}{}", wire::REQUEST_SUFFIX), values)
    }

    /// `<name>.rsp`
    pub fn response(name: &str, values: Vec<Value>) -> Self {
        Self::new(format!("{name}{}", wire::RESPONSE_SUFFIX), values)
    }
}

/// Requests understood by the daemon
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    GetProfiles,
    HasProfile { profile: String },
    GetProfile,
    SetProfile { profile: String },
    GetKeys,
    GetValue { profile: String, key: String },
    SetValue { profile: String, key: String, value: String },
    GetDatatype { key: String },
    GetValues { profile: String },
    /// Unknown tag or arguments that do not fit the tag
    Unrecognized { tag: String, reason: String },
}

impl Request {
    /// Request name without the `.req` suffix
    pub fn name(&self) -> &str {
        match self {
            Request::GetProfiles => "get_profiles",
            Request::HasProfile { .. } => "has_profile",
            Request::GetProfile => "get_profile",
            Request::SetProfile { .. } => "set_profile",
            Request::GetKeys => "get_keys",
            Request::GetValue { .. } => "get_value",
            Request::SetValue { .. } => "set_value",
            Request::GetDatatype { .. } => "get_datatype",
            Request::GetValues { .. } => "get_values",
            Request::Unrecognized { tag, .. } => tag,
        }
    }

    /// Classify a received message; never fails, bad input becomes `Unrecognized`
    pub fn parse(msg: &Message) -> Self {
        Self::try_parse(msg).unwrap_or_else(|e| Request::Unrecognized {
            tag: msg.tag.clone(),
            reason: e.to_string(),
        })
    }

    fn try_parse(msg: &Message) -> Result<Self> {
        let name = msg
            .tag
            .strip_suffix(wire::REQUEST_SUFFIX)
            .ok_or_else(|| anyhow!("tag does not end in {}", wire::REQUEST_SUFFIX))?;
        let args = msg
            .values
            .iter()
            .map(|v| v.as_str().map(str::to_string))
            .collect::<Option<Vec<String>>>()
            .ok_or_else(|| anyhow!("non-string argument"))?;

        let request = match (name, args.as_slice()) {
            ("get_profiles", []) => Request::GetProfiles,
            ("has_profile", [profile]) => Request::HasProfile {
                profile: profile.clone(),
            },
            ("get_profile", []) => Request::GetProfile,
            ("set_profile", [profile]) => Request::SetProfile {
                profile: profile.clone(),
            },
            ("get_keys", []) => Request::GetKeys,
            ("get_value", [profile, key]) => Request::GetValue {
                profile: profile.clone(),
                key: key.clone(),
            },
            ("set_value", [profile, key, value]) => Request::SetValue {
                profile: profile.clone(),
                key: key.clone(),
                value: value.clone(),
            },
            ("get_datatype", [key]) => Request::GetDatatype { key: key.clone() },
            ("get_values", [profile]) => Request::GetValues {
                profile: profile.clone(),
            },
            (
                "get_profiles" | "has_profile" | "get_profile" | "set_profile" | "get_keys"
                | "get_value" | "set_value" | "get_datatype" | "get_values",
                _,
            ) => bail!("wrong argument count {} for {name}", args.len()),
            _ => bail!("unknown request"),
        };
        Ok(request)
    }

    /// Wire form of this request
    pub fn to_message(&self) -> Message {
        let args: Vec<Value> = match self {
            Request::GetProfiles | Request::GetProfile | Request::GetKeys => vec![],
            Request::HasProfile { profile }
            | Request::SetProfile { profile }
            | Request::GetValues { profile } => vec![profile.as_str().into()],
            Request::GetValue { profile, key } => vec![profile.as_str().into(), key.as_str().into()],
            Request::SetValue { profile, key, value } => vec![
                profile.as_str().into(),
                key.as_str().into(),
                value.as_str().into(),
            ],
            Request::GetDatatype { key } => vec![key.as_str().into()],
            Request::Unrecognized { tag, .. } => return Message::new(tag.clone(), vec![]),
        };
        Message::request(self.name(), args)
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}
