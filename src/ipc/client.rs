//! Client connection to the profile daemon
//!
//! Turns method calls into one request/response exchange each.

use anyhow::{anyhow, bail, Context, Result};
use std::os::unix::net::UnixStream;
use std::path::Path;

use super::messages::{Message, Request, Value};
use super::{read_message, write_message};
use crate::constants::wire;

pub struct ProfileClient {
    stream: UnixStream,
}

impl ProfileClient {
    /// Connect to specific socket path
    pub fn connect_to(path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(path)
            .context(format!("Failed to connect to profiled at {}", path.display()))?;
        Ok(Self { stream })
    }

    /// Send a raw message without waiting for a reply
    pub fn send(&mut self, msg: &Message) -> Result<()> {
        write_message(&mut self.stream, msg)
    }

    /// Receive one raw message (blocking)
    pub fn recv(&mut self) -> Result<Message> {
        read_message(&mut self.stream)
    }

    /// Send request and wait for the matching response values
    pub fn request(&mut self, req: &Request) -> Result<Vec<Value>> {
        self.send(&req.to_message())?;
        let rsp = self.recv().context(format!("No response to {req}"))?;
        let expected = format!("{}{}", req.name(), wire::RESPONSE_SUFFIX);
        if rsp.tag != expected {
            bail!("Unexpected response tag '{}' (expected '{}')", rsp.tag, expected);
        }
        Ok(rsp.values)
    }

    fn single(&mut self, req: &Request) -> Result<Value> {
        self.request(req)?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("Empty response to {req}"))
    }

    fn text(&mut self, req: &Request) -> Result<String> {
        let value = self.single(req)?;
        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| anyhow!("Expected string in response to {req}, got {value:?}"))
    }

    fn texts(&mut self, req: &Request) -> Result<Vec<String>> {
        self.request(req)?
            .into_iter()
            .map(|v| match v {
                Value::Text(s) => Ok(s),
                other => Err(anyhow!("Expected string in response to {req}, got {other:?}")),
            })
            .collect()
    }

    pub fn get_profiles(&mut self) -> Result<Vec<String>> {
        self.texts(&Request::GetProfiles)
    }

    pub fn has_profile(&mut self, profile: &str) -> Result<bool> {
        let req = Request::HasProfile {
            profile: profile.to_string(),
        };
        let value = self.single(&req)?;
        value
            .as_bool()
            .ok_or_else(|| anyhow!("Expected boolean in response to {req}, got {value:?}"))
    }

    pub fn get_profile(&mut self) -> Result<String> {
        self.text(&Request::GetProfile)
    }

    pub fn set_profile(&mut self, profile: &str) -> Result<String> {
        self.text(&Request::SetProfile {
            profile: profile.to_string(),
        })
    }

    pub fn get_keys(&mut self) -> Result<Vec<String>> {
        self.texts(&Request::GetKeys)
    }

    pub fn get_value(&mut self, profile: &str, key: &str) -> Result<String> {
        self.text(&Request::GetValue {
            profile: profile.to_string(),
            key: key.to_string(),
        })
    }

    pub fn set_value(&mut self, profile: &str, key: &str, value: &str) -> Result<String> {
        self.text(&Request::SetValue {
            profile: profile.to_string(),
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    pub fn get_datatype(&mut self, key: &str) -> Result<String> {
        self.text(&Request::GetDatatype { key: key.to_string() })
    }

    /// (key, value, datatype) for every known key
    pub fn get_values(&mut self, profile: &str) -> Result<Vec<(String, String, String)>> {
        let req = Request::GetValues {
            profile: profile.to_string(),
        };
        self.request(&req)?
            .iter()
            .map(|item| match item.as_list() {
                Some([Value::Text(k), Value::Text(v), Value::Text(t)]) => {
                    Ok((k.clone(), v.clone(), t.clone()))
                }
                _ => Err(anyhow!("Malformed entry in response to {req}: {item:?}")),
            })
            .collect()
    }
}
