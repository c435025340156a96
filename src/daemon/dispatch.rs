//! Request dispatch for the profile daemon

use anyhow::{bail, Context, Result};
use tracing::{debug, info, warn};

use crate::config::DaemonState;
use crate::ipc::{Message, Request, Value};

fn texts(items: impl IntoIterator<Item = String>) -> Vec<Value> {
    items.into_iter().map(Value::Text).collect()
}

/// Run one request against the daemon state and build its response
///
/// Errors mean the connection should be closed without a reply: the tag was
/// not recognized, or a mutation could not be persisted.
pub fn handle_request(state: &mut DaemonState, msg: &Message) -> Result<Message> {
    let request = Request::parse(msg);
    debug!(request = ?request, "Handling request");

    let values = match &request {
        Request::GetProfiles => texts(state.profiles()),

        Request::HasProfile { profile } => vec![state.has_profile(profile).into()],

        Request::GetProfile => vec![state.current_profile().into()],

        Request::SetProfile { profile } => {
            let (active, known) = state.set_profile(profile);
            if known {
                persist(state, &request)?;
            }
            vec![active.into()]
        }

        Request::GetKeys => texts(state.known_keys()),

        Request::GetValue { profile, key } => vec![state.effective_value(profile, key).into()],

        Request::SetValue {
            profile,
            key,
            value,
        } => {
            if state.set_value(profile, key, value) {
                persist(state, &request)?;
                vec![value.as_str().into()]
            } else {
                // Unknown profile: report the unchanged effective value
                vec![state.effective_value(profile, key).into()]
            }
        }

        Request::GetDatatype { key } => vec![state.datatype(key).into()],

        Request::GetValues { profile } => state
            .values_for(profile)
            .into_iter()
            .map(|(k, v, t)| Value::List(vec![k.into(), v.into(), t.into()]))
            .collect(),

        Request::Unrecognized { tag, reason } => {
            warn!(tag = %tag, reason = %reason, "Unrecognized request");
            bail!("Unrecognized request '{tag}': {reason}");
        }
    };

    Ok(Message::response(request.name(), values))
}

fn persist(state: &DaemonState, request: &Request) -> Result<()> {
    state
        .save()
        .context(format!("Failed to persist state after {request}"))?;
    info!(request = %request, profile = %state.current_profile(), "State persisted");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServicePaths;
    use std::fs;
    use tempfile::TempDir;

    fn setup() -> (TempDir, DaemonState) {
        let dir = TempDir::new().unwrap();
        let paths = ServicePaths::from_root(dir.path());
        paths.ensure_dirs().unwrap();
        fs::write(
            paths.config_dir.join("base.ini"),
            "[fallback]\nvol=5\n[datatype]\nvol=INTEGER\n[general]\ntone=beep\n",
        )
        .unwrap();
        let state = DaemonState::load(paths);
        (dir, state)
    }

    fn call(state: &mut DaemonState, name: &str, args: &[&str]) -> Vec<Value> {
        let msg = Message::request(name, args.iter().map(|a| Value::from(*a)).collect());
        let rsp = handle_request(state, &msg).unwrap();
        assert_eq!(rsp.tag, format!("{name}.rsp"));
        rsp.values
    }

    #[test]
    fn test_read_requests() {
        let (_dir, mut state) = setup();

        assert_eq!(call(&mut state, "get_profile", &[]), vec![Value::from("general")]);
        assert_eq!(call(&mut state, "has_profile", &["silent"]), vec![Value::Bool(true)]);
        assert_eq!(call(&mut state, "has_profile", &["fallback"]), vec![Value::Bool(false)]);
        assert_eq!(call(&mut state, "get_value", &["general", "vol"]), vec![Value::from("5")]);
        assert_eq!(call(&mut state, "get_datatype", &["vol"]), vec![Value::from("INTEGER")]);
        assert_eq!(call(&mut state, "get_datatype", &["tone"]), vec![Value::from("UNKNOWN")]);
        assert_eq!(call(&mut state, "get_keys", &[]), vec![Value::from("tone")]);
        assert_eq!(
            call(&mut state, "get_profiles", &[]),
            texts(["general", "meeting", "outdoors", "silent"].map(String::from))
        );
        assert_eq!(
            call(&mut state, "get_values", &["general"]),
            vec![Value::List(vec!["tone".into(), "beep".into(), "UNKNOWN".into()])]
        );
    }

    #[test]
    fn test_set_value_persists() {
        let (_dir, mut state) = setup();

        assert_eq!(call(&mut state, "set_value", &["general", "vol", "8"]), vec![Value::from("8")]);
        assert_eq!(call(&mut state, "get_value", &["general", "vol"]), vec![Value::from("8")]);
        assert_eq!(
            fs::read_to_string(&state.paths.values_file).unwrap(),
            "[general]\nvol=8\n"
        );
    }

    #[test]
    fn test_set_value_unknown_profile() {
        let (_dir, mut state) = setup();

        assert_eq!(call(&mut state, "set_value", &["ghost", "vol", "8"]), vec![Value::from("5")]);
        assert!(state.values.section_names().next().is_none());
        assert!(!state.paths.values_file.exists());
    }

    #[test]
    fn test_set_profile_persists_tag() {
        let (_dir, mut state) = setup();

        assert_eq!(call(&mut state, "set_profile", &["ghost"]), vec![Value::from("general")]);
        assert!(!state.paths.profile_tag.exists());

        assert_eq!(call(&mut state, "set_profile", &["meeting"]), vec![Value::from("meeting")]);
        assert_eq!(fs::read_to_string(&state.paths.profile_tag).unwrap(), "meeting");
    }

    #[test]
    fn test_unknown_request_fails() {
        let (_dir, mut state) = setup();
        let msg = Message::request("format_disk", vec![]);
        assert!(handle_request(&mut state, &msg).is_err());

        let bad_args = Message::request("get_value", vec!["general".into()]);
        assert!(handle_request(&mut state, &bad_args).is_err());
    }

    #[test]
    fn test_persist_failure_surfaces() {
        let (_dir, mut state) = setup();
        // Replace the values directory with a file so the save cannot land
        let values_dir = state.paths.values_dir().to_path_buf();
        fs::remove_dir_all(&values_dir).unwrap();
        fs::write(&values_dir, "blocked").unwrap();

        let msg = Message::request("set_value", vec!["general".into(), "vol".into(), "8".into()]);
        assert!(handle_request(&mut state, &msg).is_err());
    }
}
