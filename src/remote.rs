//! Remote control surface.
//!
//! A line-oriented TCP protocol: one JSON request per line, one JSON
//! response per line. Four operations are exposed: `start`, `stop`,
//! `change_voltage` and `state`. Requests touching live instruments never
//! execute here; `start` is forwarded to the controller over a command
//! channel, `stop` and `change_voltage` only flip flags in the shared state
//! that the engine polls cooperatively.
//!
//! Snapshots serialize non-finite channel values as JSON null, never as a
//! bare `NaN` literal.

use crate::state::{ChangeVoltageRequest, StateHandle};
use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

/// Operations that need the controller, not just the shared state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RemoteCommand {
    Start,
}

pub type CommandSender = mpsc::UnboundedSender<RemoteCommand>;
pub type CommandReceiver = mpsc::UnboundedReceiver<RemoteCommand>;

pub fn command_channel() -> (CommandSender, CommandReceiver) {
    mpsc::unbounded_channel()
}

#[derive(Debug, Deserialize)]
struct Request {
    method: String,
    #[serde(default)]
    params: Value,
}

/// Accept loop. Runs until the listener is dropped by task abort; each
/// connection is served on its own task.
pub async fn serve(
    listener: TcpListener,
    state: StateHandle,
    commands: CommandSender,
) -> Result<()> {
    let local = listener.local_addr().context("reading listener address")?;
    log::info!("remote control listening on {local}");
    loop {
        let (stream, peer) = listener.accept().await.context("accepting connection")?;
        log::debug!("remote client connected: {peer}");
        let state = state.clone();
        let commands = commands.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_connection(stream, state, commands).await {
                log::warn!("remote client {peer}: {err:#}");
            }
        });
    }
}

async fn handle_connection(
    stream: TcpStream,
    state: StateHandle,
    commands: CommandSender,
) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = dispatch(&line, &state, &commands);
        let mut text = response.to_string();
        text.push('\n');
        writer.write_all(text.as_bytes()).await?;
    }
    Ok(())
}

/// Handles one request line, always producing a response value.
fn dispatch(line: &str, state: &StateHandle, commands: &CommandSender) -> Value {
    let request: Request = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(err) => return error(format!("malformed request: {err}")),
    };
    match request.method.as_str() {
        "start" => {
            if commands.send(RemoteCommand::Start).is_err() {
                return error("controller is not available".into());
            }
            ok()
        }
        "stop" => {
            state.request_stop();
            ok()
        }
        "change_voltage" => {
            let change: ChangeVoltageRequest = match serde_json::from_value(request.params) {
                Ok(change) => change,
                Err(err) => return error(format!("malformed change_voltage params: {err}")),
            };
            if !change.end_voltage.is_finite() {
                return error("end_voltage must be finite".into());
            }
            state.request_change_voltage(change);
            ok()
        }
        "state" => match serde_json::to_value(state.snapshot()) {
            Ok(snapshot) => json!({ "status": "ok", "result": snapshot }),
            Err(err) => error(format!("serializing state: {err}")),
        },
        other => error(format!("unknown method '{other}'")),
    }
}

fn ok() -> Value {
    json!({ "status": "ok" })
}

fn error(message: String) -> Value {
    json!({ "status": "error", "message": message })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::MeasurementState;

    fn setup() -> (StateHandle, CommandSender, CommandReceiver) {
        let state = StateHandle::new(MeasurementState::default());
        let (tx, rx) = command_channel();
        (state, tx, rx)
    }

    #[test]
    fn test_start_forwards_to_controller() {
        let (state, tx, mut rx) = setup();
        let response = dispatch(r#"{"method": "start"}"#, &state, &tx);
        assert_eq!(response["status"], "ok");
        assert_eq!(rx.try_recv().unwrap(), RemoteCommand::Start);
    }

    #[test]
    fn test_stop_sets_the_flag() {
        let (state, tx, _rx) = setup();
        assert!(!state.stop_requested());
        dispatch(r#"{"method": "stop"}"#, &state, &tx);
        assert!(state.stop_requested());
    }

    #[test]
    fn test_change_voltage_applies_defaults() {
        let (state, tx, _rx) = setup();
        let response = dispatch(
            r#"{"method": "change_voltage", "params": {"end_voltage": -50.0}}"#,
            &state,
            &tx,
        );
        assert_eq!(response["status"], "ok");
        let request = state.take_change_voltage().unwrap();
        assert_eq!(request.end_voltage, -50.0);
        assert_eq!(request.step_voltage, 1.0);
        assert_eq!(request.waiting_time, 1.0);
    }

    #[test]
    fn test_state_snapshot_has_null_for_unset_channels() {
        let (state, tx, _rx) = setup();
        state.set_source_voltage(1.5);
        let response = dispatch(r#"{"method": "state"}"#, &state, &tx);
        assert_eq!(response["status"], "ok");
        assert_eq!(response["result"]["source_voltage"], json!(1.5));
        assert_eq!(response["result"]["smu_current"], Value::Null);
    }

    #[test]
    fn test_malformed_and_unknown_requests() {
        let (state, tx, _rx) = setup();
        assert_eq!(dispatch("not json", &state, &tx)["status"], "error");
        assert_eq!(
            dispatch(r#"{"method": "reboot"}"#, &state, &tx)["status"],
            "error"
        );
        let response = dispatch(
            r#"{"method": "change_voltage", "params": {}}"#,
            &state,
            &tx,
        );
        assert_eq!(response["status"], "error");
    }

    #[tokio::test]
    async fn test_tcp_round_trip() {
        let (state, tx, mut rx) = setup();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(serve(listener, state.clone(), tx));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"{\"method\": \"start\"}\n{\"method\": \"stop\"}\n")
            .await
            .unwrap();
        let (reader, _) = stream.split();
        let mut lines = BufReader::new(reader).lines();
        let first: Value =
            serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(first["status"], "ok");
        let second: Value =
            serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(second["status"], "ok");

        assert_eq!(rx.recv().await.unwrap(), RemoteCommand::Start);
        assert!(state.stop_requested());
        server.abort();
    }
}
