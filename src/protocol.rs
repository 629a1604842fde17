//! Wire protocol shared by both subprotocols (`asyonline/asy` between
//! client and frontend, `asyonline.asy` between frontend-as-client and
//! executor). Every message is a text frame of the form `"<verb> <json>"`,
//! optionally followed by one binary frame carrying a payload.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    Svg,
    Pdf,
    Png,
}

impl Format {
    pub fn as_ext(&self) -> &'static str {
        match self {
            Format::Svg => "svg",
            Format::Pdf => "pdf",
            Format::Png => "png",
        }
    }
}

impl Default for Format {
    fn default() -> Self {
        Format::Svg
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stream {
    Stdout,
    Stderr,
}

/// `add` — absent-vs-present distinguished by the caller owning the binary
/// follow-up frame, not by an `Option` here.
#[derive(Debug, Deserialize)]
pub struct AddArgs {
    pub filename: String,
}

/// `options` — every field is a pointer in the original protocol; `None`
/// here means "leave unchanged", matching that absent-field semantics.
#[derive(Debug, Default, Deserialize)]
pub struct OptionsArgs {
    pub duration: Option<f64>,
    pub format: Option<Format>,
    #[serde(rename = "stderrRedir")]
    pub stderr_redir: Option<bool>,
    pub verbosity: Option<u8>,
}

#[derive(Debug, Deserialize)]
pub struct StartArgs {
    pub main: String,
}

#[derive(Debug)]
pub enum Inbound {
    Add(AddArgs),
    Options(OptionsArgs),
    Start(StartArgs),
    Input,
    Restore,
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("empty message")]
    Empty,
    #[error("unknown verb {0:?}")]
    UnknownVerb(String),
    #[error("malformed arguments: {0}")]
    BadArgs(String),
}

pub fn decode(text: &str) -> Result<Inbound, DecodeError> {
    let (verb, rest) = text.split_once(' ').unwrap_or((text, ""));
    if verb.is_empty() {
        return Err(DecodeError::Empty);
    }
    let rest = rest.trim();
    match verb {
        "add" => serde_json::from_str(rest)
            .map(Inbound::Add)
            .map_err(|e| DecodeError::BadArgs(e.to_string())),
        "options" => {
            if rest.is_empty() {
                return Ok(Inbound::Options(OptionsArgs::default()));
            }
            serde_json::from_str(rest)
                .map(Inbound::Options)
                .map_err(|e| DecodeError::BadArgs(e.to_string()))
        }
        "start" => serde_json::from_str(rest)
            .map(Inbound::Start)
            .map_err(|e| DecodeError::BadArgs(e.to_string())),
        "input" => Ok(Inbound::Input),
        "restore" => Ok(Inbound::Restore),
        other => Err(DecodeError::UnknownVerb(other.to_string())),
    }
}

#[derive(Debug, Serialize)]
struct DenyArgs<'a> {
    reason: &'a str,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OutputArgs {
    pub stream: Stream,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ResultArgs {
    pub format: Format,
}

#[derive(Debug, Serialize)]
struct CompleteArgs<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a str>,
}

/// Owned counterpart of `CompleteArgs`, for decoding a `complete` message
/// received from a backend.
#[derive(Debug, Default, Deserialize)]
pub struct CompleteNotice {
    pub error: Option<String>,
}

pub fn encode_deny(reason: &str) -> String {
    format!(
        "deny {}",
        serde_json::to_string(&DenyArgs { reason }).expect("serialize DenyArgs")
    )
}

pub fn encode_output(stream: Stream) -> String {
    format!(
        "output {}",
        serde_json::to_string(&OutputArgs { stream }).expect("serialize OutputArgs")
    )
}

pub fn encode_add(filename: &str) -> String {
    format!(
        "add {}",
        serde_json::to_string(&AddArgsOut { filename }).expect("serialize AddArgsOut")
    )
}

pub fn encode_start(main: &str) -> String {
    format!(
        "start {}",
        serde_json::to_string(&StartArgsOut { main }).expect("serialize StartArgsOut")
    )
}

pub fn encode_options(options: &OptionsOut) -> String {
    format!(
        "options {}",
        serde_json::to_string(options).expect("serialize OptionsOut")
    )
}

#[derive(Debug, Serialize)]
struct AddArgsOut<'a> {
    filename: &'a str,
}

#[derive(Debug, Serialize)]
struct StartArgsOut<'a> {
    main: &'a str,
}

#[derive(Debug, Default, Serialize)]
pub struct OptionsOut {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<Format>,
    #[serde(rename = "stderrRedir", skip_serializing_if = "Option::is_none")]
    pub stderr_redir: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verbosity: Option<u8>,
}

pub fn encode_result(format: Format) -> String {
    format!(
        "result {}",
        serde_json::to_string(&ResultArgs { format }).expect("serialize ResultArgs")
    )
}

pub fn encode_complete(error: Option<&str>) -> String {
    format!(
        "complete {}",
        serde_json::to_string(&CompleteArgs { error }).expect("serialize CompleteArgs")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_add() {
        match decode(r#"add {"filename":"foo.asy"}"#).unwrap() {
            Inbound::Add(args) => assert_eq!(args.filename, "foo.asy"),
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn decodes_partial_options() {
        match decode(r#"options {"duration":5.0}"#).unwrap() {
            Inbound::Options(args) => {
                assert_eq!(args.duration, Some(5.0));
                assert_eq!(args.format, None);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_verb() {
        assert!(matches!(
            decode("restart {}"),
            Err(DecodeError::UnknownVerb(v)) if v == "restart"
        ));
    }

    #[test]
    fn input_and_restore_parse_with_no_args() {
        assert!(matches!(decode("input").unwrap(), Inbound::Input));
        assert!(matches!(decode("restore").unwrap(), Inbound::Restore));
    }

    #[test]
    fn round_trips_deny_text() {
        let text = encode_deny("bad filename");
        assert!(text.starts_with("deny "));
        assert!(text.contains("bad filename"));
    }
}
