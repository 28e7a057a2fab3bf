// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Topic grammar for the TELEMETRY and MGMT protocol families.
//!
//! Both families are `/`-delimited. Parsing and formatting are pure
//! functions; wildcard matching is delegated to [`sparkmesh_mqtt::topic`]'s
//! `TopicName`/`TopicFilter` primitives rather than reimplemented.

use std::fmt;

use sparkmesh_mqtt::topic::{TopicFilter, TopicName};
use thiserror::Error;

/// TELEMETRY message type, carried as the third topic level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MsgType {
    /// Node birth.
    NBirth,
    /// Node data.
    NData,
    /// Node death.
    NDeath,
    /// Device birth.
    DBirth,
    /// Device data.
    DData,
    /// Device death.
    DDeath,
    /// Node command.
    NCmd,
    /// Device command.
    DCmd,
}

impl MsgType {
    /// Whether this message type is device-scoped (carries `<node>/<device_id>`) rather than
    /// node-scoped (carries just `<node>`).
    #[must_use]
    pub fn is_device_scoped(self) -> bool {
        matches!(self, MsgType::DBirth | MsgType::DData | MsgType::DDeath | MsgType::DCmd)
    }

    fn as_str(self) -> &'static str {
        match self {
            MsgType::NBirth => "NBIRTH",
            MsgType::NData => "NDATA",
            MsgType::NDeath => "NDEATH",
            MsgType::DBirth => "DBIRTH",
            MsgType::DData => "DDATA",
            MsgType::DDeath => "DDEATH",
            MsgType::NCmd => "NCMD",
            MsgType::DCmd => "DCMD",
        }
    }

    fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "NBIRTH" => MsgType::NBirth,
            "NDATA" => MsgType::NData,
            "NDEATH" => MsgType::NDeath,
            "DBIRTH" => MsgType::DBirth,
            "DDATA" => MsgType::DData,
            "DDEATH" => MsgType::DDeath,
            "NCMD" => MsgType::NCmd,
            "DCMD" => MsgType::DCmd,
            _ => return None,
        })
    }
}

impl fmt::Display for MsgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A parsed TELEMETRY topic: `<ns>/<group>/<msg_type>/<node_or_device_id>[/<device_id>]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryTopic {
    /// Namespace, first topic level.
    pub namespace: String,
    /// Group id, second topic level.
    pub group_id: String,
    /// Message type, third topic level.
    pub msg_type: MsgType,
    /// Edge node id.
    pub node_id: String,
    /// Device id, present only for device-scoped message types.
    pub device_id: Option<String>,
}

/// A parsed MGMT topic: `<prefix>/<device_id>/<verb>[/<sub>]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MgmtTopic {
    /// Prefix, first topic level.
    pub prefix: String,
    /// Device id, second topic level.
    pub device_id: String,
    /// Verb, third topic level.
    pub verb: MgmtVerb,
    /// Sub-qualifier, further qualifies `cmd`/`resp` (e.g. `read`/`write`/`execute`).
    pub sub: Option<String>,
}

/// MGMT verb, the third topic level of an [`MgmtTopic`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MgmtVerb {
    /// Registration.
    Reg,
    /// Single-update.
    Update,
    /// Bulk update.
    Bulk,
    /// Deregistration.
    Dereg,
    /// Command.
    Cmd,
    /// Command response.
    Resp,
    /// Lifecycle/telemetry event (consumed by the bridge).
    Event,
    /// Effective configuration.
    Config,
}

impl MgmtVerb {
    fn as_str(self) -> &'static str {
        match self {
            MgmtVerb::Reg => "reg",
            MgmtVerb::Update => "update",
            MgmtVerb::Bulk => "bulk",
            MgmtVerb::Dereg => "dereg",
            MgmtVerb::Cmd => "cmd",
            MgmtVerb::Resp => "resp",
            MgmtVerb::Event => "event",
            MgmtVerb::Config => "config",
        }
    }

    fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "reg" => MgmtVerb::Reg,
            "update" => MgmtVerb::Update,
            "bulk" => MgmtVerb::Bulk,
            "dereg" => MgmtVerb::Dereg,
            "cmd" => MgmtVerb::Cmd,
            "resp" => MgmtVerb::Resp,
            "event" => MgmtVerb::Event,
            "config" => MgmtVerb::Config,
            _ => return None,
        })
    }
}

impl fmt::Display for MgmtVerb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A topic parsed as one of the two protocol families.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedTopic {
    /// A TELEMETRY-family topic.
    Telemetry(TelemetryTopic),
    /// An MGMT-family topic.
    Mgmt(MgmtTopic),
}

/// Error parsing or formatting a topic.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TopicGrammarError {
    /// The topic did not match either protocol family's grammar.
    #[error("topic does not match the TELEMETRY or MGMT grammar: {0}")]
    UnrecognizedShape(String),
    /// The topic's `msg_type` or `verb` level was not a recognized token.
    #[error("unrecognized message type or verb: {0}")]
    UnrecognizedToken(String),
}

/// Parse a topic string as either a TELEMETRY or MGMT topic.
///
/// TELEMETRY is distinguished by its third level being a recognized [`MsgType`] token; MGMT by
/// its third level being a recognized [`MgmtVerb`] token. A topic whose third level matches
/// neither is rejected.
///
/// # Errors
/// Returns [`TopicGrammarError`] if the topic has too few levels or its `msg_type`/`verb` level
/// is unrecognized.
pub fn parse(topic: &str) -> Result<ParsedTopic, TopicGrammarError> {
    let levels: Vec<&str> = topic.split('/').collect();
    if levels.len() < 3 {
        return Err(TopicGrammarError::UnrecognizedShape(topic.to_string()));
    }

    if let Some(msg_type) = MsgType::from_str(levels[2]) {
        let namespace = levels[0].to_string();
        let group_id = levels[1].to_string();
        return if msg_type.is_device_scoped() {
            if levels.len() != 5 {
                return Err(TopicGrammarError::UnrecognizedShape(topic.to_string()));
            }
            Ok(ParsedTopic::Telemetry(TelemetryTopic {
                namespace,
                group_id,
                msg_type,
                node_id: levels[3].to_string(),
                device_id: Some(levels[4].to_string()),
            }))
        } else {
            if levels.len() != 4 {
                return Err(TopicGrammarError::UnrecognizedShape(topic.to_string()));
            }
            Ok(ParsedTopic::Telemetry(TelemetryTopic {
                namespace,
                group_id,
                msg_type,
                node_id: levels[3].to_string(),
                device_id: None,
            }))
        };
    }

    if let Some(verb) = MgmtVerb::from_str(levels[2]) {
        if levels.len() > 4 {
            return Err(TopicGrammarError::UnrecognizedShape(topic.to_string()));
        }
        return Ok(ParsedTopic::Mgmt(MgmtTopic {
            prefix: levels[0].to_string(),
            device_id: levels[1].to_string(),
            verb,
            sub: levels.get(3).map(|s| (*s).to_string()),
        }));
    }

    Err(TopicGrammarError::UnrecognizedToken(levels[2].to_string()))
}

/// Format a [`TelemetryTopic`] back into its wire string.
#[must_use]
pub fn format_telemetry(t: &TelemetryTopic) -> String {
    match &t.device_id {
        Some(device_id) => format!(
            "{}/{}/{}/{}/{}",
            t.namespace, t.group_id, t.msg_type, t.node_id, device_id
        ),
        None => format!("{}/{}/{}/{}", t.namespace, t.group_id, t.msg_type, t.node_id),
    }
}

/// Format an [`MgmtTopic`] back into its wire string.
#[must_use]
pub fn format_mgmt(t: &MgmtTopic) -> String {
    match &t.sub {
        Some(sub) => format!("{}/{}/{}/{}", t.prefix, t.device_id, t.verb, sub),
        None => format!("{}/{}/{}", t.prefix, t.device_id, t.verb),
    }
}

/// Format a [`ParsedTopic`] back into its wire string.
#[must_use]
pub fn format(t: &ParsedTopic) -> String {
    match t {
        ParsedTopic::Telemetry(t) => format_telemetry(t),
        ParsedTopic::Mgmt(t) => format_mgmt(t),
    }
}

/// Check whether `topic` matches `pattern`, a possibly-wildcarded topic filter. Delegates to
/// [`sparkmesh_mqtt`]'s MQTT wildcard matcher.
///
/// # Errors
/// Returns [`TopicGrammarError`] if either `pattern` or `topic` is not a syntactically valid
/// MQTT topic filter/name.
pub fn matches(pattern: &str, topic: &str) -> Result<bool, TopicGrammarError> {
    let filter = TopicFilter::from_string(pattern.to_string())
        .map_err(|_| TopicGrammarError::UnrecognizedShape(pattern.to_string()))?;
    let name = TopicName::from_string(topic.to_string())
        .map_err(|_| TopicGrammarError::UnrecognizedShape(topic.to_string()))?;
    Ok(name.matches_topic_filter(&filter))
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn parses_node_scoped_telemetry_topic() {
        let parsed = parse("spBv1.0/IIoT/NBIRTH/edge-1").unwrap();
        assert_eq!(
            parsed,
            ParsedTopic::Telemetry(TelemetryTopic {
                namespace: "spBv1.0".to_string(),
                group_id: "IIoT".to_string(),
                msg_type: MsgType::NBirth,
                node_id: "edge-1".to_string(),
                device_id: None,
            })
        );
    }

    #[test]
    fn parses_device_scoped_telemetry_topic() {
        let parsed = parse("spBv1.0/IIoT/DDATA/edge-1/dev-A").unwrap();
        assert_eq!(
            parsed,
            ParsedTopic::Telemetry(TelemetryTopic {
                namespace: "spBv1.0".to_string(),
                group_id: "IIoT".to_string(),
                msg_type: MsgType::DData,
                node_id: "edge-1".to_string(),
                device_id: Some("dev-A".to_string()),
            })
        );
    }

    #[test]
    fn parses_mgmt_topic_with_sub() {
        let parsed = parse("lwm2m/dev-B/cmd/read").unwrap();
        assert_eq!(
            parsed,
            ParsedTopic::Mgmt(MgmtTopic {
                prefix: "lwm2m".to_string(),
                device_id: "dev-B".to_string(),
                verb: MgmtVerb::Cmd,
                sub: Some("read".to_string()),
            })
        );
    }

    #[test]
    fn parses_mgmt_topic_without_sub() {
        let parsed = parse("lwm2m/dev-B/reg").unwrap();
        assert_eq!(
            parsed,
            ParsedTopic::Mgmt(MgmtTopic {
                prefix: "lwm2m".to_string(),
                device_id: "dev-B".to_string(),
                verb: MgmtVerb::Reg,
                sub: None,
            })
        );
    }

    #[test]
    fn rejects_unrecognized_third_level() {
        assert!(parse("a/b/NOT_A_VERB/d").is_err());
    }

    #[test_case("spBv1.0/IIoT/DDATA/edge-1/dev-A"; "device scoped")]
    #[test_case("spBv1.0/IIoT/NBIRTH/edge-1"; "node scoped")]
    #[test_case("lwm2m/dev-B/cmd/read"; "mgmt with sub")]
    #[test_case("lwm2m/dev-B/reg"; "mgmt without sub")]
    fn format_parse_round_trips(topic: &str) {
        let parsed = parse(topic).unwrap();
        assert_eq!(format(&parsed), topic);
    }

    #[test_case("spBv1.0/IIoT/+/edge-1", "spBv1.0/IIoT/DDATA/edge-1", true; "node telemetry single wildcard matches")]
    #[test_case("spBv1.0/IIoT/DDATA/+/+", "spBv1.0/IIoT/DDATA/edge-1/dev-A", true; "device telemetry double wildcard matches")]
    #[test_case("lwm2m/+/reg", "lwm2m/dev-B/reg", true; "mgmt reg wildcard matches")]
    #[test_case("lwm2m/+/reg", "lwm2m/dev-B/update", false; "mgmt verb mismatch does not match")]
    fn matches_wildcard_patterns(pattern: &str, topic: &str, expected: bool) {
        assert_eq!(matches(pattern, topic).unwrap(), expected);
    }

    #[test]
    fn match_of_format_of_parse_holds_for_accepted_topics() {
        for topic in [
            "spBv1.0/IIoT/DBIRTH/edge-1/dev-A",
            "spBv1.0/IIoT/NDEATH/edge-1",
            "lwm2m/dev-C/bulk",
            "lwm2m/dev-C/resp/execute",
        ] {
            let parsed = parse(topic).unwrap();
            let formatted = format(&parsed);
            assert_eq!(formatted, topic);
            assert!(matches(topic, &formatted).unwrap());
        }
    }
}
