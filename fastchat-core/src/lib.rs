use std::time::Duration;

use base64::Engine;
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

pub mod history;

pub use history::{
    HistoryError, HistoryStore, default_history_path, max_history_file_bytes, write_history_file,
};

pub const HISTORY_MAX: usize = 30;
pub const HISTORY_FILE_NAME: &str = "fastchat.json";
pub const DEFAULT_PORT: u16 = 8765;
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:8765";
pub const DEFAULT_LOCAL_ENDPOINT: &str = "ws://127.0.0.1:8765";
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(20);
pub const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(20);
pub const CONNECTION_QUEUE_DEPTH: usize = 32;
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);
pub const MAX_MESSAGE_BYTES: usize = 8 * 1024 * 1024;
pub const UNKNOWN_SENDER: &str = "???";
pub const ATTACHMENT_KIND_IMAGE: &str = "image";
pub const MIME_IMAGE_PNG: &str = "image/png";

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum EnvelopeKind {
    #[default]
    #[serde(rename = "msg")]
    Message,
    #[serde(rename = "image")]
    Image,
    #[serde(rename = "history")]
    History,
    /// Any other `type`. Treated as a regular message and re-derived from
    /// the attachments before it is stored.
    #[serde(rename = "unknown", other)]
    Unknown,
}

/// A binary payload carried inside an envelope, always base64 on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Attachment {
    #[serde(rename = "type", default = "default_attachment_kind")]
    pub kind: String,
    #[serde(default, deserialize_with = "nullable")]
    pub name: String,
    #[serde(default, deserialize_with = "nullable")]
    pub mime: String,
    #[serde(default, deserialize_with = "nullable")]
    pub data: String,
}

impl Attachment {
    pub fn from_bytes(name: impl Into<String>, mime: impl Into<String>, bytes: &[u8]) -> Self {
        Self {
            kind: ATTACHMENT_KIND_IMAGE.to_owned(),
            name: name.into(),
            mime: mime.into(),
            data: base64::engine::general_purpose::STANDARD.encode(bytes),
        }
    }

    pub fn decode_data(&self) -> Result<Vec<u8>, CodecError> {
        base64::engine::general_purpose::STANDARD
            .decode(self.data.as_bytes())
            .map_err(|err| CodecError::InvalidAttachment {
                name: self.name.clone(),
                reason: err.to_string(),
            })
    }
}

fn default_attachment_kind() -> String {
    ATTACHMENT_KIND_IMAGE.to_owned()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Envelope {
    #[serde(rename = "type", default)]
    pub kind: EnvelopeKind,
    #[serde(rename = "from", default, deserialize_with = "nullable")]
    pub sender: String,
    #[serde(default, deserialize_with = "nullable")]
    pub text: String,
    #[serde(default, deserialize_with = "nullable")]
    pub attachments: Vec<Attachment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<String>,
}

impl Envelope {
    /// Builds an envelope as a peer would send it: no timestamp, kind
    /// derived from the attachments.
    pub fn outgoing(
        sender: impl Into<String>,
        text: impl Into<String>,
        attachments: Vec<Attachment>,
    ) -> Self {
        Self {
            kind: Self::kind_for(&attachments),
            sender: sender.into(),
            text: text.into(),
            attachments,
            ts: None,
        }
    }

    pub fn kind_for(attachments: &[Attachment]) -> EnvelopeKind {
        if attachments.is_empty() {
            EnvelopeKind::Message
        } else {
            EnvelopeKind::Image
        }
    }

    /// Relay-side normalization before an envelope is stored. The timestamp
    /// is cleared here and assigned by [`HistoryStore::append`].
    pub fn normalized(mut self) -> Self {
        if self.sender.trim().is_empty() {
            self.sender = UNKNOWN_SENDER.to_owned();
        }
        self.kind = Self::kind_for(&self.attachments);
        self.ts = None;
        self
    }

    pub fn has_content(&self) -> bool {
        !self.text.trim().is_empty() || !self.attachments.is_empty()
    }
}

/// One text frame on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Envelope(Envelope),
    History(Vec<Envelope>),
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("attachment {name:?} is not valid base64: {reason}")]
    InvalidAttachment { name: String, reason: String },
}

#[derive(Deserialize)]
struct InboundFrame {
    #[serde(flatten)]
    envelope: Envelope,
    #[serde(default, deserialize_with = "nullable")]
    items: Vec<Envelope>,
}

#[derive(Serialize)]
struct HistoryFrame<'a> {
    #[serde(rename = "type")]
    kind: EnvelopeKind,
    items: &'a [Envelope],
}

pub fn encode_frame(frame: &Frame) -> Result<String, CodecError> {
    let encoded = match frame {
        Frame::Envelope(envelope) => serde_json::to_string(envelope),
        Frame::History(items) => serde_json::to_string(&HistoryFrame {
            kind: EnvelopeKind::History,
            items,
        }),
    };
    encoded.map_err(|err| CodecError::Serialization(err.to_string()))
}

pub fn decode_frame(text: &str) -> Result<Frame, CodecError> {
    let inbound: InboundFrame =
        serde_json::from_str(text).map_err(|err| CodecError::Malformed(err.to_string()))?;

    if inbound.envelope.kind == EnvelopeKind::History {
        for item in &inbound.items {
            validate_attachments(item)?;
        }
        return Ok(Frame::History(inbound.items));
    }

    validate_attachments(&inbound.envelope)?;
    Ok(Frame::Envelope(inbound.envelope))
}

fn validate_attachments(envelope: &Envelope) -> Result<(), CodecError> {
    for attachment in &envelope.attachments {
        attachment.decode_data()?;
    }
    Ok(())
}

/// Current local time at second precision, e.g. `2025-03-01T14:05:09`.
pub fn timestamp_now() -> String {
    chrono::Local::now()
        .format("%Y-%m-%dT%H:%M:%S")
        .to_string()
}

// Peers may send explicit nulls; treat them like a missing field.
fn nullable<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_minimal_peer_message() {
        let frame = decode_frame(r#"{"from":"ana","text":"hola"}"#).unwrap();
        let Frame::Envelope(envelope) = frame else {
            panic!("expected envelope frame");
        };
        assert_eq!(envelope.kind, EnvelopeKind::Message);
        assert_eq!(envelope.sender, "ana");
        assert_eq!(envelope.text, "hola");
        assert!(envelope.attachments.is_empty());
        assert_eq!(envelope.ts, None);
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let frame =
            decode_frame(r#"{"type":"msg","from":"a","text":"x","color":"red","v":2}"#).unwrap();
        assert!(matches!(frame, Frame::Envelope(_)));
    }

    #[test]
    fn nulls_are_treated_as_missing() {
        let Frame::Envelope(envelope) =
            decode_frame(r#"{"from":null,"text":null,"attachments":null}"#).unwrap()
        else {
            panic!("expected envelope frame");
        };
        assert_eq!(envelope.sender, "");
        assert_eq!(envelope.text, "");
        assert!(envelope.attachments.is_empty());
    }

    #[test]
    fn malformed_payloads_are_rejected() {
        assert!(matches!(
            decode_frame("not json"),
            Err(CodecError::Malformed(_))
        ));
        assert!(matches!(decode_frame("[1,2]"), Err(CodecError::Malformed(_))));
        assert!(matches!(
            decode_frame(r#"{"type":7,"from":"a"}"#),
            Err(CodecError::Malformed(_))
        ));
    }

    #[test]
    fn unrecognized_type_decodes_as_a_plain_envelope() {
        let Frame::Envelope(envelope) =
            decode_frame(r#"{"type":"text","from":"a","text":"hi"}"#).unwrap()
        else {
            panic!("expected envelope frame");
        };
        assert_eq!(envelope.kind, EnvelopeKind::Unknown);
        assert_eq!(envelope.sender, "a");
        assert_eq!(envelope.text, "hi");
        assert_eq!(envelope.normalized().kind, EnvelopeKind::Message);

        assert!(matches!(
            decode_frame(r#"{"type":"sticker"}"#),
            Ok(Frame::Envelope(_))
        ));
    }

    #[test]
    fn attachment_payload_must_be_base64() {
        let err = decode_frame(
            r#"{"from":"a","attachments":[{"type":"image","name":"x.png","mime":"image/png","data":"%%%"}]}"#,
        )
        .unwrap_err();
        assert!(matches!(err, CodecError::InvalidAttachment { .. }));
    }

    #[test]
    fn history_frame_carries_items_in_order() {
        let items = vec![
            Envelope::outgoing("a", "one", Vec::new()),
            Envelope::outgoing("b", "two", Vec::new()),
        ];
        let text = encode_frame(&Frame::History(items.clone())).unwrap();
        assert!(text.contains(r#""type":"history""#));
        assert_eq!(decode_frame(&text).unwrap(), Frame::History(items));
    }

    #[test]
    fn history_frame_without_items_is_empty() {
        assert_eq!(
            decode_frame(r#"{"type":"history"}"#).unwrap(),
            Frame::History(Vec::new())
        );
    }

    #[test]
    fn attachment_bytes_are_base64_on_the_wire() {
        let attachment = Attachment::from_bytes("dot.png", MIME_IMAGE_PNG, &[0, 159, 146, 150]);
        let envelope = Envelope::outgoing("ana", "", vec![attachment]);
        let text = encode_frame(&Frame::Envelope(envelope)).unwrap();
        assert!(text.contains(r#""data":"AJ+Slg==""#));
        assert!(text.contains(r#""type":"image""#));

        let Frame::Envelope(decoded) = decode_frame(&text).unwrap() else {
            panic!("expected envelope frame");
        };
        assert_eq!(decoded.attachments[0].decode_data().unwrap(), vec![0, 159, 146, 150]);
    }

    #[test]
    fn normalization_defaults_sender_and_recomputes_kind() {
        let mut envelope = Envelope::outgoing("  ", "caption", Vec::new());
        envelope.kind = EnvelopeKind::Image;
        envelope.ts = Some("1999-01-01T00:00:00".to_owned());
        let normalized = envelope.normalized();
        assert_eq!(normalized.sender, UNKNOWN_SENDER);
        assert_eq!(normalized.kind, EnvelopeKind::Message);
        assert_eq!(normalized.ts, None);

        let with_image = Envelope::outgoing(
            "ana",
            "caption",
            vec![Attachment::from_bytes("a.png", MIME_IMAGE_PNG, b"png")],
        )
        .normalized();
        assert_eq!(with_image.kind, EnvelopeKind::Image);
        assert_eq!(with_image.text, "caption");
    }

    #[test]
    fn timestamp_has_second_precision() {
        let ts = timestamp_now();
        assert_eq!(ts.len(), "2025-03-01T14:05:09".len());
        assert_eq!(&ts[10..11], "T");
    }
}
