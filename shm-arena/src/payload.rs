//! What an allocation holds, and how its bytes are read back.
use serde_json::Value;

/// Tags whose allocations hold JSON without naming it in the tag.
const STRUCTURED_TAGS: &[&str] = &["json", "systemStats"];
/// Prefix of tags for JSON payloads of a named schema, as in `json:processList`.
const JSON_PREFIX: &str = "json:";

/// The kind of an allocation, derived from the type tag it was allocated with.
///
/// The tag is kept verbatim so that it survives the allocation table unchanged.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum PayloadKind {
    /// Opaque bytes.
    Raw { tag: String },
    /// A UTF-8 JSON document.
    Json { tag: String },
}

/// The contents of an allocation.
#[derive(Clone, Debug, PartialEq)]
pub enum Payload {
    /// Every byte of a raw allocation, including the zeroed tail after the last write.
    Raw(Vec<u8>),
    Json(Value),
    /// A JSON allocation whose bytes do not currently decode, for example because it was never
    /// written or a write is in progress. This is not a read failure.
    Undecodable { bytes: Vec<u8>, error: String },
}

impl PayloadKind {
    pub fn from_tag(tag: &str) -> Self {
        let tag = tag.to_owned();
        if STRUCTURED_TAGS.contains(&tag.as_str()) || tag.starts_with(JSON_PREFIX) {
            PayloadKind::Json { tag }
        } else {
            PayloadKind::Raw { tag }
        }
    }

    pub fn tag(&self) -> &str {
        match self {
            PayloadKind::Raw { tag } | PayloadKind::Json { tag } => tag,
        }
    }

    /// The schema a JSON payload follows, if the tag names one.
    pub fn schema(&self) -> Option<&str> {
        match self {
            PayloadKind::Raw { .. } => None,
            PayloadKind::Json { tag } => match tag.strip_prefix(JSON_PREFIX) {
                Some(schema) => Some(schema),
                None if tag == "json" => None,
                None => Some(tag),
            },
        }
    }

    pub fn is_structured(&self) -> bool {
        matches!(self, PayloadKind::Json { .. })
    }
}

impl From<&str> for PayloadKind {
    fn from(tag: &str) -> Self {
        PayloadKind::from_tag(tag)
    }
}

impl Payload {
    /// Interpret the bytes of an allocation of the given kind.
    pub fn decode(kind: &PayloadKind, bytes: Vec<u8>) -> Self {
        match kind {
            PayloadKind::Raw { .. } => Payload::Raw(bytes),
            PayloadKind::Json { .. } => {
                // The unused tail of the allocation is zeroed on every write.
                let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
                let decoded = serde_json::from_slice::<Value>(&bytes[..end]);
                match decoded {
                    Ok(value) => Payload::Json(value),
                    Err(err) => Payload::Undecodable {
                        error: err.to_string(),
                        bytes,
                    },
                }
            }
        }
    }

    /// The raw bytes, unless the payload decoded into a value.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Payload::Raw(bytes) | Payload::Undecodable { bytes, .. } => Some(bytes.as_slice()),
            Payload::Json(_) => None,
        }
    }

    pub fn into_json(self) -> Option<Value> {
        match self {
            Payload::Json(value) => Some(value),
            _ => None,
        }
    }
}

#[test]
fn structured_tags() {
    assert_eq!(PayloadKind::from_tag("stats"), PayloadKind::Raw { tag: "stats".into() });
    assert!(PayloadKind::from_tag("json").is_structured());
    assert!(PayloadKind::from_tag("systemStats").is_structured());
    assert!(PayloadKind::from_tag("json:processList").is_structured());
    assert!(!PayloadKind::from_tag("jsonish").is_structured());
}

#[test]
fn schema_names() {
    assert_eq!(PayloadKind::from_tag("json").schema(), None);
    assert_eq!(PayloadKind::from_tag("systemStats").schema(), Some("systemStats"));
    assert_eq!(PayloadKind::from_tag("json:processList").schema(), Some("processList"));
    assert_eq!(PayloadKind::from_tag("stats").schema(), None);
}

#[test]
fn tags_are_kept_verbatim() {
    for tag in ["stats", "json", "systemStats", "json:json", ""] {
        assert_eq!(PayloadKind::from_tag(tag).tag(), tag);
    }
}

#[test]
fn decode_json_before_padding() {
    let kind = PayloadKind::from_tag("json");
    let mut bytes = br#"{"cpu":12.5}"#.to_vec();
    bytes.resize(24, 0);

    let payload = Payload::decode(&kind, bytes);
    assert_eq!(payload, Payload::Json(serde_json::json!({ "cpu": 12.5 })));
}

#[test]
fn undecodable_json_keeps_bytes() {
    let kind = PayloadKind::from_tag("systemStats");
    let bytes = br#"{"cpu":1"#.to_vec();

    match Payload::decode(&kind, bytes.clone()) {
        Payload::Undecodable { bytes: kept, .. } => assert_eq!(kept, bytes),
        other => panic!("decoded a truncated document: {other:?}"),
    }
}

#[test]
fn raw_is_untouched() {
    let kind = PayloadKind::from_tag("stats");
    let bytes = vec![0, 1, 2, 0];
    assert_eq!(Payload::decode(&kind, bytes.clone()).as_bytes(), Some(&bytes[..]));
}
