//! Request/response envelopes carried in the metadata section of a frame.
//!
//! Both envelopes are JSON. Requests are decoded in two steps: a structural
//! parse into the wire shape, then validation into [`RequestEnvelope`], so an
//! unknown operation or a bad filename can be reported by name instead of as
//! a generic parse failure.

use crate::error::{ReelError, Result};
use crate::protocol::option_keys::{ASPECT_RATIO, DURATION, RESOLUTION, START_TIME};
use crate::protocol::MAX_METADATA_SIZE;
use crate::protocol_core::sanitize_filename;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub type Options = BTreeMap<String, String>;

/// The closed set of transforms the daemon will run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Compress,
    Resolution,
    AspectRatio,
    ExtractAudio,
    MakeGif,
    MakeWebm,
}

impl Operation {
    pub const ALL: [Operation; 6] = [
        Operation::Compress,
        Operation::Resolution,
        Operation::AspectRatio,
        Operation::ExtractAudio,
        Operation::MakeGif,
        Operation::MakeWebm,
    ];

    /// Wire code, 1..=6 in menu order.
    pub fn code(self) -> u8 {
        match self {
            Operation::Compress => 1,
            Operation::Resolution => 2,
            Operation::AspectRatio => 3,
            Operation::ExtractAudio => 4,
            Operation::MakeGif => 5,
            Operation::MakeWebm => 6,
        }
    }

    pub fn from_code(code: i64) -> Result<Self> {
        Operation::ALL
            .into_iter()
            .find(|op| i64::from(op.code()) == code)
            .ok_or(ReelError::UnknownOperation(code))
    }

    pub fn name(self) -> &'static str {
        match self {
            Operation::Compress => "compress",
            Operation::Resolution => "resolution",
            Operation::AspectRatio => "aspect_ratio",
            Operation::ExtractAudio => "extract_audio",
            Operation::MakeGif => "make_gif",
            Operation::MakeWebm => "make_webm",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Operation::Compress => "Compress the video file",
            Operation::Resolution => "Change the resolution of the video",
            Operation::AspectRatio => "Change the aspect ratio of the video",
            Operation::ExtractAudio => "Extract audio from the video",
            Operation::MakeGif => "Create a GIF from a time range",
            Operation::MakeWebm => "Convert a time range of the video to WebM",
        }
    }

    /// Option keys that must be present and non-empty at dispatch time.
    pub fn required_options(self) -> &'static [&'static str] {
        match self {
            Operation::Compress | Operation::ExtractAudio => &[],
            Operation::Resolution => &[RESOLUTION],
            Operation::AspectRatio => &[ASPECT_RATIO],
            Operation::MakeGif | Operation::MakeWebm => &[START_TIME, DURATION],
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Serialize, Deserialize)]
struct WireRequest {
    operation: i64,
    #[serde(default)]
    options: Option<Options>,
    #[serde(default)]
    filename: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestEnvelope {
    pub operation: Operation,
    pub options: Options,
    /// Bare name, never a path.
    pub filename: String,
}

impl RequestEnvelope {
    pub fn new(operation: Operation, options: Options, filename: impl Into<String>) -> Self {
        Self {
            operation,
            options,
            filename: filename.into(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let wire = WireRequest {
            operation: i64::from(self.operation.code()),
            options: Some(self.options.clone()),
            filename: self.filename.clone(),
        };
        let bytes = serde_json::to_vec(&wire)?;
        check_metadata_len(bytes.len())?;
        Ok(bytes)
    }

    /// Parse and validate. Malformed JSON is `InvalidEnvelope`; a well-formed
    /// request with an empty name, unsafe name or unknown code gets the
    /// matching specific error.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let wire: WireRequest = serde_json::from_slice(bytes)?;
        sanitize_filename(&wire.filename)?;
        let operation = Operation::from_code(wire.operation)?;
        Ok(Self {
            operation,
            options: wire.options.unwrap_or_default(),
            filename: wire.filename,
        })
    }

    pub fn option(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(String::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

impl ResponseEnvelope {
    pub fn success(filename: impl Into<String>) -> Self {
        Self {
            status: Status::Success,
            message: None,
            filename: Some(filename.into()),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: Status::Error,
            message: Some(message.into()),
            filename: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == Status::Success
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let bytes = serde_json::to_vec(self)?;
        check_metadata_len(bytes.len())?;
        Ok(bytes)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

fn check_metadata_len(len: usize) -> Result<()> {
    if len > MAX_METADATA_SIZE {
        return Err(ReelError::MetadataTooLarge {
            size: len,
            max: MAX_METADATA_SIZE,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn any_operation() -> impl Strategy<Value = Operation> {
        prop::sample::select(Operation::ALL.to_vec())
    }

    fn any_filename() -> impl Strategy<Value = String> {
        "\\PC{1,64}".prop_filter("bare file name", |n| sanitize_filename(n).is_ok())
    }

    fn any_options() -> impl Strategy<Value = Options> {
        prop::collection::btree_map(any::<String>(), any::<String>(), 0..6)
    }

    proptest! {
        #[test]
        fn prop_request_round_trip(
            op in any_operation(),
            options in any_options(),
            filename in any_filename(),
        ) {
            let req = RequestEnvelope::new(op, options, filename);
            let decoded = RequestEnvelope::decode(&req.encode().unwrap()).unwrap();
            prop_assert_eq!(decoded, req);
        }

        #[test]
        fn prop_response_round_trip(
            success in any::<bool>(),
            message in proptest::option::of(any::<String>()),
            filename in proptest::option::of(any::<String>()),
        ) {
            let resp = ResponseEnvelope {
                status: if success { Status::Success } else { Status::Error },
                message,
                filename,
            };
            let decoded = ResponseEnvelope::decode(&resp.encode().unwrap()).unwrap();
            prop_assert_eq!(decoded, resp);
        }
    }

    fn opts(pairs: &[(&str, &str)]) -> Options {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_request_round_trip_every_operation() {
        for op in Operation::ALL {
            let options = op
                .required_options()
                .iter()
                .map(|k| (k.to_string(), "1".to_string()))
                .collect();
            let req = RequestEnvelope::new(op, options, "clip.mp4");
            let decoded = RequestEnvelope::decode(&req.encode().unwrap()).unwrap();
            assert_eq!(decoded, req);
        }
    }

    #[test]
    fn test_request_wire_shape() {
        let req = RequestEnvelope::new(
            Operation::Resolution,
            opts(&[("resolution", "1280x720")]),
            "clip.mp4",
        );
        let value: serde_json::Value = serde_json::from_slice(&req.encode().unwrap()).unwrap();
        assert_eq!(value["operation"], 2);
        assert_eq!(value["options"]["resolution"], "1280x720");
        assert_eq!(value["filename"], "clip.mp4");
    }

    #[test]
    fn test_request_decode_null_or_missing_options() {
        let req = RequestEnvelope::decode(br#"{"operation":1,"options":null,"filename":"a.mp4"}"#)
            .unwrap();
        assert!(req.options.is_empty());
        let req = RequestEnvelope::decode(br#"{"operation":4,"filename":"a.mp4"}"#).unwrap();
        assert_eq!(req.operation, Operation::ExtractAudio);
    }

    #[test]
    fn test_request_decode_unknown_operation() {
        let err = RequestEnvelope::decode(br#"{"operation":7,"options":{},"filename":"a.mp4"}"#)
            .unwrap_err();
        assert!(matches!(err, ReelError::UnknownOperation(7)));
        assert!(err.to_string().contains("Invalid operation"));

        let err = RequestEnvelope::decode(br#"{"operation":0,"filename":"a.mp4"}"#).unwrap_err();
        assert!(matches!(err, ReelError::UnknownOperation(0)));
    }

    #[test]
    fn test_request_decode_missing_filename() {
        let err = RequestEnvelope::decode(br#"{"operation":1,"options":{},"filename":""}"#)
            .unwrap_err();
        assert!(matches!(err, ReelError::MissingFilename));
        let err = RequestEnvelope::decode(br#"{"operation":1}"#).unwrap_err();
        assert!(matches!(err, ReelError::MissingFilename));
    }

    #[test]
    fn test_request_decode_rejects_paths() {
        let err =
            RequestEnvelope::decode(br#"{"operation":1,"filename":"../../etc/passwd"}"#).unwrap_err();
        assert!(matches!(err, ReelError::UnsafeFilename(_)));
    }

    #[test]
    fn test_request_decode_malformed() {
        let cases: [&[u8]; 6] = [
            b"",
            b"{",
            b"[]",
            br#"{"operation":"compress","filename":"a.mp4"}"#,
            br#"{"operation":1.5,"filename":"a.mp4"}"#,
            br#"{"operation":1,"options":{"k":3},"filename":"a.mp4"}"#,
        ];
        for bad in cases {
            assert!(
                matches!(RequestEnvelope::decode(bad), Err(ReelError::InvalidEnvelope(_))),
                "accepted {:?}",
                String::from_utf8_lossy(bad)
            );
        }
    }

    #[test]
    fn test_response_round_trip() {
        for resp in [
            ResponseEnvelope::success("compressed_clip.mp4"),
            ResponseEnvelope::error("no audio stream found in the file"),
        ] {
            let decoded = ResponseEnvelope::decode(&resp.encode().unwrap()).unwrap();
            assert_eq!(decoded, resp);
        }
    }

    #[test]
    fn test_response_wire_shape_omits_absent_fields() {
        let bytes = ResponseEnvelope::error("boom").encode().unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert_eq!(text, r#"{"status":"error","message":"boom"}"#);

        let bytes = ResponseEnvelope::success("gif_clip.gif").encode().unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert_eq!(text, r#"{"status":"success","filename":"gif_clip.gif"}"#);
    }

    #[test]
    fn test_response_decode_rejects_unknown_status() {
        assert!(matches!(
            ResponseEnvelope::decode(br#"{"status":"maybe"}"#),
            Err(ReelError::InvalidEnvelope(_))
        ));
    }

    #[test]
    fn test_encode_rejects_oversized_metadata() {
        let huge = "x".repeat(MAX_METADATA_SIZE);
        let err = ResponseEnvelope::error(huge).encode().unwrap_err();
        assert!(matches!(err, ReelError::MetadataTooLarge { .. }));
    }

    #[test]
    fn test_operation_codes() {
        for (i, op) in Operation::ALL.into_iter().enumerate() {
            assert_eq!(op.code() as usize, i + 1);
            assert_eq!(Operation::from_code(i as i64 + 1).unwrap(), op);
        }
        assert!(Operation::from_code(-1).is_err());
    }
}
