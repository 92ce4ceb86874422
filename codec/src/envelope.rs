// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! JSON command envelope carried as the payload of `PublishPacket`s.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Closed set of command codes this engine emits or recognizes in a reply.
/// Any other integer decodes successfully as `Cmd::Unknown` rather than
/// failing the whole envelope — firmware revisions are free to add codes
/// this engine does not understand.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Cmd {
    Nop0,
    Nop1,
    Disconnect,
    StartPrinting,
    UploadFile,
    SetReportPeriod,
    Unknown(i64),
}

impl Cmd {
    #[must_use]
    pub const fn code(self) -> i64 {
        match self {
            Self::Nop0 => 0,
            Self::Nop1 => 1,
            Self::Disconnect => 64,
            Self::StartPrinting => 128,
            Self::UploadFile => 256,
            Self::SetReportPeriod => 512,
            Self::Unknown(code) => code,
        }
    }
}

impl From<i64> for Cmd {
    fn from(code: i64) -> Self {
        match code {
            0 => Self::Nop0,
            1 => Self::Nop1,
            64 => Self::Disconnect,
            128 => Self::StartPrinting,
            256 => Self::UploadFile,
            512 => Self::SetReportPeriod,
            other => Self::Unknown(other),
        }
    }
}

impl Serialize for Cmd {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_i64(self.code())
    }
}

impl<'de> Deserialize<'de> for Cmd {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let code = i64::deserialize(deserializer)?;
        Ok(Self::from(code))
    }
}

/// Payload for `Cmd::StartPrinting`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct StartPrintingData {
    #[serde(rename = "Filename")]
    pub filename: String,
    #[serde(rename = "StartLayer")]
    pub start_layer: u32,
}

/// Payload for `Cmd::UploadFile`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct UploadFileData {
    #[serde(rename = "Check")]
    pub check: u8,
    #[serde(rename = "CleanCache")]
    pub clean_cache: u8,
    #[serde(rename = "Compress")]
    pub compress: u8,
    #[serde(rename = "FileSize")]
    pub file_size: u64,
    #[serde(rename = "Filename")]
    pub filename: String,
    #[serde(rename = "MD5")]
    pub md5: String,
    #[serde(rename = "URL")]
    pub url: String,
}

/// Payload for `Cmd::SetReportPeriod`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SetReportPeriodData {
    #[serde(rename = "TimePeriod")]
    pub time_period: u32,
}

/// Inner `Data` field of the envelope (`Data.Data` in the wire shape).
///
/// The printer firmware does not tag this payload with any wrapper key: it
/// *is* the flat object appropriate to the sibling `Cmd` (or `null` for
/// commands that carry none, or `{"Ack":0,...}` on a response). Serde can't
/// dispatch on a sibling field within the same struct, so this wraps the
/// payload as an untyped `serde_json::Value` and offers typed constructors
/// and accessors for each known shape.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct CommandData(pub Value);

impl CommandData {
    /// No payload, as sent with `NOP_0`/`NOP_1`/`DISCONNECT`.
    #[must_use]
    pub fn none() -> Self {
        Self(Value::Null)
    }

    /// Ack-only payload, as carried by an accepted response.
    #[must_use]
    pub fn ack(ack: i64) -> Self {
        Self(serde_json::json!({ "Ack": ack }))
    }

    /// Reads the `Ack` field out of a response payload, if present.
    #[must_use]
    pub fn ack_value(&self) -> Option<i64> {
        self.0.get("Ack").and_then(Value::as_i64)
    }

    #[must_use]
    pub fn start_printing(&self) -> Option<StartPrintingData> {
        serde_json::from_value(self.0.clone()).ok()
    }

    #[must_use]
    pub fn upload_file(&self) -> Option<UploadFileData> {
        serde_json::from_value(self.0.clone()).ok()
    }

    #[must_use]
    pub fn set_report_period(&self) -> Option<SetReportPeriodData> {
        serde_json::from_value(self.0.clone()).ok()
    }
}

impl From<StartPrintingData> for CommandData {
    fn from(data: StartPrintingData) -> Self {
        Self(serde_json::to_value(data).unwrap_or(Value::Null))
    }
}

impl From<UploadFileData> for CommandData {
    fn from(data: UploadFileData) -> Self {
        Self(serde_json::to_value(data).unwrap_or(Value::Null))
    }
}

impl From<SetReportPeriodData> for CommandData {
    fn from(data: SetReportPeriodData) -> Self {
        Self(serde_json::to_value(data).unwrap_or(Value::Null))
    }
}

/// Inner `Data` field of the envelope (the one carrying `Cmd`/`RequestID`/etc).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct EnvelopeData {
    #[serde(rename = "Cmd")]
    pub cmd: Cmd,
    #[serde(rename = "Data")]
    pub data: CommandData,
    #[serde(rename = "From")]
    pub from: i64,
    #[serde(rename = "MainboardID")]
    pub mainboard_id: String,
    #[serde(rename = "RequestID")]
    pub request_id: String,
    #[serde(rename = "TimeStamp")]
    pub time_stamp: i64,
}

/// The full JSON shape exchanged on `/sdcp/request/<mainboard>` and
/// `/sdcp/response/<mainboard>`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CommandEnvelope {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(rename = "Data")]
    pub data: EnvelopeData,
}

impl CommandEnvelope {
    /// # Errors
    ///
    /// Returns error if the envelope cannot be serialized to JSON (never
    /// happens for well-formed envelopes, but `serde_json` is fallible).
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// # Errors
    ///
    /// Returns error if `s` is not a well-formed command envelope.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}
