// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Descriptor and status types captured at discovery and refreshed by every
//! status broadcast the printer sends while connected.

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum CurrentStatus {
    #[default]
    Ready = 0,
    Busy = 1,
}

impl From<u8> for CurrentStatus {
    fn from(v: u8) -> Self {
        if v == 1 {
            Self::Busy
        } else {
            Self::Ready
        }
    }
}

/// Sub-state of an in-progress print. Only a handful of the firmware's
/// values are load-bearing for this engine's state machine; others pass
/// through as the raw `u8` in `Unknown`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PrintStatus {
    #[default]
    Idle,
    Exposure,
    Retracting,
    Lowering,
    Complete,
    Unknown(u8),
}

impl From<u8> for PrintStatus {
    fn from(v: u8) -> Self {
        match v {
            0 => Self::Idle,
            2 => Self::Exposure,
            3 => Self::Retracting,
            4 => Self::Lowering,
            16 => Self::Complete,
            other => Self::Unknown(other),
        }
    }
}

impl PrintStatus {
    /// Numeric value matching the firmware encoding, used by the print
    /// workflow's "`PrintInfo.Status` > 0" started-printing check.
    #[must_use]
    pub const fn value(self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::Exposure => 2,
            Self::Retracting => 3,
            Self::Lowering => 4,
            Self::Complete => 16,
            Self::Unknown(v) => v,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PrintInfo {
    pub status: PrintStatus,
    pub current_layer: u32,
    pub total_layer: u32,
    pub filename: String,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FileTransferStatus {
    #[default]
    None,
    Done,
    Error,
    Other(u8),
}

impl From<u8> for FileTransferStatus {
    fn from(v: u8) -> Self {
        match v {
            0 => Self::None,
            2 => Self::Done,
            3 => Self::Error,
            other => Self::Other(other),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FileTransferInfo {
    pub status: FileTransferStatus,
    pub download_offset: u64,
    pub file_total_size: u64,
    pub filename: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StatusSnapshot {
    pub current_status: CurrentStatus,
    pub print_info: PrintInfo,
    pub file_transfer_info: FileTransferInfo,
}

/// Immutable record captured at discovery; `id` is the correlation id the
/// printer expects echoed back in every command envelope's `Id` field.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PrinterDescriptor {
    pub id: String,
    pub address: std::net::SocketAddr,
    pub mainboard_id: String,
    pub name: String,
    pub machine_name: String,
    pub status: StatusSnapshot,
}

/// Wire shape of the UDP discovery response, deserialized directly from the
/// `M99999` reply datagram.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DiscoveryResponse {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(rename = "Data")]
    pub data: DiscoveryData,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DiscoveryData {
    #[serde(rename = "Attributes")]
    pub attributes: DiscoveryAttributes,
    #[serde(rename = "Status")]
    pub status: DiscoveryStatus,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DiscoveryAttributes {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "MachineName")]
    pub machine_name: String,
    #[serde(rename = "MainboardID")]
    pub mainboard_id: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DiscoveryStatus {
    #[serde(rename = "CurrentStatus")]
    pub current_status: u8,
    #[serde(rename = "PrintInfo")]
    pub print_info: DiscoveryPrintInfo,
    #[serde(rename = "FileTransferInfo")]
    pub file_transfer_info: DiscoveryFileTransferInfo,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DiscoveryPrintInfo {
    #[serde(rename = "Status")]
    pub status: u8,
    #[serde(rename = "CurrentLayer", default)]
    pub current_layer: u32,
    #[serde(rename = "TotalLayer", default)]
    pub total_layer: u32,
    #[serde(rename = "Filename", default)]
    pub filename: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DiscoveryFileTransferInfo {
    #[serde(rename = "Status")]
    pub status: u8,
    #[serde(rename = "DownloadOffset", default)]
    pub download_offset: u64,
    #[serde(rename = "FileTotalSize", default)]
    pub file_total_size: u64,
    #[serde(rename = "Filename", default)]
    pub filename: String,
}

/// Envelope of an unsolicited status push on `/sdcp/status/<mainboard>`.
/// Wrapped the same way request/response envelopes are (`Id` + `Data`),
/// though a status push carries no `Cmd`/`RequestID` of its own.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatusPush {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(rename = "Data")]
    pub data: StatusPushData,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatusPushData {
    #[serde(rename = "Status")]
    pub status: DiscoveryStatus,
}

impl From<DiscoveryStatus> for StatusSnapshot {
    fn from(status: DiscoveryStatus) -> Self {
        Self {
            current_status: CurrentStatus::from(status.current_status),
            print_info: PrintInfo {
                status: PrintStatus::from(status.print_info.status),
                current_layer: status.print_info.current_layer,
                total_layer: status.print_info.total_layer,
                filename: status.print_info.filename,
            },
            file_transfer_info: FileTransferInfo {
                status: FileTransferStatus::from(status.file_transfer_info.status),
                download_offset: status.file_transfer_info.download_offset,
                file_total_size: status.file_transfer_info.file_total_size,
                filename: status.file_transfer_info.filename,
            },
        }
    }
}

impl From<DiscoveryResponse> for PrinterDescriptor {
    fn from(resp: DiscoveryResponse) -> Self {
        // Address is filled in by the caller, which knows the datagram's
        // source socket address; a default is a placeholder only.
        Self {
            id: resp.id,
            address: std::net::SocketAddr::from(([0, 0, 0, 0], 0)),
            mainboard_id: resp.data.attributes.mainboard_id,
            name: resp.data.attributes.name,
            machine_name: resp.data.attributes.machine_name,
            status: StatusSnapshot {
                current_status: CurrentStatus::from(resp.data.status.current_status),
                print_info: PrintInfo {
                    status: PrintStatus::from(resp.data.status.print_info.status),
                    current_layer: resp.data.status.print_info.current_layer,
                    total_layer: resp.data.status.print_info.total_layer,
                    filename: resp.data.status.print_info.filename,
                },
                file_transfer_info: FileTransferInfo {
                    status: FileTransferStatus::from(resp.data.status.file_transfer_info.status),
                    download_offset: resp.data.status.file_transfer_info.download_offset,
                    file_total_size: resp.data.status.file_transfer_info.file_total_size,
                    filename: resp.data.status.file_transfer_info.filename,
                },
            },
        }
    }
}
