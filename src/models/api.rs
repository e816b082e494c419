// src/models/api.rs

use super::Playlist;
use serde::{Deserialize, Serialize};

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub model: String,
    pub os_version: String,
    pub app_version: String,
}

impl DeviceInfo {
    pub fn current() -> Self {
        Self {
            model: format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH),
            os_version: std::env::consts::FAMILY.to_string(),
            app_version: clap::crate_version!().to_string(),
        }
    }
}

#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    pub device_id: String,
    pub pairing_code: Option<String>,
    pub device_info: DeviceInfo,
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RemoteStatus {
    Unpaired,
    PairedWaiting,
    Playing,
}

#[derive(Deserialize, Debug, Clone)]
pub struct SyncResponse {
    pub status: RemoteStatus,
    #[serde(default)]
    pub playlist: Option<Playlist>,
    #[serde(default)]
    pub rotation: Option<i32>,
}
