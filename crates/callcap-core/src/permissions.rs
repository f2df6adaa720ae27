//! Mini-app permission catalog.
//!
//! Mini-apps ask for coarse `MINIAPP_*` permissions. Each one is backed by
//! one or more OS-level permissions held by the host process and carries a
//! display title used when listing recent usage.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MiniAppPermission {
    #[serde(rename = "MINIAPP_CAMERA")]
    Camera,
    #[serde(rename = "MINIAPP_RECORD_AUDIO")]
    RecordAudio,
    #[serde(rename = "MINIAPP_VIBRATE")]
    Vibrate,
    #[serde(rename = "MINIAPP_EXTERNAL_STORAGE")]
    ExternalStorage,
    #[serde(rename = "MINIAPP_LOCATION")]
    Location,
    #[serde(rename = "MINIAPP_GET_CALL_STATE")]
    GetCallState,
    #[serde(rename = "MINIAPP_READ_CONTACTS")]
    ReadContacts,
    #[serde(rename = "MINIAPP_ACCESS_WIFI")]
    AccessWifi,
    #[serde(rename = "MINIAPP_BLUETOOTH")]
    Bluetooth,
}

impl MiniAppPermission {
    pub const ALL: [Self; 9] = [
        Self::Camera,
        Self::RecordAudio,
        Self::Vibrate,
        Self::ExternalStorage,
        Self::Location,
        Self::GetCallState,
        Self::ReadContacts,
        Self::AccessWifi,
        Self::Bluetooth,
    ];

    /// The wire name (`MINIAPP_*`).
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Camera => "MINIAPP_CAMERA",
            Self::RecordAudio => "MINIAPP_RECORD_AUDIO",
            Self::Vibrate => "MINIAPP_VIBRATE",
            Self::ExternalStorage => "MINIAPP_EXTERNAL_STORAGE",
            Self::Location => "MINIAPP_LOCATION",
            Self::GetCallState => "MINIAPP_GET_CALL_STATE",
            Self::ReadContacts => "MINIAPP_READ_CONTACTS",
            Self::AccessWifi => "MINIAPP_ACCESS_WIFI",
            Self::Bluetooth => "MINIAPP_BLUETOOTH",
        }
    }

    pub const fn title(self) -> &'static str {
        match self {
            Self::Camera => "Camera",
            Self::RecordAudio => "Microphone",
            Self::Vibrate => "Vibration",
            Self::ExternalStorage => "Storage",
            Self::Location => "Location",
            Self::GetCallState => "Call state",
            Self::ReadContacts => "Contacts",
            Self::AccessWifi => "Wi-Fi",
            Self::Bluetooth => "Bluetooth",
        }
    }

    /// OS-level permissions backing this mini-app permission.
    pub const fn system_permissions(self) -> &'static [&'static str] {
        match self {
            Self::Camera => &["CAMERA"],
            Self::RecordAudio => &["RECORD_AUDIO"],
            Self::Vibrate => &["VIBRATE"],
            Self::ExternalStorage => &["MANAGE_EXTERNAL_STORAGE"],
            Self::Location => &["ACCESS_FINE_LOCATION", "ACCESS_COARSE_LOCATION"],
            Self::GetCallState => &["READ_PHONE_STATE"],
            Self::ReadContacts => &["READ_CONTACTS"],
            Self::AccessWifi => &["ACCESS_WIFI_STATE"],
            Self::Bluetooth => &["BLUETOOTH_SCAN", "BLUETOOTH_ADVERTISE", "BLUETOOTH_CONNECT"],
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.as_str() == name)
    }

    /// Resolve either a `MINIAPP_*` name or one of the backing OS-level names.
    pub fn resolve(name: &str) -> Option<Self> {
        Self::from_name(name).or_else(|| {
            Self::ALL
                .into_iter()
                .find(|p| p.system_permissions().iter().any(|s| *s == name))
        })
    }
}

impl std::fmt::Display for MiniAppPermission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Display title for a stored permission name; empty when unknown.
pub fn usage_title(name: &str) -> &'static str {
    MiniAppPermission::resolve(name).map_or("", MiniAppPermission::title)
}
