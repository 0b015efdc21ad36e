//! Known MicroPython boards, identified by USB vendor/product id.
//!
//! Many boards share the same USB serial chips, so the ids identify the
//! bridge rather than the exact board. A board in its bootloader enumerates
//! with a different product id than when running firmware.

use serde::{Deserialize, Serialize};

/// Whether the board is running firmware or waiting in its bootloader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
/// Whether a board enumerates as a REPL or as its bootloader.
pub enum BoardMode {
    /// Running firmware with a REPL.
    Normal,
    /// Waiting for a firmware upload.
    Bootloader,
}

/// One catalog entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoardProfile {
    /// Display name, e.g. `Raspberry Pi Pico`.
    pub name: String,
    /// USB vendor id.
    pub vid: u16,
    /// USB product id.
    pub pid: u16,
    /// Mode the board is in when it enumerates with this id.
    pub mode: BoardMode,
}

/// Result of matching a port against the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoardMatch {
    /// Display name, e.g. `Raspberry Pi Pico`.
    pub name: String,
    /// Mode the board is in when it enumerates with this id.
    pub mode: BoardMode,
}

impl BoardProfile {
    fn new(name: &str, vid: u16, pid: u16, mode: BoardMode) -> Self {
        Self { name: name.to_string(), vid, pid, mode }
    }
}

/// Built-in catalog used when the configuration names none.
pub fn default_boards() -> Vec<BoardProfile> {
    vec![
        BoardProfile::new("Wio Terminal", 0x2886, 0x802D, BoardMode::Normal),
        BoardProfile::new("Wio Terminal", 0x2886, 0x002D, BoardMode::Bootloader),
        BoardProfile::new("Seeeduino XIAO", 0x2886, 0x802F, BoardMode::Normal),
        BoardProfile::new("Seeeduino XIAO", 0x2886, 0x002F, BoardMode::Bootloader),
        BoardProfile::new("BBC micro:bit", 0x0D28, 0x0204, BoardMode::Normal),
        BoardProfile::new("Raspberry Pi Pico", 0x2E8A, 0x0005, BoardMode::Normal),
        BoardProfile::new("ESP32 (CP210x)", 0x10C4, 0xEA60, BoardMode::Normal),
        BoardProfile::new("ESP32 (CH340)", 0x1A86, 0x7523, BoardMode::Normal),
    ]
}

/// Lookup table from `(vid, pid)` to a board.
#[derive(Debug, Clone, Default)]
pub struct BoardCatalog {
    boards: Vec<BoardProfile>,
}

impl BoardCatalog {
    /// A catalog over `boards`, matched in order.
    pub fn new(boards: Vec<BoardProfile>) -> Self {
        Self { boards }
    }

    /// The first profile with this vendor and product id.
    pub fn identify(&self, vid: u16, pid: u16) -> Option<BoardMatch> {
        self.boards
            .iter()
            .find(|b| b.vid == vid && b.pid == pid)
            .map(|b| BoardMatch { name: b.name.clone(), mode: b.mode })
    }

    /// Number of profiles.
    pub fn len(&self) -> usize {
        self.boards.len()
    }

    /// Whether the catalog has no profiles.
    pub fn is_empty(&self) -> bool {
        self.boards.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identify_normal_and_bootloader() {
        let catalog = BoardCatalog::new(default_boards());
        let normal = catalog.identify(0x2886, 0x802D).unwrap();
        assert_eq!(normal.name, "Wio Terminal");
        assert_eq!(normal.mode, BoardMode::Normal);
        assert_eq!(catalog.identify(0x2886, 0x002D).unwrap().mode, BoardMode::Bootloader);
        assert!(catalog.identify(0xFFFF, 0xFFFF).is_none());
    }

    #[test]
    fn test_profile_serialization() {
        let json = r#"{"name":"Custom","vid":4660,"pid":22136,"mode":"bootloader"}"#;
        let profile: BoardProfile = serde_json::from_str(json).unwrap();
        assert_eq!(profile, BoardProfile::new("Custom", 0x1234, 0x5678, BoardMode::Bootloader));
    }
}
