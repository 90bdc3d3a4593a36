//! Protocol level negotiation.
//!
//! A CONNECT packet names its protocol and level; the broker only accepts
//! the pairs listed in [`SUPPORTED_LEVELS`].

/// A protocol name and level pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProtocolLevel {
    /// Protocol name carried in CONNECT.
    pub name: &'static str,
    /// Protocol level byte.
    pub level: u8,
}

/// MQTT 3.1.
pub const MQTT_3_1: ProtocolLevel = ProtocolLevel {
    name: "MQIsdp",
    level: 3,
};

/// MQTT 3.1.1.
pub const MQTT_3_1_1: ProtocolLevel = ProtocolLevel {
    name: "MQTT",
    level: 4,
};

/// Levels the broker accepts.
pub const SUPPORTED_LEVELS: [ProtocolLevel; 2] = [MQTT_3_1, MQTT_3_1_1];

impl ProtocolLevel {
    /// Look up a supported level from the CONNECT fields.
    #[must_use]
    pub fn negotiate(name: &str, level: u8) -> Option<ProtocolLevel> {
        SUPPORTED_LEVELS
            .iter()
            .copied()
            .find(|p| p.name == name && p.level == level)
    }
}

impl std::fmt::Display for ProtocolLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (level {})", self.name, self.level)
    }
}

impl Default for ProtocolLevel {
    fn default() -> Self {
        MQTT_3_1_1
    }
}
