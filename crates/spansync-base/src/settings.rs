//! Typed settings maps checked against declared definitions.
//!
//! Services that accept a settings map at start time declare the keys they
//! understand as [`SettingDef`]s; [`validate_settings`] rejects unknown keys,
//! wrongly-typed values, and missing required keys before any of them are
//! applied.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Errors from settings validation.
#[derive(Debug, Error, PartialEq)]
pub enum SettingsError {
    /// A key was supplied that the service does not declare.
    #[error("unknown setting \"{key}\"")]
    UnknownKey {
        /// The offending key.
        key: String,
    },
    /// A declared key was supplied with a value of the wrong kind.
    #[error("setting \"{key}\" expects a {expected} value")]
    WrongKind {
        /// The offending key.
        key: String,
        /// The kind the definition declares.
        expected: SettingKind,
    },
    /// A required key was not supplied.
    #[error("required setting \"{key}\" is missing")]
    MissingRequired {
        /// The missing key.
        key: String,
    },
}

/// The kind of value a setting carries.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SettingKind {
    /// A time duration.
    Duration,
    /// An unsigned integer.
    Unsigned,
    /// A signed integer.
    Int,
    /// A boolean flag.
    Bool,
    /// A string.
    Str,
}

impl fmt::Display for SettingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SettingKind::Duration => "duration",
            SettingKind::Unsigned => "unsigned",
            SettingKind::Int => "integer",
            SettingKind::Bool => "boolean",
            SettingKind::Str => "string",
        };
        write!(f, "{}", name)
    }
}

/// A single setting value.
#[derive(Clone, Debug, PartialEq)]
pub enum SettingValue {
    /// A time duration.
    Duration(Duration),
    /// An unsigned integer.
    Unsigned(u64),
    /// A signed integer.
    Int(i64),
    /// A boolean flag.
    Bool(bool),
    /// A string.
    Str(String),
}

impl SettingValue {
    /// The kind of this value.
    pub fn kind(&self) -> SettingKind {
        match self {
            SettingValue::Duration(_) => SettingKind::Duration,
            SettingValue::Unsigned(_) => SettingKind::Unsigned,
            SettingValue::Int(_) => SettingKind::Int,
            SettingValue::Bool(_) => SettingKind::Bool,
            SettingValue::Str(_) => SettingKind::Str,
        }
    }

    /// The duration payload, if this is a duration.
    pub fn as_duration(&self) -> Option<Duration> {
        match self {
            SettingValue::Duration(d) => Some(*d),
            _ => None,
        }
    }

    /// The unsigned payload, if this is an unsigned integer.
    pub fn as_unsigned(&self) -> Option<u64> {
        match self {
            SettingValue::Unsigned(v) => Some(*v),
            _ => None,
        }
    }

    /// The boolean payload, if this is a flag.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            SettingValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// The string payload, if this is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            SettingValue::Str(v) => Some(v),
            _ => None,
        }
    }
}

/// A settings map handed to a service at start time.
pub type SettingsMap = HashMap<String, SettingValue>;

/// Declaration of one setting a service understands.
#[derive(Copy, Clone, Debug)]
pub struct SettingDef {
    /// The kind of value this setting carries.
    pub kind: SettingKind,
    /// Whether the setting must be present.
    pub required: bool,
}

impl SettingDef {
    /// Creates a definition.
    pub fn new(kind: SettingKind, required: bool) -> Self {
        SettingDef { kind, required }
    }
}

/// The set of settings a service declares.
pub type SettingDefs = HashMap<&'static str, SettingDef>;

/// Checks a settings map against the declared definitions.
///
/// Every supplied key must be declared and carry a value of the declared
/// kind; every required key must be present. The first violation found is
/// returned.
pub fn validate_settings(defs: &SettingDefs, settings: &SettingsMap) -> Result<(), SettingsError> {
    for (key, value) in settings {
        match defs.get(key.as_str()) {
            None => {
                return Err(SettingsError::UnknownKey { key: key.clone() });
            }
            Some(def) if def.kind != value.kind() => {
                return Err(SettingsError::WrongKind {
                    key: key.clone(),
                    expected: def.kind,
                });
            }
            Some(_) => {}
        }
    }

    for (key, def) in defs {
        if def.required && !settings.contains_key(*key) {
            return Err(SettingsError::MissingRequired {
                key: (*key).to_string(),
            });
        }
    }

    Ok(())
}
