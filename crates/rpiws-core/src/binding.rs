//! Channel bindings and the configuration dedup rule.
//!
//! A binding is one `(class_name, channel_port)` pair plus the ordered set
//! of equations applied to its values. Configuration requests may name the
//! same pair many times; they collapse into a single binding whose
//! equation list keeps the first-seen order of each distinct expression.

use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;

/// Driver-specific channel selector: a pin number, relay index or device
/// path. Accepts a JSON string, number or boolean on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ChannelPort(String);

impl ChannelPort {
    pub fn new(port: impl Into<String>) -> Self {
        Self(port.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_number(&self) -> Option<i64> {
        self.0.trim().parse().ok()
    }
}

impl fmt::Display for ChannelPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChannelPort {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<i64> for ChannelPort {
    fn from(value: i64) -> Self {
        Self(value.to_string())
    }
}

impl From<i32> for ChannelPort {
    fn from(value: i32) -> Self {
        Self(value.to_string())
    }
}

/// Booleans are spelled `True`/`False` so keys match the ones agents and
/// admin tooling already build.
impl From<bool> for ChannelPort {
    fn from(value: bool) -> Self {
        Self::new(if value { "True" } else { "False" })
    }
}

impl<'de> Deserialize<'de> for ChannelPort {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Value::deserialize(deserializer)? {
            Value::String(s) => Ok(ChannelPort(s)),
            Value::Number(n) => Ok(ChannelPort(n.to_string())),
            Value::Bool(b) => Ok(ChannelPort::from(b)),
            _ => Err(serde::de::Error::custom(
                "expected string, number or boolean for channel port",
            )),
        }
    }
}

/// One admin-side entry: "apply `equation` to `class_name` on `channel_port`".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingRequest {
    #[serde(rename = "ch_port")]
    pub channel_port: ChannelPort,
    #[serde(default)]
    pub equation: String,
    #[serde(rename = "cls_name")]
    pub class_name: String,
}

impl BindingRequest {
    pub fn new(class_name: &str, channel_port: impl Into<ChannelPort>, equation: &str) -> Self {
        Self {
            channel_port: channel_port.into(),
            equation: equation.to_string(),
            class_name: class_name.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelBinding {
    #[serde(rename = "cls_name")]
    pub class_name: String,
    #[serde(rename = "ch_port")]
    pub channel_port: ChannelPort,
    #[serde(default)]
    pub equations: Vec<String>,
}

impl ChannelBinding {
    pub fn key(&self) -> String {
        binding_key(&self.class_name, &self.channel_port)
    }

    pub fn equation_key(&self, equation: &str) -> String {
        equation_key(&self.class_name, &self.channel_port, equation)
    }

    /// Adds `equation` unless the exact string is already present.
    pub fn add_equation(&mut self, equation: &str) -> bool {
        if self.equations.iter().any(|existing| existing == equation) {
            return false;
        }
        self.equations.push(equation.to_string());
        true
    }
}

/// Bindings keyed by [`binding_key`], in first-seen order.
pub type BindingMap = IndexMap<String, ChannelBinding>;

pub fn binding_key(class_name: &str, channel_port: &ChannelPort) -> String {
    format!("cls:{class_name}, port:{channel_port}")
}

pub fn equation_key(class_name: &str, channel_port: &ChannelPort, equation: &str) -> String {
    format!("cls:{class_name}, port:{channel_port}, eq:{equation}")
}

/// Collapses requests into one binding per `(class_name, channel_port)`.
pub fn merge_bindings<'a, I>(requests: I) -> BindingMap
where
    I: IntoIterator<Item = &'a BindingRequest>,
{
    let mut merged = BindingMap::new();
    for request in requests {
        let key = binding_key(&request.class_name, &request.channel_port);
        merged
            .entry(key)
            .or_insert_with(|| ChannelBinding {
                class_name: request.class_name.clone(),
                channel_port: request.channel_port.clone(),
                equations: Vec::new(),
            })
            .add_equation(&request.equation);
    }
    merged
}
