use std::str::FromStr;

use anyhow::Result;
use encoding_rs::GBK;
use serde::{Deserialize, Serialize};
use tracing::debug;
use zhconv::{zhconv, Variant};

use crate::logging::{last_lines, LogBuffer};

/// Shown in place of an empty log. Converted like any other log text.
pub const NOT_STARTED_MESSAGE: &str = "RAY Radar 尚未启动";

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum ScriptVariant {
    #[default]
    #[serde(rename = "zh-cn")]
    Simplified,
    #[serde(rename = "zh-tw")]
    Traditional,
}

impl ScriptVariant {
    pub fn as_tag(self) -> &'static str {
        match self {
            ScriptVariant::Simplified => "zh-cn",
            ScriptVariant::Traditional => "zh-tw",
        }
    }
}

impl FromStr for ScriptVariant {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "zh-cn" | "zh-hans" | "cn" | "simplified" => Ok(ScriptVariant::Simplified),
            "zh-tw" | "zh-hant" | "tw" | "traditional" => Ok(ScriptVariant::Traditional),
            other => {
                anyhow::bail!("unsupported script variant {other:?} (expected zh-cn or zh-tw)")
            }
        }
    }
}

impl std::fmt::Display for ScriptVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_tag())
    }
}

/// Decodes output written in the workload's legacy GBK code page.
pub fn decode_legacy(bytes: &[u8]) -> String {
    let (text, _, had_errors) = GBK.decode(bytes);
    if had_errors {
        debug!("log contained bytes outside GBK; replaced with U+FFFD");
    }
    text.into_owned()
}

/// Renders `text` in the requested script. Text already in that script comes
/// back unchanged.
pub fn convert(text: &str, variant: ScriptVariant) -> String {
    let target = match variant {
        ScriptVariant::Simplified => Variant::ZhCN,
        ScriptVariant::Traditional => Variant::ZhTW,
    };
    zhconv(text, target)
}

#[derive(Debug, Clone)]
pub struct LogTranscoder {
    buffer: LogBuffer,
}

impl LogTranscoder {
    pub fn new(buffer: LogBuffer) -> Self {
        Self { buffer }
    }

    /// Reads the captured log as text in `variant`, optionally keeping only
    /// the last `tail` lines. A missing file surfaces as `LogUnavailable`.
    pub fn read(&self, variant: ScriptVariant, tail: Option<usize>) -> Result<String> {
        let raw = self.buffer.read_raw()?;
        let decoded = decode_legacy(&raw);

        let text = if decoded.trim().is_empty() {
            NOT_STARTED_MESSAGE.to_string()
        } else if let Some(lines) = tail {
            last_lines(&decoded, lines)
        } else {
            decoded
        };

        Ok(convert(&text, variant))
    }
}
