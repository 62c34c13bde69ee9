//! Command template formatting.
//!
//! Templates contain typed placeholders `{type:name}`:
//!
//! - `{i:port}` - input path, or the input's FIFO path when it streams
//! - `{o:port}` - output *temp* path; the task renames it on commit
//! - `{os:port}` - output FIFO path
//! - `{p:name}` - parameter value
//!
//! Any placeholder that cannot be resolved is a [`FormatError`]; a command is
//! never produced with a hole in it.
//!
//! ```
//! use sciexec::{format_command, InformationPacket};
//! use std::collections::BTreeMap;
//! use std::sync::Arc;
//!
//! let inputs = BTreeMap::from([("a".to_string(), Arc::new(InformationPacket::new("/x/in.txt")))]);
//! let outputs = BTreeMap::from([("b".to_string(), Arc::new(InformationPacket::new("/x/out.txt")))]);
//! let params = BTreeMap::from([("c".to_string(), "5".to_string())]);
//!
//! let cmd = format_command("head -n {p:c} {i:a} > {o:b}", &inputs, &outputs, &params, "").unwrap();
//! assert_eq!(cmd, "head -n 5 /x/in.txt > /x/out.txt.tmp");
//! ```

use regex::{Captures, Regex};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, OnceLock};
use thiserror::Error;

use super::packet::InformationPacket;

/// Ports of a task, keyed by port name.
pub type Ports = BTreeMap<String, Arc<InformationPacket>>;

/// Errors resolving a command template.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FormatError {
    /// `{o:..}` or `{os:..}` names an unknown out-port.
    #[error("Missing outpath for outport '{port}' for command '{command}'.")]
    MissingOutPath { port: String, command: String },

    /// `{i:..}` names an unknown in-port, or one with an empty path.
    #[error("Missing inpath for inport '{port}' for command '{command}'.")]
    MissingInPath { port: String, command: String },

    /// `{p:..}` names a missing or empty parameter.
    #[error("Missing param for param '{port}' for command '{command}'.")]
    MissingParam { port: String, command: String },

    /// A placeholder resolved to an empty string.
    #[error("Replace failed for port '{port}' for command '{command}'.")]
    ReplaceFailed { port: String, command: String },

    /// Placeholder kind not allowed in this template (e.g. `{o:..}` in an output path).
    #[error("Placeholder '{placeholder}' is not allowed in '{command}'.")]
    Unsupported { placeholder: String, command: String },
}

impl FormatError {
    /// Name of the port or parameter the error refers to.
    pub fn port(&self) -> &str {
        match self {
            FormatError::MissingOutPath { port, .. }
            | FormatError::MissingInPath { port, .. }
            | FormatError::MissingParam { port, .. }
            | FormatError::ReplaceFailed { port, .. } => port,
            FormatError::Unsupported { placeholder, .. } => placeholder,
        }
    }
}

/// Kind of placeholder in a template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlaceholderKind {
    /// `i`
    In,
    /// `o`
    Out,
    /// `os`
    OutStream,
    /// `p`
    Param,
}

impl PlaceholderKind {
    fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "i" => Some(Self::In),
            "o" => Some(Self::Out),
            "os" => Some(Self::OutStream),
            "p" => Some(Self::Param),
            _ => None,
        }
    }

    /// The tag as written in templates.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::In => "i",
            Self::Out => "o",
            Self::OutStream => "os",
            Self::Param => "p",
        }
    }
}

/// A placeholder parsed from a template.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Placeholder {
    pub kind: PlaceholderKind,
    pub name: String,
}

impl fmt::Display for Placeholder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}:{}}}", self.kind.tag(), self.name)
    }
}

fn placeholder_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\{(os|o|i|p):([^{}:\s]+)\}").expect("placeholder pattern is valid")
    })
}

fn parse(caps: &Captures<'_>) -> Option<Placeholder> {
    let kind = PlaceholderKind::from_tag(caps.get(1)?.as_str())?;
    Some(Placeholder {
        kind,
        name: caps.get(2)?.as_str().to_string(),
    })
}

/// List placeholders in order of appearance, duplicates included.
pub fn placeholders(template: &str) -> Vec<Placeholder> {
    placeholder_regex()
        .captures_iter(template)
        .filter_map(|caps| parse(&caps))
        .collect()
}

/// Replace every placeholder using `resolve`, stopping at the first error.
fn substitute<F>(template: &str, mut resolve: F) -> Result<String, FormatError>
where
    F: FnMut(&Placeholder) -> Result<String, FormatError>,
{
    let mut out = String::with_capacity(template.len());
    let mut last = 0;
    for caps in placeholder_regex().captures_iter(template) {
        let (Some(whole), Some(ph)) = (caps.get(0), parse(&caps)) else {
            continue;
        };
        let value = resolve(&ph)?;
        if value.is_empty() {
            return Err(FormatError::ReplaceFailed {
                port: ph.name,
                command: template.to_string(),
            });
        }
        out.push_str(&template[last..whole.start()]);
        out.push_str(&value);
        last = whole.end();
    }
    out.push_str(&template[last..]);
    Ok(out)
}

fn resolve_input(name: &str, inputs: &Ports, template: &str) -> Result<String, FormatError> {
    match inputs.get(name) {
        Some(ip) if !ip.path().is_empty() => Ok(if ip.is_streaming() {
            ip.fifo_path()
        } else {
            ip.path().to_string()
        }),
        _ => Err(FormatError::MissingInPath {
            port: name.to_string(),
            command: template.to_string(),
        }),
    }
}

fn resolve_param(
    name: &str,
    params: &BTreeMap<String, String>,
    template: &str,
) -> Result<String, FormatError> {
    match params.get(name) {
        Some(value) if !value.is_empty() => Ok(value.clone()),
        _ => Err(FormatError::MissingParam {
            port: name.to_string(),
            command: template.to_string(),
        }),
    }
}

/// Resolve a command template against a task's ports and parameters.
///
/// A non-empty `prepend` is joined in front of the command with a space,
/// e.g. to wrap the command in a container runner.
pub fn format_command(
    template: &str,
    inputs: &Ports,
    outputs: &Ports,
    params: &BTreeMap<String, String>,
    prepend: &str,
) -> Result<String, FormatError> {
    let cmd = substitute(template, |ph| match ph.kind {
        PlaceholderKind::In => resolve_input(&ph.name, inputs, template),
        PlaceholderKind::Out | PlaceholderKind::OutStream => {
            let op = outputs
                .get(&ph.name)
                .ok_or_else(|| FormatError::MissingOutPath {
                    port: ph.name.clone(),
                    command: template.to_string(),
                })?;
            Ok(match ph.kind {
                PlaceholderKind::Out => op.temp_path(),
                _ => op.fifo_path(),
            })
        }
        PlaceholderKind::Param => resolve_param(&ph.name, params, template),
    })?;

    if prepend.is_empty() {
        Ok(cmd)
    } else {
        Ok(format!("{} {}", prepend, cmd))
    }
}

/// Resolve an output-path template from inputs and parameters.
///
/// Output placeholders are rejected: an output path cannot depend on another
/// output of the same task.
pub fn format_path(
    template: &str,
    inputs: &Ports,
    params: &BTreeMap<String, String>,
) -> Result<String, FormatError> {
    substitute(template, |ph| match ph.kind {
        PlaceholderKind::In => inputs
            .get(&ph.name)
            .filter(|ip| !ip.path().is_empty())
            .map(|ip| ip.path().to_string())
            .ok_or_else(|| FormatError::MissingInPath {
                port: ph.name.clone(),
                command: template.to_string(),
            }),
        PlaceholderKind::Param => resolve_param(&ph.name, params, template),
        PlaceholderKind::Out | PlaceholderKind::OutStream => Err(FormatError::Unsupported {
            placeholder: ph.to_string(),
            command: template.to_string(),
        }),
    })
}
