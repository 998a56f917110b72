//! Parsed build instructions.
//!
//! The instruction file surface syntax is parsed elsewhere; the engine
//! receives stages as lists of [`Instruction`] values. The serialized form
//! of an instruction is what gets hashed into its cache key.

use std::collections::HashMap;
use std::fmt;

use a3s_forge_core::error::Result;
use serde::{Deserialize, Serialize};

use crate::hash::sha256_bytes;

/// Transport protocol of an exposed port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => write!(f, "tcp"),
            Self::Udp => write!(f, "udp"),
        }
    }
}

/// A single build instruction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Instruction {
    /// `FROM <image>`; `reference` may also name an earlier stage
    FromImage { reference: String },
    /// `COPY [--from=<stage>] <src>... <dest>`
    Copy {
        src: Vec<String>,
        dest: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
    },
    /// `RUN <command>`, with the context patterns the command reads
    Run {
        command: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        inputs: Vec<String>,
    },
    /// `ENV <key>=<value> ...`
    Env { vars: Vec<(String, String)> },
    /// `EXPOSE <port>[/<proto>]`
    Expose { port: u16, proto: Protocol },
    /// `USER <user>[:<group>]`
    User { user: String },
    /// `ENTRYPOINT ["exec", "form"]`
    Entrypoint { exec: Vec<String> },
    /// `CMD ["exec", "form"]`
    Cmd { exec: Vec<String> },
    /// `ARG <name>[=<default>]`
    Arg {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        default: Option<String>,
    },
    /// `WORKDIR <path>`
    Workdir { path: String },
    /// `LABEL <key>=<value>`
    Label { key: String, value: String },
}

impl Instruction {
    /// Upper-case instruction keyword.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::FromImage { .. } => "FROM",
            Self::Copy { .. } => "COPY",
            Self::Run { .. } => "RUN",
            Self::Env { .. } => "ENV",
            Self::Expose { .. } => "EXPOSE",
            Self::User { .. } => "USER",
            Self::Entrypoint { .. } => "ENTRYPOINT",
            Self::Cmd { .. } => "CMD",
            Self::Arg { .. } => "ARG",
            Self::Workdir { .. } => "WORKDIR",
            Self::Label { .. } => "LABEL",
        }
    }

    /// Instructions that only change image metadata. They produce empty
    /// layers and are never sent to the executor.
    pub fn is_metadata_only(&self) -> bool {
        !matches!(
            self,
            Self::FromImage { .. } | Self::Copy { .. } | Self::Run { .. }
        )
    }

    /// Stage named by `COPY --from`, if any.
    pub fn copy_source_stage(&self) -> Option<&str> {
        match self {
            Self::Copy { from: Some(stage), .. } => Some(stage),
            _ => None,
        }
    }

    /// Image or stage reference of a `FROM`.
    pub fn from_reference(&self) -> Option<&str> {
        match self {
            Self::FromImage { reference } => Some(reference),
            _ => None,
        }
    }

    /// Context patterns this instruction reads, if it reads the context.
    pub fn context_patterns(&self) -> Option<&[String]> {
        match self {
            Self::Copy { src, from: None, .. } => Some(src),
            Self::Run { inputs, .. } if !inputs.is_empty() => Some(inputs),
            _ => None,
        }
    }

    /// Hex SHA256 of the canonical serialized instruction.
    pub fn payload_digest(&self) -> Result<String> {
        let payload = serde_json::to_vec(self)?;
        Ok(sha256_bytes(&payload))
    }

    /// Substitute `$NAME` and `${NAME}` references to build arguments.
    ///
    /// Unknown names are left untouched. `ARG` itself is never expanded.
    pub fn expand(&self, args: &HashMap<String, String>) -> Instruction {
        if args.is_empty() {
            return self.clone();
        }
        let x = |s: &String| expand_vars(s, args);
        let xs = |v: &Vec<String>| -> Vec<String> {
            v.iter().map(|s| expand_vars(s, args)).collect()
        };
        match self {
            Self::FromImage { reference } => Self::FromImage {
                reference: x(reference),
            },
            Self::Copy { src, dest, from } => Self::Copy {
                src: xs(src),
                dest: x(dest),
                from: from.as_ref().map(x),
            },
            Self::Run { command, inputs } => Self::Run {
                command: x(command),
                inputs: xs(inputs),
            },
            Self::Env { vars } => Self::Env {
                vars: vars.iter().map(|(k, v)| (k.clone(), x(v))).collect(),
            },
            Self::User { user } => Self::User { user: x(user) },
            Self::Entrypoint { exec } => Self::Entrypoint { exec: xs(exec) },
            Self::Cmd { exec } => Self::Cmd { exec: xs(exec) },
            Self::Workdir { path } => Self::Workdir { path: x(path) },
            Self::Label { key, value } => Self::Label {
                key: key.clone(),
                value: x(value),
            },
            Self::Expose { .. } | Self::Arg { .. } => self.clone(),
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FromImage { reference } => write!(f, "FROM {}", reference),
            Self::Copy { src, dest, from } => {
                write!(f, "COPY ")?;
                if let Some(stage) = from {
                    write!(f, "--from={} ", stage)?;
                }
                write!(f, "{} {}", src.join(" "), dest)
            }
            Self::Run { command, .. } => write!(f, "RUN {}", command),
            Self::Env { vars } => {
                let pairs: Vec<String> = vars.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
                write!(f, "ENV {}", pairs.join(" "))
            }
            Self::Expose { port, proto } => write!(f, "EXPOSE {}/{}", port, proto),
            Self::User { user } => write!(f, "USER {}", user),
            Self::Entrypoint { exec } => write!(f, "ENTRYPOINT {:?}", exec),
            Self::Cmd { exec } => write!(f, "CMD {:?}", exec),
            Self::Arg { name, default } => match default {
                Some(value) => write!(f, "ARG {}={}", name, value),
                None => write!(f, "ARG {}", name),
            },
            Self::Workdir { path } => write!(f, "WORKDIR {}", path),
            Self::Label { key, value } => write!(f, "LABEL {}={}", key, value),
        }
    }
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

fn expand_vars(s: &str, args: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];

        if let Some(braced) = after.strip_prefix('{') {
            if let Some(end) = braced.find('}') {
                let name = &braced[..end];
                match args.get(name) {
                    Some(value) => out.push_str(value),
                    None => out.push_str(&rest[pos..pos + 2 + end + 1]),
                }
                rest = &braced[end + 1..];
                continue;
            }
        }

        let len = after.find(|c: char| !is_name_char(c)).unwrap_or(after.len());
        let name = &after[..len];
        match args.get(name) {
            Some(value) if !name.is_empty() => out.push_str(value),
            _ => {
                out.push('$');
                out.push_str(name);
            }
        }
        rest = &after[len..];
    }
    out.push_str(rest);
    out
}
