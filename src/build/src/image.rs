//! Image assembly.
//!
//! An image is the target stage's layer chain plus the runtime config
//! folded from the metadata instructions along that chain.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use a3s_forge_core::error::{ForgeError, Result};
use serde::{Deserialize, Serialize};

use crate::builder::StageOutput;
use crate::hash::Digest;
use crate::instruction::{Instruction, Protocol};
use crate::layer::Layer;

/// An exposed port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ExposedPort {
    pub port: u16,
    pub proto: Protocol,
}

impl std::fmt::Display for ExposedPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.port, self.proto)
    }
}

/// Runtime configuration of an image.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Environment in first-definition order; redefinitions overwrite in place
    pub env: Vec<(String, String)>,
    pub exposed_ports: BTreeSet<ExposedPort>,
    pub entrypoint: Option<Vec<String>>,
    pub cmd: Option<Vec<String>>,
    pub user: Option<String>,
    pub working_dir: Option<String>,
    pub labels: BTreeMap<String, String>,
}

impl RuntimeConfig {
    /// Apply one instruction. Non-metadata instructions are ignored.
    pub fn apply(&mut self, instruction: &Instruction) {
        match instruction {
            Instruction::Env { vars } => {
                for (key, value) in vars {
                    match self.env.iter_mut().find(|(k, _)| k == key) {
                        Some(existing) => existing.1 = value.clone(),
                        None => self.env.push((key.clone(), value.clone())),
                    }
                }
            }
            Instruction::Expose { port, proto } => {
                self.exposed_ports.insert(ExposedPort {
                    port: *port,
                    proto: *proto,
                });
            }
            Instruction::Entrypoint { exec } => self.entrypoint = Some(exec.clone()),
            Instruction::Cmd { exec } => self.cmd = Some(exec.clone()),
            Instruction::User { user } => self.user = Some(user.clone()),
            Instruction::Workdir { path } => {
                self.working_dir = Some(resolve_workdir(self.working_dir.as_deref(), path));
            }
            Instruction::Label { key, value } => {
                self.labels.insert(key.clone(), value.clone());
            }
            Instruction::FromImage { .. }
            | Instruction::Copy { .. }
            | Instruction::Run { .. }
            | Instruction::Arg { .. } => {}
        }
    }

    pub fn env_var(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// An assembled image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    /// Stage the image was assembled from
    pub target: String,
    /// Root-to-tip layer chain
    pub layers: Vec<Layer>,
    pub config: RuntimeConfig,
    /// SHA256 over the layer hashes and the runtime config
    pub digest: Digest,
}

impl Image {
    pub fn tip(&self) -> Option<&Layer> {
        self.layers.last()
    }

    pub fn layer_hashes(&self) -> Vec<&Digest> {
        self.layers.iter().map(|l| &l.hash).collect()
    }

    /// Render the OCI image configuration JSON.
    pub fn to_oci_config(&self) -> serde_json::Value {
        let arch = match std::env::consts::ARCH {
            "x86_64" => "amd64",
            "aarch64" => "arm64",
            other => other,
        };
        let created = self
            .layers
            .iter()
            .map(|l| l.created_at)
            .max()
            .unwrap_or_default()
            .to_rfc3339();

        let mut config = serde_json::Map::new();
        if !self.config.env.is_empty() {
            let env: Vec<String> = self
                .config
                .env
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect();
            config.insert("Env".to_string(), serde_json::json!(env));
        }
        if let Some(ep) = &self.config.entrypoint {
            config.insert("Entrypoint".to_string(), serde_json::json!(ep));
        }
        if let Some(cmd) = &self.config.cmd {
            config.insert("Cmd".to_string(), serde_json::json!(cmd));
        }
        if let Some(dir) = &self.config.working_dir {
            config.insert("WorkingDir".to_string(), serde_json::json!(dir));
        }
        if let Some(user) = &self.config.user {
            config.insert("User".to_string(), serde_json::json!(user));
        }
        if !self.config.exposed_ports.is_empty() {
            let ports: serde_json::Map<String, serde_json::Value> = self
                .config
                .exposed_ports
                .iter()
                .map(|p| (p.to_string(), serde_json::json!({})))
                .collect();
            config.insert("ExposedPorts".to_string(), serde_json::Value::Object(ports));
        }
        if !self.config.labels.is_empty() {
            config.insert("Labels".to_string(), serde_json::json!(self.config.labels));
        }

        let diff_ids: Vec<&str> = self
            .layers
            .iter()
            .filter_map(|l| l.delta.as_ref().map(|b| b.digest.as_str()))
            .collect();
        let history: Vec<serde_json::Value> = self
            .layers
            .iter()
            .map(|l| {
                let mut entry = serde_json::json!({
                    "created": l.created_at.to_rfc3339(),
                    "created_by": l.produced_by.to_string(),
                });
                if l.is_empty() {
                    entry["empty_layer"] = serde_json::json!(true);
                }
                entry
            })
            .collect();

        serde_json::json!({
            "architecture": arch,
            "os": "linux",
            "created": created,
            "config": config,
            "rootfs": {
                "type": "layers",
                "diff_ids": diff_ids,
            },
            "history": history,
        })
    }
}

/// Composes images from stage outputs.
pub struct ImageAssembler;

impl ImageAssembler {
    /// Assemble the image for `target` from the built stages.
    ///
    /// Only the target's own chain (including layers inherited through
    /// `FROM <stage>`) ends up in the image; copy-source stages do not.
    pub fn assemble(target: &str, outputs: &HashMap<String, StageOutput>) -> Result<Image> {
        let output = outputs.get(target).ok_or_else(|| {
            ForgeError::AssemblyError(format!("target stage '{}' never ran", target))
        })?;
        if output.chain.is_empty() {
            return Err(ForgeError::AssemblyError(format!(
                "target stage '{}' produced no layers",
                target
            )));
        }

        let mut config = RuntimeConfig::default();
        for layer in &output.chain {
            config.apply(&layer.produced_by);
        }

        let digest = image_digest(&output.chain, &config)?;
        tracing::debug!(
            target_stage = target,
            layers = output.chain.len(),
            digest = %digest.short(),
            "Assembled image"
        );

        Ok(Image {
            target: target.to_string(),
            layers: output.chain.clone(),
            config,
            digest,
        })
    }
}

fn image_digest(layers: &[Layer], config: &RuntimeConfig) -> Result<Digest> {
    #[derive(Serialize)]
    struct Manifest<'a> {
        layers: Vec<&'a Digest>,
        config: &'a RuntimeConfig,
    }
    let manifest = Manifest {
        layers: layers.iter().map(|l| &l.hash).collect(),
        config,
    };
    Ok(Digest::of_bytes(&serde_json::to_vec(&manifest)?))
}

fn resolve_workdir(current: Option<&str>, path: &str) -> String {
    if path.starts_with('/') {
        return path.to_string();
    }
    let base = current.unwrap_or("/").trim_end_matches('/');
    format!("{}/{}", base, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::StageStats;
    use crate::layer::BlobRef;

    fn layer(instruction: Instruction, parent: Option<&Layer>, blob: bool) -> Layer {
        let hash = Digest::of_bytes(
            format!("{}{:?}", instruction, parent.map(|p| &p.hash)).as_bytes(),
        );
        Layer {
            delta: blob.then(|| BlobRef {
                digest: Digest::of_bytes(hash.as_str().as_bytes()),
                size: 10,
            }),
            hash,
            parent: parent.map(|p| p.hash.clone()),
            produced_by: instruction,
            created_at: chrono::Utc::now(),
        }
    }

    fn chain(instructions: Vec<Instruction>) -> Vec<Layer> {
        let mut out: Vec<Layer> = Vec::new();
        for instruction in instructions {
            let blob = !instruction.is_metadata_only();
            let l = layer(instruction, out.last(), blob);
            out.push(l);
        }
        out
    }

    fn outputs(name: &str, chain: Vec<Layer>) -> HashMap<String, StageOutput> {
        let mut map = HashMap::new();
        map.insert(
            name.to_string(),
            StageOutput {
                name: name.to_string(),
                ordinal: 0,
                chain,
                stats: StageStats::default(),
            },
        );
        map
    }

    fn env(k: &str, v: &str) -> Instruction {
        Instruction::Env {
            vars: vec![(k.to_string(), v.to_string())],
        }
    }

    #[test]
    fn test_fold_runtime_config() {
        let layers = chain(vec![
            Instruction::FromImage {
                reference: "alpine".to_string(),
            },
            env("PATH", "/bin"),
            env("MODE", "dev"),
            Instruction::Expose {
                port: 80,
                proto: Protocol::Tcp,
            },
            Instruction::Cmd {
                exec: vec!["sh".to_string()],
            },
            env("MODE", "prod"),
            Instruction::Expose {
                port: 443,
                proto: Protocol::Tcp,
            },
            Instruction::Cmd {
                exec: vec!["app".to_string()],
            },
            Instruction::User {
                user: "app".to_string(),
            },
        ]);
        let image = ImageAssembler::assemble("final", &outputs("final", layers)).unwrap();

        assert_eq!(
            image.config.env,
            vec![
                ("PATH".to_string(), "/bin".to_string()),
                ("MODE".to_string(), "prod".to_string())
            ]
        );
        assert_eq!(image.config.exposed_ports.len(), 2);
        assert_eq!(image.config.cmd, Some(vec!["app".to_string()]));
        assert_eq!(image.config.user.as_deref(), Some("app"));
        assert_eq!(image.layers.len(), 9);
    }

    #[test]
    fn test_workdir_resolution() {
        let mut config = RuntimeConfig::default();
        config.apply(&Instruction::Workdir {
            path: "app".to_string(),
        });
        assert_eq!(config.working_dir.as_deref(), Some("/app"));
        config.apply(&Instruction::Workdir {
            path: "src".to_string(),
        });
        assert_eq!(config.working_dir.as_deref(), Some("/app/src"));
        config.apply(&Instruction::Workdir {
            path: "/srv".to_string(),
        });
        assert_eq!(config.working_dir.as_deref(), Some("/srv"));
    }

    #[test]
    fn test_missing_target_is_assembly_error() {
        let err = ImageAssembler::assemble("final", &HashMap::new()).unwrap_err();
        assert!(matches!(err, ForgeError::AssemblyError(_)));
        assert!(err.is_defect());
    }

    #[test]
    fn test_empty_target_is_assembly_error() {
        let err = ImageAssembler::assemble("final", &outputs("final", Vec::new())).unwrap_err();
        assert!(matches!(err, ForgeError::AssemblyError(ref m) if m.contains("no layers")));
    }

    #[test]
    fn test_digest_deterministic_and_config_sensitive() {
        let layers = chain(vec![env("A", "1")]);
        let a = ImageAssembler::assemble("s", &outputs("s", layers.clone())).unwrap();
        let b = ImageAssembler::assemble("s", &outputs("s", layers)).unwrap();
        assert_eq!(a.digest, b.digest);

        let other = ImageAssembler::assemble("s", &outputs("s", chain(vec![env("A", "2")]))).unwrap();
        assert_ne!(a.digest, other.digest);
    }

    #[test]
    fn test_oci_config() {
        let layers = chain(vec![
            Instruction::Run {
                command: "make".to_string(),
                inputs: vec![],
            },
            env("A", "1"),
            Instruction::Expose {
                port: 53,
                proto: Protocol::Udp,
            },
            Instruction::Label {
                key: "org.opencontainers.image.title".to_string(),
                value: "app".to_string(),
            },
        ]);
        let image = ImageAssembler::assemble("s", &outputs("s", layers)).unwrap();
        let oci = image.to_oci_config();

        assert_eq!(oci["os"], "linux");
        assert_eq!(oci["config"]["Env"][0], "A=1");
        assert!(oci["config"]["ExposedPorts"]["53/udp"].is_object());
        assert_eq!(oci["config"]["Labels"]["org.opencontainers.image.title"], "app");
        assert_eq!(oci["rootfs"]["diff_ids"].as_array().unwrap().len(), 1);
        assert_eq!(oci["history"].as_array().unwrap().len(), 4);
        assert_eq!(oci["history"][1]["empty_layer"], true);
        assert!(oci["history"][0].get("empty_layer").is_none());
    }
}
