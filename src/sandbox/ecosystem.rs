use super::SandboxError;
use crate::changeset::manifest::normalize_python_name;
use crate::changeset::{apply_to_package_json, apply_to_requirements, ChangeSet, ManifestError};
use crate::config::EcosystemImages;
use serde::{Deserialize, Serialize};
use serde_json::Value;

const NPM_PLACEHOLDER_TEST: &str = "no test specified";
const PYTHON_ENTRY_POINTS: [&str; 3] = ["app.py", "main.py", "server.py"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Ecosystem {
    Node,
    Python,
}

impl Ecosystem {
    pub fn parse(raw: &str) -> Result<Self, SandboxError> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "node" | "nodejs" | "node-like" => Ok(Self::Node),
            "python" | "python-like" => Ok(Self::Python),
            _ => Err(SandboxError::UnsupportedEcosystem(raw.to_string())),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Node => "node",
            Self::Python => "python",
        }
    }

    pub fn image(self, images: &EcosystemImages) -> &str {
        match self {
            Self::Node => &images.node,
            Self::Python => &images.python,
        }
    }

    pub fn manifest_file(self) -> &'static str {
        match self {
            Self::Node => "package.json",
            Self::Python => "requirements.txt",
        }
    }

    pub fn app_port(self) -> u16 {
        match self {
            Self::Node => 3000,
            Self::Python => 5000,
        }
    }

    pub fn install_command(self) -> &'static str {
        match self {
            Self::Node => "npm install --no-audit --no-fund",
            Self::Python => "pip install --no-cache-dir -r requirements.txt",
        }
    }

    /// Process name the liveness check looks for.
    pub fn runtime_binary(self) -> &'static str {
        match self {
            Self::Node => "node",
            Self::Python => "python",
        }
    }

    pub fn rewrite_manifest(
        self,
        raw: &str,
        change_set: &ChangeSet,
    ) -> Result<String, ManifestError> {
        match self {
            Self::Node => apply_to_package_json(raw, change_set),
            Self::Python => Ok(apply_to_requirements(raw, change_set)),
        }
    }

    pub fn start_command(self, layout: &ProjectLayout) -> String {
        match self {
            Self::Node => {
                let package = layout.package_json();
                if let Some(script) = package
                    .as_ref()
                    .and_then(|p| p.pointer("/scripts/start"))
                    .and_then(Value::as_str)
                    .filter(|s| !s.trim().is_empty())
                {
                    return script.trim().to_string();
                }
                if let Some(main) = package
                    .as_ref()
                    .and_then(|p| p.get("main"))
                    .and_then(Value::as_str)
                    .filter(|s| !s.trim().is_empty())
                {
                    return format!("node {}", main.trim());
                }
                "node index.js".to_string()
            }
            Self::Python => {
                let entry = PYTHON_ENTRY_POINTS
                    .iter()
                    .find(|name| layout.has_file(name))
                    .copied()
                    .unwrap_or("app.py");
                format!("python {entry}")
            }
        }
    }

    /// `None` when the project declares no tests; the test phase is skipped.
    pub fn test_command(self, layout: &ProjectLayout) -> Option<String> {
        match self {
            Self::Node => {
                let package = layout.package_json()?;
                let script = package.pointer("/scripts/test")?.as_str()?.trim();
                if script.is_empty() || script.contains(NPM_PLACEHOLDER_TEST) {
                    return None;
                }
                Some("CI=true npm test".to_string())
            }
            Self::Python => {
                let has_config = layout.has_file("pytest.ini") || layout.has_file("conftest.py");
                let has_tests = has_config
                    || layout.files.iter().any(|path| {
                        path.starts_with("tests/") || is_python_test_file(path)
                    });
                if !has_tests {
                    return None;
                }
                let uses_pytest =
                    has_config || layout.manifest.as_deref().is_some_and(requires_pytest);
                if uses_pytest {
                    Some("python -m pytest -q".to_string())
                } else {
                    Some("python -m unittest discover -v".to_string())
                }
            }
        }
    }
}

impl std::fmt::Display for Ecosystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn requires_pytest(requirements: &str) -> bool {
    requirements.lines().any(|line| {
        let name = line
            .trim_start()
            .split(|c: char| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
            .next()
            .unwrap_or("");
        normalize_python_name(name) == "pytest"
    })
}

fn is_python_test_file(path: &str) -> bool {
    let name = path.rsplit('/').next().unwrap_or(path);
    name.ends_with(".py") && (name.starts_with("test_") || name.ends_with("_test.py"))
}

/// What the engine knows about a staged project: its relative file paths and
/// the manifest as it will exist inside the environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProjectLayout {
    pub files: Vec<String>,
    pub manifest: Option<String>,
}

impl ProjectLayout {
    pub fn new(files: Vec<String>, manifest: Option<String>) -> Self {
        Self { files, manifest }
    }

    pub fn has_file(&self, relative: &str) -> bool {
        self.files.iter().any(|path| path == relative)
    }

    fn package_json(&self) -> Option<Value> {
        self.manifest
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
    }
}
