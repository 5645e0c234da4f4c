use super::{ChangeAction, ChangeSet};
use serde_json::{Map, Value};

pub const NODE_DEPENDENCY_GROUPS: [&str; 4] = [
    "dependencies",
    "devDependencies",
    "peerDependencies",
    "optionalDependencies",
];

#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("package.json is not valid json: {source}")]
    InvalidJson {
        #[source]
        source: serde_json::Error,
    },
    #[error("package.json must be a json object")]
    NotAnObject,
    #[error("package.json group `{group}` must be an object")]
    GroupNotAnObject { group: String },
    #[error("failed to encode package.json: {source}")]
    Encode {
        #[source]
        source: serde_json::Error,
    },
}

fn upgrade_target<'a>(change_set: &'a ChangeSet, name: &str) -> Option<&'a str> {
    change_set
        .get(name)
        .filter(|change| change.action == ChangeAction::Upgrade)
        .and_then(|change| change.target_version.as_deref())
        .map(str::trim)
        .filter(|target| !target.is_empty())
}

/// Rewrites a `package.json` document. Key order is preserved and the output
/// is two-space pretty JSON with a trailing newline.
pub fn apply_to_package_json(raw: &str, change_set: &ChangeSet) -> Result<String, ManifestError> {
    let mut document: Value =
        serde_json::from_str(raw).map_err(|source| ManifestError::InvalidJson { source })?;
    let root = document.as_object_mut().ok_or(ManifestError::NotAnObject)?;

    for group in NODE_DEPENDENCY_GROUPS {
        if let Some(value) = root.get(group) {
            if !value.is_object() {
                return Err(ManifestError::GroupNotAnObject {
                    group: group.to_string(),
                });
            }
        }
    }

    for (name, change) in change_set.actionable() {
        match change.action {
            ChangeAction::Upgrade => {
                let Some(target) = upgrade_target(change_set, name) else {
                    continue;
                };
                let mut found = false;
                for group in NODE_DEPENDENCY_GROUPS {
                    if let Some(Value::Object(entries)) = root.get_mut(group) {
                        if let Some(slot) = entries.get_mut(name) {
                            *slot = Value::String(target.to_string());
                            found = true;
                        }
                    }
                }
                if !found {
                    let entries = root
                        .entry("dependencies")
                        .or_insert_with(|| Value::Object(Map::new()));
                    if let Value::Object(entries) = entries {
                        entries.insert(name.clone(), Value::String(target.to_string()));
                    }
                }
            }
            ChangeAction::Remove => {
                for group in NODE_DEPENDENCY_GROUPS {
                    if let Some(Value::Object(entries)) = root.get_mut(group) {
                        entries.remove(name);
                    }
                }
            }
            ChangeAction::Keep => {}
        }
    }

    let mut out = serde_json::to_string_pretty(&document)
        .map_err(|source| ManifestError::Encode { source })?;
    out.push('\n');
    Ok(out)
}

/// PEP 503 name normalisation: lowercase, runs of `-`, `_`, `.` collapse to `-`.
pub fn normalize_python_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut pending_separator = false;
    for ch in name.chars() {
        if matches!(ch, '-' | '_' | '.') {
            pending_separator = true;
            continue;
        }
        if pending_separator && !out.is_empty() {
            out.push('-');
        }
        pending_separator = false;
        out.push(ch.to_ascii_lowercase());
    }
    out
}

struct Requirement<'a> {
    name: &'a str,
    extras: &'a str,
    tail: &'a str,
}

fn parse_requirement(line: &str) -> Option<Requirement<'_>> {
    let trimmed = line.trim_start();
    if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with('-') {
        return None;
    }
    let name_end = trimmed
        .find(|ch: char| !(ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.')))
        .unwrap_or(trimmed.len());
    if name_end == 0 {
        return None;
    }
    let name = &trimmed[..name_end];
    let rest = &trimmed[name_end..];
    let (extras, rest) = if rest.starts_with('[') {
        match rest.find(']') {
            Some(close) => (&rest[..=close], &rest[close + 1..]),
            None => ("", rest),
        }
    } else {
        ("", rest)
    };
    // Environment markers and inline comments survive a rewrite untouched.
    let tail_start = rest
        .char_indices()
        .find(|(idx, ch)| {
            *ch == ';'
                || (*ch == '#'
                    && (*idx == 0 || rest[..*idx].ends_with(char::is_whitespace)))
        })
        .map(|(idx, _)| idx)
        .unwrap_or(rest.len());
    let tail_start = rest[..tail_start].trim_end().len();
    Some(Requirement {
        name,
        extras,
        tail: &rest[tail_start..],
    })
}

fn version_spec(target: &str) -> String {
    if target.starts_with(['=', '<', '>', '!', '~']) {
        target.to_string()
    } else {
        format!("=={target}")
    }
}

/// Rewrites a `requirements.txt` document line by line. Comments, blank lines
/// and pip options pass through verbatim, and the document keeps its line
/// ending style.
pub fn apply_to_requirements(raw: &str, change_set: &ChangeSet) -> String {
    let newline = if raw.contains("\r\n") { "\r\n" } else { "\n" };
    let mut wanted = std::collections::BTreeMap::new();
    for (name, change) in change_set.actionable() {
        wanted.insert(normalize_python_name(name), (name.as_str(), change.action));
    }

    let mut seen = std::collections::BTreeSet::new();
    let mut lines = Vec::new();
    for line in raw.lines() {
        let Some(requirement) = parse_requirement(line) else {
            lines.push(line.to_string());
            continue;
        };
        let key = normalize_python_name(requirement.name);
        let Some((change_name, action)) = wanted.get(&key) else {
            lines.push(line.to_string());
            continue;
        };
        seen.insert(key);
        match action {
            ChangeAction::Remove => {}
            ChangeAction::Upgrade => match upgrade_target(change_set, change_name) {
                Some(target) => lines.push(format!(
                    "{}{}{}{}",
                    requirement.name,
                    requirement.extras,
                    version_spec(target),
                    requirement.tail
                )),
                None => lines.push(line.to_string()),
            },
            ChangeAction::Keep => lines.push(line.to_string()),
        }
    }

    let mut appended = false;
    for (key, (change_name, action)) in &wanted {
        if *action != ChangeAction::Upgrade || seen.contains(key) {
            continue;
        }
        if let Some(target) = upgrade_target(change_set, change_name) {
            lines.push(format!("{change_name}{}", version_spec(target)));
            appended = true;
        }
    }

    let mut out = lines.join(newline);
    if !out.is_empty() && (raw.ends_with('\n') || appended) {
        out.push_str(newline);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_python_names() {
        assert_eq!(normalize_python_name("Flask_SQLAlchemy"), "flask-sqlalchemy");
        assert_eq!(normalize_python_name("zope.interface"), "zope-interface");
        assert_eq!(normalize_python_name("a--_b"), "a-b");
    }

    #[test]
    fn parses_extras_markers_and_comments() {
        let req = parse_requirement("uvicorn[standard]>=0.20 ; python_version > '3.8'  # server")
            .expect("requirement");
        assert_eq!(req.name, "uvicorn");
        assert_eq!(req.extras, "[standard]");
        assert_eq!(req.tail, " ; python_version > '3.8'  # server");
        assert!(parse_requirement("--index-url https://example.invalid").is_none());
        assert!(parse_requirement("   # note").is_none());
    }

    #[test]
    fn operator_targets_are_written_verbatim() {
        assert_eq!(version_spec(">=2.0,<3"), ">=2.0,<3");
        assert_eq!(version_spec("2.3.2"), "==2.3.2");
    }
}
