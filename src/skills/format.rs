//! Skill Format Parser
//!
//! Parses `.md` skill files that use YAML frontmatter for metadata and a
//! Markdown body for instructions.
//!
//! Expected format:
//! ```text
//! ---
//! name: my-skill
//! description: Does something useful
//! auto-activate: true
//! requires:
//!   bins: [git]
//!   env: [RELAY_URL]
//! ---
//!
//! Instructions go here in Markdown...
//! ```

use std::path::Path;

use chrono::Utc;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::types::{Skill, SkillRequirements, SkillSource};

/// Deserialized YAML frontmatter from a skill file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillFrontmatter {
    pub name: Option<String>,
    pub description: Option<String>,
    #[serde(rename = "auto-activate", alias = "auto_activate", default = "default_true")]
    pub auto_activate: bool,
    pub requires: Option<SkillRequirements>,
}

fn default_true() -> bool {
    true
}

/// Valid skill names: lowercase alphanumerics, underscore, dash.
pub fn is_valid_skill_name(name: &str) -> bool {
    Regex::new(r"^[a-z0-9_-]+$")
        .map(|re| re.is_match(name))
        .unwrap_or(false)
}

/// Parse a complete skill markdown file into a [`Skill`].
///
/// Returns `None` if the frontmatter is missing, unparseable, or names
/// the skill invalidly.
pub fn parse_skill_md(content: &str, file_path: &str, source: SkillSource) -> Option<Skill> {
    let frontmatter = parse_yaml_frontmatter(content)?;
    let instructions = extract_body(content);

    let name = frontmatter
        .name
        .unwrap_or_else(|| extract_name_from_path(file_path));
    if !is_valid_skill_name(&name) {
        return None;
    }

    Some(Skill {
        name,
        description: frontmatter.description.unwrap_or_default(),
        auto_activate: frontmatter.auto_activate,
        requires: frontmatter.requires,
        instructions,
        source,
        path: file_path.to_string(),
        enabled: true,
        installed_at: Utc::now().to_rfc3339(),
    })
}

/// Re-serialize a skill back into frontmatter + body form. Parsing the
/// output yields the same frontmatter fields and body, modulo a single
/// trailing newline on the body.
pub fn serialize_skill_md(skill: &Skill) -> String {
    let mut out = String::from("---\n");
    out.push_str(&format!("name: {}\n", skill.name));
    if !skill.description.is_empty() {
        out.push_str(&format!("description: {}\n", skill.description));
    }
    out.push_str(&format!("auto-activate: {}\n", skill.auto_activate));
    if let Some(ref requires) = skill.requires {
        out.push_str("requires:\n");
        if let Some(ref bins) = requires.bins {
            out.push_str(&format!("  bins: [{}]\n", bins.join(", ")));
        }
        if let Some(ref env) = requires.env {
            out.push_str(&format!("  env: [{}]\n", env.join(", ")));
        }
    }
    out.push_str("---\n\n");
    out.push_str(skill.instructions.trim_end_matches('\n'));
    out.push('\n');
    out
}

/// Extract and parse the YAML frontmatter block from raw Markdown content.
///
/// The frontmatter must be delimited by lines that are exactly `---`.
pub fn parse_yaml_frontmatter(raw: &str) -> Option<SkillFrontmatter> {
    let trimmed = raw.trim_start();

    if !trimmed.starts_with("---") {
        return None;
    }

    let after_open = &trimmed[3..];
    let close_idx = after_open.find("\n---")?;

    let yaml_block = after_open[..close_idx].trim();

    let json_value = yaml_to_json(yaml_block)?;
    serde_json::from_value::<SkillFrontmatter>(json_value).ok()
}

/// Derive a skill name from the file path by taking the file stem, or
/// the parent directory name for `SKILL.md` layout files.
pub fn extract_name_from_path(file_path: &str) -> String {
    let path = Path::new(file_path);
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("unknown");

    if stem.eq_ignore_ascii_case("skill") {
        if let Some(dir_name) = path
            .parent()
            .and_then(|p| p.file_name())
            .and_then(|s| s.to_str())
        {
            return dir_name.to_string();
        }
    }

    stem.to_string()
}

/// Extract the Markdown body (everything after the closing `---`).
fn extract_body(content: &str) -> String {
    let trimmed = content.trim_start();

    if !trimmed.starts_with("---") {
        return content.to_string();
    }

    let after_open = &trimmed[3..];
    if let Some(close_idx) = after_open.find("\n---") {
        let after_close = &after_open[close_idx + 4..];
        after_close.trim_start_matches('\n').to_string()
    } else {
        String::new()
    }
}

/// Minimal YAML-to-JSON converter for simple frontmatter.
///
/// Supports scalar key-value pairs, single-level inline arrays with the
/// `[a, b]` syntax, and one level of nesting for the `requires` mapping.
fn yaml_to_json(yaml: &str) -> Option<serde_json::Value> {
    use serde_json::{Map, Value};

    let mut map = Map::new();
    let mut current_nested: Option<(String, Map<String, Value>)> = None;

    for line in yaml.lines() {
        if line.trim().is_empty() || line.trim().starts_with('#') {
            continue;
        }

        let indented = line.starts_with("  ") || line.starts_with('\t');
        let trimmed = line.trim();

        let colon = trimmed.find(':')?;
        let key = trimmed[..colon].trim().to_string();
        let raw_value = trimmed[colon + 1..].trim();

        let value = parse_scalar(raw_value);

        if indented {
            if let Some((_, ref mut nested)) = current_nested {
                nested.insert(key, value);
                continue;
            }
            map.insert(key, value);
            continue;
        }

        if let Some((nested_key, nested)) = current_nested.take() {
            map.insert(nested_key, Value::Object(nested));
        }

        if raw_value.is_empty() {
            current_nested = Some((key, Map::new()));
        } else {
            map.insert(key, value);
        }
    }

    if let Some((nested_key, nested)) = current_nested.take() {
        map.insert(nested_key, serde_json::Value::Object(nested));
    }

    Some(serde_json::Value::Object(map))
}

fn parse_scalar(raw_value: &str) -> serde_json::Value {
    use serde_json::Value;

    if raw_value.is_empty() {
        Value::Null
    } else if raw_value.starts_with('[') && raw_value.ends_with(']') {
        let inner = &raw_value[1..raw_value.len() - 1];
        let items: Vec<Value> = inner
            .split(',')
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(|s| Value::String(s.to_string()))
            .collect();
        Value::Array(items)
    } else if raw_value == "true" {
        Value::Bool(true)
    } else if raw_value == "false" {
        Value::Bool(false)
    } else if let Ok(n) = raw_value.parse::<i64>() {
        Value::Number(n.into())
    } else {
        Value::String(raw_value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_name_from_path() {
        assert_eq!(extract_name_from_path("/skills/my-skill.md"), "my-skill");
        assert_eq!(
            extract_name_from_path("/skills/web-search/SKILL.md"),
            "web-search"
        );
    }

    #[test]
    fn test_skill_name_validation() {
        assert!(is_valid_skill_name("web-search"));
        assert!(is_valid_skill_name("tool_2"));
        assert!(!is_valid_skill_name("Web Search"));
        assert!(!is_valid_skill_name("UPPER"));
        assert!(!is_valid_skill_name(""));
    }

    #[test]
    fn test_parse_yaml_frontmatter_basic() {
        let raw = "---\nname: test\ndescription: A test skill\nauto-activate: true\n---\n\nBody";
        let fm = parse_yaml_frontmatter(raw).unwrap();
        assert_eq!(fm.name.unwrap(), "test");
        assert_eq!(fm.description.unwrap(), "A test skill");
        assert!(fm.auto_activate);
    }

    #[test]
    fn test_parse_requires_block() {
        let raw = "---\nname: deploy\nrequires:\n  bins: [git, curl]\n  env: [DEPLOY_KEY]\n---\n\nDeploy things.\n";
        let skill = parse_skill_md(raw, "/skills/deploy.md", SkillSource::Disk).unwrap();
        let requires = skill.requires.unwrap();
        assert_eq!(
            requires.bins.unwrap(),
            vec!["git".to_string(), "curl".to_string()]
        );
        assert_eq!(requires.env.unwrap(), vec!["DEPLOY_KEY".to_string()]);
    }

    #[test]
    fn test_parse_skill_md_full() {
        let content = "---\nname: example\ndescription: Example skill\n---\n\nDo the thing.\n";
        let skill = parse_skill_md(content, "/skills/example.md", SkillSource::Disk).unwrap();
        assert_eq!(skill.name, "example");
        assert_eq!(skill.instructions, "Do the thing.\n");
    }

    #[test]
    fn test_parse_skill_md_no_frontmatter() {
        let content = "Just some markdown without frontmatter.";
        assert!(parse_skill_md(content, "test.md", SkillSource::Disk).is_none());
    }

    #[test]
    fn test_invalid_name_rejected() {
        let content = "---\nname: Bad Name\n---\n\nBody\n";
        assert!(parse_skill_md(content, "bad.md", SkillSource::Disk).is_none());
    }

    #[test]
    fn test_round_trip_preserves_fields_and_body() {
        let content = "---\nname: roundtrip\ndescription: Round trip skill\nauto-activate: false\nrequires:\n  bins: [jq]\n---\n\nUse jq to slice JSON.\n";
        let skill = parse_skill_md(content, "/skills/roundtrip.md", SkillSource::Disk).unwrap();
        let serialized = serialize_skill_md(&skill);
        let reparsed =
            parse_skill_md(&serialized, "/skills/roundtrip.md", SkillSource::Disk).unwrap();

        assert_eq!(reparsed.name, skill.name);
        assert_eq!(reparsed.description, skill.description);
        assert_eq!(reparsed.auto_activate, skill.auto_activate);
        assert_eq!(reparsed.requires, skill.requires);
        assert_eq!(
            reparsed.instructions.trim_end(),
            skill.instructions.trim_end()
        );
    }
}
