//! Skill Loader
//!
//! Discovers skill files on disk, checks prerequisites, and builds the
//! active instruction set for the agent's system prompt. Skills whose
//! requirements are unsatisfied are loaded but left disabled.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::skills::format::{parse_skill_md, serialize_skill_md};
use crate::state::Database;
use crate::types::{Skill, SkillSource};

/// Scan `skills_dir` for skill files and return all parsed skills, with
/// the enabled flag resolved against requirements and any persisted
/// disable. Both flat `<name>.md` files and `<name>/SKILL.md`
/// directories are recognized.
///
/// Every discovered skill is upserted so the enabled flag survives
/// reloads.
pub fn load_skills(skills_dir: &str, db: &Database) -> Vec<Skill> {
    let dir = Path::new(skills_dir);
    if !dir.is_dir() {
        return Vec::new();
    }

    let mut skills: Vec<Skill> = Vec::new();

    let entries = match fs::read_dir(dir) {
        Ok(e) => e,
        Err(_) => return Vec::new(),
    };

    for entry in entries.flatten() {
        let path = entry.path();

        let skill_file: Option<PathBuf> = if path.is_dir() {
            let candidate = path.join("SKILL.md");
            candidate.is_file().then_some(candidate)
        } else if path.extension().and_then(|e| e.to_str()) == Some("md") {
            Some(path)
        } else {
            None
        };

        let Some(skill_file) = skill_file else {
            continue;
        };

        let content = match fs::read_to_string(&skill_file) {
            Ok(c) => c,
            Err(_) => continue,
        };

        let file_path = skill_file.to_string_lossy().to_string();

        if let Some(mut skill) = parse_skill_md(&content, &file_path, SkillSource::Disk) {
            let requirements_met = check_requirements(&skill);
            let persisted_enabled = persisted_enabled(db, &skill.name);

            // Unsatisfied requirements force the skill off; otherwise the
            // stored flag wins so disables survive reloads.
            skill.enabled = requirements_met && persisted_enabled;

            if !requirements_met {
                debug!("Skill '{}' loaded but disabled: requirements unmet", skill.name);
            }

            let _ = db.upsert_skill(&skill);
            skills.push(skill);
        }
    }

    skills
}

/// The stored enabled flag, defaulting to enabled when the skill has no
/// database record yet.
fn persisted_enabled(db: &Database, name: &str) -> bool {
    match db.get_skill_by_name(name) {
        Ok(Some(skill)) => skill.enabled,
        _ => true,
    }
}

/// Check whether all external requirements declared by a skill are
/// satisfied: every listed binary resolvable on PATH, every listed
/// environment variable set.
pub fn check_requirements(skill: &Skill) -> bool {
    let requires = match &skill.requires {
        Some(r) => r,
        None => return true,
    };

    if let Some(bins) = &requires.bins {
        for bin in bins {
            if !binary_on_path(bin) {
                return false;
            }
        }
    }

    if let Some(env_vars) = &requires.env {
        for var in env_vars {
            if std::env::var(var).is_err() {
                return false;
            }
        }
    }

    true
}

/// Resolve a binary name against PATH.
fn binary_on_path(bin: &str) -> bool {
    let Some(path_var) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&path_var).any(|dir| dir.join(bin).is_file())
}

/// Build a combined instruction string from all enabled auto-activating
/// skills, suitable for injection into the system prompt.
pub fn get_active_skill_instructions(skills: &[Skill]) -> String {
    let mut sections: Vec<String> = Vec::new();

    for skill in skills {
        if !skill.enabled || !skill.auto_activate {
            continue;
        }

        let header = format!("## Skill: {}", skill.name);
        let body = skill.instructions.trim();

        if !body.is_empty() {
            sections.push(format!("{}\n\n{}", header, body));
        }
    }

    if sections.is_empty() {
        String::new()
    } else {
        sections.join("\n\n---\n\n")
    }
}

/// Persist a self-authored skill to disk and the database.
pub fn save_skill(skill: &Skill, skills_dir: &str, db: &Database) -> anyhow::Result<()> {
    let dir = Path::new(skills_dir);
    fs::create_dir_all(dir)?;

    let path = dir.join(format!("{}.md", skill.name));
    fs::write(&path, serialize_skill_md(skill))?;

    let mut stored = skill.clone();
    stored.path = path.to_string_lossy().to_string();
    db.upsert_skill(&stored)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SkillRequirements;
    use chrono::Utc;

    fn skill(name: &str, requires: Option<SkillRequirements>) -> Skill {
        Skill {
            name: name.to_string(),
            description: String::new(),
            auto_activate: true,
            requires,
            instructions: "Do things.".to_string(),
            source: SkillSource::Disk,
            path: format!("/skills/{name}.md"),
            enabled: true,
            installed_at: Utc::now().to_rfc3339(),
        }
    }

    #[test]
    fn no_requirements_is_satisfied() {
        assert!(check_requirements(&skill("simple", None)));
    }

    #[test]
    fn missing_binary_fails_requirements() {
        let s = skill(
            "needs-bin",
            Some(SkillRequirements {
                bins: Some(vec!["definitely-not-a-real-binary-xyz".to_string()]),
                env: None,
            }),
        );
        assert!(!check_requirements(&s));
    }

    #[test]
    fn missing_env_var_fails_requirements() {
        let s = skill(
            "needs-env",
            Some(SkillRequirements {
                bins: None,
                env: Some(vec!["AUTOMATON_TEST_UNSET_VAR_12345".to_string()]),
            }),
        );
        assert!(!check_requirements(&s));
    }

    #[test]
    fn loads_flat_and_directory_layouts() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("flat.md"),
            "---\nname: flat\n---\n\nFlat skill.\n",
        )
        .unwrap();
        fs::create_dir(dir.path().join("nested")).unwrap();
        fs::write(
            dir.path().join("nested").join("SKILL.md"),
            "---\nname: nested\n---\n\nNested skill.\n",
        )
        .unwrap();

        let db = Database::open_in_memory().unwrap();
        let mut skills = load_skills(&dir.path().to_string_lossy(), &db);
        skills.sort_by(|a, b| a.name.cmp(&b.name));

        assert_eq!(skills.len(), 2);
        assert_eq!(skills[0].name, "flat");
        assert_eq!(skills[1].name, "nested");
    }

    #[test]
    fn unsatisfied_requires_loads_disabled() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("gated.md"),
            "---\nname: gated\nrequires:\n  bins: [definitely-not-a-real-binary-xyz]\n---\n\nGated.\n",
        )
        .unwrap();

        let db = Database::open_in_memory().unwrap();
        let skills = load_skills(&dir.path().to_string_lossy(), &db);

        assert_eq!(skills.len(), 1);
        assert!(!skills[0].enabled);
        // The disabled state is persisted.
        assert!(!db.get_skill_by_name("gated").unwrap().unwrap().enabled);
    }

    #[test]
    fn disabled_flag_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("togglable.md"),
            "---\nname: togglable\n---\n\nBody.\n",
        )
        .unwrap();

        let db = Database::open_in_memory().unwrap();
        let skills = load_skills(&dir.path().to_string_lossy(), &db);
        assert!(skills[0].enabled);

        db.set_skill_enabled("togglable", false).unwrap();
        let skills = load_skills(&dir.path().to_string_lossy(), &db);
        assert!(!skills[0].enabled);
    }

    #[test]
    fn only_enabled_auto_activating_skills_inject() {
        let mut on = skill("on", None);
        on.instructions = "Active instructions.".to_string();
        let mut off = skill("off", None);
        off.enabled = false;
        let mut manual = skill("manual", None);
        manual.auto_activate = false;

        let combined = get_active_skill_instructions(&[on, off, manual]);
        assert!(combined.contains("## Skill: on"));
        assert!(!combined.contains("## Skill: off"));
        assert!(!combined.contains("## Skill: manual"));
    }
}
