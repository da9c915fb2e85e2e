//! Skills Module
//!
//! Markdown-based skill definitions that extend the automaton's
//! capabilities. Skills are loaded from disk, parsed from YAML
//! frontmatter + Markdown body, and injected into the system prompt
//! when enabled and auto-activating.

pub mod format;
pub mod loader;

pub use format::{is_valid_skill_name, parse_skill_md, serialize_skill_md, SkillFrontmatter};
pub use loader::{check_requirements, get_active_skill_instructions, load_skills, save_skill};
