//! `drover roster` commands: validate and show roster files.

use std::path::Path;

use anyhow::{Context, Result};

use drover_core::roster::RosterToml;

/// Run `drover roster validate`.
pub fn run_validate(path: &Path) -> Result<()> {
    let roster = RosterToml::load(path)
        .with_context(|| format!("failed to load roster {}", path.display()))?;
    roster.validate().context("roster validation failed")?;

    println!("Roster OK: {}", roster.roster.name);
    println!("  Roles: {}", roster.roles.len());
    println!("  Tasks: {}", roster.tasks.len());
    Ok(())
}

/// Run `drover roster show`.
pub fn run_show(path: &Path) -> Result<()> {
    let roster = RosterToml::load(path)
        .with_context(|| format!("failed to load roster {}", path.display()))?;

    println!("Roster: {}", roster.roster.name);
    if let Some(repo) = &roster.roster.repo {
        println!("Repository: {}", repo.display());
    }
    println!();

    println!("Roles:");
    for entry in &roster.roles {
        let role = &entry.role;
        let singleton = if role.singleton { " (singleton)" } else { "" };
        println!("  {} [{}]{singleton}", role.id, role.kind);
        if !role.description.is_empty() {
            println!("      {}", role.description);
        }
        let capabilities = role.enabled_capabilities();
        if !capabilities.is_empty() {
            println!("      capabilities: {}", capabilities.join(", "));
        }
    }
    println!();

    println!("Tasks:");
    for task in &roster.tasks {
        println!("  {} [{}] {:?}", task.name, task.kind, task.priority);
        if !task.depends_on.is_empty() {
            println!("      depends on: {}", task.depends_on.join(", "));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROSTER: &str = r#"
[roster]
name = "Smoke"

[[roles]]
id = "builder"
name = "Builder"
kind = "worker"
base_prompt = "You build."

[[tasks]]
name = "a"
kind = "worker"
description = "do a thing"
"#;

    #[test]
    fn validate_and_show_accept_a_valid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("roster.toml");
        std::fs::write(&path, ROSTER).unwrap();

        run_validate(&path).expect("validate should pass");
        run_show(&path).expect("show should pass");
    }

    #[test]
    fn validate_rejects_broken_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("roster.toml");
        std::fs::write(
            &path,
            ROSTER.replace("kind = \"worker\"\ndescription", "kind = \"ghost\"\ndescription"),
        )
        .unwrap();

        assert!(run_validate(&path).is_err());
    }

    #[test]
    fn validate_rejects_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(run_validate(&dir.path().join("nope.toml")).is_err());
    }
}
