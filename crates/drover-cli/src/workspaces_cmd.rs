//! `drover workspaces` commands: inspect and prune agent checkouts.

use std::path::Path;

use anyhow::{Context, Result};

use drover_core::workspace::WorkspaceAllocator;

/// Run `drover workspaces list`.
pub fn run_list(repo: &Path) -> Result<()> {
    let allocator = WorkspaceAllocator::new(repo, None)
        .with_context(|| format!("{} is not a git repository", repo.display()))?;
    let checkouts = allocator.list_allocated()?;

    println!("Checkouts of {}:", repo.display());
    for checkout in &checkouts {
        let branch = checkout.branch.as_deref().unwrap_or(if checkout.detached {
            "<detached>"
        } else {
            "<none>"
        });
        let head = &checkout.head[..checkout.head.len().min(12)];
        let prunable = if checkout.prunable { "  (prunable)" } else { "" };
        println!("  {}  {branch}  {head}{prunable}", checkout.path.display());
    }
    println!("{} checkout(s).", checkouts.len());
    Ok(())
}

/// Run `drover workspaces prune`.
pub fn run_prune(repo: &Path) -> Result<()> {
    let allocator = WorkspaceAllocator::new(repo, None)
        .with_context(|| format!("{} is not a git repository", repo.display()))?;

    let before = allocator.list_allocated()?;
    let stale = before.iter().filter(|c| c.prunable).count();

    allocator.prune_orphaned()?;

    println!("Pruned {stale} orphaned checkout(s).");
    Ok(())
}
