use std::collections::{HashMap, HashSet, VecDeque};

use anyhow::{Context, Result};
use cargo_metadata::{MetadataCommand, PackageId};

/// Crates that decide what may run. They stay free of IO so every decision
/// is reproducible from its inputs.
const PURE_PACKAGES: &[&str] = &["vba-catalog", "vba-compiler", "vba-contracts", "vba-policy"];
const FORBIDDEN_IO_DEPENDENCIES: &[&str] = &[
    "axum",
    "reqwest",
    "sqlx",
    "tokio",
    "vba-gateway",
    "vba-ledger",
];

fn main() -> Result<()> {
    let metadata = MetadataCommand::new()
        .exec()
        .context("failed to run `cargo metadata`")?;

    let resolve = metadata
        .resolve
        .as_ref()
        .context("`cargo metadata` did not include a resolved dependency graph")?;

    let id_to_name: HashMap<_, _> = metadata
        .packages
        .iter()
        .map(|p| (p.id.clone(), p.name.as_str()))
        .collect();

    let adjacency: HashMap<_, _> = resolve
        .nodes
        .iter()
        .map(|node| {
            let deps: Vec<_> = node.deps.iter().map(|dep| dep.pkg.clone()).collect();
            (node.id.clone(), deps)
        })
        .collect();

    let mut failed = false;
    for package_name in PURE_PACKAGES {
        let package = metadata
            .packages
            .iter()
            .find(|p| p.name.as_str() == *package_name)
            .with_context(|| format!("package `{}` not found in workspace", package_name))?;

        let violations = forbidden_reachable(&package.id, &adjacency, &id_to_name);
        if violations.is_empty() {
            println!(
                "OK: `{}` has no dependency edge to {}",
                package_name,
                FORBIDDEN_IO_DEPENDENCIES.join(", ")
            );
        } else {
            eprintln!(
                "FAIL: `{}` depends on forbidden crate(s): {}",
                package_name,
                violations.join(", ")
            );
            failed = true;
        }
    }

    if failed {
        std::process::exit(1);
    }

    Ok(())
}

fn forbidden_reachable(
    root: &PackageId,
    adjacency: &HashMap<PackageId, Vec<PackageId>>,
    id_to_name: &HashMap<PackageId, &str>,
) -> Vec<String> {
    let mut visited = HashSet::new();
    let mut queue = VecDeque::new();
    queue.push_back(root.clone());
    visited.insert(root.clone());

    let mut violations = Vec::new();

    while let Some(current) = queue.pop_front() {
        let Some(deps) = adjacency.get(&current) else {
            continue;
        };

        for dep in deps.iter().cloned() {
            if !visited.insert(dep.clone()) {
                continue;
            }

            if let Some(name) = id_to_name.get(&dep)
                && FORBIDDEN_IO_DEPENDENCIES.contains(name)
            {
                violations.push((*name).to_string());
            }

            queue.push_back(dep);
        }
    }

    violations.sort();
    violations.dedup();
    violations
}
