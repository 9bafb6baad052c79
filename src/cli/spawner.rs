//! Interactive spawner picker.
//!
//! Walks the operator through selecting an availability zone, domain,
//! project, flavor, image, and hypervisor, and prints the result as
//! `export` lines. The previous selection is remembered per environment
//! variable in a JSON file and offered as the default next time. A
//! cancelled prompt exits non-zero.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use dialoguer::theme::ColorfulTheme;
use dialoguer::Select;
use serde_json::json;

/// Arguments for the spawner command.
#[derive(clap::Parser, Debug)]
pub struct SpawnerArgs {
    /// JSON file remembering the last selection per environment variable.
    #[arg(long)]
    pub memory_file: Option<PathBuf>,

    /// JSON file with candidate values per environment variable,
    /// overriding the built-in lists.
    #[arg(long)]
    pub candidates_file: Option<PathBuf>,
}

/// The picker dimensions: prompt label, environment variable, fallback
/// candidates when no candidates file provides better ones.
const DIMENSIONS: [(&str, &str, &[&str]); 6] = [
    (
        "Availability zone",
        "OS_AVAILABILITY_ZONE",
        &["az-a", "az-b", "az-c"],
    ),
    ("Domain", "OS_PROJECT_DOMAIN_NAME", &["Default"]),
    ("Project", "OS_PROJECT_NAME", &["cloud-admin", "cloud-dev"]),
    (
        "Flavor",
        "OS_FLAVOR",
        &["m1.small", "m1.medium", "m1.large", "m1.xlarge"],
    ),
    (
        "Image",
        "OS_IMAGE",
        &["ubuntu-24.04", "debian-12", "gardenlinux"],
    ),
    ("Hypervisor", "OS_HYPERVISOR", &["qemu", "ch", "vmware"]),
];

/// Runs the picker.
///
/// # Errors
///
/// Returns an error (and thereby a non-zero exit) when a prompt is
/// cancelled or the memory file cannot be written.
pub fn run(args: SpawnerArgs) -> anyhow::Result<()> {
    let memory_path = args.memory_file.unwrap_or_else(default_memory_path);
    let mut memory = load_memory(&memory_path);
    let candidates = match &args.candidates_file {
        Some(path) => load_candidates(path)?,
        None => HashMap::new(),
    };

    let theme = ColorfulTheme::default();
    let mut selected = Vec::with_capacity(DIMENSIONS.len());

    for (label, envvar, fallback) in DIMENSIONS {
        let items: Vec<String> = candidates
            .get(envvar)
            .cloned()
            .unwrap_or_else(|| fallback.iter().map(|s| s.to_string()).collect());
        let default = default_index(&items, memory.get(envvar));

        let choice = Select::with_theme(&theme)
            .with_prompt(label)
            .items(&items)
            .default(default)
            .interact_opt()
            .context("reading selection")?;

        let Some(choice) = choice else {
            anyhow::bail!("selection cancelled");
        };

        let value = items[choice].clone();
        memory.insert(envvar.to_string(), value.clone());
        selected.push((envvar, value));
    }

    save_memory(&memory_path, &memory)?;

    for (envvar, value) in selected {
        println!("export {}={}", envvar, value);
    }

    Ok(())
}

fn default_memory_path() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".cortex_spawner.json")
}

/// Index of the remembered value among the candidates, or 0.
fn default_index(items: &[String], remembered: Option<&String>) -> usize {
    remembered
        .and_then(|value| items.iter().position(|item| item == value))
        .unwrap_or(0)
}

/// Loads the selection memory; a missing or unreadable file is an empty
/// memory.
fn load_memory(path: &Path) -> HashMap<String, String> {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|raw| serde_json::from_str(&raw).ok())
        .unwrap_or_default()
}

fn save_memory(path: &Path, memory: &HashMap<String, String>) -> anyhow::Result<()> {
    let raw = serde_json::to_string_pretty(&json!(memory))?;
    std::fs::write(path, raw).with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

/// Loads per-envvar candidate lists from a JSON file.
fn load_candidates(path: &Path) -> anyhow::Result<HashMap<String, Vec<String>>> {
    let raw =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let candidates =
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
    Ok(candidates)
}
