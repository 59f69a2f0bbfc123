//! Finds conflicting Python package requirements across custom nodes.
//!
//! Input is a precomputed JSON document mapping every node to its
//! requirements, `{"all_nodes": {node: {package: spec}}, "all_packages": [..]}`.
//! Specs are compared as trimmed strings; `""` and `"any"` place no
//! constraint on a package and never conflict.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    path::{Path, PathBuf},
};

use anyhow::Context;
use clap::Parser;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DefaultOnNull};

/// Prints version conflicts between custom node requirements.
#[derive(Parser, Debug)]
pub struct AuditOpts {
    /// JSON file with the parsed requirements of every node
    deps: PathBuf,

    /// Also write the report as JSON to this file
    #[arg(short, long, value_name = "FILE")]
    output: Option<PathBuf>,
}

/// Packages every install has anyway; sharing them is not redundancy.
const BASE_PACKAGES: &[&str] = &["torch", "torchvision", "numpy", "scipy"];

/// Distributions of the same module that cannot be installed together.
const OPENCV_VARIANTS: &[&str] = &[
    "opencv-python",
    "opencv-python-headless",
    "opencv-contrib-python",
    "opencv-contrib-python-headless",
];

/// Nodes requiring a package before it counts as redundant.
const REDUNDANCY_THRESHOLD: usize = 3;

#[serde_as]
#[derive(Deserialize, Debug, Default)]
pub struct Requirements {
    #[serde_as(as = "BTreeMap<_, BTreeMap<_, DefaultOnNull>>")]
    pub all_nodes: BTreeMap<String, BTreeMap<String, String>>,
    #[serde(default)]
    pub all_packages: Vec<String>,
}

impl Requirements {
    pub fn from_path(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("Failed to parse {}", path.display()))
    }

    /// Every package mentioned, from `all_packages` and from the nodes,
    /// by normalized name.
    fn packages(&self) -> BTreeSet<String> {
        self.all_packages
            .iter()
            .chain(self.all_nodes.values().flat_map(|reqs| reqs.keys()))
            .map(|package| normalize(package))
            .collect()
    }

    /// Every `(node, spec)` requiring `package`, under any spelling of it.
    fn occurrences(&self, package: &str) -> Vec<Requirement> {
        self.all_nodes
            .iter()
            .filter_map(|(node, reqs)| {
                reqs.iter()
                    .find(|(name, _)| normalize(name) == package)
                    .map(|(_, spec)| Requirement {
                        node: node.clone(),
                        spec: spec.trim().to_owned(),
                    })
            })
            .collect()
    }

    pub fn analyze(&self) -> AuditReport {
        let mut report = AuditReport::default();
        let mut variants = vec![];

        for package in self.packages() {
            let occurrences = self.occurrences(&package);
            if occurrences.is_empty() {
                continue;
            }
            if OPENCV_VARIANTS.contains(&package.as_str()) {
                variants.push((package.clone(), occurrences.clone()));
            }
            if occurrences.len() < 2 {
                continue;
            }

            let constrained: BTreeSet<&str> = occurrences
                .iter()
                .map(|req| req.spec.as_str())
                .filter(|spec| is_constrained(spec))
                .collect();
            if constrained.len() > 1 {
                report.version_conflicts.push(VersionConflict {
                    package: package.clone(),
                    severity: severity(&constrained),
                    requirements: occurrences.clone(),
                });
            }

            if occurrences.len() >= REDUNDANCY_THRESHOLD
                && !BASE_PACKAGES.contains(&package.as_str())
            {
                report.redundant.push(Redundant {
                    package: package.clone(),
                    nodes: occurrences.iter().map(|req| req.node.clone()).collect(),
                });
            }
            report.duplicates.insert(package, occurrences);
        }

        if variants.len() > 1 {
            report.variant_conflicts.push(VariantConflict {
                severity: Severity::High,
                packages: variants.into_iter().collect(),
            });
        }
        report
    }
}

fn normalize(package: &str) -> String {
    package.trim().to_lowercase().replace('_', "-")
}

fn is_constrained(spec: &str) -> bool {
    !spec.is_empty() && !spec.eq_ignore_ascii_case("any")
}

fn severity(specs: &BTreeSet<&str>) -> Severity {
    if specs.iter().any(|spec| spec.contains("==")) {
        Severity::High
    } else if specs.iter().any(|spec| spec.contains('<') || spec.contains("~=")) {
        Severity::Medium
    } else {
        Severity::Low
    }
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
        })
    }
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct Requirement {
    pub node: String,
    pub spec: String,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct VersionConflict {
    pub package: String,
    pub severity: Severity,
    pub requirements: Vec<Requirement>,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct VariantConflict {
    pub severity: Severity,
    /// Each variant present, with the nodes requiring it.
    pub packages: BTreeMap<String, Vec<Requirement>>,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct Redundant {
    pub package: String,
    pub nodes: Vec<String>,
}

#[derive(Serialize, Debug, Default, Clone, PartialEq)]
pub struct AuditReport {
    /// Packages required by more than one node.
    pub duplicates: BTreeMap<String, Vec<Requirement>>,
    pub version_conflicts: Vec<VersionConflict>,
    pub variant_conflicts: Vec<VariantConflict>,
    pub redundant: Vec<Redundant>,
}

fn display_spec(spec: &str) -> &str {
    if is_constrained(spec) {
        spec
    } else {
        "any"
    }
}

impl fmt::Display for AuditReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Version conflicts: {}", self.version_conflicts.len())?;
        for conflict in &self.version_conflicts {
            writeln!(f, "  {} [{}]", conflict.package, conflict.severity)?;
            for req in &conflict.requirements {
                writeln!(f, "    - {}: {}", req.node, display_spec(&req.spec))?;
            }
        }

        writeln!(f, "Variant conflicts: {}", self.variant_conflicts.len())?;
        for conflict in &self.variant_conflicts {
            let names: Vec<&str> = conflict.packages.keys().map(String::as_str).collect();
            writeln!(f, "  {} [{}]", names.join(" / "), conflict.severity)?;
            for (package, reqs) in &conflict.packages {
                let nodes: Vec<&str> = reqs.iter().map(|req| req.node.as_str()).collect();
                writeln!(f, "    - {}: {}", package, nodes.join(", "))?;
            }
        }

        writeln!(
            f,
            "Redundant packages ({}+ nodes): {}",
            REDUNDANCY_THRESHOLD,
            self.redundant.len()
        )?;
        for redundant in &self.redundant {
            writeln!(
                f,
                "  {}: installed by {} nodes",
                redundant.package,
                redundant.nodes.len()
            )?;
        }
        write!(f, "Packages required by several nodes: {}", self.duplicates.len())
    }
}

pub fn exec(opts: AuditOpts) -> anyhow::Result<()> {
    let report = Requirements::from_path(&opts.deps)?.analyze();
    println!("{}", report);
    if let Some(path) = &opts.output {
        let json = serde_json::to_string_pretty(&report)?;
        std::fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))?;
        println!("Report written to {}", path.display());
    }
    Ok(())
}
