//! Validation of user supplied scheduler directives (`#SBATCH` / `#PBS` options).
//!
//! Options that the resource manager derives itself (node counts, partitions,
//! GPU requests, output files) must not be overridden by pool or task directives.

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DirectiveError {
    #[error("scheduler option '{0}' is malformed, options must start with '-'")]
    Malformed(String),
    #[error("scheduler option '{option}' in '{directive}' is controlled by the resource manager")]
    Forbidden { option: String, directive: String },
}

impl DirectiveError {
    pub fn directive(&self) -> &str {
        match self {
            DirectiveError::Malformed(directive) => directive,
            DirectiveError::Forbidden { directive, .. } => directive,
        }
    }
}

const SLURM_FORBIDDEN: &[&str] = &[
    "--ntasks-per-node",
    "--gpus",
    "-G",
    "--gres",
    "--nodes",
    "-N",
    "--partition",
    "-p",
    "--output",
    "-o",
    "--error",
    "-e",
    "--chdir",
    "-D",
    "--gpus-per-task",
    "--cpus-per-gpu",
];

const PBS_FORBIDDEN: &[&str] = &["-q", "-o", "-e"];
const PBS_FORBIDDEN_RESOURCES: &[&str] = &["select", "place"];

/// Extracts the option name from a directive, e.g. `--nodes=2` -> `--nodes`, `-N2` -> `-N`.
fn option_name(directive: &str) -> Option<&str> {
    let directive = directive.trim();
    if directive.starts_with("--") {
        let end = directive
            .find(|c: char| c == '=' || c.is_whitespace())
            .unwrap_or(directive.len());
        Some(&directive[..end])
    } else if directive.starts_with('-') && directive.len() >= 2 {
        directive.get(..2)
    } else {
        None
    }
}

pub fn validate_slurm_directives(directives: &[String]) -> Vec<DirectiveError> {
    directives
        .iter()
        .filter_map(|directive| match option_name(directive) {
            None => Some(DirectiveError::Malformed(directive.clone())),
            Some(option) if SLURM_FORBIDDEN.contains(&option) => {
                Some(DirectiveError::Forbidden {
                    option: option.to_string(),
                    directive: directive.clone(),
                })
            }
            Some(_) => None,
        })
        .collect()
}

pub fn validate_pbs_directives(directives: &[String]) -> Vec<DirectiveError> {
    directives
        .iter()
        .filter_map(|directive| {
            let option = match option_name(directive) {
                Some(option) => option,
                None => return Some(DirectiveError::Malformed(directive.clone())),
            };
            if PBS_FORBIDDEN.contains(&option) {
                return Some(DirectiveError::Forbidden {
                    option: option.to_string(),
                    directive: directive.clone(),
                });
            }
            if option == "-l" {
                let resources = directive.trim()[2..].trim_start();
                if let Some(resource) = PBS_FORBIDDEN_RESOURCES
                    .iter()
                    .find(|r| resources.starts_with(**r))
                {
                    return Some(DirectiveError::Forbidden {
                        option: format!("-l {resource}"),
                        directive: directive.clone(),
                    });
                }
            }
            None
        })
        .collect()
}
