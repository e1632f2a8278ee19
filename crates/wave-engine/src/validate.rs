//! Load-time pipeline validation.
//!
//! Everything that can be rejected before the first workspace is created is
//! rejected here: unknown dependencies, cycles, unresolvable personas and
//! adapters, dangling artifact injections, unparseable permission patterns
//! and unresolved prompt placeholders.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::LazyLock;

use regex::Regex;
use wave_adapter::{Adapter, UnknownAdapter};
use wave_core::types::{Manifest, Step};
use wave_permission::{PatternError, PermissionPolicy};

static PLACEHOLDER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*([a-zA-Z_:][a-zA-Z0-9_\-:.]*)\s*\}\}").unwrap());

#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("pipeline declares no steps")]
    Empty,

    #[error("duplicate step id '{0}'")]
    DuplicateStepId(String),

    #[error("step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency { step: String, dependency: String },

    #[error("dependency cycle involving steps {0:?}")]
    Cycle(Vec<String>),

    #[error("step '{step}' references unknown persona '{persona}'")]
    UnknownPersona { step: String, persona: String },

    #[error("persona '{persona}': {source}")]
    UnknownAdapterForPersona {
        persona: String,
        #[source]
        source: UnknownAdapter,
    },

    #[error(
        "step '{step}' injects artifact '{artifact}' from '{from_step}', \
         which does not declare it as an output"
    )]
    UnknownInjectedArtifact {
        step: String,
        from_step: String,
        artifact: String,
    },

    #[error("step '{step}' injects from '{from_step}' without depending on it")]
    InjectionWithoutDependency { step: String, from_step: String },

    #[error("step '{step}' prompt references unresolved placeholder '{{{{{placeholder}}}}}'")]
    UnresolvedPlaceholder { step: String, placeholder: String },

    #[error("persona '{persona}': {source}")]
    InvalidToolPattern {
        persona: String,
        #[source]
        source: PatternError,
    },
}

/// A pipeline that passed load-time validation, with its execution order
/// and resolved per-persona adapters and policies.
#[derive(Debug)]
pub struct ValidatedPipeline {
    pub manifest: Manifest,

    /// Topological order; ties broken by declaration order, so dispatch is
    /// deterministic.
    pub order: Vec<String>,

    /// Persona name → resolved adapter.
    pub adapters: HashMap<String, Adapter>,

    /// Persona name → parsed permission policy.
    pub policies: HashMap<String, PermissionPolicy>,
}

impl ValidatedPipeline {
    /// Rank of a step in the dispatch order.
    pub fn rank(&self, step_id: &str) -> usize {
        self.order
            .iter()
            .position(|s| s == step_id)
            .unwrap_or(usize::MAX)
    }
}

/// Validate a manifest into an executable pipeline.
pub fn validate(manifest: Manifest) -> Result<ValidatedPipeline, ValidationError> {
    let steps = &manifest.pipeline.steps;
    if steps.is_empty() {
        return Err(ValidationError::Empty);
    }

    let mut seen: HashSet<&str> = HashSet::new();
    for step in steps {
        if !seen.insert(step.step_id.as_str()) {
            return Err(ValidationError::DuplicateStepId(step.step_id.clone()));
        }
    }

    for step in steps {
        for dependency in &step.depends_on {
            if !seen.contains(dependency.as_str()) {
                return Err(ValidationError::UnknownDependency {
                    step: step.step_id.clone(),
                    dependency: dependency.clone(),
                });
            }
        }
    }

    let order = topo_order(steps)?;

    let personas = manifest.personas_by_name();
    let mut adapters = HashMap::new();
    let mut policies = HashMap::new();
    for step in steps {
        let Some(persona) = personas.get(step.persona.as_str()) else {
            return Err(ValidationError::UnknownPersona {
                step: step.step_id.clone(),
                persona: step.persona.clone(),
            });
        };
        if adapters.contains_key(&persona.name) {
            continue;
        }
        let adapter = Adapter::from_identifier(&persona.adapter).map_err(|source| {
            ValidationError::UnknownAdapterForPersona {
                persona: persona.name.clone(),
                source,
            }
        })?;
        let policy = PermissionPolicy::parse(&persona.allowed_tools, &persona.denied_tools)
            .map_err(|source| ValidationError::InvalidToolPattern {
                persona: persona.name.clone(),
                source,
            })?;
        adapters.insert(persona.name.clone(), adapter);
        policies.insert(persona.name.clone(), policy);
    }

    validate_injections(&manifest)?;
    validate_placeholders(&manifest)?;

    Ok(ValidatedPipeline {
        manifest,
        order,
        adapters,
        policies,
    })
}

/// Kahn's algorithm with in-degree counting. Ready candidates are taken in
/// declaration order, which both detects cycles and fixes the dispatch
/// order.
fn topo_order(steps: &[Step]) -> Result<Vec<String>, ValidationError> {
    let index: HashMap<&str, usize> = steps
        .iter()
        .enumerate()
        .map(|(i, s)| (s.step_id.as_str(), i))
        .collect();

    let mut in_degree = vec![0usize; steps.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); steps.len()];
    for (i, step) in steps.iter().enumerate() {
        for dependency in &step.depends_on {
            let d = index[dependency.as_str()];
            in_degree[i] += 1;
            dependents[d].push(i);
        }
    }

    let mut queue: VecDeque<usize> = (0..steps.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(steps.len());
    while let Some(i) = queue.pop_front() {
        order.push(steps[i].step_id.clone());
        // Collect newly-ready dependents, then enqueue in declaration order.
        let mut ready: Vec<usize> = Vec::new();
        for &dependent in &dependents[i] {
            in_degree[dependent] -= 1;
            if in_degree[dependent] == 0 {
                ready.push(dependent);
            }
        }
        ready.sort_unstable();
        queue.extend(ready);
    }

    if order.len() < steps.len() {
        let ordered: HashSet<&str> = order.iter().map(String::as_str).collect();
        let cyclic: Vec<String> = steps
            .iter()
            .map(|s| s.step_id.clone())
            .filter(|id| !ordered.contains(id.as_str()))
            .collect();
        return Err(ValidationError::Cycle(cyclic));
    }
    Ok(order)
}

/// Every injected reference must point at a declared output of a declared
/// dependency.
fn validate_injections(manifest: &Manifest) -> Result<(), ValidationError> {
    for step in &manifest.pipeline.steps {
        for injection in &step.inject {
            if !step.depends_on.contains(&injection.from_step) {
                return Err(ValidationError::InjectionWithoutDependency {
                    step: step.step_id.clone(),
                    from_step: injection.from_step.clone(),
                });
            }
            let producer = manifest
                .pipeline
                .step(&injection.from_step)
                .expect("dependency existence already validated");
            if !producer.outputs.iter().any(|o| o.name == injection.artifact) {
                return Err(ValidationError::UnknownInjectedArtifact {
                    step: step.step_id.clone(),
                    from_step: injection.from_step.clone(),
                    artifact: injection.artifact.clone(),
                });
            }
        }
    }
    Ok(())
}

/// Prompt templates may reference `{{input}}` and `{{artifact:<as>}}` for
/// artifacts injected into the same step.
fn validate_placeholders(manifest: &Manifest) -> Result<(), ValidationError> {
    for step in &manifest.pipeline.steps {
        let injected: HashSet<&str> = step.inject.iter().map(|i| i.as_name.as_str()).collect();
        for caps in PLACEHOLDER_RE.captures_iter(&step.exec.prompt) {
            let name = &caps[1];
            if name == "input" {
                continue;
            }
            if let Some(artifact) = name.strip_prefix("artifact:") {
                if injected.contains(artifact) {
                    continue;
                }
            }
            return Err(ValidationError::UnresolvedPlaceholder {
                step: step.step_id.clone(),
                placeholder: name.to_string(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
#[path = "validate_tests.rs"]
mod tests;
