use std::collections::{BTreeSet, HashMap, HashSet};

use salesflow_core::error::{Result, SalesflowError};

use crate::step::{Step, Trigger};

/// Registered steps of one flow, and the trigger edges between them.
///
/// Wiring errors surface here, before any run: duplicate names and trigger
/// cycles on [`register`](Self::register), dangling references and a
/// missing or ambiguous entry point on [`validate`](Self::validate).
#[derive(Debug, Default, Clone)]
pub struct StepRegistry {
    steps: Vec<Step>,
    index: HashMap<String, usize>,
    terminals: Vec<String>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a step.
    ///
    /// Its trigger may name steps that are not registered yet; those
    /// references are checked by `validate`.
    pub fn register(&mut self, step: Step) -> Result<&Step> {
        if self.index.contains_key(&step.name) {
            return Err(SalesflowError::DuplicateStep(step.name));
        }

        if let Trigger::AfterAll(steps) = &step.trigger {
            if steps.is_empty() {
                return Err(SalesflowError::Config(format!(
                    "step '{}' waits on an empty set of steps",
                    step.name
                )));
            }
            let mut seen = HashSet::new();
            for name in steps {
                if !seen.insert(name.as_str()) {
                    return Err(SalesflowError::Config(format!(
                        "step '{}' lists '{}' twice in its trigger",
                        step.name, name
                    )));
                }
            }
        }

        if let Some(via) = self.find_cycle(&step) {
            return Err(SalesflowError::CyclicTrigger {
                step: step.name,
                via,
            });
        }

        let idx = self.steps.len();
        self.index.insert(step.name.clone(), idx);
        self.steps.push(step);
        Ok(&self.steps[idx])
    }

    /// Mark a step whose completion decides the run's status.
    pub fn designate_terminal(&mut self, name: impl Into<String>) -> &mut Self {
        let name = name.into();
        if !self.terminals.contains(&name) {
            self.terminals.push(name);
        }
        self
    }

    /// Check the registry describes a runnable flow.
    pub fn validate(&self) -> Result<()> {
        let initial: Vec<&str> = self
            .steps
            .iter()
            .filter(|s| s.trigger.is_initial())
            .map(|s| s.name.as_str())
            .collect();
        match initial.len() {
            0 => {
                return Err(SalesflowError::Config(
                    "flow has no initial step".to_string(),
                ))
            }
            1 => {}
            _ => {
                return Err(SalesflowError::Config(format!(
                    "flow has several initial steps: {}",
                    initial.join(", ")
                )))
            }
        }

        for step in &self.steps {
            for pred in step.trigger.predecessors() {
                if !self.index.contains_key(pred) {
                    return Err(SalesflowError::Config(format!(
                        "step '{}' is triggered by unknown step '{}'",
                        step.name, pred
                    )));
                }
            }
        }

        for terminal in &self.terminals {
            if !self.index.contains_key(terminal) {
                return Err(SalesflowError::Config(format!(
                    "terminal step '{}' is not registered",
                    terminal
                )));
            }
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Step> {
        self.index.get(name).map(|&i| &self.steps[i])
    }

    /// Steps in registration order.
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn initial(&self) -> Option<&Step> {
        self.steps.iter().find(|s| s.trigger.is_initial())
    }

    /// Steps whose trigger names `name`.
    pub fn listeners(&self, name: &str) -> Vec<&Step> {
        self.steps
            .iter()
            .filter(|s| s.trigger.predecessors().iter().any(|p| p == name))
            .collect()
    }

    /// Designated terminals, or every step without listeners when none
    /// were designated.
    pub fn terminals(&self) -> Vec<&str> {
        if !self.terminals.is_empty() {
            return self.terminals.iter().map(String::as_str).collect();
        }
        self.steps
            .iter()
            .filter(|s| self.listeners(&s.name).is_empty())
            .map(|s| s.name.as_str())
            .collect()
    }

    /// Every step `name` transitively waits on.
    pub fn ancestors(&self, name: &str) -> BTreeSet<String> {
        let mut found = BTreeSet::new();
        let mut stack: Vec<&str> = match self.get(name) {
            Some(step) => step.trigger.predecessors().iter().map(String::as_str).collect(),
            None => return found,
        };
        while let Some(current) = stack.pop() {
            if !found.insert(current.to_string()) {
                continue;
            }
            if let Some(step) = self.get(current) {
                stack.extend(step.trigger.predecessors().iter().map(String::as_str));
            }
        }
        found
    }

    /// Steps not yet fired whose trigger is satisfied by `completed`,
    /// sorted by name so the outcome is independent of registration order.
    pub fn resolve_ready(
        &self,
        completed: &HashSet<String>,
        fired: &HashSet<String>,
    ) -> Vec<&Step> {
        let mut ready: Vec<&Step> = self
            .steps
            .iter()
            .filter(|s| !fired.contains(&s.name))
            .filter(|s| match &s.trigger {
                Trigger::Initial => true,
                Trigger::AfterOne(pred) => completed.contains(pred),
                Trigger::AfterAll(preds) => preds.iter().all(|p| completed.contains(p)),
            })
            .collect();
        ready.sort_by(|a, b| a.name.cmp(&b.name));
        ready
    }

    /// Walk predecessor edges from the new step's trigger; reaching the new
    /// step again means registering it closes a cycle. Returns the direct
    /// predecessor the cycle runs through.
    fn find_cycle(&self, step: &Step) -> Option<String> {
        for pred in step.trigger.predecessors() {
            let mut stack = vec![pred.as_str()];
            let mut seen = HashSet::new();
            while let Some(current) = stack.pop() {
                if current == step.name {
                    return Some(pred.clone());
                }
                if !seen.insert(current) {
                    continue;
                }
                if let Some(existing) = self.get(current) {
                    stack.extend(existing.trigger.predecessors().iter().map(String::as_str));
                }
            }
        }
        None
    }
}
