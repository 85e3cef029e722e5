//! Dependency-ordered workflow execution.
//!
//! A workflow is a DAG of named steps. A step starts once every step it
//! depends on has finished; steps that become ready together run
//! concurrently. Two kinds of dependency exist:
//!
//! - `requires`: the dependency must succeed, otherwise the step is
//!   [`StepOutcome::Blocked`] and so are its own dependents
//! - `after`: ordering only, the step waits for the dependency to finish
//!   whatever its outcome
//!
//! A failed step never aborts independent branches.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::context::WorkflowContext;
use crate::error::{StepError, WorkflowError};

/// One unit of work in a workflow.
#[async_trait]
pub trait WorkflowStep: Send + Sync {
    /// Unique name within the workflow; dependencies refer to it.
    fn name(&self) -> &str;

    async fn run(&self, ctx: &WorkflowContext) -> Result<(), StepError>;
}

/// Dependencies and limits of one step.
#[derive(Debug, Clone, Default)]
pub struct StepOptions {
    requires: Vec<String>,
    after: Vec<String>,
    timeout: Option<Duration>,
}

impl StepOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Steps that must succeed first.
    pub fn requires(mut self, steps: &[&str]) -> Self {
        self.requires.extend(steps.iter().map(|s| s.to_string()));
        self
    }

    /// Steps that must finish first, successfully or not.
    pub fn after(mut self, steps: &[&str]) -> Self {
        self.after.extend(steps.iter().map(|s| s.to_string()));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// How a step ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StepOutcome {
    Succeeded,
    Failed { error: String },
    TimedOut { after_ms: u64 },
    /// Not run because a required dependency did not succeed
    Blocked { by: String },
}

impl StepOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, StepOutcome::Succeeded)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    pub name: String,
    #[serde(flatten)]
    pub outcome: StepOutcome,
    pub duration_ms: u64,
}

/// Outcome of every step of one run, in completion order.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowReport {
    pub workflow: String,
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub steps: Vec<StepReport>,
}

impl WorkflowReport {
    pub fn outcome(&self, step: &str) -> Option<&StepOutcome> {
        self.steps.iter().find(|s| s.name == step).map(|s| &s.outcome)
    }

    /// Position of `step` in completion order.
    pub fn position(&self, step: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.name == step)
    }

    pub fn completion_order(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name.as_str()).collect()
    }

    pub fn is_success(&self) -> bool {
        self.steps.iter().all(|s| s.outcome.is_success())
    }

    /// Steps that ran and did not succeed.
    pub fn failed(&self) -> Vec<&StepReport> {
        self.steps
            .iter()
            .filter(|s| matches!(s.outcome, StepOutcome::Failed { .. } | StepOutcome::TimedOut { .. }))
            .collect()
    }

    pub fn blocked(&self) -> Vec<&StepReport> {
        self.steps
            .iter()
            .filter(|s| matches!(s.outcome, StepOutcome::Blocked { .. }))
            .collect()
    }
}

struct PendingNode {
    step: Arc<dyn WorkflowStep>,
    options: StepOptions,
}

/// Collects steps and validates the graph.
pub struct WorkflowBuilder {
    name: String,
    nodes: Vec<PendingNode>,
    default_timeout: Option<Duration>,
}

impl WorkflowBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes: Vec::new(),
            default_timeout: None,
        }
    }

    /// Add a step whose `requires` must all succeed before it runs.
    pub fn step(self, step: impl WorkflowStep + 'static, requires: &[&str]) -> Self {
        self.add(Arc::new(step), StepOptions::new().requires(requires))
    }

    /// Add a step that runs once every step in `after` has finished,
    /// whatever their outcome.
    pub fn after(self, step: impl WorkflowStep + 'static, after: &[&str]) -> Self {
        self.add(Arc::new(step), StepOptions::new().after(after))
    }

    pub fn add(mut self, step: Arc<dyn WorkflowStep>, options: StepOptions) -> Self {
        self.nodes.push(PendingNode { step, options });
        self
    }

    /// Timeout for steps that do not set their own.
    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    /// Resolve dependencies and reject duplicates, unknown names and cycles.
    pub fn build(self) -> Result<Workflow, WorkflowError> {
        if self.nodes.is_empty() {
            return Err(WorkflowError::Empty);
        }

        let mut index: HashMap<String, usize> = HashMap::new();
        for (i, node) in self.nodes.iter().enumerate() {
            let name = node.step.name().to_string();
            if index.insert(name.clone(), i).is_some() {
                return Err(WorkflowError::DuplicateStep(name));
            }
        }

        let resolve = |step: &str, deps: &[String]| -> Result<Vec<usize>, WorkflowError> {
            let mut resolved = Vec::with_capacity(deps.len());
            for dep in deps {
                let i = *index.get(dep).ok_or_else(|| WorkflowError::UnknownDependency {
                    step: step.to_string(),
                    dependency: dep.clone(),
                })?;
                if !resolved.contains(&i) {
                    resolved.push(i);
                }
            }
            Ok(resolved)
        };

        let mut nodes = Vec::with_capacity(self.nodes.len());
        for node in self.nodes {
            let name = node.step.name().to_string();
            let requires = resolve(&name, &node.options.requires)?;
            let after: Vec<usize> = resolve(&name, &node.options.after)?
                .into_iter()
                .filter(|i| !requires.contains(i))
                .collect();
            nodes.push(Node {
                timeout: node.options.timeout.or(self.default_timeout),
                step: node.step,
                requires,
                after,
            });
        }

        let order = topological_order(&nodes)?;
        debug!(workflow = %self.name, steps = nodes.len(), "Workflow built");
        Ok(Workflow {
            name: self.name,
            nodes,
            order,
        })
    }
}

struct Node {
    step: Arc<dyn WorkflowStep>,
    requires: Vec<usize>,
    after: Vec<usize>,
    timeout: Option<Duration>,
}

impl Node {
    fn dependencies(&self) -> impl Iterator<Item = &usize> {
        self.requires.iter().chain(self.after.iter())
    }
}

/// Kahn's algorithm, ties broken by declaration order.
fn topological_order(nodes: &[Node]) -> Result<Vec<usize>, WorkflowError> {
    let mut in_degree: Vec<usize> = nodes.iter().map(|n| n.dependencies().count()).collect();
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
    for (i, node) in nodes.iter().enumerate() {
        for &dep in node.dependencies() {
            dependents[dep].push(i);
        }
    }

    let mut ready: VecDeque<usize> = (0..nodes.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(nodes.len());
    while let Some(i) = ready.pop_front() {
        order.push(i);
        for &next in &dependents[i] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                ready.push_back(next);
            }
        }
    }

    if order.len() < nodes.len() {
        return Err(WorkflowError::Cycle(find_cycle(nodes, &in_degree)));
    }
    Ok(order)
}

/// One cycle among the steps Kahn's algorithm could not order, in run
/// order and starting from its smallest name. Every such step still waits
/// on another one, so following those edges must revisit a step.
fn find_cycle(nodes: &[Node], in_degree: &[usize]) -> Vec<String> {
    let stuck = |i: usize| in_degree[i] > 0;
    let mut path: Vec<usize> = Vec::new();
    let mut current = (0..nodes.len()).find(|&i| stuck(i));
    while let Some(i) = current {
        if let Some(start) = path.iter().position(|&p| p == i) {
            path.drain(..start);
            break;
        }
        path.push(i);
        current = nodes[i].dependencies().copied().find(|&d| stuck(d));
    }

    let mut cycle: Vec<String> = path.iter().rev().map(|&i| nodes[i].step.name().to_string()).collect();
    if let Some(first) = cycle
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.cmp(b.1))
        .map(|(i, _)| i)
    {
        cycle.rotate_left(first);
    }
    cycle
}

/// A validated workflow graph, reusable across runs.
pub struct Workflow {
    name: String,
    nodes: Vec<Node>,
    /// Topological order
    order: Vec<usize>,
}

impl Workflow {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Step names in a valid execution order.
    pub fn step_names(&self) -> Vec<&str> {
        self.order.iter().map(|&i| self.nodes[i].step.name()).collect()
    }

    /// Execute every step once against `ctx`.
    pub async fn run(&self, ctx: &WorkflowContext) -> WorkflowReport {
        let started_at = Utc::now();
        info!(workflow = %self.name, run_id = %ctx.run_id(), steps = self.nodes.len(), "Workflow started");

        let mut outcomes: Vec<Option<StepOutcome>> = vec![None; self.nodes.len()];
        let mut scheduled = vec![false; self.nodes.len()];
        let mut reports = Vec::with_capacity(self.nodes.len());
        let mut running = FuturesUnordered::new();

        loop {
            // Topological order: a step blocked in this pass is already
            // settled when its dependents are checked
            for &i in &self.order {
                let node = &self.nodes[i];
                if scheduled[i] || !node.dependencies().all(|&d| outcomes[d].is_some()) {
                    continue;
                }
                scheduled[i] = true;

                let blocker = node
                    .requires
                    .iter()
                    .find(|&&d| !outcomes[d].as_ref().map_or(false, StepOutcome::is_success));
                if let Some(&blocker) = blocker {
                    let by = self.nodes[blocker].step.name().to_string();
                    warn!(step = node.step.name(), blocked_by = %by, "Step blocked");
                    let outcome = StepOutcome::Blocked { by };
                    reports.push(StepReport {
                        name: node.step.name().to_string(),
                        outcome: outcome.clone(),
                        duration_ms: 0,
                    });
                    outcomes[i] = Some(outcome);
                    continue;
                }

                running.push(run_step(i, node, ctx));
            }

            let Some((i, outcome, elapsed)) = running.next().await else {
                break;
            };
            reports.push(StepReport {
                name: self.nodes[i].step.name().to_string(),
                outcome: outcome.clone(),
                duration_ms: elapsed.as_millis() as u64,
            });
            outcomes[i] = Some(outcome);
        }

        let report = WorkflowReport {
            workflow: self.name.clone(),
            run_id: ctx.run_id(),
            started_at,
            finished_at: Utc::now(),
            steps: reports,
        };
        info!(
            workflow = %self.name,
            run_id = %ctx.run_id(),
            failed = report.failed().len(),
            blocked = report.blocked().len(),
            "Workflow finished"
        );
        report
    }
}

async fn run_step<'a>(index: usize, node: &'a Node, ctx: &'a WorkflowContext) -> (usize, StepOutcome, Duration) {
    let name = node.step.name();
    debug!(step = name, "Step started");
    let start = Instant::now();

    let outcome = match node.timeout {
        Some(limit) => match tokio::time::timeout(limit, node.step.run(ctx)).await {
            Ok(result) => outcome_of(result),
            Err(_) => StepOutcome::TimedOut {
                after_ms: limit.as_millis() as u64,
            },
        },
        None => outcome_of(node.step.run(ctx).await),
    };

    let elapsed = start.elapsed();
    match &outcome {
        StepOutcome::Succeeded => info!(step = name, elapsed_ms = elapsed.as_millis() as u64, "Step completed"),
        StepOutcome::Failed { error } => error!(step = name, "Step failed: {}", error),
        StepOutcome::TimedOut { after_ms } => error!(step = name, after_ms, "Step timed out"),
        StepOutcome::Blocked { .. } => {}
    }
    (index, outcome, elapsed)
}

fn outcome_of(result: Result<(), StepError>) -> StepOutcome {
    match result {
        Ok(()) => StepOutcome::Succeeded,
        Err(e) => StepOutcome::Failed { error: e.to_string() },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Records its name into the shared log, optionally after a delay or
    /// with a failure.
    struct TestStep {
        name: &'static str,
        delay: Duration,
        fail: bool,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl WorkflowStep for TestStep {
        fn name(&self) -> &str {
            self.name
        }

        async fn run(&self, _ctx: &WorkflowContext) -> Result<(), StepError> {
            tokio::time::sleep(self.delay).await;
            self.log.lock().unwrap().push(self.name.to_string());
            if self.fail {
                return Err(StepError::Failed(format!("{} broke", self.name)));
            }
            Ok(())
        }
    }

    fn step(name: &'static str, log: &Arc<Mutex<Vec<String>>>) -> TestStep {
        TestStep {
            name,
            delay: Duration::ZERO,
            fail: false,
            log: log.clone(),
        }
    }

    fn failing(name: &'static str, log: &Arc<Mutex<Vec<String>>>) -> TestStep {
        TestStep {
            fail: true,
            ..step(name, log)
        }
    }

    fn slow(name: &'static str, millis: u64, log: &Arc<Mutex<Vec<String>>>) -> TestStep {
        TestStep {
            delay: Duration::from_millis(millis),
            ..step(name, log)
        }
    }

    #[test]
    fn test_build_rejects_bad_graphs() {
        let log = Arc::new(Mutex::new(Vec::new()));

        let duplicate = WorkflowBuilder::new("w")
            .step(step("a", &log), &[])
            .step(step("a", &log), &[])
            .build();
        assert_eq!(duplicate.err(), Some(WorkflowError::DuplicateStep("a".into())));

        let unknown = WorkflowBuilder::new("w").step(step("a", &log), &["ghost"]).build();
        assert_eq!(
            unknown.err(),
            Some(WorkflowError::UnknownDependency {
                step: "a".into(),
                dependency: "ghost".into()
            })
        );

        let cycle = WorkflowBuilder::new("w")
            .step(step("root", &log), &[])
            .step(step("a", &log), &["root", "c"])
            .step(step("b", &log), &["a"])
            .after(step("c", &log), &["b"])
            .build();
        assert_eq!(
            cycle.err(),
            Some(WorkflowError::Cycle(vec!["a".into(), "b".into(), "c".into()]))
        );

        let self_loop = WorkflowBuilder::new("w").step(step("a", &log), &["a"]).build();
        assert_eq!(self_loop.err(), Some(WorkflowError::Cycle(vec!["a".into()])));

        assert_eq!(WorkflowBuilder::new("w").build().err(), Some(WorkflowError::Empty));
    }

    #[test]
    fn test_step_names_topological() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let workflow = WorkflowBuilder::new("w")
            .step(step("c", &log), &["b"])
            .step(step("b", &log), &["a"])
            .step(step("a", &log), &[])
            .build()
            .unwrap();
        assert_eq!(workflow.step_names(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_failure_blocks_dependents_only() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let workflow = WorkflowBuilder::new("w")
            .step(step("source", &log), &[])
            .step(failing("left", &log), &["source"])
            .step(step("right", &log), &["source"])
            .step(step("left_child", &log), &["left"])
            .step(step("left_grandchild", &log), &["left_child"])
            .after(step("cleanup", &log), &["left_grandchild", "right"])
            .build()
            .unwrap();

        let report = workflow.run(&WorkflowContext::new()).await;

        assert!(matches!(report.outcome("left"), Some(StepOutcome::Failed { .. })));
        assert_eq!(report.outcome("right"), Some(&StepOutcome::Succeeded));
        assert_eq!(
            report.outcome("left_child"),
            Some(&StepOutcome::Blocked { by: "left".into() })
        );
        assert_eq!(
            report.outcome("left_grandchild"),
            Some(&StepOutcome::Blocked { by: "left_child".into() })
        );
        // Ordering-only dependencies run regardless
        assert_eq!(report.outcome("cleanup"), Some(&StepOutcome::Succeeded));
        assert!(!report.is_success());

        let ran = log.lock().unwrap().clone();
        assert!(!ran.contains(&"left_child".to_string()));
        assert_eq!(ran.last().map(String::as_str), Some("cleanup"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_steps_run_concurrently() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let workflow = WorkflowBuilder::new("w")
            .step(step("start", &log), &[])
            .step(slow("x", 100, &log), &["start"])
            .step(slow("y", 100, &log), &["start"])
            .step(slow("z", 100, &log), &["start"])
            .step(step("join", &log), &["x", "y", "z"])
            .build()
            .unwrap();

        let began = Instant::now();
        let report = workflow.run(&WorkflowContext::new()).await;

        assert!(report.is_success());
        assert!(began.elapsed() < Duration::from_millis(150));
        assert_eq!(report.position("join"), Some(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_step_timeout() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let workflow = WorkflowBuilder::new("w")
            .add(
                Arc::new(slow("hang", 60_000, &log)),
                StepOptions::new().timeout(Duration::from_millis(500)),
            )
            .step(step("next", &log), &["hang"])
            .build()
            .unwrap();

        let report = workflow.run(&WorkflowContext::new()).await;
        assert_eq!(report.outcome("hang"), Some(&StepOutcome::TimedOut { after_ms: 500 }));
        assert_eq!(
            report.outcome("next"),
            Some(&StepOutcome::Blocked { by: "hang".into() })
        );
    }
}
