//! Drives the authentication graph to completion, honouring the verdicts
//! produced by each flow's operations.

use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::errors::Error;
use crate::graph::AuthGraph;
use crate::operations::Verdict;
use crate::session::Session;
use crate::DEFAULT_MAX_TRANSITIONS;

/// Terminal state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Ok,
    Error,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunStats {
    /// HTTP exchanges performed.
    pub requests: usize,
    /// Stage transitions driven by `NextStage` verdicts.
    pub transitions: usize,
    pub elapsed: Duration,
}

/// Result object of one authentication or function run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub outcome: Outcome,
    pub message: Option<String>,
    pub last_flow: Option<String>,
    pub stats: RunStats,
}

impl RunOutcome {
    pub fn is_ok(&self) -> bool {
        self.outcome == Outcome::Ok
    }

    /// 0 on a clean stop, 1 on any terminal error.
    pub fn exit_code(&self) -> i32 {
        match self.outcome {
            Outcome::Ok => 0,
            Outcome::Error => 1,
        }
    }
}

fn finished(last_flow: Option<String>, mut stats: RunStats, started: Instant) -> RunOutcome {
    stats.elapsed = started.elapsed();
    RunOutcome {
        outcome: Outcome::Ok,
        message: None,
        last_flow,
        stats,
    }
}

fn failed(
    message: impl Into<String>,
    last_flow: Option<String>,
    mut stats: RunStats,
    started: Instant,
) -> RunOutcome {
    stats.elapsed = started.elapsed();
    let message = message.into();
    warn!(%message, "run aborted");
    RunOutcome {
        outcome: Outcome::Error,
        message: Some(message),
        last_flow,
        stats,
    }
}

/// Executes flows against one session. The graph stays immutable; the
/// session collects every cookie and plugin value along the way.
pub struct Runner<'a> {
    graph: &'a AuthGraph,
    session: &'a mut Session,
    max_transitions: usize,
}

impl<'a> Runner<'a> {
    pub fn new(graph: &'a AuthGraph, session: &'a mut Session) -> Self {
        Self {
            graph,
            session,
            max_transitions: DEFAULT_MAX_TRANSITIONS,
        }
    }

    /// Overrides the transition bound of the loop guard.
    pub fn with_max_transitions(mut self, max_transitions: usize) -> Self {
        self.max_transitions = max_transitions;
        self
    }

    /// Runs the authentication sequence from the first flow.
    pub async fn authenticate(&mut self) -> RunOutcome {
        self.authenticate_from(0).await
    }

    /// Runs the authentication sequence from the flow at `start`.
    ///
    /// Verdicts drive the machine: `Next` jumps by name (a name found only
    /// in the functions list is run once as a terminal detour), `Stop` and
    /// a trailing `Continue` end the run, `Error` aborts. A `Next` chain
    /// longer than the transition bound trips the loop guard.
    pub async fn authenticate_from(&mut self, start: usize) -> RunOutcome {
        let graph = self.graph;
        let started = Instant::now();
        let mut stats = RunStats::default();
        let mut last_flow: Option<String> = None;

        if graph.flows().is_empty() {
            return finished(None, stats, started);
        }

        let mut index = start;
        loop {
            let Some(flow) = graph.flow_at(index) else {
                return failed(
                    format!("no stage at position {index}"),
                    last_flow,
                    stats,
                    started,
                );
            };
            info!(stage = %flow.name(), "running stage");
            last_flow = Some(flow.name().to_string());
            let verdict = match flow.run(self.session, graph.base_url()).await {
                Ok(verdict) => verdict,
                Err(err) => return failed(err.to_string(), last_flow, stats, started),
            };
            stats.requests += 1;

            match verdict {
                Verdict::Stop => return finished(last_flow, stats, started),
                Verdict::Error(message) => return failed(message, last_flow, stats, started),
                Verdict::Continue => {
                    if index + 1 < graph.flows().len() {
                        index += 1;
                    } else {
                        return finished(last_flow, stats, started);
                    }
                }
                Verdict::Next(name) => {
                    if let Some(next) = graph.flow_position(&name) {
                        stats.transitions += 1;
                        if stats.transitions > self.max_transitions {
                            return failed(
                                Error::LoopGuard(self.max_transitions).to_string(),
                                last_flow,
                                stats,
                                started,
                            );
                        }
                        index = next;
                    } else if let Some(function) = graph.function(&name) {
                        info!(function = %name, "detouring into function");
                        last_flow = Some(name.clone());
                        let verdict = match function.run(self.session, graph.base_url()).await {
                            Ok(verdict) => verdict,
                            Err(err) => return failed(err.to_string(), last_flow, stats, started),
                        };
                        stats.requests += 1;
                        return match verdict {
                            Verdict::Error(message) => failed(message, last_flow, stats, started),
                            _ => finished(last_flow, stats, started),
                        };
                    } else {
                        return failed(
                            Error::UnknownStage(name).to_string(),
                            last_flow,
                            stats,
                            started,
                        );
                    }
                }
            }
        }
    }

    /// Runs a named function flow, chaining through `NextStage` verdicts.
    ///
    /// Names resolve against the functions list first, then the
    /// authentication list. `Continue` and `Stop` end the run.
    pub async fn run_function(&mut self, name: &str) -> RunOutcome {
        let graph = self.graph;
        let started = Instant::now();
        let mut stats = RunStats::default();

        let Some(mut current) = graph.function(name) else {
            return failed(
                Error::UnknownFunction(name.to_string()).to_string(),
                None,
                stats,
                started,
            );
        };
        let mut last_flow: Option<String> = None;
        loop {
            info!(function = %current.name(), "running function");
            last_flow = Some(current.name().to_string());
            let verdict = match current.run(self.session, graph.base_url()).await {
                Ok(verdict) => verdict,
                Err(err) => return failed(err.to_string(), last_flow, stats, started),
            };
            stats.requests += 1;

            match verdict {
                Verdict::Continue | Verdict::Stop => return finished(last_flow, stats, started),
                Verdict::Error(message) => return failed(message, last_flow, stats, started),
                Verdict::Next(next) => {
                    let target = graph
                        .function(&next)
                        .or_else(|| graph.flow_position(&next).and_then(|i| graph.flow_at(i)));
                    match target {
                        Some(target) => {
                            stats.transitions += 1;
                            if stats.transitions > self.max_transitions {
                                return failed(
                                    Error::LoopGuard(self.max_transitions).to_string(),
                                    last_flow,
                                    stats,
                                    started,
                                );
                            }
                            current = target;
                        }
                        None => {
                            return failed(
                                Error::UnknownStage(next).to_string(),
                                last_flow,
                                stats,
                                started,
                            )
                        }
                    }
                }
            }
        }
    }
}
