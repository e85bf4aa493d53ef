//! Bounded worker pool over the build graph.
//!
//! Each target runs on its own worker thread; the unit of concurrency is the
//! subprocess the job spawns. A target is released only when every
//! prerequisite finished successfully. When a target fails, its dependents
//! are marked blocked and never start, while independent targets keep going.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::mpsc;
use std::time::Instant;

use crate::error::{Error, Result};
use crate::executor::{ExecCtx, ExecEvent};
use crate::planner::BuildGraph;

#[derive(Debug)]
pub enum TargetOutcome<T> {
    Done(T),
    Failed(Error),
    /// A prerequisite failed, so the target never started.
    Blocked { by: String },
    /// The run was cancelled before the target started.
    Cancelled,
}

impl<T> TargetOutcome<T> {
    pub fn is_done(&self) -> bool {
        matches!(self, TargetOutcome::Done(_))
    }
}

#[derive(Debug)]
pub struct PoolReport<T> {
    /// Completion order of targets that actually ran.
    pub finished: Vec<String>,
    pub outcomes: BTreeMap<String, TargetOutcome<T>>,
}

impl<T> PoolReport<T> {
    pub fn all_done(&self) -> bool {
        self.outcomes.values().all(TargetOutcome::is_done)
    }

    pub fn failures(&self) -> impl Iterator<Item = (&str, &Error)> {
        self.finished.iter().filter_map(|id| match self.outcomes.get(id) {
            Some(TargetOutcome::Failed(e)) => Some((id.as_str(), e)),
            _ => None,
        })
    }

    pub fn blocked(&self) -> impl Iterator<Item = (&str, &str)> {
        self.outcomes.iter().filter_map(|(id, o)| match o {
            TargetOutcome::Blocked { by } => Some((id.as_str(), by.as_str())),
            _ => None,
        })
    }

    /// Move failures out in completion order.
    pub fn take_failures(&mut self) -> Vec<(String, Error)> {
        let mut out = Vec::new();
        for id in &self.finished {
            if let Some(TargetOutcome::Failed(_)) = self.outcomes.get(id)
                && let Some(TargetOutcome::Failed(e)) = self.outcomes.remove(id)
            {
                out.push((id.clone(), e));
            }
        }
        out
    }
}

type Finished<T> = (String, Result<T>, u128);

/// Run `job` for every node of `graph` with at most `max_parallel` at once.
pub fn run_pool<T, F>(
    graph: &BuildGraph,
    ctx: &ExecCtx,
    max_parallel: usize,
    job: F,
) -> Result<PoolReport<T>>
where
    T: Send,
    F: Fn(&str, &mut ExecCtx) -> Result<T> + Sync,
{
    let nodes = graph.ordered()?;
    let dependents = graph.dependents();
    let workers = max_parallel.max(1);

    let mut incoming: BTreeMap<&str, usize> = nodes
        .iter()
        .map(|n| (n.id.as_str(), n.after.len()))
        .collect();
    let mut ready: BTreeSet<(u32, usize, &str)> = nodes
        .iter()
        .filter(|n| n.after.is_empty())
        .map(|n| (n.rank, n.seq, n.id.as_str()))
        .collect();
    let mut report = PoolReport {
        finished: Vec::new(),
        outcomes: BTreeMap::new(),
    };

    std::thread::scope(|scope| -> Result<()> {
        let (tx, rx) = mpsc::channel::<Finished<T>>();
        let mut running = HashMap::new();
        let job = &job;

        loop {
            while running.len() < workers && !ctx.cancelled() {
                let Some((_, _, id)) = ready.pop_first() else {
                    break;
                };
                let id = id.to_string();
                ctx.sink.emit(ExecEvent::TaskSpawned { id: id.clone() });
                let tx = tx.clone();
                let mut local = ctx.clone();
                let thread_id = id.clone();
                let handle = scope.spawn(move || {
                    local.set_task(thread_id.clone());
                    local.sink.emit(ExecEvent::TaskStarted {
                        id: thread_id.clone(),
                    });
                    let start = Instant::now();
                    let res = catch_unwind(AssertUnwindSafe(|| job(&thread_id, &mut local)))
                        .unwrap_or_else(|_| {
                            Err(Error::msg(format!("worker for '{thread_id}' panicked")))
                        });
                    let _ = tx.send((thread_id, res, start.elapsed().as_millis()));
                });
                running.insert(id, handle);
            }

            if running.is_empty() {
                break;
            }

            let (done_id, res, elapsed_ms) = rx
                .recv()
                .map_err(|e| Error::msg(format!("worker pool recv failed: {e}")))?;
            if let Some(h) = running.remove(&done_id) {
                let _ = h.join();
            }
            report.finished.push(done_id.clone());

            match res {
                Ok(value) => {
                    ctx.sink.emit(ExecEvent::TaskFinished {
                        id: done_id.clone(),
                        ok: true,
                        error: None,
                        elapsed_ms,
                    });
                    for &child in dependents.get(done_id.as_str()).map(Vec::as_slice).unwrap_or_default() {
                        let Some(slot) = incoming.get_mut(child) else {
                            continue;
                        };
                        *slot -= 1;
                        if *slot == 0
                            && !report.outcomes.contains_key(child)
                            && let Some(n) = graph.get(child)
                        {
                            ready.insert((n.rank, n.seq, n.id.as_str()));
                        }
                    }
                    report.outcomes.insert(done_id, TargetOutcome::Done(value));
                }
                Err(e) => {
                    ctx.sink.emit(ExecEvent::TaskFinished {
                        id: done_id.clone(),
                        ok: false,
                        error: Some(e.to_string()),
                        elapsed_ms,
                    });
                    block_subtree(&done_id, &dependents, &mut report.outcomes, &mut ready);
                    report.outcomes.insert(done_id, TargetOutcome::Failed(e));
                }
            }
        }
        Ok(())
    })?;

    for n in nodes {
        report
            .outcomes
            .entry(n.id.clone())
            .or_insert(TargetOutcome::Cancelled);
    }
    Ok(report)
}

fn block_subtree<T>(
    failed: &str,
    dependents: &BTreeMap<&str, Vec<&str>>,
    outcomes: &mut BTreeMap<String, TargetOutcome<T>>,
    ready: &mut BTreeSet<(u32, usize, &str)>,
) {
    let mut queue: VecDeque<&str> = dependents.get(failed).cloned().unwrap_or_default().into();
    while let Some(id) = queue.pop_front() {
        if outcomes.contains_key(id) {
            continue;
        }
        ready.retain(|(_, _, r)| *r != id);
        outcomes.insert(
            id.to_string(),
            TargetOutcome::Blocked {
                by: failed.to_string(),
            },
        );
        queue.extend(dependents.get(id).into_iter().flatten().copied());
    }
}
