//! Running one edit against many books.

use std::path::PathBuf;

use crate::error::Result;
use crate::metadata::EditRequest;
use crate::replace::{Coordinator, RunReport};

/// One book to rewrite.
#[derive(Debug, Clone)]
pub struct Job {
    pub source: PathBuf,
    /// Where to write the result; `None` rewrites `source` in place.
    pub destination: Option<PathBuf>,
    pub edits: EditRequest,
}

impl Job {
    pub fn in_place(source: impl Into<PathBuf>, edits: EditRequest) -> Self {
        Self {
            source: source.into(),
            destination: None,
            edits,
        }
    }

    pub fn to(source: impl Into<PathBuf>, destination: impl Into<PathBuf>, edits: EditRequest) -> Self {
        Self {
            source: source.into(),
            destination: Some(destination.into()),
            edits,
        }
    }
}

/// The result of one [`Job`].
#[derive(Debug)]
pub struct Outcome {
    pub source: PathBuf,
    pub result: Result<RunReport>,
}

/// Per-file results of [`run_batch`], in submission order.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub outcomes: Vec<Outcome>,
}

impl BatchReport {
    pub fn succeeded(&self) -> impl Iterator<Item = &Outcome> {
        self.outcomes.iter().filter(|o| o.result.is_ok())
    }

    pub fn failed(&self) -> impl Iterator<Item = &Outcome> {
        self.outcomes.iter().filter(|o| o.result.is_err())
    }

    pub fn is_success(&self) -> bool {
        self.outcomes.iter().all(|o| o.result.is_ok())
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }
}

/// Run every job in order. A failing job never stops the rest.
pub fn run_batch(coordinator: &Coordinator, jobs: impl IntoIterator<Item = Job>) -> BatchReport {
    let outcomes = jobs
        .into_iter()
        .map(|job| {
            let destination = job.destination.as_deref().unwrap_or(&job.source);
            let result = coordinator.run_to(&job.source, destination, &job.edits);
            match &result {
                Ok(report) => log::info!(
                    "{}: updated {} field(s)",
                    report.destination.display(),
                    report.fields_changed.len()
                ),
                Err(e) => log::warn!("{}: {e}", job.source.display()),
            }
            Outcome {
                source: job.source,
                result,
            }
        })
        .collect();
    BatchReport { outcomes }
}
