//! Execution engine: one test through the harness, bounded by the per-test
//! ceiling, classified into an [`ExecutionResult`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, instrument};

use crate::core::classifier::{OutputGrammar, RawOutput};
use crate::core::types::ExecutionResult;
use crate::error::CiError;
use crate::io::harness::{Harness, RunRequest};

pub struct ExecutionEngine<'a> {
    harness: &'a dyn Harness,
    grammar: OutputGrammar,
    root: PathBuf,
    timeout: Duration,
    connect_uri: Option<&'a str>,
    harness_config: Option<&'a Path>,
}

impl<'a> ExecutionEngine<'a> {
    pub fn new(
        harness: &'a dyn Harness,
        root: impl Into<PathBuf>,
        timeout: Duration,
        connect_uri: Option<&'a str>,
        harness_config: Option<&'a Path>,
    ) -> Self {
        Self {
            harness,
            grammar: OutputGrammar::default(),
            root: root.into(),
            timeout,
            connect_uri,
            harness_config,
        }
    }

    /// Run one test and classify it.
    ///
    /// Expected outcomes (including timeouts) are `Ok`; a harness that cannot
    /// be invoked at all is a [`CiError::ExecutionFault`].
    #[instrument(skip(self))]
    pub fn run_one(&self, test_id: &str) -> Result<ExecutionResult> {
        let outcome = self.harness.run(&RunRequest {
            test_id,
            connect_uri: self.connect_uri,
            config: self.harness_config,
            restore_image: false,
            timeout: self.timeout,
        });
        // The harness (and anything it spawns) may leave the process in
        // another directory; every later relative path assumes the root.
        std::env::set_current_dir(&self.root)
            .with_context(|| format!("return to {}", self.root.display()))
            .map_err(|err| CiError::execution_fault(test_id, err))?;
        let out = outcome.map_err(|err| CiError::execution_fault(test_id, err))?;

        let classification = self.grammar.classify(RawOutput {
            stdout: &out.stdout,
            stderr: &out.stderr,
            timed_out: out.timed_out,
        });
        let duration_secs = if out.timed_out {
            self.timeout.as_secs_f64()
        } else {
            out.elapsed.as_secs_f64()
        };
        debug!(status = %classification.status, duration_secs, "test classified");
        println!("Result: {} {duration_secs:.2} s", classification.status);

        Ok(ExecutionResult {
            status: classification.status,
            duration_secs,
            stdout: out.stdout,
            stderr: out.stderr,
            diagnostics: classification.diagnostics,
            result_line: classification.result_line,
            reason: None,
        })
    }
}
