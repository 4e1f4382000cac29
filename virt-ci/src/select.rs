//! Test selection: layered include/exclude rules resolved into the ordered
//! list of test ids for this run.
//!
//! Order of application:
//! 1. default excludes from settings
//! 2. `--only` replaces the include set
//! 3. slices from the slice source (`other` excludes every named slice)
//! 4. `--no` adds excludes
//! 5. `--only-change` intersects the include set with changed test groups
//! 6. ids come from the whitelist file, else from the listing harness
//! 7. smoke mode keeps the first case per class
//! 8. blacklisted ids are removed
//!
//! The result is always written to the run manifest. An include set that ends
//! up empty selects nothing without consulting the harness.

use std::collections::BTreeSet;
use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::core::filter::{
    Filter, SliceMap, changed_config_path, config_label, parse_listing, remove_listed, smoke,
};
use crate::core::name::NameRules;
use crate::error::CiError;
use crate::io::config::CiConfig;
use crate::io::harness::{Harness, ListRequest};
use crate::io::http::Fetch;
use crate::io::lists::{read_id_file, write_manifest};
use crate::options::RunOptions;

pub struct TestSelector<'a> {
    config: &'a CiConfig,
    options: &'a RunOptions,
    rules: &'a NameRules,
    harness: &'a dyn Harness,
    fetch: &'a dyn Fetch,
}

impl<'a> TestSelector<'a> {
    pub fn new(
        config: &'a CiConfig,
        options: &'a RunOptions,
        rules: &'a NameRules,
        harness: &'a dyn Harness,
        fetch: &'a dyn Fetch,
    ) -> Self {
        Self {
            config,
            options,
            rules,
            harness,
            fetch,
        }
    }

    /// Resolve the final test list. `changed_files` are provider repository
    /// paths, used only with `--only-change`.
    ///
    /// Every failure is a [`CiError::Selection`].
    #[instrument(skip_all)]
    pub fn select(&self, changed_files: Option<&[String]>) -> Result<Vec<String>> {
        self.resolve(changed_files)
            .map_err(|err| CiError::selection(err).into())
    }

    fn resolve(&self, changed_files: Option<&[String]>) -> Result<Vec<String>> {
        let filter = self.build_filter(changed_files)?;
        debug!(?filter, "filter resolved");

        let mut ids = if filter.selects_nothing() {
            info!("include set is empty, selecting nothing");
            Vec::new()
        } else if let Some(whitelist) = &self.options.whitelist {
            read_id_file(whitelist)?
        } else {
            self.list(&filter)?
        };

        if self.options.smoke {
            ids = smoke(ids, self.rules);
        }
        if let Some(blacklist) = &self.options.blacklist {
            ids = remove_listed(ids, &read_id_file(blacklist)?);
        }

        let manifest = manifest_path(self.config, self.options);
        write_manifest(&manifest, &ids)
            .with_context(|| format!("write manifest {}", manifest.display()))?;
        info!(count = ids.len(), "tests selected");
        Ok(ids)
    }

    /// Steps 1-5: everything that shapes the harness filter.
    pub fn build_filter(&self, changed_files: Option<&[String]>) -> Result<Filter> {
        let mut filter = Filter::with_excludes(self.config.default_excludes.iter().cloned());

        if let Some(include) = &self.options.include {
            filter.set_include(include.iter().cloned());
        }

        if let Some(slice) = &self.options.slice {
            let text = self.fetch.get_text(&slice.url)?;
            let slices = SliceMap::parse(&text).map_err(|msg| anyhow!("{}: {msg}", slice.url))?;
            if slices.is_empty() {
                warn!(url = %slice.url, "slice map has no entries");
            } else {
                debug!(slices = slices.len(), url = %slice.url, "slice map fetched");
            }
            for unknown in filter.apply_slices(&slices, &slice.names) {
                warn!(slice = %unknown, url = %slice.url, "unknown slice name ignored");
            }
        }

        filter.exclude_more(self.options.exclude.iter().cloned());

        if self.options.only_change {
            let changed = changed_files.unwrap_or_default();
            let groups = self.changed_groups(changed);
            debug!(changed = changed.len(), groups = groups.len(), "change-based filter");
            filter.restrict_to(groups);
        }
        Ok(filter)
    }

    fn changed_groups(&self, changed: &[String]) -> BTreeSet<String> {
        let provider = self.options.root.join(&self.config.repos.provider.path);
        changed
            .iter()
            .filter_map(|path| changed_config_path(path))
            .filter_map(|cfg| match first_line(&provider.join(&cfg)) {
                Ok(line) => Some(config_label(&line)),
                Err(err) => {
                    debug!(cfg = %cfg, err = %err, "changed test has no readable cfg");
                    None
                }
            })
            .filter(|label| !label.is_empty())
            .collect()
    }

    fn list(&self, filter: &Filter) -> Result<Vec<String>> {
        let request = ListRequest {
            include: filter.include.as_ref(),
            exclude: &filter.exclude,
            config: self.options.harness_config.as_deref(),
            connect_uri: self.options.env.connect_uri.as_deref(),
        };
        let out = self.harness.list(&request).context("list tests")?;
        if out.timed_out || out.exit_code != Some(0) {
            return Err(anyhow!(
                "listing tests failed (exit {:?}, timed out: {}): {}",
                out.exit_code,
                out.timed_out,
                out.stderr.trim()
            ));
        }
        Ok(parse_listing(&out.stdout))
    }
}

fn first_line(path: &Path) -> Result<String> {
    let file = fs::File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut line = String::new();
    BufReader::new(file)
        .read_line(&mut line)
        .with_context(|| format!("read {}", path.display()))?;
    Ok(line)
}

/// Manifest location for `options` under `config`.
pub fn manifest_path(config: &CiConfig, options: &RunOptions) -> PathBuf {
    options.root.join(&config.manifest)
}
