//! Main staging engine with modular architecture.
//!
//! Orchestrates a staging run using specialized modules for file discovery,
//! per-file staging and manifest construction.

pub mod discovery;
pub mod manifest;
pub mod staging;

#[cfg(test)]
pub mod tests;

use self::{discovery::FileDiscovery, manifest::ManifestBuilder, staging::StagingContext};

use crate::config::StagerConfig;
use crate::error::{Result, StagerError};
use crate::header::try_parse_header;
use crate::models::{DiscoveryReport, FileOutcome, RejectedFile, StagingSummary};
use crate::partition::relative_path;
use crate::schema::ProcedureSchemaCache;

use colored::*;
use futures::stream::{self, StreamExt};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::task;
use tracing::{debug, error, info};

/// Main processor for a staging run
#[derive(Debug)]
pub struct StagingProcessor {
    config: StagerConfig,
    schemas: Arc<ProcedureSchemaCache>,
}

impl StagingProcessor {
    /// Create a new staging processor; the input root must exist
    pub fn new(config: StagerConfig) -> Result<Self> {
        if !config.input_root.is_dir() {
            return Err(StagerError::InputRootNotFound {
                path: config.input_root.clone(),
            });
        }
        config.validate()?;

        let schemas = Arc::new(ProcedureSchemaCache::new(config.schema_path.clone()));
        Ok(Self { config, schemas })
    }

    /// Use an already-built schema cache instead of loading `schema_path`
    pub fn with_schema_cache(mut self, schemas: Arc<ProcedureSchemaCache>) -> Self {
        self.schemas = schemas;
        self
    }

    pub fn config(&self) -> &StagerConfig {
        &self.config
    }

    fn discover_files(&self) -> Result<(Vec<PathBuf>, usize)> {
        let mut discovery = FileDiscovery::new(
            self.config.input_root.clone(),
            &self.config.file_patterns,
            &self.config.excluded_dirs,
        )?;
        let files = discovery.discover_files()?;
        Ok((files, discovery.computer_count()))
    }

    /// Main staging entry point
    pub async fn process(&self) -> Result<StagingSummary> {
        let start_time = Instant::now();
        let dataset_path = self.config.dataset_path();
        info!(
            "Staging {} into {}",
            self.config.input_root.display(),
            dataset_path.display()
        );

        // Step 1: Discover raw files
        let (files, computer_count) = self.discover_files()?;
        info!(
            "Found {} files from {} computers",
            files.len(),
            computer_count
        );

        // Load the schema once, before any worker needs it
        let schemas = Arc::clone(&self.schemas);
        task::spawn_blocking(move || {
            schemas.get();
        })
        .await
        .map_err(|e| StagerError::Configuration {
            message: format!("Schema loading task failed: {}", e),
        })?;

        // Step 2: Stage files with a bounded worker pool
        let context = Arc::new(StagingContext {
            input_root: self.config.input_root.clone(),
            writer: staging::StagingWriter::new(dataset_path.clone(), &self.config),
            schemas: Arc::clone(&self.schemas),
            manifest_fields: self.config.manifest_fields.clone(),
            drop_empty_columns: self.config.drop_empty_columns,
            normalize_columns: self.config.normalize_columns,
        });
        let outcomes = self.stage_all(&files, context).await;

        // Step 3: Manifest and rejects report, only after every worker finished
        let builder = ManifestBuilder::new(&self.config);
        let manifest_path = builder.write(&outcomes)?;
        let rejects_path = builder.write_rejects(&outcomes)?;

        let mut summary = StagingSummary {
            files_discovered: files.len(),
            dataset_path,
            manifest_path,
            rejects_path,
            ..Default::default()
        };
        for outcome in &outcomes {
            match outcome {
                FileOutcome::Written(row) => {
                    summary.files_written += 1;
                    summary.total_rows += row.rows;
                }
                FileOutcome::Kept(row) => {
                    summary.files_kept += 1;
                    summary.total_rows += row.rows;
                }
                FileOutcome::Failed { .. } => summary.files_failed += 1,
            }
        }
        summary.elapsed = start_time.elapsed();

        Ok(summary)
    }

    async fn stage_all(&self, files: &[PathBuf], context: Arc<StagingContext>) -> Vec<FileOutcome> {
        let progress = self.progress_bar(files.len());
        let workers = self.config.workers.max(1);
        debug!("Staging {} files with {} workers", files.len(), workers);

        let outcomes = stream::iter(files.iter().cloned())
            .map(|path| {
                let context = Arc::clone(&context);
                let progress = progress.clone();
                async move {
                    if let Some(pb) = &progress {
                        if let Some(file_name) = path.file_name() {
                            pb.set_message(file_name.to_string_lossy().into_owned());
                        }
                    }

                    let task_path = path.clone();
                    let outcome = task::spawn_blocking(move || context.stage_file(&task_path))
                        .await
                        .unwrap_or_else(|e| {
                            error!("Worker for {} did not complete: {}", path.display(), e);
                            FileOutcome::Failed {
                                rel_path: relative_path(&path, &self.config.input_root),
                                path: path.clone(),
                                reason: format!("worker task failed: {}", e),
                            }
                        });

                    if let Some(pb) = &progress {
                        pb.inc(1);
                    }
                    outcome
                }
            })
            .buffer_unordered(workers)
            .collect::<Vec<_>>()
            .await;

        if let Some(pb) = progress {
            pb.finish_with_message("done");
        }
        outcomes
    }

    fn progress_bar(&self, total: usize) -> Option<ProgressBar> {
        if !self.config.show_progress || total == 0 {
            return None;
        }
        let pb = ProgressBar::new(total as u64);
        let style = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-");
        pb.set_style(style);
        Some(pb)
    }

    /// Discovery only: parse every header and report per-procedure counts
    pub async fn discover(&self) -> Result<DiscoveryReport> {
        let (files, _) = self.discover_files()?;
        let workers = self.config.workers.max(1);
        let input_root = self.config.input_root.clone();

        let results = stream::iter(files.iter().cloned())
            .map(|path| async move {
                let task_path = path.clone();
                let parsed = task::spawn_blocking(move || try_parse_header(&task_path))
                    .await
                    .map_err(|e| e.to_string())
                    .and_then(|r| r.map_err(|e| e.to_string()));
                (path, parsed)
            })
            .buffer_unordered(workers)
            .collect::<Vec<_>>()
            .await;

        let mut report = DiscoveryReport {
            files_discovered: files.len(),
            ..Default::default()
        };
        for (path, parsed) in results {
            match parsed {
                Ok(header) => *report.procedures.entry(header.proc_short).or_default() += 1,
                Err(reason) => report.header_failures.push(RejectedFile {
                    rel_path: relative_path(&path, &input_root),
                    path,
                    reason,
                }),
            }
        }
        report.header_failures.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));

        Ok(report)
    }
}

/// Print the human-facing run summary
pub fn print_summary(summary: &StagingSummary) {
    println!("\n{}", "Staging Summary".bright_green().bold());
    println!(
        "  {} {:.2}s ({:.1} files/s)",
        "Time elapsed:".bright_cyan(),
        summary.elapsed.as_secs_f64(),
        summary.files_per_second()
    );
    println!(
        "  {} {}",
        "Files discovered:".bright_cyan(),
        summary.files_discovered.to_string().bright_white()
    );
    println!(
        "  {} {}",
        "Files written:".bright_cyan(),
        summary.files_written.to_string().bright_white()
    );
    println!(
        "  {} {}",
        "Files kept:".bright_cyan(),
        summary.files_kept.to_string().bright_white()
    );
    if summary.files_failed > 0 {
        println!(
            "  {} {}",
            "Files failed:".bright_red(),
            summary.files_failed.to_string().bright_red().bold()
        );
    }
    println!(
        "  {} {}",
        "Total rows:".bright_cyan(),
        summary.total_rows.to_string().bright_white().bold()
    );
    println!(
        "  {} {}",
        "Dataset:".bright_cyan(),
        summary.dataset_path.display()
    );
    match &summary.manifest_path {
        Some(path) => println!("  {} {}", "Manifest:".bright_cyan(), path.display()),
        None => println!("  {}", "No manifest written".bright_yellow()),
    }
    if let Some(path) = &summary.rejects_path {
        println!("  {} {}", "Rejects:".bright_red(), path.display());
    }
}

/// Print the discovery-only report
pub fn print_discovery(report: &DiscoveryReport) {
    println!("\n{}", "Discovery Report".bright_green().bold());
    println!(
        "  {} {}",
        "Files discovered:".bright_cyan(),
        report.files_discovered.to_string().bright_white().bold()
    );
    for (proc, count) in &report.procedures {
        println!("    {:<20} {}", proc.bright_white(), count);
    }
    if !report.header_failures.is_empty() {
        println!(
            "  {} {}",
            "Unreadable headers:".bright_red(),
            report.header_failures.len().to_string().bright_red().bold()
        );
        for rejected in &report.header_failures {
            println!("    {} ({})", rejected.rel_path, rejected.reason);
        }
    }
}
