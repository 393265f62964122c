use crate::config::AppConfig;
use crate::convert::{ArchiveFormat, ConversionResult, GalleryConverter};
use crate::downloader::{DownloadResult, GalleryDownloader};
use crate::paths::AppPaths;
use crate::site::SiteProvider;
use crate::{logs, EngineError, Result};
use serde::Serialize;
use serde_json::json;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::SyncSender;
use std::sync::{Mutex, MutexGuard};

/// Advisory progress notification. Events are dropped rather than blocking
/// workers when the receiver falls behind.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressEvent {
    pub message: String,
    pub completed: usize,
    pub total: usize,
}

pub struct BatchOptions {
    pub stop_on_error: bool,
    pub format_override: Option<ArchiveFormat>,
    pub fetch_info: bool,
    pub progress: Option<SyncSender<ProgressEvent>>,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            stop_on_error: false,
            format_override: None,
            fetch_info: true,
            progress: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchOutcome {
    pub url: String,
    pub download: DownloadResult,
    pub conversion: Option<ConversionResult>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchSummary {
    pub requested: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub files_downloaded: usize,
    pub converted: usize,
    pub conversion_failures: usize,
}

pub fn summarize(outcomes: &[BatchOutcome]) -> BatchSummary {
    let mut summary = BatchSummary {
        requested: outcomes.len(),
        succeeded: 0,
        failed: 0,
        files_downloaded: 0,
        converted: 0,
        conversion_failures: 0,
    };
    for outcome in outcomes {
        if outcome.download.success {
            summary.succeeded += 1;
        } else {
            summary.failed += 1;
        }
        summary.files_downloaded += outcome.download.files_downloaded;
        match &outcome.conversion {
            Some(conversion) if conversion.success => summary.converted += 1,
            Some(_) => summary.conversion_failures += 1,
            None => {}
        }
    }
    summary
}

/// Downloads a list of galleries on a bounded worker pool, optionally
/// converting each finished gallery, and returns one outcome per input url
/// in submission order.
pub struct BatchOrchestrator {
    paths: AppPaths,
    config: AppConfig,
    downloader: GalleryDownloader,
    converter: GalleryConverter,
}

impl BatchOrchestrator {
    pub fn new(paths: AppPaths, config: AppConfig) -> Self {
        let downloader = GalleryDownloader::new(paths.clone(), &config);
        let converter = GalleryConverter::new(config.conversion.clone());
        Self {
            paths,
            config,
            downloader,
            converter,
        }
    }

    pub fn downloader(&self) -> &GalleryDownloader {
        &self.downloader
    }

    pub fn converter(&self) -> &GalleryConverter {
        &self.converter
    }

    /// Convenience form of `run_batch`: default options, download results
    /// only.
    pub fn run_many(
        &self,
        provider: &dyn SiteProvider,
        urls: &[String],
    ) -> Result<Vec<DownloadResult>> {
        let outcomes = self.run_batch(provider, urls, &BatchOptions::default())?;
        Ok(outcomes.into_iter().map(|o| o.download).collect())
    }

    /// Downloads one gallery end to end. With no sibling jobs to keep
    /// running, an invalid url is an error here rather than a failed
    /// outcome.
    pub fn run_single(
        &self,
        provider: &dyn SiteProvider,
        url: &str,
        options: &BatchOptions,
    ) -> Result<BatchOutcome> {
        let normalized = provider.normalize_url(url);
        if !provider.validate_gallery_url(&normalized) {
            return Err(EngineError::InvalidUrl(url.to_string()));
        }
        self.downloader.ensure_tool_available()?;
        let format = self.effective_format(options)?;
        let job_id = uuid::Uuid::new_v4().to_string();
        Ok(self.run_one(provider, url, &normalized, format, options, &job_id))
    }

    /// Runs the whole batch. The only error here is a failed pre-flight
    /// check; per-url failures are reported inside the returned outcomes.
    pub fn run_batch(
        &self,
        provider: &dyn SiteProvider,
        urls: &[String],
        options: &BatchOptions,
    ) -> Result<Vec<BatchOutcome>> {
        self.downloader.ensure_tool_available()?;
        let format = self.effective_format(options)?;

        let batch_id = uuid::Uuid::new_v4().to_string();
        let total = urls.len();
        let _ = logs::log_line(
            &self.paths,
            &batch_id,
            "info",
            "batch_started",
            json!({
                "requested": total,
                "stop_on_error": options.stop_on_error,
                "format": format.map(|f| f.as_str()),
            }),
        );

        let mut slots: Vec<Option<BatchOutcome>> = Vec::with_capacity(total);
        let mut pending: VecDeque<(usize, String)> = VecDeque::new();
        for (index, url) in urls.iter().enumerate() {
            let normalized = provider.normalize_url(url);
            if provider.validate_gallery_url(&normalized) {
                slots.push(None);
                pending.push_back((index, normalized));
            } else {
                let _ = logs::log_line(
                    &self.paths,
                    &batch_id,
                    "warn",
                    "url_rejected",
                    json!({"url": logs::redact_url_for_log(url)}),
                );
                slots.push(Some(BatchOutcome {
                    url: url.clone(),
                    download: DownloadResult::failed(
                        None,
                        format!("invalid or unsupported gallery url: {url}"),
                    ),
                    conversion: None,
                }));
            }
        }

        let workers = (self.config.download.max_parallel_galleries.max(1) as usize)
            .min(pending.len().max(1));
        let rejected = total - pending.len();

        let queue = Mutex::new(pending);
        let results = Mutex::new(slots);
        let completed = AtomicUsize::new(rejected);
        let stop = AtomicBool::new(false);

        std::thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| loop {
                    let next = lock_or_recover(&queue).pop_front();
                    let Some((index, url)) = next else {
                        break;
                    };

                    let original = urls[index].as_str();
                    let outcome = if options.stop_on_error && stop.load(Ordering::SeqCst) {
                        BatchOutcome {
                            url: original.to_string(),
                            download: DownloadResult::failed(
                                None,
                                "not started: batch stopped after earlier failure",
                            ),
                            conversion: None,
                        }
                    } else {
                        let run = std::panic::catch_unwind(AssertUnwindSafe(|| {
                            self.run_one(provider, original, &url, format, options, &batch_id)
                        }));
                        match run {
                            Ok(outcome) => outcome,
                            Err(payload) => BatchOutcome {
                                url: original.to_string(),
                                download: DownloadResult::failed(
                                    None,
                                    format!("download worker panicked: {}", panic_text(&*payload)),
                                ),
                                conversion: None,
                            },
                        }
                    };

                    if options.stop_on_error && !outcome.download.success {
                        stop.store(true, Ordering::SeqCst);
                    }

                    lock_or_recover(&results)[index] = Some(outcome);
                    let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
                    if let Some(progress) = &options.progress {
                        let _ = progress.try_send(ProgressEvent {
                            message: format!("Completed {done}/{total}"),
                            completed: done,
                            total,
                        });
                    }
                });
            }
        });

        let finished = match results.into_inner() {
            Ok(slots) => slots,
            Err(poisoned) => poisoned.into_inner(),
        };
        let outcomes: Vec<BatchOutcome> = finished
            .into_iter()
            .enumerate()
            .map(|(index, slot)| {
                slot.unwrap_or_else(|| BatchOutcome {
                    url: urls[index].clone(),
                    download: DownloadResult::failed(None, "not processed"),
                    conversion: None,
                })
            })
            .collect();

        let summary = summarize(&outcomes);
        let _ = logs::log_line(
            &self.paths,
            &batch_id,
            "info",
            "batch_finished",
            json!({
                "succeeded": summary.succeeded,
                "failed": summary.failed,
                "files_downloaded": summary.files_downloaded,
                "converted": summary.converted,
            }),
        );
        let _ = logs::prune_job_logs_now(&self.paths);

        Ok(outcomes)
    }

    /// Runs one url end to end. `url` is the caller's original string for
    /// reporting; `fetch_url` is the normalized form handed to the tools.
    fn run_one(
        &self,
        provider: &dyn SiteProvider,
        url: &str,
        fetch_url: &str,
        format: Option<ArchiveFormat>,
        options: &BatchOptions,
        batch_id: &str,
    ) -> BatchOutcome {
        let info = if options.fetch_info {
            provider.gallery_info(fetch_url)
        } else {
            None
        };
        let download = self
            .downloader
            .download_gallery(fetch_url, info.as_ref(), provider.name());

        let conversion = match (&download.download_path, format) {
            (Some(path), Some(format)) if download.success => {
                let delete_source = self.config.conversion.delete_source_after_conversion;
                let result = self.converter.convert_with_log(
                    path,
                    format,
                    None,
                    delete_source,
                    None,
                    |message| {
                        let _ = logs::log_line(
                            &self.paths,
                            batch_id,
                            "warn",
                            "convert_warning",
                            json!({"message": message}),
                        );
                    },
                );
                let _ = logs::log_line(
                    &self.paths,
                    batch_id,
                    if result.success { "info" } else { "warn" },
                    "conversion_finished",
                    json!({
                        "path": path.to_string_lossy().to_string(),
                        "success": result.success,
                        "output": result.output_path.as_ref().map(|p| p.to_string_lossy().to_string()),
                        "error": result.error_message,
                    }),
                );
                Some(result)
            }
            _ => None,
        };

        BatchOutcome {
            url: url.to_string(),
            download,
            conversion,
        }
    }

    /// Conversion format for this run. An explicit override wins; otherwise
    /// auto-convert picks up the configured default.
    fn effective_format(&self, options: &BatchOptions) -> Result<Option<ArchiveFormat>> {
        if let Some(format) = options.format_override {
            return Ok(Some(format));
        }
        if !self.config.conversion.auto_convert {
            return Ok(None);
        }
        let name = self.config.conversion.default_format.trim();
        if name.is_empty() || name.eq_ignore_ascii_case("none") {
            return Ok(None);
        }
        Ok(Some(ArchiveFormat::parse(name)?))
    }
}

fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn panic_text(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown panic".to_string()
    }
}
