use crate::config::{AppConfig, DownloadConfig};
use crate::history::HistoryStore;
use crate::paths::AppPaths;
use crate::site::GalleryInfo;
use crate::{logs, tools, EngineError, Result};
use serde::Serialize;
use serde_json::json;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

const EXTERNAL_CMD_POLL_INTERVAL_MS: u64 = 200;

/// Extensions gallery-dl is expected to emit for gallery pages.
const GALLERY_IMAGE_EXTS: &[&str] = &[".webp", ".jpg", ".jpeg", ".png", ".gif"];

/// Passed to gallery-dl's aria2 hook when the accelerator is available.
const ARIA2_CMDLINE_ARGS: &[&str] = &[
    "--max-connections-per-server=16",
    "--split=16",
    "--min-split-size=256K",
    "--max-concurrent-downloads=32",
    "--continue=true",
    "--auto-file-renaming=false",
    "--disk-cache=64M",
    "--file-allocation=none",
    "--check-certificate=false",
    "--max-download-limit=0",
    "--max-overall-download-limit=0",
    "--piece-length=1M",
    "--allow-overwrite=true",
    "--always-resume=false",
    "--async-dns=true",
    "--enable-http-keep-alive=true",
    "--enable-http-pipelining=true",
    "--max-tries=3",
    "--retry-wait=1",
    "--timeout=10",
    "--connect-timeout=10",
];

#[derive(Debug, Clone, Serialize)]
pub struct DownloadResult {
    pub success: bool,
    pub gallery_info: Option<GalleryInfo>,
    pub download_path: Option<PathBuf>,
    pub files_downloaded: usize,
    pub error_message: Option<String>,
}

impl DownloadResult {
    pub(crate) fn failed(info: Option<&GalleryInfo>, message: impl Into<String>) -> Self {
        Self {
            success: false,
            gallery_info: info.cloned(),
            download_path: None,
            files_downloaded: 0,
            error_message: Some(message.into()),
        }
    }
}

/// Runs gallery-dl for one gallery at a time and records completed
/// downloads in the history store.
pub struct GalleryDownloader {
    paths: AppPaths,
    config: DownloadConfig,
    history: Option<HistoryStore>,
    aria2_available: bool,
}

impl GalleryDownloader {
    pub fn new(paths: AppPaths, config: &AppConfig) -> Self {
        let aria2_available =
            config.download.use_aria2 && tools::aria2_status(&config.download).available;
        let history = if config.history.enable_history {
            Some(HistoryStore::new(paths.clone(), &config.history))
        } else {
            None
        };
        Self {
            paths,
            config: config.download.clone(),
            history,
            aria2_available,
        }
    }

    pub fn history(&self) -> Option<&HistoryStore> {
        self.history.as_ref()
    }

    /// Fails fast when the configured gallery-dl executable cannot be run.
    pub fn ensure_tool_available(&self) -> Result<()> {
        if tools::gallery_dl_status(&self.config).available {
            Ok(())
        } else {
            Err(EngineError::ExternalToolMissing {
                tool: self.config.gallery_dl_path.clone(),
            })
        }
    }

    pub fn download_dir(&self) -> PathBuf {
        match &self.config.base_path {
            Some(path) => path.clone(),
            None => self.paths.default_download_dir(),
        }
    }

    /// Downloads one gallery. Failures are reported in the result rather
    /// than as errors so batch callers can keep going.
    pub fn download_gallery(
        &self,
        url: &str,
        info: Option<&GalleryInfo>,
        site: &str,
    ) -> DownloadResult {
        let job_id = uuid::Uuid::new_v4().to_string();
        let download_dir = self.download_dir();

        if let Err(e) = std::fs::create_dir_all(&download_dir) {
            return DownloadResult::failed(
                info,
                format!(
                    "failed to create download directory {}: {e}",
                    download_dir.to_string_lossy()
                ),
            );
        }

        let _ = logs::log_line(
            &self.paths,
            &job_id,
            "info",
            "job_started",
            json!({
                "url": logs::redact_url_for_log(url),
                "site": site,
                "title": info.map(|i| i.title.clone()),
            }),
        );

        let config_path = match self.write_job_config(&job_id, &download_dir, info) {
            Ok(path) => path,
            Err(e) => {
                return DownloadResult::failed(
                    info,
                    format!("failed to write gallery-dl config: {e}"),
                )
            }
        };

        let mut command = crate::cmd::command(&self.config.gallery_dl_path);
        command.arg("--config").arg(&config_path);
        if self.config.verbose {
            command.arg("--verbose");
        }
        command.arg(url);

        let run = run_command_output_with_control(&mut command, self.config.job_timeout_secs);
        let _ = std::fs::remove_file(&config_path);

        let output = match run {
            Ok(output) => output,
            Err(CommandRunError::Spawn(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                let _ = logs::log_line(
                    &self.paths,
                    &job_id,
                    "error",
                    "download_failed",
                    json!({"error": "gallery-dl not found"}),
                );
                return DownloadResult::failed(
                    info,
                    "gallery-dl is not installed or not on PATH",
                );
            }
            Err(CommandRunError::Spawn(e)) => {
                return DownloadResult::failed(info, format!("failed to launch gallery-dl: {e}"))
            }
            Err(CommandRunError::Wait(e)) => {
                return DownloadResult::failed(
                    info,
                    format!("failed while waiting for gallery-dl: {e}"),
                )
            }
            Err(CommandRunError::TimedOut(secs)) => {
                let _ = logs::log_line(
                    &self.paths,
                    &job_id,
                    "error",
                    "download_timeout",
                    json!({"timeout_secs": secs}),
                );
                return DownloadResult::failed(info, format!("download timed out after {secs}s"));
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stderr = stderr.trim();
            let message = if stderr.is_empty() {
                format!("gallery-dl exited with code {:?}", output.status.code())
            } else {
                format!(
                    "gallery-dl exited with code {:?}: {stderr}",
                    output.status.code()
                )
            };
            let _ = logs::log_line(
                &self.paths,
                &job_id,
                "error",
                "download_failed",
                json!({"code": output.status.code()}),
            );
            return DownloadResult::failed(info, message);
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let (parsed_dir, files_downloaded) = parse_gallery_dl_output(&stdout);
        let download_path = parsed_dir.or_else(|| {
            info.map(|i| download_dir.join(sanitize_title(&i.title)))
                .filter(|p| p.exists())
        });

        if let (Some(store), Some(gallery), Some(path)) = (&self.history, info, &download_path) {
            if let Err(e) = store.record(gallery, path, files_downloaded as u32, site) {
                let _ = logs::log_line(
                    &self.paths,
                    &job_id,
                    "warn",
                    "history_record_failed",
                    json!({"error": e.to_string()}),
                );
            }
        }

        let _ = logs::log_line(
            &self.paths,
            &job_id,
            "info",
            "download_finished",
            json!({
                "files": files_downloaded,
                "path": download_path.as_ref().map(|p| p.to_string_lossy().to_string()),
            }),
        );

        DownloadResult {
            success: true,
            gallery_info: info.cloned(),
            download_path,
            files_downloaded,
            error_message: None,
        }
    }

    /// Writes the per-job gallery-dl configuration file and returns its path.
    fn write_job_config(
        &self,
        job_id: &str,
        download_dir: &Path,
        info: Option<&GalleryInfo>,
    ) -> Result<PathBuf> {
        let dir = self.paths.gallery_dl_config_dir();
        std::fs::create_dir_all(&dir)?;

        let config = build_gallery_dl_config(&self.config, download_dir, info, self.aria2_available);
        let path = dir.join(format!("{job_id}.json"));
        std::fs::write(&path, format!("{}\n", serde_json::to_string_pretty(&config)?))?;
        Ok(path)
    }
}

fn build_gallery_dl_config(
    config: &DownloadConfig,
    download_dir: &Path,
    info: Option<&GalleryInfo>,
    aria2_available: bool,
) -> serde_json::Value {
    // Without metadata the gallery title is only known to gallery-dl, so the
    // directory template falls back to its own {title} keyword.
    let directory = match info {
        Some(gallery) => json!([sanitize_title(&gallery.title)]),
        None => json!(["{title}"]),
    };

    let mut root = json!({
        "extractor": {
            "base-directory": download_dir.to_string_lossy(),
            "directory": directory,
            "filename": "{filename}.{extension}",
            "retries": config.retry_attempts,
            "sleep": 0.05,
            "sleep-request": 0.05,
            "sleep-extractor": 0.05,
            "timeout": 10,
            "verify": false,
        }
    });
    if config.use_aria2 && aria2_available {
        root["downloader"] = json!({
            "aria2": {
                "cmdline-args": ARIA2_CMDLINE_ARGS,
            }
        });
    }
    root
}

/// Extracts the target directory and downloaded-file count from gallery-dl's
/// stdout. Lines starting with `#` are files that already existed; status and
/// error chatter never looks like a bare image path.
fn parse_gallery_dl_output(stdout: &str) -> (Option<PathBuf>, usize) {
    let mut dir: Option<PathBuf> = None;
    let mut count = 0usize;

    for line in stdout.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let lower = line.to_ascii_lowercase();
        if lower.contains("error") || lower.contains("failed") || lower.contains("skipping") {
            continue;
        }
        if GALLERY_IMAGE_EXTS.iter().any(|ext| lower.ends_with(ext)) {
            count += 1;
            if dir.is_none() {
                dir = Path::new(line).parent().map(Path::to_path_buf);
            }
        }
    }

    (dir, count)
}

/// Replaces characters that are unsafe in directory names and caps the
/// length so deep gallery titles cannot overflow path limits.
pub(crate) fn sanitize_title(title: &str) -> String {
    let cleaned: String = title
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            _ => c,
        })
        .collect();
    let cleaned = cleaned.trim();

    let mut out: String = cleaned.chars().take(200).collect();
    if cleaned.chars().count() > 200 {
        out.push_str("...");
    }
    if out.is_empty() {
        out.push_str("untitled");
    }
    out
}

#[derive(Debug)]
enum CommandRunError {
    Spawn(std::io::Error),
    Wait(std::io::Error),
    TimedOut(u64),
}

fn kill_child_process_tree(child: &mut std::process::Child) {
    #[cfg(windows)]
    {
        let pid = child.id().to_string();
        let _ = crate::cmd::command("taskkill")
            .args(["/PID", &pid, "/T", "/F"])
            .status();
    }

    let _ = child.kill();
    let _ = child.wait();
}

/// Runs a command with piped output, polling so a hung tool can be killed
/// once the timeout elapses. `timeout_secs` of zero disables the timeout.
fn run_command_output_with_control(
    cmd: &mut std::process::Command,
    timeout_secs: u64,
) -> std::result::Result<std::process::Output, CommandRunError> {
    use std::io::ErrorKind;
    use std::process::Stdio;

    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    let mut child = cmd.spawn().map_err(CommandRunError::Spawn)?;

    let mut stdout = child.stdout.take().ok_or_else(|| {
        CommandRunError::Wait(std::io::Error::new(ErrorKind::Other, "stdout pipe missing"))
    })?;
    let mut stderr = child.stderr.take().ok_or_else(|| {
        CommandRunError::Wait(std::io::Error::new(ErrorKind::Other, "stderr pipe missing"))
    })?;

    let stdout_handle = thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = stdout.read_to_end(&mut buf);
        buf
    });
    let stderr_handle = thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = stderr.read_to_end(&mut buf);
        buf
    });

    let started = Instant::now();
    let mut abort_reason: Option<CommandRunError> = None;

    loop {
        if abort_reason.is_none()
            && timeout_secs > 0
            && started.elapsed() >= Duration::from_secs(timeout_secs)
        {
            kill_child_process_tree(&mut child);
            abort_reason = Some(CommandRunError::TimedOut(timeout_secs));
        }

        match child.try_wait() {
            Ok(Some(status)) => {
                let stdout = stdout_handle.join().unwrap_or_default();
                let stderr = stderr_handle.join().unwrap_or_default();
                if let Some(reason) = abort_reason {
                    return Err(reason);
                }
                return Ok(std::process::Output {
                    status,
                    stdout,
                    stderr,
                });
            }
            Ok(None) => {
                thread::sleep(Duration::from_millis(EXTERNAL_CMD_POLL_INTERVAL_MS));
            }
            Err(err) => {
                kill_child_process_tree(&mut child);
                let _ = stdout_handle.join();
                let _ = stderr_handle.join();
                return Err(CommandRunError::Wait(err));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;

    #[test]
    fn parser_counts_image_paths_and_takes_first_parent() {
        let stdout = "\
/downloads/My Gallery/001.webp
/downloads/My Gallery/002.jpg
# /downloads/My Gallery/003.jpg
[warning] HttpError: '503 Service Unavailable'
/downloads/My Gallery/004.PNG
[download][error] Failed to download 005.jpg
/downloads/My Gallery/notes.txt
";
        let (dir, count) = parse_gallery_dl_output(stdout);
        assert_eq!(count, 3);
        assert_eq!(dir, Some(PathBuf::from("/downloads/My Gallery")));
    }

    #[test]
    fn parser_on_chatter_only_finds_nothing() {
        let stdout = "[gallery-dl][info] starting\n\n# /old/already-there.jpg\n";
        let (dir, count) = parse_gallery_dl_output(stdout);
        assert_eq!(count, 0);
        assert!(dir.is_none());
    }

    #[test]
    fn sanitize_replaces_unsafe_characters() {
        assert_eq!(
            sanitize_title(r#"Who: "A/B" <C>?|*\"#),
            "Who_ _A_B_ _C_____"
        );
        assert_eq!(sanitize_title("  padded  "), "padded");
        assert_eq!(sanitize_title("   "), "untitled");
    }

    #[test]
    fn sanitize_caps_length_on_char_boundaries() {
        let long: String = "å".repeat(250);
        let out = sanitize_title(&long);
        assert_eq!(out.chars().count(), 203);
        assert!(out.ends_with("..."));

        let short = sanitize_title("ordinary title");
        assert_eq!(short, "ordinary title");
    }

    #[test]
    fn job_config_includes_aria2_block_only_when_available() {
        let config = AppConfig::default();
        let dir = PathBuf::from("/tmp/downloads");
        let info = GalleryInfo {
            id: "147838".to_string(),
            title: "A/B Test".to_string(),
            url: "https://hentaifox.com/gallery/147838/".to_string(),
            tags: Vec::new(),
            artist: None,
            pages: Some(20),
            description: None,
            thumbnail_url: None,
            metadata: None,
        };

        let with_aria2 = build_gallery_dl_config(&config.download, &dir, Some(&info), true);
        let args = &with_aria2["downloader"]["aria2"]["cmdline-args"];
        assert!(args.is_array());
        assert_eq!(args.as_array().map(Vec::len), Some(ARIA2_CMDLINE_ARGS.len()));
        assert_eq!(
            with_aria2["extractor"]["directory"],
            serde_json::json!(["A_B Test"])
        );
        assert_eq!(with_aria2["extractor"]["retries"], 3);

        let without = build_gallery_dl_config(&config.download, &dir, Some(&info), false);
        assert!(without.get("downloader").is_none());

        let anonymous = build_gallery_dl_config(&config.download, &dir, None, true);
        assert_eq!(
            anonymous["extractor"]["directory"],
            serde_json::json!(["{title}"])
        );
    }

    #[test]
    fn download_dir_prefers_configured_base_path() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let paths = AppPaths::new(tmp.path().to_path_buf());

        let mut config = AppConfig::default();
        config.download.base_path = Some(PathBuf::from("/data/galleries"));
        let downloader = GalleryDownloader::new(paths.clone(), &config);
        assert_eq!(downloader.download_dir(), PathBuf::from("/data/galleries"));

        config.download.base_path = None;
        let downloader = GalleryDownloader::new(paths.clone(), &config);
        assert_eq!(downloader.download_dir(), paths.default_download_dir());
    }
}
