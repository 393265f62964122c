#![cfg(unix)]

use hfox_engine::batch::{BatchOptions, BatchOrchestrator, ProgressEvent};
use hfox_engine::config::AppConfig;
use hfox_engine::history::HistoryStore;
use hfox_engine::paths::AppPaths;
use hfox_engine::site::{GalleryInfo, SearchResult, SiteProvider};
use std::io::Read;
use std::path::{Path, PathBuf};

struct StubProvider;

impl SiteProvider for StubProvider {
    fn name(&self) -> &str {
        "hentaifox"
    }

    fn is_valid_url(&self, url: &str) -> bool {
        url.contains("hentaifox.com")
    }

    fn extract_gallery_id(&self, url: &str) -> Option<String> {
        let marker = "/gallery/";
        let start = url.find(marker)? + marker.len();
        let digits: String = url[start..]
            .chars()
            .take_while(|c| c.is_ascii_digit())
            .collect();
        if digits.is_empty() {
            None
        } else {
            Some(digits)
        }
    }

    fn gallery_info(&self, url: &str) -> Option<GalleryInfo> {
        let id = self.extract_gallery_id(url)?;
        Some(GalleryInfo {
            id: id.clone(),
            title: format!("Stub Gallery {id}"),
            url: url.to_string(),
            tags: vec!["color".to_string()],
            artist: Some("somebody".to_string()),
            pages: Some(3),
            description: None,
            thumbnail_url: None,
            metadata: Some(serde_json::json!({"source": "stub"})),
        })
    }

    fn search(&self, _query: &str, _page: u32) -> Option<SearchResult> {
        None
    }

    fn tag_galleries(&self, _tag: &str, _page: u32) -> Option<SearchResult> {
        None
    }
}

fn write_stub_gallery_dl(dir: &Path, downloads: &Path) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let script = format!(
        r#"#!/bin/sh
if [ "$1" = "--version" ]; then
  echo "1.27.5"
  exit 0
fi
for a in "$@"; do last="$a"; done
name=$(basename "$last")
out="{downloads}/Stub Gallery $name"
mkdir -p "$out"
for n in 001 002 003; do
  printf 'fake-image-%s' "$n" > "$out/$n.jpg"
  echo "$out/$n.jpg"
done
"#,
        downloads = downloads.to_string_lossy()
    );

    let path = dir.join("gallery-dl-stub");
    std::fs::write(&path, script).expect("write stub");
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).expect("chmod stub");
    path
}

fn read_all_job_logs(paths: &AppPaths) -> String {
    let mut combined = String::new();
    if let Ok(entries) = std::fs::read_dir(paths.job_logs_dir()) {
        for entry in entries.flatten() {
            if let Ok(text) = std::fs::read_to_string(entry.path()) {
                combined.push_str(&text);
            }
        }
    }
    combined
}

#[test]
fn batch_downloads_convert_and_land_in_history() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let downloads = tmp.path().join("downloads");
    std::fs::create_dir_all(&downloads).expect("downloads dir");
    let stub = write_stub_gallery_dl(tmp.path(), &downloads);
    let paths = AppPaths::new(tmp.path().join("app"));

    let mut config = AppConfig::default();
    config.download.gallery_dl_path = stub.to_string_lossy().to_string();
    config.download.use_aria2 = false;
    config.download.base_path = Some(downloads.clone());
    config.conversion.auto_convert = true;
    config.conversion.default_format = "cbz".to_string();

    let orchestrator = BatchOrchestrator::new(paths.clone(), config.clone());
    let (sender, receiver) = std::sync::mpsc::sync_channel(16);
    let urls = vec![
        "https://hentaifox.com/gallery/147838/".to_string(),
        "https://hentaifox.com/gallery/251004/".to_string(),
    ];
    let options = BatchOptions {
        progress: Some(sender),
        ..BatchOptions::default()
    };

    let outcomes = orchestrator
        .run_batch(&StubProvider, &urls, &options)
        .expect("batch runs");
    drop(options);

    assert_eq!(outcomes.len(), 2);
    for outcome in &outcomes {
        assert!(
            outcome.download.success,
            "download failed: {:?}",
            outcome.download.error_message
        );
        assert_eq!(outcome.download.files_downloaded, 3);

        let gallery_dir = outcome
            .download
            .download_path
            .as_ref()
            .expect("download path");
        assert!(gallery_dir.starts_with(&downloads));

        let conversion = outcome.conversion.as_ref().expect("conversion ran");
        assert!(
            conversion.success,
            "conversion failed: {:?}",
            conversion.error_message
        );
        let archive = conversion.output_path.as_ref().expect("archive path");
        assert!(archive.exists());
        assert_eq!(archive.extension().and_then(|e| e.to_str()), Some("cbz"));

        let file = std::fs::File::open(archive).expect("open cbz");
        let mut zip = zip::ZipArchive::new(file).expect("read cbz");
        assert_eq!(zip.len(), 3);
        let mut first = zip.by_name("001.jpg").expect("first entry");
        let mut bytes = Vec::new();
        first.read_to_end(&mut bytes).expect("read entry");
        assert_eq!(bytes, b"fake-image-001");
    }

    // Both galleries are in history with their metadata intact.
    let history = HistoryStore::new(paths.clone(), &config.history);
    assert!(history.exists("147838", "hentaifox").expect("exists"));
    assert!(history.exists("251004", "hentaifox").expect("exists"));

    let stats = history.stats().expect("stats");
    assert_eq!(stats.total_downloads, 2);
    assert_eq!(stats.total_files, 6);
    assert_eq!(stats.by_site.get("hentaifox"), Some(&2));

    let recent = history.recent(10).expect("recent");
    assert_eq!(recent.len(), 2);
    assert!(recent
        .iter()
        .all(|entry| entry.metadata.as_ref().is_some_and(|m| m["source"] == "stub")));

    // Progress reached the receiver and the batch was logged.
    let events: Vec<ProgressEvent> = receiver.iter().collect();
    assert_eq!(events.len(), 2);
    assert!(events.iter().any(|e| e.completed == 2 && e.total == 2));

    let logs = read_all_job_logs(&paths);
    assert!(logs.contains("download_finished"), "logs: {logs}");
    assert!(logs.contains("batch_started"));
    assert!(logs.contains("batch_finished"));
}

#[test]
fn rerunning_a_batch_does_not_duplicate_history() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let downloads = tmp.path().join("downloads");
    std::fs::create_dir_all(&downloads).expect("downloads dir");
    let stub = write_stub_gallery_dl(tmp.path(), &downloads);
    let paths = AppPaths::new(tmp.path().join("app"));

    let mut config = AppConfig::default();
    config.download.gallery_dl_path = stub.to_string_lossy().to_string();
    config.download.use_aria2 = false;
    config.download.base_path = Some(downloads);

    let orchestrator = BatchOrchestrator::new(paths.clone(), config.clone());
    let urls = vec!["https://hentaifox.com/gallery/147838/".to_string()];

    for _ in 0..2 {
        let results = orchestrator
            .run_many(&StubProvider, &urls)
            .expect("batch runs");
        assert!(results[0].success);
    }

    let history = HistoryStore::new(paths, &config.history);
    let stats = history.stats().expect("stats");
    assert_eq!(stats.total_downloads, 1);
}
