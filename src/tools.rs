use crate::config::DownloadConfig;
use serde::Serialize;

/// Probe result for the gallery-dl executable named in the config.
#[derive(Debug, Clone, Serialize)]
pub struct GalleryDlStatus {
    pub available: bool,
    pub path: String,
    pub version: Option<String>,
}

pub fn gallery_dl_status(config: &DownloadConfig) -> GalleryDlStatus {
    let version = tool_version_first_line(&config.gallery_dl_path, "--version");
    GalleryDlStatus {
        available: version.is_some(),
        path: config.gallery_dl_path.clone(),
        version,
    }
}

/// Probe result for the optional aria2c accelerator.
#[derive(Debug, Clone, Serialize)]
pub struct Aria2Status {
    pub available: bool,
    pub path: String,
    pub version: Option<String>,
}

pub fn aria2_status(config: &DownloadConfig) -> Aria2Status {
    let version = tool_version_first_line(&config.aria2_path, "--version");
    Aria2Status {
        available: version.is_some(),
        path: config.aria2_path.clone(),
        version,
    }
}

fn tool_version_first_line(program: &str, arg: &str) -> Option<String> {
    let output = crate::cmd::command(program).arg(arg).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout);
    let first = text.lines().next()?.trim();
    if first.is_empty() {
        None
    } else {
        Some(first.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_executable_probes_as_unavailable() {
        let mut config = DownloadConfig::default();
        config.gallery_dl_path = "definitely-not-a-real-tool-9f2c".to_string();
        config.aria2_path = "definitely-not-a-real-tool-9f2c".to_string();

        let gallery_dl = gallery_dl_status(&config);
        assert!(!gallery_dl.available);
        assert!(gallery_dl.version.is_none());

        let aria2 = aria2_status(&config);
        assert!(!aria2.available);
        assert!(aria2.version.is_none());
    }

    #[cfg(unix)]
    #[test]
    fn stub_executable_reports_its_version_line() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().expect("tempdir");
        let stub = dir.path().join("gallery-dl");
        std::fs::write(&stub, "#!/bin/sh\necho '1.27.5'\n").expect("write stub");
        std::fs::set_permissions(&stub, std::fs::Permissions::from_mode(0o755))
            .expect("chmod stub");

        let mut config = DownloadConfig::default();
        config.gallery_dl_path = stub.to_string_lossy().to_string();

        let status = gallery_dl_status(&config);
        assert!(status.available);
        assert_eq!(status.version.as_deref(), Some("1.27.5"));
    }
}
