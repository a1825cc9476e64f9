pub mod args;
pub mod cleaner;

use crate::config::ScraperConfig;
use crate::pipeline::strategy::ScrapePlan;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, warn};

use self::args::{shell_join, split_args};

/// Executable name of the external scraper.
pub const SCRAPER_NAME: &str = "yt-dlp";

/// Always passed: keep going past per-item errors, emit one JSON object per
/// item, never download media.
const FIXED_FLAGS: &[&str] = &[
    "--ignore-errors",
    "--no-warnings",
    "--skip-download",
    "--dump-json",
    "--yes-playlist",
];

/// Places below each ancestor directory where a scraper install is expected.
const CANDIDATE_DIRS: &[&str] = &["", "bin", ".venv/bin"];

// ── Lookup ────────────────────────────────────────────────────────────────────

/// Find the scraper: the configured path, then every ancestor of `start_dir`,
/// then `PATH`.
pub fn locate_executable(config: &ScraperConfig, start_dir: &Path) -> Option<PathBuf> {
    if let Some(path) = &config.binary {
        if is_executable(path) {
            return Some(path.clone());
        }
        warn!("Configured scraper {:?} is not an executable file", path);
        return None;
    }

    for dir in start_dir.ancestors() {
        for sub in CANDIDATE_DIRS {
            let candidate = dir.join(sub).join(SCRAPER_NAME);
            if is_executable(&candidate) {
                debug!("Found scraper at {:?}", candidate);
                return Some(candidate);
            }
        }
    }

    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(SCRAPER_NAME))
        .find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

// ── Invocation ────────────────────────────────────────────────────────────────

/// A fully-resolved scraper command line.
#[derive(Debug, Clone)]
pub struct ScraperInvocation {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl ScraperInvocation {
    pub fn new(program: PathBuf, config: &ScraperConfig, url: &str, plan: &ScrapePlan) -> Self {
        Self {
            program,
            args: build_args(config, url, plan),
        }
    }

    pub fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd
    }

    /// Copy-pasteable shell form, for logs.
    pub fn display(&self) -> String {
        let mut words = vec![self.program.to_string_lossy().into_owned()];
        words.extend(self.args.iter().cloned());
        shell_join(&words)
    }
}

pub fn build_args(config: &ScraperConfig, url: &str, plan: &ScrapePlan) -> Vec<String> {
    let mut args: Vec<String> = FIXED_FLAGS.iter().map(|s| s.to_string()).collect();

    if config.verbose {
        args.push("--verbose".into());
    }
    if let Some(n) = config.max_items {
        args.push("--playlist-end".into());
        args.push(n.to_string());
    }
    if let Some(preset) = config.rate_limit_preset() {
        args.push("-t".into());
        args.push(preset.to_string());
    }
    args.extend(split_args(&config.extra_args));

    if let Some(date) = &plan.date_after {
        args.push("--dateafter".into());
        args.push(date.clone());
    }
    if plan.reverse {
        args.push("--playlist-reverse".into());
    }
    if let Some(archive) = &plan.archive_path {
        if plan.break_on_existing {
            args.push("--break-on-existing".into());
        }
        args.push("--download-archive".into());
        args.push(archive.to_string_lossy().into_owned());
    }

    args.push(url.to_string());
    args
}

#[cfg(test)]
mod tests {
    use super::*;

    fn has_pair(args: &[String], flag: &str, value: &str) -> bool {
        args.windows(2).any(|w| w[0] == flag && w[1] == value)
    }

    #[test]
    fn default_invocation_has_fixed_flags_and_url_last() {
        let cfg = ScraperConfig::default();
        let args = build_args(&cfg, "https://www.youtube.com/@x/", &ScrapePlan::default());
        for flag in FIXED_FLAGS {
            assert!(args.iter().any(|a| a == flag), "missing {flag}");
        }
        assert!(has_pair(&args, "-t", "sleep"));
        assert!(!args.iter().any(|a| a == "--playlist-reverse"));
        assert!(!args.iter().any(|a| a == "--download-archive"));
        assert_eq!(args.last().map(String::as_str), Some("https://www.youtube.com/@x/"));
    }

    #[test]
    fn plan_and_config_options_are_forwarded() {
        let cfg = ScraperConfig {
            verbose: true,
            max_items: Some(40),
            extra_args: "--cookies 'my cookies.txt'".into(),
            rate_limit_preset: Some("off".into()),
            ..ScraperConfig::default()
        };
        let plan = ScrapePlan {
            reverse: true,
            date_after: Some("20240114".into()),
            break_on_existing: true,
            archive_path: Some(PathBuf::from("/tmp/archive.txt")),
        };
        let args = build_args(&cfg, "u", &plan);
        assert!(args.iter().any(|a| a == "--verbose"));
        assert!(has_pair(&args, "--playlist-end", "40"));
        assert!(has_pair(&args, "--cookies", "my cookies.txt"));
        assert!(has_pair(&args, "--dateafter", "20240114"));
        assert!(has_pair(&args, "--download-archive", "/tmp/archive.txt"));
        assert!(args.iter().any(|a| a == "--playlist-reverse"));
        assert!(args.iter().any(|a| a == "--break-on-existing"));
        assert!(!args.iter().any(|a| a == "-t"));
    }

    #[test]
    fn early_stop_requires_an_archive() {
        let plan = ScrapePlan {
            break_on_existing: true,
            ..ScrapePlan::default()
        };
        let args = build_args(&ScraperConfig::default(), "u", &plan);
        assert!(!args.iter().any(|a| a == "--break-on-existing"));
    }

    #[cfg(unix)]
    #[test]
    fn lookup_walks_ancestor_directories() {
        use std::os::unix::fs::PermissionsExt;

        let root = tempfile::tempdir().unwrap();
        let bin = root.path().join("bin");
        std::fs::create_dir_all(&bin).unwrap();
        let exe = bin.join(SCRAPER_NAME);
        std::fs::write(&exe, "#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&exe, std::fs::Permissions::from_mode(0o755)).unwrap();
        let nested = root.path().join("a/b/c");
        std::fs::create_dir_all(&nested).unwrap();

        let found = locate_executable(&ScraperConfig::default(), &nested);
        assert_eq!(found, Some(exe.clone()));

        let configured = ScraperConfig {
            binary: Some(root.path().join("missing")),
            ..ScraperConfig::default()
        };
        assert_eq!(locate_executable(&configured, &nested), None);
    }
}
