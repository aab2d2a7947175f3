//! CLI argument definitions.

use std::path::PathBuf;

use clap::Parser;

/// Concurrent media downloader: queue, scheduler, engines.
#[derive(Debug, Parser)]
#[command(name = "mediafetch", version, about)]
pub struct Args {
    /// URLs to download; reads stdin when omitted.
    pub urls: Vec<String>,

    /// Output directory (defaults to the configured one).
    #[arg(short, long)]
    pub output_dir: Option<PathBuf>,

    /// Maximum concurrent downloads (1-32).
    #[arg(short = 'j', long)]
    pub concurrency: Option<usize>,

    /// Rate limit per download, e.g. 5M or 500K.
    #[arg(long)]
    pub rate_limit: Option<String>,

    /// Proxy URL (http, https, or socks5).
    #[arg(long)]
    pub proxy: Option<String>,

    /// Skip site handlers and page scraping; fetch URLs as-is.
    #[arg(long)]
    pub force_generic: bool,

    /// Config file path.
    #[arg(long, default_value = "mediafetch.json")]
    pub config: PathBuf,

    /// History database path.
    #[arg(long, default_value = "mediafetch-history.db")]
    pub history_db: PathBuf,

    /// Disable the progress spinner.
    #[arg(long)]
    pub no_spinner: bool,

    /// Increase log verbosity (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Only log errors.
    #[arg(short, long)]
    pub quiet: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_defaults() {
        let args = Args::parse_from(["mediafetch"]);
        assert!(args.urls.is_empty());
        assert!(!args.force_generic);
        assert_eq!(args.config, PathBuf::from("mediafetch.json"));
    }

    #[test]
    fn test_parse_urls_and_flags() {
        let args = Args::parse_from([
            "mediafetch",
            "-j",
            "4",
            "--rate-limit",
            "5M",
            "https://example.com/a.mp4",
            "https://example.com/b.mp4",
        ]);
        assert_eq!(args.urls.len(), 2);
        assert_eq!(args.concurrency, Some(4));
        assert_eq!(args.rate_limit.as_deref(), Some("5M"));
    }
}
