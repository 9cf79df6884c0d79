use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "apkzoo")]
#[command(about = "Download packages from the AndroZoo archive and search its index", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Download packages by SHA-256
    Download(DownloadArgs),
    /// Refresh the local catalog from the remote index
    Sync(SyncArgs),
    /// Search the local catalog by package name
    Search(SearchArgs),
    /// Show the mirrored Google Play metadata of a package
    Metadata(MetadataArgs),
}

#[derive(clap::Args, Debug)]
pub struct DownloadArgs {
    /// Package hashes to download
    pub hashes: Vec<String>,

    /// Also download every catalog entry whose package name contains this
    #[arg(long)]
    pub search: Option<String>,

    /// Parallel downloads (overrides queue.concurrency)
    #[arg(long)]
    pub concurrency: Option<usize>,
}

#[derive(clap::Args, Debug)]
pub struct SyncArgs {
    /// Sync even if the index has not changed
    #[arg(long)]
    pub force: bool,

    /// Sync the Google Play metadata dump instead of the package index
    #[arg(long)]
    pub metadata: bool,
}

#[derive(clap::Args, Debug)]
pub struct SearchArgs {
    /// Substring of the package name (case-insensitive)
    pub name: String,

    /// Print one JSON object per match
    #[arg(long)]
    pub json: bool,
}

#[derive(clap::Args, Debug)]
pub struct MetadataArgs {
    /// Exact package name, e.g. `com.example.app`
    pub package: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_download() {
        let cli = Cli::try_parse_from(["apkzoo", "download", "AA", "BB", "--concurrency", "4"]).unwrap();
        match cli.command {
            Commands::Download(args) => {
                assert_eq!(args.hashes, vec!["AA", "BB"]);
                assert_eq!(args.concurrency, Some(4));
                assert!(args.search.is_none());
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_parse_sync_and_search() {
        let cli = Cli::try_parse_from(["apkzoo", "sync", "--force"]).unwrap();
        assert!(matches!(cli.command, Commands::Sync(SyncArgs { force: true, metadata: false })));

        let cli = Cli::try_parse_from(["apkzoo", "sync", "--metadata"]).unwrap();
        assert!(matches!(cli.command, Commands::Sync(SyncArgs { force: false, metadata: true })));

        let cli = Cli::try_parse_from(["apkzoo", "search", "google", "--json"]).unwrap();
        assert!(matches!(cli.command, Commands::Search(SearchArgs { ref name, json: true }) if name == "google"));
    }

    #[test]
    fn test_parse_metadata() {
        let cli = Cli::try_parse_from(["apkzoo", "metadata", "com.example.app"]).unwrap();
        assert!(matches!(cli.command, Commands::Metadata(MetadataArgs { ref package }) if package == "com.example.app"));

        assert!(Cli::try_parse_from(["apkzoo", "metadata"]).is_err());
    }
}
