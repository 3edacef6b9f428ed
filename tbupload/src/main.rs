use std::io;
use std::path::{Path, PathBuf};

use anyhow::Context;
use tbupload::config::UploadConfig;
use tbupload::provider::ProviderRegistry;
use tbupload::remote::AuthorizedRemote;
use tbupload::upload::{UploadEngine, UploadOutcome};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, PartialEq, Eq)]
enum CliMode {
    Upload { local: PathBuf, remote_dir: String },
    Help,
}

fn parse_cli_mode<I>(args: I) -> anyhow::Result<CliMode>
where
    I: IntoIterator<Item = String>,
{
    let mut positional = Vec::new();
    for arg in args.into_iter().skip(1) {
        match arg.as_str() {
            "--help" | "-h" => return Ok(CliMode::Help),
            other if other.starts_with("--") => anyhow::bail!("unknown argument: {other}"),
            _ => positional.push(arg),
        }
    }
    match <[String; 2]>::try_from(positional) {
        Ok([local, remote_dir]) => Ok(CliMode::Upload {
            local: PathBuf::from(local),
            remote_dir,
        }),
        Err(args) => anyhow::bail!(
            "expected <localFilePath> <remoteTargetPath>, got {} argument(s)",
            args.len()
        ),
    }
}

fn print_usage() {
    println!("Usage: tbupload <localFilePath> <remoteTargetPath>");
    println!("  Uploads a file into a remote directory, resuming interrupted uploads.");
    println!("  The local file is removed once the remote copy is verified.");
}

async fn remove_local(path: &Path) -> anyhow::Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("failed to remove {}", path.display())),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tbupload=info")),
        )
        .with_writer(io::stderr)
        .init();

    let (local, remote_dir) = match parse_cli_mode(std::env::args())? {
        CliMode::Help => {
            print_usage();
            return Ok(());
        }
        CliMode::Upload { local, remote_dir } => (local, remote_dir),
    };

    let config = UploadConfig::from_env();
    let storage = ProviderRegistry::with_defaults()
        .resolve(&config)
        .context("failed to set up storage provider")?;
    let remote = AuthorizedRemote::login(storage)
        .await
        .context("login check failed")?;
    let engine = UploadEngine::new(remote, config.upload_options());

    let outcome = engine
        .upload(&local, &remote_dir)
        .await
        .with_context(|| format!("failed to upload {}", local.display()))?;
    match &outcome {
        UploadOutcome::Skipped { remote_path } => {
            tracing::info!(remote_path = %remote_path, "already on remote, skipped");
        }
        UploadOutcome::Uploaded {
            remote_path,
            sent_chunks,
        } => {
            tracing::info!(remote_path = %remote_path, sent_chunks, "uploaded");
        }
    }
    remove_local(&local).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("tbupload")
            .chain(list.iter().copied())
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn parse_cli_mode_reads_two_paths() {
        let mode = parse_cli_mode(args(&["movie.mkv", "/Videos"])).unwrap();
        assert_eq!(
            mode,
            CliMode::Upload {
                local: PathBuf::from("movie.mkv"),
                remote_dir: "/Videos".into(),
            }
        );
    }

    #[test]
    fn parse_cli_mode_supports_help() {
        assert_eq!(parse_cli_mode(args(&["--help"])).unwrap(), CliMode::Help);
        assert_eq!(
            parse_cli_mode(args(&["a.bin", "-h"])).unwrap(),
            CliMode::Help
        );
    }

    #[test]
    fn parse_cli_mode_rejects_wrong_arity() {
        assert!(parse_cli_mode(args(&[])).is_err());
        assert!(parse_cli_mode(args(&["a.bin"])).is_err());
        assert!(parse_cli_mode(args(&["a.bin", "/Docs", "extra"])).is_err());
    }

    #[test]
    fn parse_cli_mode_rejects_unknown_flags() {
        assert!(parse_cli_mode(args(&["--force", "a.bin", "/Docs"])).is_err());
    }

    #[tokio::test]
    async fn remove_local_ignores_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.bin");
        std::fs::write(&path, b"x").unwrap();

        remove_local(&path).await.unwrap();
        remove_local(&path).await.unwrap();

        assert!(!path.exists());
    }
}
