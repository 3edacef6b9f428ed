use crate::remote::{AuthorizedRemote, RemoteError};

/// Name-only existence check against the target directory.
///
/// Size and content are not compared; a same-named entry of any kind counts.
pub async fn already_uploaded(
    remote: &AuthorizedRemote,
    remote_dir: &str,
    file_name: &str,
) -> Result<bool, RemoteError> {
    let listing = remote.list_directory(remote_dir).await?;
    let found = listing.exists && listing.contains_name(file_name);
    if found {
        tracing::info!(remote_dir, file_name, "remote already has a file with this name");
    }
    Ok(found)
}
