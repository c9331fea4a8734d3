use std::{
    io::{Cursor, Read},
    path::Path,
    sync::Arc,
};

use async_trait::async_trait;
use bytes::Bytes;

use crate::{
    config::{STAGING_DIR, UNPRIVILEGED_USER},
    runtime::{Container, ProcessSpec, StreamInSpec, StreamOutSpec},
    ResultExt, WardenCpiError, WardenCpiResult,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

const PRIVILEGED_USER: &str = "root";

// Paths are passed as positional arguments, never spliced into the script text.
const PROMOTE_SCRIPT: &str = r#"mv "$1" "$2""#;

const STAGE_SCRIPT: &str = r#"cp "$1" "$2" && chown "$3:$3" "$2""#;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Moves files across the privilege boundary of a container.
///
/// Uploads are streamed into a staging directory the unprivileged streaming user can write to,
/// then promoted to their final root-owned location by a privileged script. Downloads run the
/// same two steps in reverse.
pub struct ContainerFileService {
    container: Arc<dyn Container>,
}

//--------------------------------------------------------------------------------------------------
// Traits
//--------------------------------------------------------------------------------------------------

/// Reads and writes whole files inside a container.
#[async_trait]
pub trait FileService: Send + Sync {
    /// Writes `contents` to the absolute `path`, replacing any existing file.
    async fn upload(&self, path: &str, contents: Bytes) -> WardenCpiResult<()>;

    /// Reads the file at the absolute `path`.
    async fn download(&self, path: &str) -> WardenCpiResult<Bytes>;
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ContainerFileService {
    /// Creates a file service for `container`.
    pub fn new(container: Arc<dyn Container>) -> Self {
        Self { container }
    }

    async fn run_privileged_script(&self, script: &str, args: &[&str]) -> WardenCpiResult<()> {
        let mut process_args = vec!["-c".to_string(), script.to_string(), "_".to_string()];
        process_args.extend(args.iter().map(|a| a.to_string()));

        let spec = ProcessSpec::builder()
            .path("bash")
            .args(process_args)
            .user(PRIVILEGED_USER)
            .build();

        let mut process = self.container.run(spec).await.context("Running script")?;
        let output = process.wait().await.context("Waiting for script")?;

        if output.exit_code != 0 {
            return Err(WardenCpiError::ScriptFailed {
                exit_code: output.exit_code,
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }

        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl FileService for ContainerFileService {
    async fn upload(&self, path: &str, contents: Bytes) -> WardenCpiResult<()> {
        tracing::debug!(handle = %self.container.handle(), path, "uploading file");

        let file_name = file_name(path)?;
        let staged_path = staged_path(file_name);

        let tar_stream = single_file_tar(file_name, &contents).context("Creating tar")?;

        let spec = StreamInSpec::builder()
            .path(format!("{STAGING_DIR}/"))
            .user(PRIVILEGED_USER)
            .tar_stream(tar_stream)
            .build();

        self.container
            .stream_in(spec)
            .await
            .context("Streaming in tar")?;

        self.run_privileged_script(PROMOTE_SCRIPT, &[&staged_path, path])
            .await
            .with_context(|| format!("Moving temporary file to destination '{path}'"))
    }

    async fn download(&self, path: &str) -> WardenCpiResult<Bytes> {
        tracing::debug!(handle = %self.container.handle(), path, "downloading file");

        let file_name = file_name(path)?;
        let staged_path = staged_path(file_name);

        self.run_privileged_script(STAGE_SCRIPT, &[path, &staged_path, UNPRIVILEGED_USER])
            .await
            .context("Running copy source file script")?;

        let spec = StreamOutSpec::builder()
            .path(staged_path.as_str())
            .user(PRIVILEGED_USER)
            .build();

        let tar_stream = self
            .container
            .stream_out(spec)
            .await
            .with_context(|| format!("Streaming out file '{file_name}'"))?;

        first_tar_entry(tar_stream).map_err(|source| WardenCpiError::InvalidTarStream {
            path: path.to_string(),
            source,
        })
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn file_name(path: &str) -> WardenCpiResult<&str> {
    Path::new(path)
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| WardenCpiError::custom(anyhow::anyhow!("'{path}' does not name a file")))
}

fn staged_path(file_name: &str) -> String {
    format!("{STAGING_DIR}/{file_name}")
}

fn single_file_tar(file_name: &str, contents: &[u8]) -> std::io::Result<Bytes> {
    let mut header = tar::Header::new_gnu();
    header.set_size(contents.len() as u64);
    header.set_mode(0o640);

    let mut builder = tar::Builder::new(Vec::new());
    builder.append_data(&mut header, file_name, contents)?;

    Ok(Bytes::from(builder.into_inner()?))
}

fn first_tar_entry(tar_stream: Bytes) -> std::io::Result<Bytes> {
    let mut archive = tar::Archive::new(Cursor::new(tar_stream));
    let mut entry = archive.entries()?.next().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "tar stream has no entries")
    })??;

    let mut contents = Vec::new();
    entry.read_to_end(&mut contents)?;

    Ok(Bytes::from(contents))
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
