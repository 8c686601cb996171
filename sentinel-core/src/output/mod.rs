//! Output artifact writer.
//!
//! Artifacts are JSON Lines: one `header` line, then per table a `table`
//! line, its `row` lines, and a `table_end` line. Each table is staged in a
//! scratch file and appended to the artifact only when it completes, so a
//! failed table contributes nothing. The finished artifact is optionally
//! zstd-compressed (`.zst`) and then encrypted (`.enc`), and renamed from its
//! `.partial` name into place only at the very end.

use crate::{Result, SentinelError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::borrow::Cow;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};

#[cfg(feature = "encryption")]
pub mod encryption;

/// Version written into every artifact header.
pub const FORMAT_VERSION: u32 = 1;

/// zstd level for compressed artifacts.
pub const COMPRESSION_LEVEL: i32 = 3;

/// One line of an artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ArtifactLine<'a> {
    Header {
        format_version: u32,
        job_id: Cow<'a, str>,
        sync_config_id: Cow<'a, str>,
        generated_at: DateTime<Utc>,
    },
    Table {
        /// Qualified source table
        source: Cow<'a, str>,
        /// Output table name
        target: Cow<'a, str>,
        /// Output column names, in value order
        columns: Cow<'a, [String]>,
    },
    Row {
        table: Cow<'a, str>,
        values: Cow<'a, [Value]>,
    },
    TableEnd {
        table: Cow<'a, str>,
        rows: u64,
    },
}

/// Where and how to write one artifact.
#[derive(Debug, Clone)]
pub struct ArtifactOptions {
    pub directory: PathBuf,
    pub file_name: String,
    pub compress: bool,
    /// Present when the artifact must be encrypted
    pub passphrase: Option<crate::config::SecretString>,
}

impl ArtifactOptions {
    /// File name after the compression and encryption suffixes.
    pub fn final_file_name(&self) -> String {
        let mut name = self.file_name.clone();
        if self.compress {
            name.push_str(".zst");
        }
        if self.passphrase.is_some() {
            name.push_str(".enc");
        }
        name
    }

    /// Path the finished artifact is renamed to.
    pub fn final_path(&self) -> PathBuf {
        self.directory.join(self.final_file_name())
    }
}

/// Location and size of a finished artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactInfo {
    pub path: PathBuf,
    pub size: u64,
}

struct TableSection {
    target: String,
    path: PathBuf,
    out: BufWriter<File>,
    rows: u64,
}

/// Streaming writer for one run's artifact.
pub struct ArtifactWriter {
    options: ArtifactOptions,
    partial_path: PathBuf,
    out: BufWriter<File>,
    section: Option<TableSection>,
}

impl std::fmt::Debug for ArtifactWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactWriter")
            .field("partial_path", &self.partial_path)
            .field("table", &self.section.as_ref().map(|s| &s.target))
            .finish_non_exhaustive()
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

async fn write_line(out: &mut BufWriter<File>, line: &ArtifactLine<'_>) -> Result<()> {
    let mut bytes = serde_json::to_vec(line)
        .map_err(|e| SentinelError::serialization("Failed to encode artifact line", e))?;
    bytes.push(b'\n');
    out.write_all(&bytes)
        .await
        .map_err(|e| SentinelError::io("Failed to write artifact", e))
}

impl ArtifactWriter {
    /// Creates the output directory and the `.partial` file and writes the
    /// header.
    ///
    /// # Errors
    /// Returns `UnsupportedFeature` when a requested stage is compiled out,
    /// and I/O errors from the filesystem.
    pub async fn create(options: ArtifactOptions, job_id: &str, sync_config_id: &str) -> Result<Self> {
        #[cfg(not(feature = "compression"))]
        if options.compress {
            return Err(SentinelError::unsupported_feature(
                "Compressed artifacts",
                "Compile with --features compression to enable zstd output",
            ));
        }
        #[cfg(not(feature = "encryption"))]
        if options.passphrase.is_some() {
            return Err(SentinelError::unsupported_feature(
                "Encrypted artifacts",
                "Compile with --features encryption to enable encrypted output",
            ));
        }

        tokio::fs::create_dir_all(&options.directory)
            .await
            .map_err(|e| {
                SentinelError::io(
                    format!(
                        "Failed to create output directory {}",
                        options.directory.display()
                    ),
                    e,
                )
            })?;

        let partial_path = with_suffix(&options.directory.join(&options.file_name), ".partial");
        let file = File::create(&partial_path).await.map_err(|e| {
            SentinelError::io(format!("Failed to create {}", partial_path.display()), e)
        })?;
        let mut out = BufWriter::new(file);
        write_line(
            &mut out,
            &ArtifactLine::Header {
                format_version: FORMAT_VERSION,
                job_id: Cow::Borrowed(job_id),
                sync_config_id: Cow::Borrowed(sync_config_id),
                generated_at: Utc::now(),
            },
        )
        .await?;

        Ok(Self {
            options,
            partial_path,
            out,
            section: None,
        })
    }

    /// Starts a table section. Any unfinished section is discarded.
    ///
    /// # Errors
    /// Returns I/O errors from the scratch file.
    pub async fn begin_table(&mut self, source: &str, target: &str, columns: &[String]) -> Result<()> {
        self.abort_table().await;

        let path = with_suffix(&self.partial_path, ".table");
        let file = File::create(&path)
            .await
            .map_err(|e| SentinelError::io(format!("Failed to create {}", path.display()), e))?;
        let mut out = BufWriter::new(file);
        write_line(
            &mut out,
            &ArtifactLine::Table {
                source: Cow::Borrowed(source),
                target: Cow::Borrowed(target),
                columns: Cow::Borrowed(columns),
            },
        )
        .await?;

        self.section = Some(TableSection {
            target: target.to_string(),
            path,
            out,
            rows: 0,
        });
        Ok(())
    }

    /// Writes one masked, projected row to the open table section.
    ///
    /// # Errors
    /// Returns an output error when no section is open.
    pub async fn write_row(&mut self, values: &[Value]) -> Result<()> {
        let section = self
            .section
            .as_mut()
            .ok_or_else(|| SentinelError::output("Row written outside a table section"))?;
        write_line(
            &mut section.out,
            &ArtifactLine::Row {
                table: Cow::Borrowed(&section.target),
                values: Cow::Borrowed(values),
            },
        )
        .await?;
        section.rows = section.rows.saturating_add(1);
        Ok(())
    }

    /// Closes the open section and appends it to the artifact. Returns the
    /// section's row count.
    ///
    /// # Errors
    /// Returns an output error when no section is open, or I/O errors.
    pub async fn commit_table(&mut self) -> Result<u64> {
        let mut section = self
            .section
            .take()
            .ok_or_else(|| SentinelError::output("No table section to commit"))?;
        write_line(
            &mut section.out,
            &ArtifactLine::TableEnd {
                table: Cow::Borrowed(&section.target),
                rows: section.rows,
            },
        )
        .await?;
        section
            .out
            .flush()
            .await
            .map_err(|e| SentinelError::io("Failed to flush table section", e))?;
        drop(section.out);

        let mut scratch = File::open(&section.path)
            .await
            .map_err(|e| SentinelError::io("Failed to reopen table section", e))?;
        tokio::io::copy(&mut scratch, &mut self.out)
            .await
            .map_err(|e| SentinelError::io("Failed to append table section", e))?;
        remove_quietly(&section.path).await;
        Ok(section.rows)
    }

    /// Drops the open section, if any, without touching the artifact.
    pub async fn abort_table(&mut self) {
        if let Some(section) = self.section.take() {
            drop(section.out);
            remove_quietly(&section.path).await;
        }
    }

    /// Flushes, applies the compression and encryption stages, and renames
    /// the artifact into place.
    ///
    /// # Errors
    /// Returns I/O, compression, or encryption errors. Scratch files are
    /// removed either way.
    pub async fn finish(mut self) -> Result<ArtifactInfo> {
        self.abort_table().await;
        let result = self.finalize().await;
        if result.is_err() {
            self.cleanup().await;
        }
        result
    }

    async fn finalize(&mut self) -> Result<ArtifactInfo> {
        self.out
            .flush()
            .await
            .map_err(|e| SentinelError::io("Failed to flush artifact", e))?;
        self.out
            .get_mut()
            .sync_all()
            .await
            .map_err(|e| SentinelError::io("Failed to sync artifact", e))?;

        #[allow(unused_mut)]
        let mut staged = self.partial_path.clone();

        #[cfg(feature = "compression")]
        if self.options.compress {
            let compressed = with_suffix(&self.partial_path, ".zst");
            compress_file(staged.clone(), compressed.clone()).await?;
            remove_quietly(&staged).await;
            staged = compressed;
        }

        #[cfg(feature = "encryption")]
        if let Some(passphrase) = &self.options.passphrase {
            let encrypted = with_suffix(&self.partial_path, ".enc");
            encrypt_file(staged.clone(), encrypted.clone(), passphrase.clone()).await?;
            remove_quietly(&staged).await;
            staged = encrypted;
        }

        let final_path = self.options.final_path();
        tokio::fs::rename(&staged, &final_path).await.map_err(|e| {
            SentinelError::io(
                format!("Failed to move artifact into {}", final_path.display()),
                e,
            )
        })?;
        let size = tokio::fs::metadata(&final_path)
            .await
            .map_err(|e| SentinelError::io("Failed to stat artifact", e))?
            .len();

        tracing::info!("Wrote artifact {} ({} bytes)", final_path.display(), size);
        Ok(ArtifactInfo {
            path: final_path,
            size,
        })
    }

    /// Deletes every file this writer created. Used for cancelled runs.
    pub async fn discard(mut self) {
        self.abort_table().await;
        self.cleanup().await;
    }

    async fn cleanup(&mut self) {
        for suffix in ["", ".zst", ".enc"] {
            remove_quietly(&with_suffix(&self.partial_path, suffix)).await;
        }
    }
}

async fn remove_quietly(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!("Failed to remove {}: {}", path.display(), e),
    }
}

#[cfg(feature = "compression")]
async fn compress_file(source: PathBuf, target: PathBuf) -> Result<()> {
    tokio::task::spawn_blocking(move || {
        let input = std::fs::File::open(&source)?;
        let output = std::fs::File::create(&target)?;
        zstd::stream::copy_encode(input, output, COMPRESSION_LEVEL)
    })
    .await
    .map_err(|e| SentinelError::output(format!("Compression task failed: {e}")))?
    .map_err(|e| SentinelError::io("Failed to compress artifact", e))
}

#[cfg(feature = "encryption")]
async fn encrypt_file(
    source: PathBuf,
    target: PathBuf,
    passphrase: crate::config::SecretString,
) -> Result<()> {
    tokio::task::spawn_blocking(move || {
        let data = std::fs::read(&source)
            .map_err(|e| SentinelError::io("Failed to read artifact for encryption", e))?;
        let sealed = encryption::encrypt_data(&data, passphrase.expose())?;
        let bytes = serde_json::to_vec(&sealed)
            .map_err(|e| SentinelError::serialization("Failed to encode encrypted artifact", e))?;
        std::fs::write(&target, bytes)
            .map_err(|e| SentinelError::io("Failed to write encrypted artifact", e))
    })
    .await
    .map_err(|e| SentinelError::output(format!("Encryption task failed: {e}")))?
}

/// Reads an artifact back, undoing encryption and compression based on its
/// file suffixes.
///
/// # Errors
/// Returns an error when a stage cannot be undone (missing passphrase,
/// compiled-out feature, corrupt data) or a line does not parse.
pub async fn read_artifact(
    path: &Path,
    passphrase: Option<&str>,
) -> Result<Vec<ArtifactLine<'static>>> {
    let mut data = tokio::fs::read(path)
        .await
        .map_err(|e| SentinelError::io(format!("Failed to read {}", path.display()), e))?;
    let mut name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();

    if let Some(stripped) = name.strip_suffix(".enc") {
        #[cfg(feature = "encryption")]
        {
            let passphrase = passphrase.ok_or_else(|| {
                SentinelError::configuration("Encrypted artifact requires a passphrase")
            })?;
            let sealed: encryption::EncryptedData = serde_json::from_slice(&data)
                .map_err(|e| SentinelError::serialization("Invalid encrypted artifact", e))?;
            data = encryption::decrypt_data(&sealed, passphrase)?;
        }
        #[cfg(not(feature = "encryption"))]
        {
            let _ = passphrase;
            return Err(SentinelError::unsupported_feature(
                "Encrypted artifacts",
                "Compile with --features encryption to read encrypted output",
            ));
        }
        name = stripped.to_string();
    }

    if name.ends_with(".zst") {
        #[cfg(feature = "compression")]
        {
            data = zstd::stream::decode_all(data.as_slice())
                .map_err(|e| SentinelError::io("Failed to decompress artifact", e))?;
        }
        #[cfg(not(feature = "compression"))]
        return Err(SentinelError::unsupported_feature(
            "Compressed artifacts",
            "Compile with --features compression to read zstd output",
        ));
    }

    data.split(|b| *b == b'\n')
        .filter(|line| !line.is_empty())
        .map(|line| {
            serde_json::from_slice(line)
                .map_err(|e| SentinelError::serialization("Invalid artifact line", e))
        })
        .collect()
}
