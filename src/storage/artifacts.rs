use std::collections::BTreeSet;
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use tokio::io::{AsyncRead, AsyncWriteExt};

use crate::models::ArtifactRef;
use crate::storage::{Artifact, ArtifactMeta, ArtifactReader, ArtifactStore};

const META_SUFFIX: &str = ".meta.json";

/// Filesystem artifact store.
///
/// Layout: `{root}/{shard}/{ref}` holds the bytes and `{ref}.meta.json` the
/// content type and length, where `shard` is the last two characters of the
/// ref. Both files are written under `{root}/tmp` and renamed into place,
/// data first. An artifact is visible only once its metadata exists.
pub struct FsArtifactStore {
    root: PathBuf,
    tmp_dir: PathBuf,
}

impl FsArtifactStore {
    /// Create the store, discarding temp files left by an interrupted write.
    pub async fn new(root: PathBuf) -> Result<Self> {
        let tmp_dir = root.join("tmp");
        if tmp_dir.exists() {
            tokio::fs::remove_dir_all(&tmp_dir)
                .await
                .context("Failed to clear artifact temp directory")?;
        }
        tokio::fs::create_dir_all(&tmp_dir)
            .await
            .context("Failed to create artifact directory")?;
        Ok(Self { root, tmp_dir })
    }

    fn shard_dir(&self, artifact: &ArtifactRef) -> PathBuf {
        let s = artifact.as_str();
        self.root.join(&s[s.len() - 2..])
    }

    fn data_path(&self, artifact: &ArtifactRef) -> PathBuf {
        self.shard_dir(artifact).join(artifact.as_str())
    }

    fn meta_path(&self, artifact: &ArtifactRef) -> PathBuf {
        self.shard_dir(artifact)
            .join(format!("{}{}", artifact.as_str(), META_SUFFIX))
    }

    async fn read_meta(&self, artifact: &ArtifactRef) -> Result<Option<ArtifactMeta>> {
        match tokio::fs::read(self.meta_path(artifact)).await {
            Ok(raw) => {
                let meta = serde_json::from_slice(&raw)
                    .with_context(|| format!("Corrupted metadata for artifact {}", artifact))?;
                Ok(Some(meta))
            }
            Err(e) if e.kind() == IoErrorKind::NotFound => Ok(None),
            Err(e) => {
                Err(e).with_context(|| format!("Failed to read metadata for artifact {}", artifact))
            }
        }
    }

    /// Move a fully written temp file into place and publish its metadata.
    async fn commit(&self, tmp_data: &Path, content_type: &str, len: u64) -> Result<ArtifactRef> {
        let artifact = ArtifactRef::generate();
        let shard = self.shard_dir(&artifact);
        tokio::fs::create_dir_all(&shard)
            .await
            .context("Failed to create artifact shard directory")?;

        tokio::fs::rename(tmp_data, self.data_path(&artifact))
            .await
            .context("Failed to move artifact into place")?;

        let meta = ArtifactMeta {
            content_type: content_type.to_string(),
            len,
            created_at: Utc::now(),
        };
        let tmp_meta = self
            .tmp_dir
            .join(format!("{}{}", artifact.as_str(), META_SUFFIX));
        let publish = async {
            tokio::fs::write(&tmp_meta, serde_json::to_vec(&meta)?)
                .await
                .context("Failed to write artifact metadata")?;
            tokio::fs::rename(&tmp_meta, self.meta_path(&artifact))
                .await
                .context("Failed to publish artifact metadata")?;
            anyhow::Ok(())
        };
        if let Err(e) = publish.await {
            let _ = tokio::fs::remove_file(self.data_path(&artifact)).await;
            let _ = tokio::fs::remove_file(&tmp_meta).await;
            return Err(e);
        }

        Ok(artifact)
    }

    fn tmp_data_path(&self) -> PathBuf {
        self.tmp_dir
            .join(format!("{}.part", ArtifactRef::generate().as_str()))
    }
}

async fn remove_if_exists(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == IoErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Failed to remove {}", path.display())),
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn put(&self, bytes: Vec<u8>, content_type: &str) -> Result<ArtifactRef> {
        self.put_stream(&mut bytes.as_slice(), content_type).await
    }

    async fn put_stream(
        &self,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        content_type: &str,
    ) -> Result<ArtifactRef> {
        let tmp = self.tmp_data_path();
        let written = async {
            let mut file = tokio::fs::File::create(&tmp).await?;
            let len = tokio::io::copy(reader, &mut file).await?;
            file.flush().await?;
            Ok::<u64, std::io::Error>(len)
        };
        let len = match written.await {
            Ok(len) => len,
            Err(e) => {
                let _ = tokio::fs::remove_file(&tmp).await;
                return Err(e).context("Failed to write artifact");
            }
        };
        match self.commit(&tmp, content_type, len).await {
            Ok(artifact) => Ok(artifact),
            Err(e) => {
                let _ = tokio::fs::remove_file(&tmp).await;
                Err(e)
            }
        }
    }

    async fn get(&self, artifact: &ArtifactRef) -> Result<Option<Artifact>> {
        let Some(meta) = self.read_meta(artifact).await? else {
            return Ok(None);
        };
        match tokio::fs::read(self.data_path(artifact)).await {
            Ok(bytes) => Ok(Some(Artifact { meta, bytes })),
            Err(e) if e.kind() == IoErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read artifact {}", artifact)),
        }
    }

    async fn open(&self, artifact: &ArtifactRef) -> Result<Option<ArtifactReader>> {
        let Some(meta) = self.read_meta(artifact).await? else {
            return Ok(None);
        };
        match tokio::fs::File::open(self.data_path(artifact)).await {
            Ok(file) => Ok(Some(ArtifactReader {
                meta,
                reader: Box::new(file),
            })),
            Err(e) if e.kind() == IoErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to open artifact {}", artifact)),
        }
    }

    async fn stat(&self, artifact: &ArtifactRef) -> Result<Option<ArtifactMeta>> {
        self.read_meta(artifact).await
    }

    async fn delete(&self, artifact: &ArtifactRef) -> Result<()> {
        remove_if_exists(&self.meta_path(artifact)).await?;
        remove_if_exists(&self.data_path(artifact)).await?;
        Ok(())
    }

    async fn list_refs(&self) -> Result<Vec<ArtifactRef>> {
        let mut refs = BTreeSet::new();
        let mut shards = tokio::fs::read_dir(&self.root)
            .await
            .context("Failed to read artifact directory")?;
        while let Some(shard) = shards.next_entry().await? {
            if !shard.file_type().await?.is_dir() || shard.path() == self.tmp_dir {
                continue;
            }
            let mut entries = tokio::fs::read_dir(shard.path()).await?;
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name();
                let Some(name) = name.to_str() else {
                    continue;
                };
                let raw = name.strip_suffix(META_SUFFIX).unwrap_or(name);
                if let Ok(artifact) = ArtifactRef::parse(raw) {
                    refs.insert(artifact);
                }
            }
        }
        Ok(refs.into_iter().collect())
    }
}
