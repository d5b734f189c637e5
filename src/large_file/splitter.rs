use super::{
    piece::{self, Piece, PieceRange},
    Error, SourceFile,
};
use crate::{
    api::{Authorization, B2Api, UploadPartUrl},
    hasher::{self, Digests, HashingWriter},
};
use std::{
    fs::{self, File},
    io::{self, BufWriter, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

/// Cuts a source file into pieces backed by temp files.
pub struct PieceSplitter<'a> {
    api: &'a dyn B2Api,
    auth: &'a Authorization,
    part_size: u64,
    large_file_threshold: u64,
    temp_dir: &'a Path,
}

impl<'a> PieceSplitter<'a> {
    pub fn new(
        api: &'a dyn B2Api,
        auth: &'a Authorization,
        part_size: u64,
        large_file_threshold: u64,
        temp_dir: &'a Path,
    ) -> Self {
        PieceSplitter {
            api,
            auth,
            part_size,
            large_file_threshold,
            temp_dir,
        }
    }

    /// Checks the limits for `total_size` and lays out its pieces. Touches neither disk nor network.
    pub fn plan(
        total_size: u64,
        part_size: u64,
        large_file_threshold: u64,
    ) -> Result<Vec<PieceRange>, Error> {
        let plan = piece::plan_pieces(total_size, part_size)?;
        if total_size < large_file_threshold {
            return Err(Error::TooSmall {
                size: total_size,
                threshold: large_file_threshold,
            });
        }
        Ok(plan)
    }

    /// Writes every piece to its temp file and requests its part credentials, one piece at a time.
    ///
    /// On error the temp files written so far are removed.
    pub async fn split(&self, source: &SourceFile, remote_file_id: &str) -> Result<Vec<Piece>, Error> {
        let plan = Self::plan(source.size, self.part_size, self.large_file_threshold)?;
        tracing::info!(
            file = %source.path.display(),
            parts = plan.len(),
            "Splitting file into temp pieces"
        );

        let mut pieces = Vec::with_capacity(plan.len());
        for range in plan {
            match self.split_one(source, remote_file_id, range).await {
                Ok(piece) => pieces.push(piece),
                Err(e) => {
                    remove_temp_files(pieces.iter().map(|p| p.temp_path.as_path()));
                    return Err(e);
                }
            }
        }
        Ok(pieces)
    }

    async fn split_one(
        &self,
        source: &SourceFile,
        remote_file_id: &str,
        range: PieceRange,
    ) -> Result<Piece, Error> {
        let temp_path = temp_path_of(self.temp_dir, source, range);

        let digests = {
            let source_path = source.path.clone();
            let temp_path = temp_path.clone();
            tokio::task::spawn_blocking(move || write_piece(&source_path, &temp_path, range))
                .await??
        };
        tracing::info!(
            piece = range.index,
            path = %temp_path.display(),
            sha1 = %digests.sha1,
            "Temp file piece created"
        );

        match self.part_url(remote_file_id).await {
            Ok(upload_url) => {
                tracing::debug!(piece = range.index, "Obtained upload part URL");
                Ok(Piece::new(range, digests.sha1, temp_path, upload_url))
            }
            Err(e) => {
                remove_temp_files([temp_path.as_path()]);
                Err(e)
            }
        }
    }

    async fn part_url(&self, remote_file_id: &str) -> Result<UploadPartUrl, Error> {
        let upload_url = self.api.get_upload_part_url(self.auth, remote_file_id).await?;
        if upload_url.file_id != remote_file_id {
            tracing::error!(
                part_file_id = %upload_url.file_id,
                start_file_id = %remote_file_id,
                "Upload part file ID and start file ID do not match"
            );
            return Err(Error::FileIdMismatch {
                requested: remote_file_id.to_owned(),
                echoed: upload_url.file_id,
            });
        }
        Ok(upload_url)
    }
}

fn temp_path_of(temp_dir: &Path, source: &SourceFile, range: PieceRange) -> PathBuf {
    piece::temp_path(temp_dir, &source.name, range.index)
}

/// Copies `range` of `source` into a new file at `temp_path`, hashing it on the way.
///
/// The temp file is removed again if the copy fails. A failure before it is
/// created leaves `temp_path` untouched.
fn write_piece(source: &Path, temp_path: &Path, range: PieceRange) -> Result<Digests, Error> {
    let mut file = File::open(source)?;
    file.seek(SeekFrom::Start(range.offset))?;

    let out = File::create(temp_path)?;
    copy_range(file, out, range).map_err(|e| {
        remove_temp_files([temp_path]);
        e
    })
}

fn copy_range(source: File, out: File, range: PieceRange) -> Result<Digests, Error> {
    let mut writer = HashingWriter::new(BufWriter::new(out));
    let copied = io::copy(&mut source.take(range.size), &mut writer)?;
    if copied != range.size {
        return Err(hasher::Error::Truncated {
            expected: range.size,
            read: copied,
        }
        .into());
    }

    let (mut out, digests) = writer.finish();
    out.flush()?;
    Ok(digests)
}

fn remove_temp_files<'p>(paths: impl IntoIterator<Item = &'p Path>) {
    for path in paths {
        match fs::remove_file(path) {
            Ok(()) => tracing::debug!(path = %path.display(), "Removed temp file of abandoned split"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "Could not remove temp file"),
        }
    }
}
