use async_trait::async_trait;
use b2up::{
    api::{
        self, Authorization, B2Api, B2File, FileUpload, PartUpload, StartLargeFile, UploadPartUrl,
        UploadUrl,
    },
    config::Config,
    hasher,
    helper::{self, Uploaded},
    large_file::{self, ErrorKind, LargeFileSession, PieceStatus, SessionState},
};
use reqwest::StatusCode;
use std::{
    collections::{BTreeMap, HashSet},
    fs,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tempfile::TempDir;

const FILE_ID: &str = "4_zb6ee61624837a6c6588b0715_f202847f5820b0610";

#[derive(Default)]
struct FakeApi {
    fail_parts: HashSet<usize>,
    panic_part: Option<usize>,
    wrong_part_file_id: bool,
    unreachable_finish: bool,
    part_delay: Duration,

    calls: Mutex<Vec<&'static str>>,
    started: Mutex<Option<StartLargeFile>>,
    parts: Mutex<BTreeMap<usize, Vec<u8>>>,
    finished_with: Mutex<Option<Vec<String>>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeApi {
    fn record(&self, call: &'static str) {
        self.calls.lock().unwrap().push(call);
    }

    fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }

    fn status(operation: &'static str, status: StatusCode) -> api::Error {
        api::Error::Status {
            operation,
            status,
            body: "{}".into(),
        }
    }
}

#[async_trait]
impl B2Api for FakeApi {
    async fn authorize(&self) -> Result<Authorization, api::Error> {
        self.record("authorize");
        Ok(Authorization {
            account_id: "0e1000668b00".into(),
            api_url: "https://api001.example".into(),
            authorization_token: "session-token".into(),
            download_url: String::new(),
            recommended_part_size: 0,
            absolute_minimum_part_size: 0,
        })
    }

    async fn get_upload_url(
        &self,
        _auth: &Authorization,
        bucket_id: &str,
    ) -> Result<UploadUrl, api::Error> {
        self.record("get_upload_url");
        Ok(UploadUrl {
            bucket_id: bucket_id.into(),
            upload_url: "https://pod.example/upload".into(),
            authorization_token: "upload-token".into(),
        })
    }

    async fn upload_file(&self, _target: &UploadUrl, file: FileUpload) -> Result<B2File, api::Error> {
        self.record("upload_file");
        Ok(B2File {
            file_id: "4_single".into(),
            file_name: file.file_name,
            content_length: file.data.len() as u64,
            content_sha1: Some(file.sha1),
            ..Default::default()
        })
    }

    async fn start_large_file(
        &self,
        _auth: &Authorization,
        request: &StartLargeFile,
    ) -> Result<B2File, api::Error> {
        self.record("start_large_file");
        *self.started.lock().unwrap() = Some(request.clone());
        Ok(B2File {
            file_id: FILE_ID.into(),
            file_name: request.file_name.clone(),
            ..Default::default()
        })
    }

    async fn get_upload_part_url(
        &self,
        _auth: &Authorization,
        file_id: &str,
    ) -> Result<UploadPartUrl, api::Error> {
        self.record("get_upload_part_url");
        let n = self.calls().len();
        Ok(UploadPartUrl {
            file_id: if self.wrong_part_file_id {
                "4_someone_else".into()
            } else {
                file_id.into()
            },
            upload_url: format!("https://pod.example/part/{n}"),
            authorization_token: format!("part-token-{n}"),
        })
    }

    async fn upload_part(&self, _target: &UploadPartUrl, part: PartUpload) -> Result<(), api::Error> {
        if self.panic_part == Some(part.part_number) {
            panic!("connection pool poisoned while sending part {}", part.part_number);
        }
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.part_delay.is_zero() {
            tokio::time::sleep(self.part_delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.fail_parts.contains(&part.part_number) {
            return Err(Self::status("b2_upload_part", StatusCode::INTERNAL_SERVER_ERROR));
        }
        if hasher::hash_bytes(&part.data).sha1 != part.sha1 {
            return Err(Self::status("b2_upload_part", StatusCode::BAD_REQUEST));
        }
        self.parts
            .lock()
            .unwrap()
            .insert(part.part_number, part.data.as_ref().clone());
        Ok(())
    }

    async fn finish_large_file(
        &self,
        _auth: &Authorization,
        file_id: &str,
        part_sha1s: &[String],
    ) -> Result<B2File, api::Error> {
        self.record("finish_large_file");
        *self.finished_with.lock().unwrap() = Some(part_sha1s.to_vec());
        if self.unreachable_finish {
            let err = serde_json::from_str::<u8>("<html>").unwrap_err();
            return Err(api::Error::SerdeJSONError(err, "<html>".into()));
        }

        let parts = self.parts.lock().unwrap();
        let complete = parts.len() == part_sha1s.len()
            && parts
                .iter()
                .zip(part_sha1s)
                .all(|((_, data), sha1)| hasher::hash_bytes(data).sha1 == *sha1);
        if !complete {
            return Err(Self::status("b2_finish_large_file", StatusCode::BAD_REQUEST));
        }
        Ok(B2File {
            file_id: file_id.into(),
            file_name: "launch.mp4".into(),
            ..Default::default()
        })
    }
}

struct Fixture {
    source_dir: TempDir,
    temp_dir: TempDir,
    config: Config,
}

impl Fixture {
    fn new(part_size: u64, large_file_threshold: u64, concurrency: usize) -> Self {
        let source_dir = TempDir::new().unwrap();
        let temp_dir = TempDir::new().unwrap();
        let config = Config {
            account_id: "0e1000668b00".into(),
            application_key: "key".into(),
            part_size,
            large_file_threshold,
            upload_concurrency: concurrency,
            temp_dir: temp_dir.path().to_owned(),
            ..Config::default()
        };
        Fixture {
            source_dir,
            temp_dir,
            config,
        }
    }

    fn write_source(&self, name: &str, len: usize) -> (PathBuf, Vec<u8>) {
        let data: Vec<u8> = (0..len).map(|i| (i * 31 % 251) as u8).collect();
        let path = self.source_dir.path().join(name);
        fs::write(&path, &data).unwrap();
        (path, data)
    }

    fn temp_files(&self) -> Vec<PathBuf> {
        list(self.temp_dir.path())
    }
}

fn list(dir: &Path) -> Vec<PathBuf> {
    let mut paths: Vec<PathBuf> = fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect();
    paths.sort();
    paths
}

#[tokio::test]
async fn three_pieces_are_uploaded_finished_and_cleaned_up() {
    let fx = Fixture::new(100, 100, 5);
    let (path, data) = fx.write_source("launch.mp4", 250);
    let api = Arc::new(FakeApi {
        part_delay: Duration::from_millis(50),
        ..Default::default()
    });

    let outcome = large_file::upload_large_file(api.clone(), &fx.config, "bucket", &path, None)
        .await
        .unwrap();

    assert_eq!(outcome.file.file_id, FILE_ID);
    assert_eq!(api.max_in_flight.load(Ordering::SeqCst), 3);
    assert_eq!(outcome.cleanup.deleted.len(), 3);
    assert!(outcome.cleanup.retained.is_empty());
    assert!(fx.temp_files().is_empty());

    let parts = api.parts.lock().unwrap();
    assert_eq!(parts.keys().copied().collect::<Vec<_>>(), vec![1, 2, 3]);
    let sizes: Vec<usize> = parts.values().map(|p| p.len()).collect();
    assert_eq!(sizes, vec![100, 100, 50]);
    let joined: Vec<u8> = parts.values().flatten().copied().collect();
    assert_eq!(joined, data);

    let expected: Vec<String> = data.chunks(100).map(|c| hasher::hash_bytes(c).sha1).collect();
    assert_eq!(api.finished_with.lock().unwrap().as_ref(), Some(&expected));

    let started = api.started.lock().unwrap().clone().unwrap();
    let whole = hasher::hash_bytes(&data);
    assert_eq!(started.file_name, "launch.mp4");
    assert_eq!(started.content_type, "b2/x-auto");
    assert_eq!(started.file_info.large_file_sha1, Some(whole.sha1));
    assert_eq!(started.file_info.content_blake2b, Some(whole.blake2b));
    assert!(started.file_info.src_last_modified_millis.is_some());

    assert_eq!(
        api.calls(),
        vec![
            "authorize",
            "start_large_file",
            "get_upload_part_url",
            "get_upload_part_url",
            "get_upload_part_url",
            "finish_large_file",
        ]
    );
}

#[tokio::test]
async fn failed_part_keeps_its_temp_file_and_finish_is_rejected() {
    let fx = Fixture::new(100, 100, 5);
    let (path, _) = fx.write_source("launch.mp4", 250);
    let api = Arc::new(FakeApi {
        fail_parts: HashSet::from([2]),
        ..Default::default()
    });

    let err = large_file::upload_large_file(api.clone(), &fx.config, "bucket", &path, None)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Remote);
    let kept = fx.temp_dir.path().join("launch_1.mp4");
    match err {
        large_file::Error::FinishFailed { source, retained } => {
            assert!(
                matches!(source, api::Error::Status { status, .. } if status == StatusCode::BAD_REQUEST)
            );
            assert_eq!(retained, vec![kept.clone()]);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(fx.temp_files(), vec![kept]);
    assert_eq!(api.parts.lock().unwrap().len(), 2);
    assert_eq!(api.finished_with.lock().unwrap().as_ref().map(|h| h.len()), Some(3));
}

#[tokio::test]
async fn unreadable_piece_fails_alone_and_finish_is_still_attempted() {
    let fx = Fixture::new(100, 100, 5);
    let (path, _) = fx.write_source("launch.mp4", 250);
    let api = Arc::new(FakeApi::default());

    let mut session = LargeFileSession::new(api.clone(), &fx.config, "bucket", &path, None).unwrap();
    session.start().await.unwrap();
    session.split().await.unwrap();

    let damaged = fx.temp_dir.path().join("launch_1.mp4");
    fs::write(&damaged, b"short").unwrap();

    session.upload_all().await.unwrap();
    let statuses: Vec<PieceStatus> = session.pieces().iter().map(|p| p.status()).collect();
    assert_eq!(
        statuses,
        vec![PieceStatus::Success, PieceStatus::Failed, PieceStatus::Success]
    );
    assert_eq!(session.failed_parts(), vec![2]);
    assert_eq!(api.parts.lock().unwrap().keys().copied().collect::<Vec<_>>(), vec![1, 3]);

    let err = session.finish().await.unwrap_err();
    assert!(matches!(
        &err,
        large_file::Error::FinishFailed { source: api::Error::Status { status, .. }, .. }
            if *status == StatusCode::BAD_REQUEST
    ));
    assert_eq!(err.retained(), [damaged.clone()]);
    assert_eq!(session.state(), SessionState::Abandoned);
    assert_eq!(api.calls().last(), Some(&"finish_large_file"));
    assert_eq!(fx.temp_files(), vec![damaged]);
}

#[tokio::test]
async fn panicked_worker_is_reported_after_the_others_finish() {
    let fx = Fixture::new(100, 100, 2);
    let (path, _) = fx.write_source("launch.mp4", 300);
    let api = Arc::new(FakeApi {
        panic_part: Some(2),
        ..Default::default()
    });

    let mut session = LargeFileSession::new(api.clone(), &fx.config, "bucket", &path, None).unwrap();
    session.start().await.unwrap();
    session.split().await.unwrap();
    let err = session.upload_all().await.unwrap_err();

    assert!(matches!(err, large_file::Error::WorkerPanicked { .. }));
    assert_eq!(err.kind(), ErrorKind::Io);
    assert_eq!(err.retained(), fx.temp_files().as_slice());
    assert_eq!(fx.temp_files().len(), 3);
    assert_eq!(api.parts.lock().unwrap().keys().copied().collect::<Vec<_>>(), vec![1, 3]);
    assert_eq!(session.state(), SessionState::Abandoned);
    assert!(!api.calls().contains(&"finish_large_file"));
}

#[tokio::test]
async fn unreachable_finish_keeps_every_temp_file() {
    let fx = Fixture::new(100, 100, 2);
    let (path, _) = fx.write_source("launch.mp4", 300);
    let api = Arc::new(FakeApi {
        unreachable_finish: true,
        ..Default::default()
    });

    let err = large_file::upload_large_file(api, &fx.config, "bucket", &path, None)
        .await
        .unwrap_err();

    assert!(matches!(&err, large_file::Error::FinishFailed { retained, .. } if retained.len() == 3));
    assert_eq!(fx.temp_files().len(), 3);
}

#[tokio::test]
async fn too_many_parts_fails_before_any_io() {
    let fx = Fixture::new(1, 1, 5);
    let (path, _) = fx.write_source("big.bin", 10_001);
    let api = Arc::new(FakeApi::default());

    let err = large_file::upload_large_file(api.clone(), &fx.config, "bucket", &path, None)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Configuration);
    assert!(matches!(err, large_file::Error::TooManyParts { parts: 10_001, .. }));
    assert!(api.calls().is_empty());
    assert!(fx.temp_files().is_empty());
}

#[tokio::test]
async fn small_file_is_not_a_large_file() {
    let fx = Fixture::new(100, 100, 5);
    let (path, _) = fx.write_source("notes.txt", 99);
    let api = Arc::new(FakeApi::default());

    let err = large_file::upload_large_file(api.clone(), &fx.config, "bucket", &path, None)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(api.calls().is_empty());
}

#[tokio::test]
async fn mismatched_part_file_id_abandons_and_removes_pieces() {
    let fx = Fixture::new(100, 100, 5);
    let (path, _) = fx.write_source("launch.mp4", 250);
    let api = Arc::new(FakeApi {
        wrong_part_file_id: true,
        ..Default::default()
    });

    let mut session = LargeFileSession::new(api, &fx.config, "bucket", &path, None).unwrap();
    session.start().await.unwrap();
    let err = session.split().await.unwrap_err();

    assert!(matches!(err, large_file::Error::FileIdMismatch { ref requested, .. } if requested == FILE_ID));
    assert_eq!(err.kind(), ErrorKind::Remote);
    assert_eq!(session.state(), SessionState::Abandoned);
    assert!(fx.temp_files().is_empty());
}

#[tokio::test]
async fn session_walks_through_every_state() {
    let fx = Fixture::new(64, 100, 5);
    let (path, data) = fx.write_source("archive.tar.gz", 200);
    let api = Arc::new(FakeApi::default());

    let mut session = LargeFileSession::new(api, &fx.config, "bucket", &path, None).unwrap();
    assert_eq!(session.state(), SessionState::Created);
    assert_eq!(session.source().size, 200);

    session.start().await.unwrap();
    assert_eq!(session.state(), SessionState::Started);
    assert_eq!(session.remote_file_id(), Some(FILE_ID));
    assert_eq!(
        session.whole_file_sha1(),
        Some(hasher::hash_bytes(&data).sha1.as_str())
    );

    session.split().await.unwrap();
    assert_eq!(session.state(), SessionState::Split);
    let pieces = session.pieces();
    assert_eq!(pieces.iter().map(|p| p.size).collect::<Vec<_>>(), vec![64, 64, 64, 8]);
    for (i, piece) in pieces.iter().enumerate() {
        assert_eq!(piece.piece_number, i);
        assert_eq!(piece.status(), PieceStatus::NotStarted);
        assert_eq!(
            piece.temp_path,
            fx.temp_dir.path().join(format!("archive.tar_{i}.gz"))
        );
        assert_eq!(hasher::hash_file(&piece.temp_path).unwrap().sha1, piece.sha1);
        assert_eq!(piece.upload_url.file_id, FILE_ID);
    }

    session.upload_all().await.unwrap();
    assert_eq!(session.state(), SessionState::Uploaded);
    assert!(session.pieces().iter().all(|p| p.status() == PieceStatus::Success));
    assert!(session.failed_parts().is_empty());

    let outcome = session.finish().await.unwrap();
    assert_eq!(session.state(), SessionState::Finalized);
    assert_eq!(outcome.cleanup.deleted.len(), 4);
    assert!(fx.temp_files().is_empty());
}

#[tokio::test]
async fn stages_must_run_in_order() {
    let fx = Fixture::new(100, 100, 5);
    let (path, _) = fx.write_source("launch.mp4", 250);
    let api = Arc::new(FakeApi::default());

    let mut session = LargeFileSession::new(api, &fx.config, "bucket", &path, None).unwrap();
    let err = session.split().await.unwrap_err();
    assert!(matches!(
        err,
        large_file::Error::OutOfOrder {
            expected: SessionState::Started,
            actual: SessionState::Created
        }
    ));
    assert_eq!(session.state(), SessionState::Created);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn uploads_never_exceed_the_worker_pool() {
    let fx = Fixture::new(10, 10, 3);
    let (path, _) = fx.write_source("pool.bin", 120);
    let api = Arc::new(FakeApi {
        part_delay: Duration::from_millis(30),
        ..Default::default()
    });

    let outcome = large_file::upload_large_file(api.clone(), &fx.config, "bucket", &path, None)
        .await
        .unwrap();

    assert_eq!(outcome.cleanup.deleted.len(), 12);
    assert_eq!(api.parts.lock().unwrap().len(), 12);
    let max = api.max_in_flight.load(Ordering::SeqCst);
    assert!(max <= 3, "{max} uploads ran at once");
    assert!(max >= 2, "uploads did not overlap");
}

#[tokio::test]
async fn upload_file_picks_the_path_by_size() {
    let fx = Fixture::new(100, 100, 5);
    let (small, small_data) = fx.write_source("notes.txt", 40);
    let (large, _) = fx.write_source("launch.mp4", 100);

    let api = Arc::new(FakeApi::default());
    let uploaded = helper::upload_file(api.clone(), &fx.config, "bucket", &small, None)
        .await
        .unwrap();
    match uploaded {
        Uploaded::Standard(file) => {
            assert_eq!(file.file_name, "notes.txt");
            assert_eq!(file.content_sha1, Some(hasher::hash_bytes(&small_data).sha1));
        }
        other => panic!("expected a standard upload, got {other:?}"),
    }
    assert_eq!(api.calls(), vec!["authorize", "get_upload_url", "upload_file"]);

    let api = Arc::new(FakeApi::default());
    let uploaded = helper::upload_file(api.clone(), &fx.config, "bucket", &large, None)
        .await
        .unwrap();
    assert!(matches!(uploaded, Uploaded::Large(_)));
    assert_eq!(uploaded.file().file_id, FILE_ID);
    assert_eq!(api.parts.lock().unwrap().len(), 1);
}
