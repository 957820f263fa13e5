use blobdex::{
    backends::{BackendError, Directory, InMemory, Result as BackendResult},
    BlobHandle, BlobType, Handle, Index, IndexError, MasterIndex, ObjectClass, ObjectId,
    ObjectStore, PackedBlob,
};

use async_trait::async_trait;
use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

fn init_logging() -> tracing::subscriber::DefaultGuard {
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .finish();

    tracing::subscriber::set_default(subscriber)
}

/// Forwards to `inner` and fails saves on request, or never finishes them.
struct Flaky<S> {
    inner: S,
    fail_saves: AtomicBool,
    hang_saves: AtomicBool,
    removed: AtomicUsize,
}

impl<S> Flaky<S> {
    fn new(inner: S) -> Self {
        Flaky {
            inner,
            fail_saves: AtomicBool::new(false),
            hang_saves: AtomicBool::new(false),
            removed: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl<S: ObjectStore> ObjectStore for Flaky<S> {
    async fn save(&self, handle: Handle, data: Vec<u8>) -> BackendResult<()> {
        if self.hang_saves.load(Ordering::SeqCst) {
            futures::future::pending::<()>().await;
        }
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(anyhow::anyhow!("connection reset").into());
        }
        self.inner.save(handle, data).await
    }

    async fn load(&self, handle: Handle) -> BackendResult<Vec<u8>> {
        self.inner.load(handle).await
    }

    async fn stat(&self, handle: Handle) -> BackendResult<u64> {
        self.inner.stat(handle).await
    }

    async fn list(&self, class: ObjectClass) -> BackendResult<Vec<(ObjectId, u64)>> {
        self.inner.list(class).await
    }

    async fn remove(&self, handle: Handle) -> BackendResult<()> {
        self.removed.fetch_add(1, Ordering::SeqCst);
        self.inner.remove(handle).await
    }
}

fn record(content: &[u8], blob_type: BlobType, pack: &[u8], offset: u32, length: u32) -> PackedBlob {
    PackedBlob {
        id: ObjectId::hash(content),
        blob_type,
        pack: ObjectId::hash(pack),
        offset,
        length,
        uncompressed_length: 0,
    }
}

async fn upload(store: &dyn ObjectStore, blobs: &[PackedBlob]) -> ObjectId {
    let mut index = Index::new();
    for blob in blobs {
        index.add(*blob).unwrap();
    }

    let id = index.finalize().unwrap();
    store
        .save(Handle::index(id), index.serialize().unwrap())
        .await
        .unwrap();
    id
}

fn master(store: Arc<dyn ObjectStore>) -> MasterIndex {
    MasterIndex::new(store, Default::default())
}

#[tokio::test]
async fn two_indexes_with_a_type_mismatch() {
    let _log = init_logging();
    let store = Arc::new(InMemory::default());

    let x = record(b"idX", BlobType::Data, b"pack1", 0, 100);
    let y = record(b"idY", BlobType::Tree, b"pack2", 0, 50);
    upload(store.as_ref(), &[x]).await;
    upload(store.as_ref(), &[y]).await;

    let master = master(store);
    assert_eq!(master.load().await.unwrap(), 2);

    assert_eq!(master.lookup(&x.id, BlobType::Data), Some(x));
    assert_eq!(master.lookup(&y.id, BlobType::Tree), Some(y));
    assert_eq!(master.lookup(&x.id, BlobType::Tree), None);
    assert!(!master.has(&y.id, BlobType::Data));
}

#[tokio::test]
async fn every_shard_is_merged() {
    let store = Arc::new(InMemory::default());

    let mut all = vec![];
    let mut ids = HashSet::new();
    for shard in 0..16u32 {
        let blobs: Vec<PackedBlob> = (0..25u32)
            .map(|n| {
                let content = format!("shard {shard} blob {n}");
                let blob_type = if n % 3 == 0 { BlobType::Tree } else { BlobType::Data };
                record(content.as_bytes(), blob_type, &shard.to_le_bytes(), n * 100, 100)
            })
            .collect();

        ids.insert(upload(store.as_ref(), &blobs).await);
        all.extend(blobs);
    }

    let master = MasterIndex::new(
        store,
        blobdex::config::IndexConfig {
            load_concurrency: 3,
            duplicates: blobdex::DuplicatePolicy::Reject,
            ..Default::default()
        },
    );
    master.load().await.unwrap();

    assert_eq!(master.index_count(), 16);
    assert_eq!(master.index_ids().into_iter().collect::<HashSet<_>>(), ids);
    for blob in all.iter() {
        assert_eq!(master.lookup(&blob.id, blob.blob_type), Some(*blob));
    }
    assert_eq!(master.packs().len(), 16);

    // nothing new to load
    assert_eq!(master.load().await.unwrap(), 0);
}

#[tokio::test]
async fn failed_session_upload_is_never_loaded() {
    let store = Arc::new(Flaky::new(InMemory::default()));
    let writer = master(store.clone());
    let blob = record(b"lost", BlobType::Data, b"pack1", 0, 10);

    writer.insert_session_record(blob).unwrap();
    store.fail_saves.store(true, Ordering::SeqCst);

    let error = writer.finalize_session().await.unwrap_err();
    assert!(matches!(error, IndexError::Upload { .. }));

    // the writer still knows about it, for a retry
    assert!(writer.has(&blob.id, BlobType::Data));

    let reader = master(store.clone());
    assert_eq!(reader.load().await.unwrap(), 0);
    assert!(!reader.has(&blob.id, BlobType::Data));

    // retrying succeeds and the record becomes durable
    store.fail_saves.store(false, Ordering::SeqCst);
    let id = writer.finalize_session().await.unwrap().unwrap();

    let reader = master(store);
    reader.load().await.unwrap();
    assert_eq!(reader.index_ids(), vec![id]);
    assert_eq!(reader.lookup(&blob.id, BlobType::Data), Some(blob));
}

#[tokio::test]
async fn compaction_keeps_everything_until_the_new_index_is_stored() {
    let store = Arc::new(Flaky::new(InMemory::default()));
    let blobs = [
        record(b"a", BlobType::Data, b"pack1", 0, 10),
        record(b"b", BlobType::Tree, b"pack1", 10, 10),
        record(b"c", BlobType::Data, b"pack2", 0, 10),
    ];
    for blob in blobs.iter() {
        upload(store.as_ref(), &[*blob]).await;
    }

    let master = master(store.clone());
    master.load().await.unwrap();
    let before = master.index_ids();

    store.fail_saves.store(true, Ordering::SeqCst);
    assert!(master.compact(100).await.is_err());
    assert_eq!(master.index_ids(), before);
    assert_eq!(store.removed.load(Ordering::SeqCst), 0);
    assert_eq!(store.inner.len(), 3);

    store.fail_saves.store(false, Ordering::SeqCst);
    let superseded = master.compact(100).await.unwrap();
    assert_eq!(superseded, before);
    assert_eq!(master.index_count(), 1);
    for blob in blobs.iter() {
        assert_eq!(master.lookup(&blob.id, blob.blob_type), Some(*blob));
    }

    // the caller deletes the superseded objects; a fresh load agrees
    for id in superseded {
        store.remove(Handle::index(id)).await.unwrap();
    }
    let fresh = MasterIndex::new(store.clone(), Default::default());
    assert_eq!(fresh.load().await.unwrap(), 1);
    for blob in blobs.iter() {
        assert_eq!(fresh.lookup(&blob.id, blob.blob_type), Some(*blob));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_writers_store_each_blob_once() {
    let master = Arc::new(master(Arc::new(InMemory::default())));
    let handle = BlobHandle::new(ObjectId::hash(b"popular"), BlobType::Data);

    let writers: Vec<_> = (0..8u32)
        .map(|writer| {
            let master = master.clone();
            tokio::spawn(async move {
                if !master.add_pending(handle) {
                    return false;
                }

                let pack = format!("pack {writer}");
                master
                    .insert_session_record(PackedBlob {
                        id: handle.id,
                        blob_type: handle.blob_type,
                        pack: ObjectId::hash(pack.as_bytes()),
                        offset: 0,
                        length: 10,
                        uncompressed_length: 0,
                    })
                    .unwrap();
                true
            })
        })
        .collect();

    let mut stored = 0;
    for writer in writers {
        if writer.await.unwrap() {
            stored += 1;
        }
    }

    assert_eq!(stored, 1);
    assert_eq!(master.session_len(), 1);

    master.finalize_session().await.unwrap();
    assert!(!master.add_pending(handle));
    assert_eq!(master.count(BlobType::Data), 1);
}

#[tokio::test]
async fn cancelled_finalize_leaves_the_session_intact() {
    let store = Arc::new(Flaky::new(InMemory::default()));
    let master = master(store.clone());
    let blob = record(b"slow", BlobType::Data, b"pack1", 0, 10);

    master.insert_session_record(blob).unwrap();
    store.hang_saves.store(true, Ordering::SeqCst);

    let result = tokio::time::timeout(Duration::from_millis(50), master.finalize_session()).await;
    assert!(result.is_err());

    assert_eq!(master.session_len(), 1);
    assert_eq!(master.index_count(), 0);
    assert_eq!(master.lookup(&blob.id, BlobType::Data), Some(blob));

    // the writer lock was released with the dropped future
    store.hang_saves.store(false, Ordering::SeqCst);
    assert!(master.finalize_session().await.unwrap().is_some());
}

#[tokio::test]
async fn index_round_trips_through_a_directory() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(Directory::new(dir.path()).unwrap());

    let mut index = Index::new();
    let blobs = [
        record(b"one", BlobType::Data, b"pack1", 0, 10),
        record(b"two", BlobType::Tree, b"pack1", 10, 10),
    ];
    for blob in blobs.iter() {
        index.add(*blob).unwrap();
    }
    index.add_to_supersedes(ObjectId::hash(b"older")).unwrap();

    let id = index.finalize().unwrap();
    store
        .save(Handle::index(id), index.serialize().unwrap())
        .await
        .unwrap();

    let bytes = store.load(Handle::index(id)).await.unwrap();
    assert_eq!(ObjectId::hash(&bytes), id);

    let loaded = Index::deserialize(id, &bytes).unwrap();
    assert_eq!(loaded.id(), Some(id));
    assert!(loaded.supersedes().contains(&ObjectId::hash(b"older")));
    for blob in blobs.iter() {
        assert_eq!(loaded.lookup(&blob.id, blob.blob_type), Some(*blob));
    }

    // the stored bytes are exactly what the ID was computed from, every time
    assert_eq!(ObjectId::hash(loaded.serialize().unwrap()), id);
}

#[tokio::test]
async fn missing_index_objects_fail_the_load() {
    struct Vanishing(InMemory);

    #[async_trait]
    impl ObjectStore for Vanishing {
        async fn save(&self, handle: Handle, data: Vec<u8>) -> BackendResult<()> {
            self.0.save(handle, data).await
        }

        async fn load(&self, handle: Handle) -> BackendResult<Vec<u8>> {
            Err(BackendError::NotFound { handle })
        }

        async fn stat(&self, handle: Handle) -> BackendResult<u64> {
            self.0.stat(handle).await
        }

        async fn list(&self, class: ObjectClass) -> BackendResult<Vec<(ObjectId, u64)>> {
            self.0.list(class).await
        }

        async fn remove(&self, handle: Handle) -> BackendResult<()> {
            self.0.remove(handle).await
        }
    }

    let store = Arc::new(Vanishing(InMemory::default()));
    let id = upload(store.as_ref(), &[record(b"x", BlobType::Data, b"pack1", 0, 10)]).await;

    let master = master(store);
    match master.load().await {
        Err(IndexError::Load { id: failed, source }) => {
            assert_eq!(failed, id);
            assert!(matches!(source, BackendError::NotFound { .. }));
        }
        other => panic!("unexpected result: {other:?}"),
    }
    assert_eq!(master.index_count(), 0);
}
