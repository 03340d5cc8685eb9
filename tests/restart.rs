use std::{
    collections::BTreeMap,
    fs,
    io::{self, Read},
    sync::atomic::Ordering,
};

use anyhow::Result;
use similar_asserts::assert_eq;

use layerstore::{ChainId, CreateOpts, Digest, Error, GraphDriver, LayerStore};

mod common;
use common::{export, layer_tar, open_store, tempdir};

/// A diff whose transfer breaks off.
struct BrokenDiff;

impl Read for BrokenDiff {
    fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        Err(io::Error::new(io::ErrorKind::ConnectionReset, "connection reset"))
    }
}

/// Chain ID to (diff ID, cache ID, size, parent) for every layer.
fn describe(store: &LayerStore) -> BTreeMap<ChainId, (String, String, u64, Option<ChainId>)> {
    store
        .map()
        .into_iter()
        .map(|(id, info)| {
            let entry = (
                info.diff_id().to_string(),
                info.cache_id().to_string(),
                info.size(),
                info.parent().map(|p| p.chain_id().clone()),
            );
            (id, entry)
        })
        .collect()
}

#[test]
fn test_reopen_rebuilds_graph() -> Result<()> {
    let tmp = tempdir();
    let leaf1_tar = layer_tar("leaf1");

    let (before, root, mid, leaf1, leaf2) = {
        let (store, _driver) = open_store(tmp.path());
        let root = store.register(&layer_tar("root")[..], None)?;
        let mid = store.register(&layer_tar("mid")[..], Some(root.chain_id()))?;
        let leaf1 = store.register(&leaf1_tar[..], Some(mid.chain_id()))?;
        let leaf2 = store.register(&layer_tar("leaf2")[..], Some(mid.chain_id()))?;
        store.create_rw_layer("web", Some(leaf1.chain_id()), Default::default())?;
        store.create_rw_layer("scratch", None, Default::default())?;
        (
            describe(&store),
            root.chain_id().clone(),
            mid.chain_id().clone(),
            leaf1.chain_id().clone(),
            leaf2.chain_id().clone(),
        )
    };

    let (store, driver) = open_store(tmp.path());
    assert_eq!(describe(&store), before);
    assert_eq!(
        store.reference_counts(),
        BTreeMap::from([
            (root.clone(), 1),
            (mid.clone(), 2),
            (leaf1.clone(), 1),
            (leaf2.clone(), 0),
        ])
    );
    assert_eq!(store.mount_names(), vec!["scratch".to_string(), "web".to_string()]);

    let layer = store.get(&leaf1)?;
    assert_eq!(export(&layer)?, leaf1_tar);
    assert!(store.release(layer)?.is_empty());

    // the read-write layer holds the last reference to leaf1
    let web = store.get_rw_layer("web")?;
    assert_eq!(web.parent()?, Some(leaf1.clone()));
    let removed = store.release_rw_layer(&web)?;
    assert_eq!(removed.len(), 1);
    assert_eq!(removed[0].chain_id, leaf1);
    assert_eq!(store.reference_counts()[&mid], 1);

    let removed = store.release(store.get(&leaf2)?)?;
    assert_eq!(removed.len(), 3);
    assert_eq!(driver.cache_ids()?.len(), 1);
    Ok(())
}

#[test]
fn test_reopen_skips_broken_mount() -> Result<()> {
    let tmp = tempdir();
    let base = {
        let (store, _driver) = open_store(tmp.path());
        let base = store.register(&layer_tar("base")[..], None)?;
        store.create_rw_layer("good", Some(base.chain_id()), Default::default())?;
        store.create_rw_layer("bad", Some(base.chain_id()), Default::default())?;
        base.chain_id().clone()
    };
    fs::remove_file(tmp.path().join("layerdb/mounts/bad/mount-id"))?;

    let (store, _driver) = open_store(tmp.path());
    assert_eq!(store.mount_names(), vec!["good".to_string()]);
    assert_eq!(store.reference_counts()[&base], 1);
    Ok(())
}

#[test]
fn test_cleanup_removes_unreferenced_stores() -> Result<()> {
    let tmp = tempdir();
    let (store, driver) = open_store(tmp.path());

    let base = store.register(&layer_tar("base")[..], None)?;
    let opts = layerstore::CreateRwLayerOpts {
        init_func: Some(Box::new(|_: &std::path::Path| Ok::<_, anyhow::Error>(()))),
        ..Default::default()
    };
    let rw = store.create_rw_layer("web", Some(base.chain_id()), opts)?;
    driver.create("stray", None, &CreateOpts::default())?;
    let mut expected = vec![
        base.info().cache_id().to_string(),
        rw.mount_id()?,
        format!("{}-init", rw.mount_id()?),
    ];
    expected.sort();

    store.cleanup()?;
    assert_eq!(driver.cache_ids()?, expected);
    assert_eq!(driver.removals("stray"), 1);
    Ok(())
}

#[test]
fn test_cleanup_finishes_interrupted_deletion() -> Result<()> {
    let tmp = tempdir();
    let (chain_id, cache_id) = {
        let (store, _driver) = open_store(tmp.path());
        let layer = store.register(&layer_tar("doomed")[..], None)?;
        (layer.chain_id().clone(), layer.info().cache_id().to_string())
    };

    // a deletion that got as far as removing the driver store
    let layers_dir = tmp.path().join("layerdb/sha256");
    let removing = layers_dir.join(format!("{}-0123456789abcdef-removing", chain_id.encoded()));
    fs::rename(layers_dir.join(chain_id.encoded()), &removing)?;

    let (store, driver) = open_store(tmp.path());
    assert!(store.map().is_empty());
    driver.vfs().remove(&cache_id)?;

    store.cleanup()?;
    assert!(!removing.exists());
    assert_eq!(fs::read_dir(&layers_dir)?.count(), 0);
    assert!(driver.cache_ids()?.is_empty());
    Ok(())
}

#[test]
fn test_cleanup_keeps_orphan_when_driver_fails() -> Result<()> {
    let tmp = tempdir();
    let (store, driver) = open_store(tmp.path());
    let layer = store.register(&layer_tar("doomed")[..], None)?;
    let cache_id = layer.info().cache_id().to_string();

    driver.fail_remove.store(true, std::sync::atomic::Ordering::SeqCst);
    assert!(store.release(layer).is_err());
    store.cleanup()?;
    let layers_dir = tmp.path().join("layerdb/sha256");
    assert_eq!(fs::read_dir(&layers_dir)?.count(), 1);
    assert!(driver.exists(&cache_id));

    driver.fail_remove.store(false, std::sync::atomic::Ordering::SeqCst);
    store.cleanup()?;
    assert_eq!(fs::read_dir(&layers_dir)?.count(), 0);
    assert!(!driver.exists(&cache_id));
    Ok(())
}

#[test]
fn test_export_after_reopen_keeps_layer() -> Result<()> {
    let tmp = tempdir();
    let tar = layer_tar("exported");
    let chain_id = {
        let (store, _driver) = open_store(tmp.path());
        store.register(&tar[..], None)?.chain_id().clone()
    };

    let (store, driver) = open_store(tmp.path());
    assert_eq!(store.reference_counts()[&chain_id], 0);
    let mut exported = Vec::new();
    store.tar_stream(&chain_id)?.read_to_end(&mut exported)?;
    assert_eq!(exported, tar);

    assert!(store.map().contains_key(&chain_id));
    assert_eq!(store.reference_counts()[&chain_id], 0);
    assert_eq!(driver.total_removals(), 0);

    let missing = ChainId::from(Digest::from_bytes(b"missing"));
    assert!(matches!(store.tar_stream(&missing), Err(Error::LayerDoesNotExist)));
    Ok(())
}

#[test]
fn test_failed_child_keeps_reopened_parent() -> Result<()> {
    let tmp = tempdir();
    let parent = {
        let (store, _driver) = open_store(tmp.path());
        store.register(&layer_tar("parent")[..], None)?.chain_id().clone()
    };

    let (store, driver) = open_store(tmp.path());
    assert_eq!(store.reference_counts()[&parent], 0);

    assert!(store.register(BrokenDiff, Some(&parent)).is_err());
    assert!(store.map().contains_key(&parent));
    assert_eq!(store.reference_counts()[&parent], 0);

    driver.fail_create_read_write.store(true, Ordering::SeqCst);
    assert!(matches!(
        store.create_rw_layer("web", Some(&parent), Default::default()),
        Err(Error::Driver(_))
    ));
    assert!(store.map().contains_key(&parent));
    assert_eq!(store.reference_counts()[&parent], 0);
    assert_eq!(driver.cache_ids()?.len(), 1);

    // a reference that was handed out still deletes on release
    driver.fail_create_read_write.store(false, Ordering::SeqCst);
    let layer = store.get(&parent)?;
    assert_eq!(store.release(layer)?.len(), 1);
    assert!(store.map().is_empty());
    Ok(())
}
