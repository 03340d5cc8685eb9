use std::{fs, sync::atomic::Ordering};

use anyhow::Result;
use similar_asserts::assert_eq;

use layerstore::{CreateRwLayerOpts, Error, GraphDriver};

mod common;
use common::{layer_tar, open_store, tar_of, tempdir};

fn with_init(f: impl FnOnce(&std::path::Path) -> Result<()> + Send + 'static) -> CreateRwLayerOpts {
    CreateRwLayerOpts {
        init_func: Some(Box::new(f)),
        ..Default::default()
    }
}

#[test]
fn test_create_and_release() -> Result<()> {
    let tmp = tempdir();
    let (store, driver) = open_store(tmp.path());

    let base = store.register(&layer_tar("base")[..], None)?;
    let rw = store.create_rw_layer("web", Some(base.chain_id()), Default::default())?;
    assert_eq!(rw.name(), "web");
    assert_eq!(rw.parent()?.as_ref(), Some(base.chain_id()));
    assert_eq!(store.reference_counts()[base.chain_id()], 2);
    assert_eq!(store.mount_names(), vec!["web".to_string()]);

    let mount_id = rw.mount_id()?;
    assert_eq!(store.get_mount_id("web")?, mount_id);
    assert!(driver.exists(&mount_id));

    assert!(store.release_rw_layer(&rw)?.is_empty());
    assert!(!driver.exists(&mount_id));
    assert!(store.mount_names().is_empty());
    assert!(matches!(rw.mount_id(), Err(Error::MountDoesNotExist)));
    assert!(matches!(store.get_mount_id("web"), Err(Error::MountDoesNotExist)));
    assert_eq!(store.reference_counts()[base.chain_id()], 1);

    assert_eq!(store.release(base)?.len(), 1);
    Ok(())
}

#[test]
fn test_release_rw_layer_releases_parent_chain() -> Result<()> {
    let tmp = tempdir();
    let (store, driver) = open_store(tmp.path());

    let base = store.register(&layer_tar("base")[..], None)?;
    let app = store.register(&layer_tar("app")[..], Some(base.chain_id()))?;
    let rw = store.create_rw_layer("web", Some(app.chain_id()), Default::default())?;
    store.release(app)?;
    store.release(base)?;

    let removed = store.release_rw_layer(&rw)?;
    assert_eq!(removed.len(), 2);
    assert!(store.map().is_empty());
    assert!(driver.cache_ids()?.is_empty());
    Ok(())
}

#[test]
fn test_name_conflicts() -> Result<()> {
    let tmp = tempdir();
    let (store, _driver) = open_store(tmp.path());

    let first = store.create_rw_layer("web", None, Default::default())?;
    assert!(matches!(
        store.create_rw_layer("web", None, Default::default()),
        Err(Error::MountNameConflict)
    ));
    assert!(matches!(
        store.create_rw_layer("a/b", None, Default::default()),
        Err(Error::InvalidMountName(_))
    ));

    let first_id = first.mount_id()?;
    store.release_rw_layer(&first)?;
    let second = store.create_rw_layer("web", None, Default::default())?;
    assert_ne!(second.mount_id()?, first_id);
    Ok(())
}

#[test]
fn test_handles_are_counted() -> Result<()> {
    let tmp = tempdir();
    let (store, driver) = open_store(tmp.path());

    let created = store.create_rw_layer("web", None, Default::default())?;
    let other = store.get_rw_layer("web")?;
    let mount_id = created.mount_id()?;
    assert!(matches!(store.get_rw_layer("db"), Err(Error::MountDoesNotExist)));

    assert!(store.release_rw_layer(&created)?.is_empty());
    assert!(driver.exists(&mount_id));
    assert!(matches!(created.mount_id(), Err(Error::LayerNotRetained)));
    assert!(matches!(
        store.release_rw_layer(&created),
        Err(Error::LayerNotRetained)
    ));

    store.release_rw_layer(&other)?;
    assert!(!driver.exists(&mount_id));
    // already gone
    assert!(store.release_rw_layer(&other)?.is_empty());
    Ok(())
}

#[test]
fn test_mount_and_unmount() -> Result<()> {
    let tmp = tempdir();
    let (store, driver) = open_store(tmp.path());

    let base = store.register(&tar_of(&[("etc/os-release", "ID=test\n")])[..], None)?;
    let rw = store.create_rw_layer("web", Some(base.chain_id()), Default::default())?;
    let mount_id = rw.mount_id()?;

    assert!(matches!(rw.unmount(), Err(Error::NotMounted)));

    let path = rw.mount("")?;
    assert_eq!(fs::read_to_string(path.join("etc/os-release"))?, "ID=test\n");
    assert_eq!(rw.mount("")?, path);
    assert_eq!(rw.mount_count()?, 2);
    assert_eq!(driver.vfs().active_count(&mount_id), 2);

    fs::write(path.join("scratch"), "12345")?;
    assert!(rw.size()? >= 5);
    assert_eq!(rw.metadata()?["Path"], path.display().to_string());

    rw.unmount()?;
    rw.unmount()?;
    assert_eq!(driver.vfs().active_count(&mount_id), 0);
    assert!(matches!(rw.unmount(), Err(Error::NotMounted)));

    // mounts are tracked per handle
    let other = store.get_rw_layer("web")?;
    other.mount("")?;
    assert_eq!(other.mount_count()?, 1);
    assert_eq!(rw.mount_count()?, 0);
    Ok(())
}

#[test]
fn test_init_layer() -> Result<()> {
    let tmp = tempdir();
    let (store, driver) = open_store(tmp.path());

    let base = store.register(&tar_of(&[("etc/hosts", "127.0.0.1 localhost\n")])[..], None)?;
    let opts = with_init(|root| {
        fs::create_dir_all(root.join("etc"))?;
        fs::write(root.join("etc/hostname"), "web\n")?;
        Ok(())
    });
    let rw = store.create_rw_layer("web", Some(base.chain_id()), opts)?;
    let mount_id = rw.mount_id()?;
    let init_id = format!("{mount_id}-init");
    assert!(driver.exists(&init_id));

    let path = rw.mount("")?;
    assert_eq!(fs::read_to_string(path.join("etc/hostname"))?, "web\n");
    assert_eq!(fs::read_to_string(path.join("etc/hosts"))?, "127.0.0.1 localhost\n");
    // the base layer is not touched
    let base_path = base.metadata()?["Path"].clone();
    assert!(!std::path::Path::new(&base_path).join("etc/hostname").exists());
    rw.unmount()?;

    store.release_rw_layer(&rw)?;
    assert!(!driver.exists(&mount_id));
    assert!(!driver.exists(&init_id));
    Ok(())
}

#[test]
fn test_failed_create_rolls_back() -> Result<()> {
    let tmp = tempdir();
    let (store, driver) = open_store(tmp.path());
    let base = store.register(&layer_tar("base")[..], None)?;

    driver.fail_create_read_write.store(true, Ordering::SeqCst);
    let err = store
        .create_rw_layer("web", Some(base.chain_id()), Default::default())
        .unwrap_err();
    assert!(matches!(err, Error::Driver(_)), "{err}");
    assert_eq!(driver.cache_ids()?, vec![base.info().cache_id().to_string()]);
    assert!(store.mount_names().is_empty());
    assert_eq!(store.reference_counts()[base.chain_id()], 1);

    driver.fail_create_read_write.store(false, Ordering::SeqCst);
    let err = store
        .create_rw_layer(
            "web",
            Some(base.chain_id()),
            with_init(|_| anyhow::bail!("no room")),
        )
        .unwrap_err();
    assert!(format!("{err:#}").contains("no room"), "{err:#}");
    assert_eq!(driver.cache_ids()?.len(), 1);
    assert_eq!(store.reference_counts()[base.chain_id()], 1);

    store.create_rw_layer("web", Some(base.chain_id()), Default::default())?;
    assert_eq!(store.reference_counts()[base.chain_id()], 2);
    Ok(())
}

#[test]
fn test_failed_release_can_be_retried() -> Result<()> {
    let tmp = tempdir();
    let (store, driver) = open_store(tmp.path());
    let base = store.register(&layer_tar("base")[..], None)?;
    let rw = store.create_rw_layer("web", Some(base.chain_id()), Default::default())?;
    rw.mount("")?;
    let mount_id = rw.mount_id()?;

    driver.fail_remove.store(true, Ordering::SeqCst);
    assert!(matches!(store.release_rw_layer(&rw), Err(Error::Driver(_))));
    assert_eq!(rw.mount_id()?, mount_id);
    assert_eq!(rw.mount_count()?, 1);
    assert_eq!(store.reference_counts()[base.chain_id()], 2);

    driver.fail_remove.store(false, Ordering::SeqCst);
    assert!(store.release_rw_layer(&rw)?.is_empty());
    assert!(!driver.exists(&mount_id));
    assert_eq!(driver.removals(&mount_id), 1);
    assert_eq!(store.reference_counts()[base.chain_id()], 1);
    Ok(())
}

#[test]
fn test_live_restore() -> Result<()> {
    let tmp = tempdir();
    let mount_id = {
        let (store, _driver) = open_store(tmp.path());
        let rw = store.create_rw_layer("web", None, Default::default())?;
        rw.mount("")?;
        rw.mount_id()?
    };

    let (store, driver) = open_store(tmp.path());
    let rw = store.get_rw_layer("web")?;
    assert_eq!(rw.mount_count()?, 0);
    assert_eq!(driver.vfs().active_count(&mount_id), 0);

    store.live_restore(&rw)?;
    assert_eq!(rw.mount_count()?, 1);
    assert_eq!(driver.vfs().active_count(&mount_id), 1);

    rw.unmount()?;
    assert_eq!(driver.vfs().active_count(&mount_id), 0);
    Ok(())
}

#[test]
fn test_failed_unmount_keeps_count() -> Result<()> {
    let tmp = tempdir();
    let (store, driver) = open_store(tmp.path());
    let rw = store.create_rw_layer("web", None, Default::default())?;
    let mount_id = rw.mount_id()?;
    rw.mount("")?;

    driver.fail_put.store(true, Ordering::SeqCst);
    assert!(matches!(rw.unmount(), Err(Error::Driver(_))));
    assert_eq!(rw.mount_count()?, 1);
    assert_eq!(driver.vfs().active_count(&mount_id), 1);

    driver.fail_put.store(false, Ordering::SeqCst);
    rw.unmount()?;
    assert_eq!(rw.mount_count()?, 0);
    assert_eq!(driver.vfs().active_count(&mount_id), 0);
    Ok(())
}
