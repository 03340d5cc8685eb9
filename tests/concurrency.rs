use std::thread;

use anyhow::Result;
use similar_asserts::assert_eq;

use layerstore::GraphDriver;

mod common;
use common::{export, layer_tar, open_store, tempdir};

#[test]
fn test_parallel_lifecycles() -> Result<()> {
    let tmp = tempdir();
    let (store, driver) = open_store(tmp.path());
    let shared = layer_tar("shared");

    let workers: Vec<_> = (0..8)
        .map(|i| {
            let store = store.clone();
            let shared = shared.clone();
            thread::spawn(move || -> Result<()> {
                let base = store.register(&shared[..], None)?;
                let own_tar = layer_tar(&format!("worker-{i}"));
                let own = store.register(&own_tar[..], Some(base.chain_id()))?;
                assert_eq!(export(&own)?, own_tar);

                let name = format!("container-{i}");
                let rw = store.create_rw_layer(&name, Some(own.chain_id()), Default::default())?;
                rw.mount("")?;
                rw.unmount()?;

                store.release(own)?;
                store.release(base)?;
                store.release_rw_layer(&rw)?;
                Ok(())
            })
        })
        .collect();
    for worker in workers {
        worker.join().expect("worker panicked")?;
    }

    assert!(store.map().is_empty());
    assert!(store.mount_names().is_empty());
    assert_eq!(driver.cache_ids()?, Vec::<String>::new());
    Ok(())
}

#[test]
fn test_cleanup_during_registration() -> Result<()> {
    let tmp = tempdir();
    let (store, _driver) = open_store(tmp.path());

    let cleaner = {
        let store = store.clone();
        thread::spawn(move || -> Result<()> {
            for _ in 0..20 {
                store.cleanup()?;
            }
            Ok(())
        })
    };
    let mut layers = Vec::new();
    for i in 0..20 {
        let tar = layer_tar(&format!("layer-{i}"));
        let layer = store.register(&tar[..], None)?;
        assert_eq!(export(&layer)?, tar);
        layers.push(layer);
    }
    cleaner.join().expect("cleaner panicked")?;

    store.cleanup()?;
    for (i, layer) in layers.iter().enumerate() {
        assert_eq!(export(layer)?, layer_tar(&format!("layer-{i}")));
    }
    Ok(())
}
