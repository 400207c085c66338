//! Integration tests for registration, image selection and symbol resolution
//!
//! Every test drives the public runtime API against the host backend.

use std::sync::Arc;
use std::thread;

use offload_runtime::{
    BinaryDescriptor, DeviceAddress, DeviceHandle, DeviceImage, EntryFlags, EntryRecord, HostBackend, OffloadError,
    OffloadRuntime, Result, RuntimeConfig,
};

const DEV_X: DeviceHandle = DeviceHandle::new(0, 0);
const DEV_Y: DeviceHandle = DeviceHandle::new(0, 1);

fn setup() -> (Arc<HostBackend>, OffloadRuntime) {
    offload_tracing::init_test_tracing();
    let backend = Arc::new(HostBackend::new());
    backend.add_device(DEV_X, "arch-x");
    backend.add_device(DEV_Y, "arch-y");
    (backend.clone(), OffloadRuntime::new(backend))
}

fn kernel_and_global(arch: &str) -> DeviceImage {
    DeviceImage::new(
        arch,
        arch.as_bytes().to_vec(),
        vec![EntryRecord::function("kernel1"), EntryRecord::global("gvar", 64)],
    )
}

fn host_entries(desc: BinaryDescriptor) -> BinaryDescriptor {
    desc.with_host_entry(EntryRecord::function("kernel1"))
        .with_host_entry(EntryRecord::global("gvar", 64))
}

// ============================================================================
// Selection
// ============================================================================

#[test]
fn test_arch_x_loads_and_arch_y_has_no_image() -> Result<()> {
    let (_backend, runtime) = setup();
    let id = runtime.register(host_entries(BinaryDescriptor::new().with_image(kernel_and_global("arch-x"))));

    let table = runtime.load(DEV_X, id)?;
    assert_eq!(table.len(), 2);
    assert!(table.iter().all(|entry| !entry.address.is_null()));
    assert_eq!(table.entries()[0].name, "kernel1");
    assert_eq!(table.entries()[1].size, 64);

    match runtime.load(DEV_Y, id) {
        Err(OffloadError::NoCompatibleImage { architecture, available }) => {
            assert_eq!(architecture, "arch-y");
            assert_eq!(available, vec!["arch-x".to_string()]);
        }
        other => panic!("expected NoCompatibleImage, got {other:?}"),
    }
    assert!(!runtime.is_loaded(DEV_Y, id));
    Ok(())
}

#[test]
fn test_each_device_gets_its_own_image() -> Result<()> {
    let (backend, runtime) = setup();
    let id = runtime.register(host_entries(
        BinaryDescriptor::new()
            .with_image(kernel_and_global("arch-y"))
            .with_image(kernel_and_global("arch-x")),
    ));

    runtime.load(DEV_X, id)?;
    runtime.load(DEV_Y, id)?;
    assert_eq!(runtime.loaded_devices(id), vec![DEV_X, DEV_Y]);
    assert_eq!(backend.loaded_image_count(DEV_X), 1);
    assert_eq!(backend.loaded_image_count(DEV_Y), 1);

    runtime.unload(DEV_X, id)?;
    assert_eq!(runtime.loaded_devices(id), vec![DEV_Y]);
    runtime.unload(DEV_Y, id)?;
    runtime.unregister(id)?;
    assert_eq!(runtime.registered_count(), 0);
    Ok(())
}

#[test]
fn test_duplicate_architecture_rejected() {
    let (backend, runtime) = setup();
    let id = runtime.register(host_entries(
        BinaryDescriptor::new()
            .with_image(kernel_and_global("arch-x"))
            .with_image(kernel_and_global("arch-x")),
    ));

    assert!(matches!(
        runtime.load(DEV_X, id),
        Err(OffloadError::DuplicateImage { architecture }) if architecture == "arch-x"
    ));
    assert_eq!(backend.loaded_image_count(DEV_X), 0);
}

// ============================================================================
// Resolution
// ============================================================================

#[test]
fn test_resolution_follows_host_order() -> Result<()> {
    let (_backend, runtime) = setup();
    let image = DeviceImage::new(
        "arch-x",
        vec![],
        (0..8).rev().map(|i| EntryRecord::function(format!("k{i}"))).collect(),
    );
    let desc = (0..8).fold(BinaryDescriptor::new().with_image(image), |desc, i| {
        desc.with_host_entry(EntryRecord::function(format!("k{i}")))
    });
    let id = runtime.register(desc);

    let table = runtime.load(DEV_X, id)?;
    let names: Vec<_> = table.iter().map(|e| e.name.clone()).collect();
    let expected: Vec<_> = (0..8).map(|i| format!("k{i}")).collect();
    assert_eq!(names, expected);
    Ok(())
}

#[test]
fn test_unresolved_symbol_produces_no_table() {
    let (backend, runtime) = setup();
    let id = runtime.register(
        host_entries(BinaryDescriptor::new().with_image(kernel_and_global("arch-x")))
            .with_host_entry(EntryRecord::function("kernel2")),
    );

    match runtime.load(DEV_X, id) {
        Err(OffloadError::UnresolvedSymbol { name, device }) => {
            assert_eq!(name, "kernel2");
            assert_eq!(device, DEV_X);
        }
        other => panic!("expected UnresolvedSymbol, got {other:?}"),
    }
    assert!(runtime.table(DEV_X, id).is_none());
    assert_eq!(backend.loaded_image_count(DEV_X), 0);
}

#[test]
fn test_weak_symbol_resolves_to_null() -> Result<()> {
    let (_backend, runtime) = setup();
    let id = runtime.register(
        host_entries(BinaryDescriptor::new().with_image(kernel_and_global("arch-x")))
            .with_host_entry(EntryRecord::function("optional_hook").with_flags(EntryFlags::WEAK)),
    );

    let table = runtime.load(DEV_X, id)?;
    assert_eq!(table.len(), 3);
    assert_eq!(table.address_of("optional_hook"), Some(DeviceAddress::NULL));
    assert!(!table.address_of("kernel1").unwrap_or_default().is_null());
    Ok(())
}

#[test]
fn test_malformed_binary_surfaces_at_load() {
    let (_backend, runtime) = setup();
    let image = DeviceImage::new("arch-x", vec![], vec![EntryRecord::global("gvar", 32)]);
    let id = runtime.register(BinaryDescriptor::new().with_image(image).with_host_entry(EntryRecord::global("gvar", 64)));

    assert!(runtime.descriptor(id).is_some());
    assert!(matches!(runtime.load(DEV_X, id), Err(OffloadError::MalformedBinary(_))));
}

#[test]
fn test_oversized_global_fails_load_without_panicking() {
    let (backend, runtime) = setup();
    let image = DeviceImage::new("arch-x", vec![], vec![EntryRecord::global("g", u64::MAX - 4)]);
    let id = runtime.register(BinaryDescriptor::new().with_image(image).with_host_entry(EntryRecord::global("g", u64::MAX - 4)));

    assert!(matches!(runtime.load(DEV_X, id), Err(OffloadError::Backend(_))));
    assert!(!runtime.is_loaded(DEV_X, id));
    assert_eq!(backend.loaded_image_count(DEV_X), 0);
}

#[test]
fn test_size_check_can_be_disabled() -> Result<()> {
    let backend = Arc::new(HostBackend::new());
    backend.add_device(DEV_X, "arch-x");
    let config = RuntimeConfig::from_json(r#"{ "check_global_sizes": false }"#)?;
    let runtime = OffloadRuntime::with_config(backend, config);

    let image = DeviceImage::new("arch-x", vec![], vec![EntryRecord::global("gvar", 32)]);
    let id = runtime.register(BinaryDescriptor::new().with_image(image).with_host_entry(EntryRecord::global("gvar", 64)));
    assert_eq!(runtime.load(DEV_X, id)?.len(), 1);
    Ok(())
}

#[test]
fn test_descriptor_from_json() -> Result<()> {
    let (_backend, runtime) = setup();
    let desc = BinaryDescriptor::from_json(
        r#"{
            "images": [
                { "info": { "architecture": "arch-x" },
                  "entries": [ { "name": "kernel1" }, { "name": "gvar", "size": 64 } ] }
            ],
            "host_entries": [ { "name": "kernel1" }, { "name": "gvar", "size": 64 } ]
        }"#,
    )?;
    let id = runtime.register(desc);
    assert_eq!(runtime.load(DEV_X, id)?.len(), 2);
    Ok(())
}

// ============================================================================
// Concurrency
// ============================================================================

#[test]
fn test_concurrent_loads_share_one_table() {
    let (backend, runtime) = setup();
    let runtime = Arc::new(runtime);
    let id = runtime.register(host_entries(BinaryDescriptor::new().with_image(kernel_and_global("arch-x"))));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let runtime = Arc::clone(&runtime);
            thread::spawn(move || runtime.load(DEV_X, id))
        })
        .collect();

    let tables: Vec<_> = handles
        .into_iter()
        .map(|h| h.join().expect("loader thread panicked").expect("load failed"))
        .collect();
    assert!(tables.windows(2).all(|pair| Arc::ptr_eq(&pair[0], &pair[1])));
    assert_eq!(backend.loaded_image_count(DEV_X), 1);
}
