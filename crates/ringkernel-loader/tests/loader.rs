//! End-to-end loader tests over the mock toolchain and driver.

use std::collections::BTreeMap;
use std::fs;
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use ringkernel_loader::mock::{MockDriver, MockToolchain};
use ringkernel_loader::{
    ArtifactFormat, CompiledArtifact, DeviceLoadErrorKind, EmbeddedProvider, FilesystemProvider,
    KernelLoader, KernelRequest, KernelSource, LoaderConfig, LoaderError, Severity,
};
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

const SAXPY: &str = r#"
extern "C" __global__ void saxpy(float a, const float* x, float* y, int n) {
    int i = blockIdx.x * blockDim.x + threadIdx.x;
    if (i < n) y[i] = a * x[i] + y[i];
}
"#;

struct Harness {
    loader: Arc<KernelLoader>,
    toolchain: Arc<MockToolchain>,
    driver: Arc<MockDriver>,
}

/// Logs to the test harness when `RUST_LOG` is set.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn harness_with(dir: &TempDir, toolchain: MockToolchain, driver: MockDriver) -> Harness {
    init_tracing();
    let toolchain = Arc::new(toolchain);
    let driver = Arc::new(driver);
    let loader = KernelLoader::new(
        toolchain.clone(),
        driver.clone(),
        LoaderConfig::default().with_cache_dir(dir.path()),
    )
    .unwrap();
    Harness {
        loader: Arc::new(loader),
        toolchain,
        driver,
    }
}

fn harness(dir: &TempDir) -> Harness {
    harness_with(dir, MockToolchain::new(), MockDriver::new())
}

fn saxpy() -> KernelRequest {
    KernelRequest::new("saxpy", KernelSource::text(SAXPY), "sm_80")
}

fn vec_provider(content: &str) -> Arc<EmbeddedProvider> {
    Arc::new(EmbeddedProvider::from_entries(
        "vec",
        [("vec.cuh".to_string(), content.to_string())],
    ))
}

#[test]
fn test_fingerprint_deterministic() {
    let dir = TempDir::new().unwrap();
    let h = harness(&dir);

    let a = h.loader.fingerprint(&saxpy()).unwrap();
    let b = h.loader.fingerprint(&saxpy()).unwrap();
    assert_eq!(a, b);

    // A second loader with the same toolchain agrees.
    let other = harness(&dir);
    assert_eq!(other.loader.fingerprint(&saxpy()).unwrap(), a);

    let variants = [
        saxpy().with_flag("-O3"),
        KernelRequest::new("saxpy", KernelSource::text(SAXPY), "sm_75"),
        KernelRequest::new("saxpy", KernelSource::text(format!("{}\n// edit", SAXPY)), "sm_80"),
        saxpy().with_entry("other"),
        saxpy().with_constant("scale"),
    ];
    for variant in &variants {
        assert_ne!(h.loader.fingerprint(variant).unwrap(), a, "{:?}", variant);
    }

    let newer = harness_with(&dir, MockToolchain::new().with_version("2.0"), MockDriver::new());
    assert_ne!(newer.loader.fingerprint(&saxpy()).unwrap(), a);
}

#[test]
fn test_fingerprint_tracks_include_content() {
    let dir = TempDir::new().unwrap();
    let h = harness(&dir);
    let request = KernelRequest::new(
        "add",
        KernelSource::text("#include \"vec.cuh\"\nextern \"C\" __global__ void add() {}\n"),
        "sm_80",
    );

    h.loader.register_provider(vec_provider("#define WIDTH 4\n"), 0);
    let before = h.loader.fingerprint(&request).unwrap();
    h.loader.register_provider(vec_provider("#define WIDTH 8\n"), 0);
    let after = h.loader.fingerprint(&request).unwrap();
    assert_ne!(before, after);
}

#[test]
fn test_at_most_once_compile() {
    const THREADS: usize = 8;
    let dir = TempDir::new().unwrap();
    let h = harness_with(
        &dir,
        MockToolchain::new().with_delay(Duration::from_millis(100)),
        MockDriver::new(),
    );

    let handles: Vec<_> = std::thread::scope(|scope| {
        let workers: Vec<_> = (0..THREADS)
            .map(|_| {
                let loader = Arc::clone(&h.loader);
                scope.spawn(move || loader.get_kernel(&saxpy()).unwrap())
            })
            .collect();
        workers.into_iter().map(|w| w.join().unwrap()).collect()
    });

    assert_eq!(h.toolchain.compile_count(), 1);
    assert_eq!(h.loader.stats().compilations(), 1);
    assert_eq!(h.loader.stats().disk_writes(), 1);
    assert_eq!(h.loader.stats().memory_hits(), THREADS as u64 - 1);
    assert_eq!(h.loader.store().stats().entries, 1);
    assert_eq!(h.driver.total_loads(), 1);
    assert!(handles.iter().all(|handle| handle.same_module(&handles[0])));
}

#[test]
fn test_concurrent_compile_failure_reported_once() {
    let dir = TempDir::new().unwrap();
    let h = harness_with(
        &dir,
        MockToolchain::new().with_delay(Duration::from_millis(100)),
        MockDriver::new(),
    );
    let bad = KernelRequest::new("k", KernelSource::text("#error broken\n"), "sm_80");

    let results: Vec<_> = std::thread::scope(|scope| {
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let loader = Arc::clone(&h.loader);
                let bad = bad.clone();
                scope.spawn(move || loader.get_kernel(&bad))
            })
            .collect();
        workers.into_iter().map(|w| w.join().unwrap()).collect()
    });

    assert!(results
        .iter()
        .all(|r| matches!(r, Err(LoaderError::Compile(_)))));
    assert_eq!(h.toolchain.compile_count(), 1);
}

#[test]
fn test_distinct_fingerprints_compile_independently() {
    let dir = TempDir::new().unwrap();
    let gate = Arc::new(Mutex::new(()));
    let h = harness_with(
        &dir,
        MockToolchain::new().with_gate("slow", Arc::clone(&gate)),
        MockDriver::new(),
    );
    let slow = KernelRequest::new(
        "slow",
        KernelSource::text("extern \"C\" __global__ void slow() {}\n"),
        "sm_80",
    );

    std::thread::scope(|scope| {
        let held = gate.lock();
        let loader = Arc::clone(&h.loader);
        let first = scope.spawn(move || loader.get_kernel(&slow).map(|k| k.fingerprint()));

        // Wait until the first request is inside the toolchain.
        let started = Instant::now();
        while h.toolchain.compile_count() == 0 {
            assert!(started.elapsed() < Duration::from_secs(10), "first compile never started");
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(h.loader.compiles_in_flight(), 1);

        // A different fingerprint completes while the first is still held.
        let (tx, rx) = mpsc::channel();
        let loader = Arc::clone(&h.loader);
        scope.spawn(move || {
            let _ = tx.send(loader.get_kernel(&saxpy()).map(|k| k.entry().to_string()));
        });
        let second = rx
            .recv_timeout(Duration::from_secs(10))
            .expect("second request waited for the first");
        assert_eq!(second.unwrap(), "saxpy");
        assert_eq!(h.loader.compiles_in_flight(), 1);
        assert_eq!(h.toolchain.compile_count(), 2);

        drop(held);
        first.join().unwrap().unwrap();
    });

    assert_eq!(h.loader.compiles_in_flight(), 0);
    assert_eq!(h.loader.cached_modules(), 2);
    assert_eq!(h.loader.stats().compilations(), 2);
}

#[test]
fn test_cache_hit_skips_compilation() {
    let dir = TempDir::new().unwrap();
    let h = harness(&dir);

    let first = h.loader.get_kernel(&saxpy()).unwrap();
    let second = h.loader.get_kernel(&saxpy()).unwrap();

    assert!(first.same_module(&second));
    assert_eq!(h.toolchain.compile_count(), 1);
    assert_eq!(h.loader.stats().memory_hits(), 1);
    assert_eq!(h.loader.stats().disk_hits(), 0);
    assert_eq!(h.driver.total_loads(), 1);
}

#[test]
fn test_disk_cache_shared_between_loaders() {
    let dir = TempDir::new().unwrap();
    let first = harness(&dir);
    first.loader.get_kernel(&saxpy()).unwrap();

    let second = harness(&dir);
    let handle = second.loader.get_kernel(&saxpy()).unwrap();

    assert_eq!(second.toolchain.compile_count(), 0);
    assert_eq!(second.loader.stats().disk_hits(), 1);
    assert_eq!(second.loader.stats().disk_writes(), 0);
    assert_eq!(handle.entry(), "saxpy");
}

#[test]
fn test_disabled_disk_cache() {
    let dir = TempDir::new().unwrap();
    let toolchain = Arc::new(MockToolchain::new());
    let loader = KernelLoader::new(
        toolchain.clone(),
        Arc::new(MockDriver::new()),
        LoaderConfig::default()
            .with_cache_dir(dir.path())
            .without_disk_cache(),
    )
    .unwrap();

    loader.get_kernel(&saxpy()).unwrap();
    loader.release();
    loader.get_kernel(&saxpy()).unwrap();

    assert_eq!(toolchain.compile_count(), 2);
    assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[test]
fn test_resolver_priority() {
    let dir = TempDir::new().unwrap();
    let include = TempDir::new().unwrap();
    fs::write(include.path().join("vec.cuh"), "#define SOURCE_FS 1\n").unwrap();

    let h = harness(&dir);
    let fs_provider = Arc::new(FilesystemProvider::new(include.path()));
    let embedded = vec_provider("#define SOURCE_EMBEDDED 1\n");
    let request = KernelRequest::new(
        "add",
        KernelSource::text("#include <vec.cuh>\nextern \"C\" __global__ void add() {}\n"),
        "sm_80",
    );

    h.loader.register_provider(fs_provider.clone(), 10);
    h.loader.register_provider(embedded.clone(), 0);
    let fs_first = h.loader.fingerprint(&request).unwrap();

    h.loader.register_provider(fs_provider.clone(), 0);
    h.loader.register_provider(embedded.clone(), 10);
    let embedded_first = h.loader.fingerprint(&request).unwrap();
    assert_ne!(fs_first, embedded_first);

    // Only the embedded copy registered gives the same fingerprint as
    // embedded-first resolution.
    let only_embedded = harness(&dir);
    only_embedded.loader.register_provider(embedded, 0);
    assert_eq!(only_embedded.loader.fingerprint(&request).unwrap(), embedded_first);

    // Equal priority: filesystem wins.
    let tie = harness(&dir);
    tie.loader.register_provider(vec_provider("#define SOURCE_EMBEDDED 1\n"), 5);
    tie.loader.register_provider(fs_provider, 5);
    assert_eq!(tie.loader.fingerprint(&request).unwrap(), fs_first);
}

#[test]
fn test_request_include_dir_searched_first() {
    let dir = TempDir::new().unwrap();
    let include = TempDir::new().unwrap();
    fs::write(include.path().join("vec.cuh"), "#define LOCAL 1\n").unwrap();

    let h = harness(&dir);
    h.loader.register_provider(vec_provider("#define GLOBAL 1\n"), 1000);
    let source = KernelSource::text("#include \"vec.cuh\"\nextern \"C\" __global__ void k() {}\n");

    let global = h
        .loader
        .fingerprint(&KernelRequest::new("k", source.clone(), "sm_80"))
        .unwrap();
    let local = h
        .loader
        .fingerprint(&KernelRequest::new("k", source, "sm_80").with_include_dir(include.path()))
        .unwrap();
    assert_ne!(global, local);
}

#[test]
fn test_truncated_artifact_recovered() {
    let dir = TempDir::new().unwrap();
    let first = harness(&dir);
    let fingerprint = first.loader.fingerprint(&saxpy()).unwrap();
    first.loader.get_kernel(&saxpy()).unwrap();

    let image = dir.path().join(format!("{}.ptx", fingerprint.to_hex()));
    let bytes = fs::read(&image).unwrap();
    fs::write(&image, &bytes[..bytes.len() / 2]).unwrap();

    let second = harness(&dir);
    let handle = second.loader.get_kernel(&saxpy()).unwrap();

    assert_eq!(handle.entry(), "saxpy");
    assert_eq!(second.toolchain.compile_count(), 1);
    assert_eq!(second.loader.stats().corrupt_recoveries(), 1);
    assert_eq!(second.loader.stats().disk_writes(), 1);
    assert_eq!(fs::read(&image).unwrap(), bytes);
}

#[test]
fn test_rejected_artifact_recovered() {
    let dir = TempDir::new().unwrap();
    let h = harness(&dir);
    let fingerprint = h.loader.fingerprint(&saxpy()).unwrap();

    // Internally consistent on disk, but not an image the driver accepts.
    let bogus = CompiledArtifact {
        image: b"not a module".to_vec(),
        format: ArtifactFormat::Ptx,
        arch: "sm_80".to_string(),
        entries: BTreeMap::from([("saxpy".to_string(), "saxpy".to_string())]),
        constants: BTreeMap::new(),
    };
    assert!(h.loader.store().store(&fingerprint, &bogus).unwrap());

    let handle = h.loader.get_kernel(&saxpy()).unwrap();
    assert_eq!(handle.fingerprint(), fingerprint);
    assert_eq!(h.toolchain.compile_count(), 1);
    assert_eq!(h.loader.stats().corrupt_recoveries(), 1);

    // The rebuilt artifact replaced the bogus one.
    let stored = h.loader.store().load(&fingerprint).unwrap().unwrap();
    assert_ne!(stored.image, bogus.image);
}

#[test]
fn test_vec_scenario() {
    let dir = TempDir::new().unwrap();
    let h = harness(&dir);
    h.loader.register_provider(
        vec_provider("struct vec2 { float x, y; };\n"),
        0,
    );

    let source = KernelSource::text(
        "#include <vec.cuh>\n__global__ void add(vec2* out, const vec2* a, const vec2* b) {}\n",
    );
    let o3 = KernelRequest::new("add", source.clone(), "sm_80").with_flag("-O3");

    let first = h.loader.get_kernel(&o3).unwrap();
    assert_eq!(h.toolchain.compile_count(), 1);

    let second = h.loader.get_kernel(&o3).unwrap();
    assert!(first.same_module(&second));
    assert_eq!(h.toolchain.compile_count(), 1);

    let o2 = KernelRequest::new("add", source, "sm_80").with_flag("-O2");
    let third = h.loader.get_kernel(&o2).unwrap();
    assert_ne!(third.fingerprint(), first.fingerprint());
    assert!(!third.same_module(&first));
    assert_eq!(h.toolchain.compile_count(), 2);
    assert_eq!(h.loader.cached_modules(), 2);
}

#[test]
fn test_source_not_found() {
    let dir = TempDir::new().unwrap();
    let h = harness(&dir);

    // Host-only includes behind `__CUDACC_RTC__` never reach the compiler.
    let guarded = KernelRequest::new(
        "add",
        KernelSource::text(
            "#ifndef __CUDACC_RTC__\n#include <cstdio>\n#endif\nextern \"C\" __global__ void add() {}\n",
        ),
        "sm_80",
    );
    assert_eq!(h.loader.get_kernel(&guarded).unwrap().entry(), "add");
    assert_eq!(h.toolchain.compile_count(), 1);

    // A live include nobody has is reported once the compiler asks for it.
    let request = KernelRequest::new(
        "k",
        KernelSource::text("#include \"missing.cuh\"\nextern \"C\" __global__ void k() {}\n"),
        "sm_80",
    );
    match h.loader.get_kernel(&request) {
        Err(LoaderError::SourceNotFound {
            name,
            included_from,
            searched,
        }) => {
            assert_eq!(name, "missing.cuh");
            assert_eq!(included_from.as_deref(), Some("main.cu"));
            assert_eq!(searched, vec!["embedded:ringkernel"]);
        }
        other => panic!("expected SourceNotFound, got {:?}", other),
    }
    assert_eq!(h.toolchain.compile_count(), 2);
    assert_eq!(h.loader.cached_modules(), 1);

    let named = KernelRequest::new("k", KernelSource::named("kernels/k.cu"), "sm_80");
    assert!(matches!(
        h.loader.get_kernel(&named),
        Err(LoaderError::SourceNotFound { included_from: None, .. })
    ));
    assert_eq!(h.toolchain.compile_count(), 2);
}

#[test]
fn test_local_override_with_non_utf8_content() {
    let dir = TempDir::new().unwrap();
    let include = TempDir::new().unwrap();
    fs::write(include.path().join("vec.cuh"), b"// caf\xe9\n#define W 4\n").unwrap();
    let request = KernelRequest::new(
        "add",
        KernelSource::text("#include <vec.cuh>\nextern \"C\" __global__ void add() {}\n"),
        "sm_80",
    );

    // The local copy wins over the embedded one even though it is not UTF-8.
    let h = harness(&dir);
    h.loader
        .register_provider(Arc::new(FilesystemProvider::new(include.path())), 0);
    h.loader.register_provider(vec_provider("#define W 8\n"), 0);
    let local = h.loader.fingerprint(&request).unwrap();

    let embedded_only = harness(&dir);
    embedded_only
        .loader
        .register_provider(vec_provider("#define W 8\n"), 0);
    assert_ne!(local, embedded_only.loader.fingerprint(&request).unwrap());

    // On its own the local root is enough.
    let local_only = harness(&dir);
    local_only
        .loader
        .register_provider(Arc::new(FilesystemProvider::new(include.path())), 0);
    let kernel = local_only.loader.get_kernel(&request).unwrap();
    assert_eq!(kernel.fingerprint(), local);
    assert_eq!(local_only.toolchain.compile_count(), 1);
}

#[test]
fn test_named_source() {
    let dir = TempDir::new().unwrap();
    let include = TempDir::new().unwrap();
    fs::create_dir_all(include.path().join("kernels")).unwrap();
    fs::write(include.path().join("kernels/saxpy.cu"), SAXPY).unwrap();

    let h = harness(&dir);
    h.loader
        .register_provider(Arc::new(FilesystemProvider::new(include.path())), 0);
    let request = KernelRequest::new("saxpy", KernelSource::named("kernels/saxpy.cu"), "sm_80");
    assert_eq!(h.loader.get_kernel(&request).unwrap().entry(), "saxpy");
}

#[test]
fn test_compile_error() {
    let dir = TempDir::new().unwrap();
    let h = harness(&dir);
    let request = KernelRequest::new(
        "k",
        KernelSource::text("extern \"C\" __global__ void k() {}\n#error unsupported width\n"),
        "sm_80",
    );

    match h.loader.get_kernel(&request) {
        Err(LoaderError::Compile(err)) => {
            assert_eq!(err.kernel, "k");
            let error = err.errors().next().unwrap();
            assert_eq!(error.file, "main.cu");
            assert_eq!(error.line, 2);
            assert_eq!(error.severity, Severity::Error);
            assert!(err.log.contains("unsupported width"));
            assert!(err.missing_include.is_none());
        }
        other => panic!("expected Compile, got {:?}", other),
    }
    assert_eq!(h.loader.cached_modules(), 0);
    assert_eq!(h.loader.store().stats().entries, 0);
}

#[test]
fn test_architecture_mismatch() {
    let dir = TempDir::new().unwrap();
    let h = harness(&dir);
    let request = KernelRequest::new("saxpy", KernelSource::text(SAXPY), "sm_90");

    match h.loader.get_kernel(&request) {
        Err(LoaderError::DeviceLoad(err)) => {
            assert!(matches!(
                err.kind,
                DeviceLoadErrorKind::ArchitectureMismatch { .. }
            ));
            assert!(!err.is_retryable());
        }
        other => panic!("expected DeviceLoad, got {:?}", other),
    }
    assert_eq!(h.toolchain.compile_count(), 0);

    // Older targets still run on newer devices.
    let older = KernelRequest::new("saxpy", KernelSource::text(SAXPY), "sm_75");
    assert!(h.loader.get_kernel(&older).is_ok());
}

#[test]
fn test_arch_specific_target() {
    let dir = TempDir::new().unwrap();
    let h = harness(&dir);

    // The mock device is 8.0.
    let exact = KernelRequest::new("saxpy", KernelSource::text(SAXPY), "sm_80a");
    let kernel = h.loader.get_kernel(&exact).unwrap();
    assert_eq!(kernel.entry(), "saxpy");
    assert_ne!(
        h.loader.fingerprint(&exact).unwrap(),
        h.loader.fingerprint(&saxpy()).unwrap()
    );

    // Architecture-specific code is not forward compatible.
    let older = KernelRequest::new("saxpy", KernelSource::text(SAXPY), "sm_75a");
    match h.loader.get_kernel(&older) {
        Err(LoaderError::DeviceLoad(err)) => {
            assert!(matches!(
                err.kind,
                DeviceLoadErrorKind::ArchitectureMismatch { .. }
            ));
        }
        other => panic!("expected DeviceLoad, got {:?}", other),
    }
    assert_eq!(h.toolchain.compile_count(), 1);
}

#[test]
fn test_invalid_request() {
    let dir = TempDir::new().unwrap();
    let h = harness(&dir);
    let bad_arch = KernelRequest::new("saxpy", KernelSource::text(SAXPY), "gfx90a");
    assert!(matches!(
        h.loader.get_kernel(&bad_arch),
        Err(LoaderError::Config(_))
    ));
}

#[test]
fn test_templated_entries_and_constants() {
    let dir = TempDir::new().unwrap();
    let h = harness(&dir);
    let request = KernelRequest::new(
        "axpy<float>",
        KernelSource::text(
            "__constant__ float scale;\ntemplate <typename T> __global__ void axpy(T* x) {}\n",
        ),
        "sm_80",
    )
    .with_entry("axpy<double>")
    .with_constant("scale");

    let float = h.loader.get_kernel(&request).unwrap();
    assert_eq!(float.function().lowered_name(), "_Z11axpy_float_");
    let double = float.with_entry("axpy<double>").unwrap();
    assert!(double.same_module(&float));
    assert_ne!(double.function().handle(), float.function().handle());
    assert_eq!(float.best_block_size(), 256);

    let scale = float.constant("scale").unwrap();
    assert_eq!(scale.size, 4);
    float.fill_constant("scale", &2.0f32.to_le_bytes()).unwrap();
    assert_eq!(
        h.driver.read_global(scale.ptr).unwrap(),
        2.0f32.to_le_bytes().to_vec()
    );
    assert!(float.fill_constant("scale", &[0u8; 8]).is_err());
    assert!(float.fill_constant("missing", &[0u8; 4]).is_err());
}

#[test]
fn test_release_unloads_modules() {
    let dir = TempDir::new().unwrap();
    let h = harness(&dir);

    let handle = h.loader.get_kernel(&saxpy()).unwrap();
    assert_eq!(h.driver.loaded_modules(), 1);
    assert_eq!(h.loader.release(), 1);

    // Still referenced by the handle.
    assert_eq!(h.driver.loaded_modules(), 1);
    drop(handle);
    assert_eq!(h.driver.loaded_modules(), 0);
}

#[test]
fn test_context_bind_failure() {
    let dir = TempDir::new().unwrap();
    let h = harness(&dir);
    h.driver.fail_bind(true);

    match h.loader.get_kernel(&saxpy()) {
        Err(LoaderError::DeviceLoad(err)) => {
            assert_eq!(err.kind, DeviceLoadErrorKind::InvalidContext);
        }
        other => panic!("expected DeviceLoad, got {:?}", other),
    }
    // The compiled artifact was still persisted.
    assert_eq!(h.loader.store().stats().entries, 1);

    h.driver.fail_bind(false);
    assert!(h.loader.get_kernel(&saxpy()).is_ok());
    assert_eq!(h.toolchain.compile_count(), 1);
}
