//! Micro benchmarks for the dispatcher's read/write hot path over the
//! in-memory plugin - pure CPU, no network, no IO.
//!
//! ```bash
//! cargo bench --bench bench_dispatcher
//! ```

use blockwright_lib::backend::types::OpFlags;
use blockwright_lib::plugins::memory::MemoryPlugin;
use blockwright_lib::{dispatcher, Backend};
use criterion::{criterion_group, criterion_main, Criterion};

fn open_context(size: &str) -> (Backend, blockwright_lib::Context) {
    let backend = Backend::plugin(MemoryPlugin::new());
    backend.config("size", size).expect("memory plugin accepts its own size param");
    let mut ctx = dispatcher::open(&backend, false, "", false, None).expect("open never fails for the memory plugin");
    dispatcher::prepare(&backend, &mut ctx, false).expect("prepare never fails for the memory plugin");
    (backend, ctx)
}

fn bench_pwrite(c: &mut Criterion) {
    let (backend, mut ctx) = open_context("16777216");
    let buf = vec![0xabu8; 4096];

    c.bench_function("pwrite_4k", |b| {
        b.iter(|| {
            dispatcher::pwrite(&backend, &mut ctx, std::hint::black_box(&buf), 0, OpFlags::empty()).unwrap();
        });
    });
}

fn bench_pread(c: &mut Criterion) {
    let (backend, mut ctx) = open_context("16777216");
    let mut buf = vec![0u8; 4096];

    c.bench_function("pread_4k", |b| {
        b.iter(|| {
            dispatcher::pread(&backend, &mut ctx, std::hint::black_box(&mut buf), 0, OpFlags::empty()).unwrap();
        });
    });
}

criterion_group!(dispatcher_benches, bench_pwrite, bench_pread);
criterion_main!(dispatcher_benches);
