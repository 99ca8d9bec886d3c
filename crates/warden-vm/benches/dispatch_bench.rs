use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::sync::Arc;
use warden_core::proto::Prototype;
use warden_vm::{ChunkCompiler, Globals};

struct BundledCompiler;

impl ChunkCompiler for BundledCompiler {
    fn compile(&self, source: &[u8], chunk_name: &str) -> Result<Arc<Prototype>, String> {
        warden_compiler::compile(source, chunk_name).map_err(|e| e.to_string())
    }
}

const LOOP: &str = "local s = 0 for i = 1, 10000 do s = s + i end return s";

fn bench_numeric_loop(c: &mut Criterion) {
    let globals = Globals::new();
    globals.set_compiler(Box::new(BundledCompiler));
    let chunk = globals.load(LOOP.as_bytes(), "bench", usize::MAX).unwrap();
    c.bench_function("numeric_loop_10k", |b| {
        b.iter(|| globals.call(black_box(&chunk), &[]).unwrap())
    });
}

fn bench_table_fill(c: &mut Criterion) {
    let globals = Globals::new();
    globals.set_compiler(Box::new(BundledCompiler));
    let src = "local t = {} for i = 1, 1000 do t[i] = i end return #t";
    let chunk = globals.load(src.as_bytes(), "bench", usize::MAX).unwrap();
    c.bench_function("table_fill_1k", |b| {
        b.iter(|| globals.call(black_box(&chunk), &[]).unwrap())
    });
}

criterion_group!(benches, bench_numeric_loop, bench_table_fill);
criterion_main!(benches);
