use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use cryptmirror::config::EncryptionConfig;
use cryptmirror::crypto::{AeadCipher, Passphrase};
use cryptmirror::fs::{ContentState, MemoryAttributeStore, TransformEngine};
use std::sync::Arc;

fn engine() -> TransformEngine {
    let cipher = AeadCipher::new(EncryptionConfig {
        argon2_memory_kib: 1024,
        argon2_iterations: 1,
        argon2_parallelism: 1,
    });
    TransformEngine::new(Arc::new(cipher), Arc::new(MemoryAttributeStore::new()))
}

/// A small write costs a full decrypt and re-encrypt of the file
fn small_write(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine();
    let pass = Passphrase::from("bench");

    let mut group = c.benchmark_group("small_write");
    for size in [4 * 1024usize, 256 * 1024, 4 * 1024 * 1024] {
        let path = dir.path().join(format!("f{}", size));
        engine.create(&path, 0o644, false, &pass).unwrap();
        engine
            .write(&path, ContentState::Encrypted, &pass, 0, &vec![0x42; size])
            .unwrap();

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &path, |b, path| {
            b.iter(|| {
                engine
                    .write(path, ContentState::Encrypted, &pass, 0, b"x")
                    .unwrap()
            })
        });
    }
    group.finish();
}

fn small_read(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine();
    let pass = Passphrase::from("bench");

    let mut group = c.benchmark_group("small_read");
    for size in [4 * 1024usize, 256 * 1024, 4 * 1024 * 1024] {
        let path = dir.path().join(format!("f{}", size));
        engine.create(&path, 0o644, false, &pass).unwrap();
        engine
            .write(&path, ContentState::Encrypted, &pass, 0, &vec![0x42; size])
            .unwrap();

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &path, |b, path| {
            b.iter(|| {
                engine
                    .read(path, ContentState::Encrypted, &pass, 0, 4096)
                    .unwrap()
            })
        });
    }
    group.finish();
}

criterion_group!(benches, small_write, small_read);
criterion_main!(benches);
