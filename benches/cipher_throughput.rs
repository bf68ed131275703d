use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use openworld::cipher::{CipherSpec, CipherStream};

fn spec() -> CipherSpec {
    CipherSpec {
        method: "aes-256-gcm".to_string(),
        password: "benchmark password".to_string(),
    }
}

/// Measures steady-state AEAD seal throughput: encrypt-only, no I/O, on an
/// in-memory transport sized to absorb a handful of chunks without blocking.
fn bench_encrypt_throughput(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let payload = vec![0x42u8; 16 * 1024];

    let mut group = c.benchmark_group("cipher_encrypt");
    group.throughput(Throughput::Bytes(payload.len() as u64));
    group.bench_function("aes_256_gcm_16kb", |b| {
        b.iter(|| {
            rt.block_on(async {
                let (client, _server) = tokio::io::duplex(1 << 20);
                let mut stream = CipherStream::wrap(client, &spec()).unwrap();
                stream.write(black_box(&payload)).await.unwrap();
            });
        });
    });
    group.finish();
}

/// Measures decrypt throughput for a single chunk already written to the wire.
fn bench_decrypt_throughput(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let payload = vec![0x24u8; 16 * 1024];

    let mut group = c.benchmark_group("cipher_decrypt");
    group.throughput(Throughput::Bytes(payload.len() as u64));
    group.bench_function("aes_256_gcm_16kb", |b| {
        b.iter(|| {
            rt.block_on(async {
                let (client, server) = tokio::io::duplex(1 << 20);
                let mut c_stream = CipherStream::wrap(client, &spec()).unwrap();
                let mut s_stream = CipherStream::wrap(server, &spec()).unwrap();
                c_stream.write(&payload).await.unwrap();
                let mut buf = vec![0u8; payload.len()];
                let mut read = 0;
                while read < buf.len() {
                    read += s_stream.read(&mut buf[read..]).await.unwrap();
                }
                black_box(buf);
            });
        });
    });
    group.finish();
}

criterion_group!(benches, bench_encrypt_throughput, bench_decrypt_throughput);
criterion_main!(benches);
