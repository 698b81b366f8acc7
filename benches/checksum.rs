use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use ledger_client::constants::{HEADER_SIZE_USIZE, MESSAGE_SIZE_MAX_USIZE};
use ledger_client::vsr::wire::{Command, Header, checksum};
use rand::{RngCore, SeedableRng, rngs::StdRng};
use std::env;
use std::hint::black_box;

const KIB: usize = 1024;
const DEFAULT_SAMPLE_SIZE: usize = 50;

const SIZES: [usize; 4] = [HEADER_SIZE_USIZE, 4 * KIB, 64 * KIB, MESSAGE_SIZE_MAX_USIZE];

fn env_usize(name: &str) -> Option<usize> {
    env::var(name).ok().and_then(|value| value.parse().ok())
}

fn bench_checksum(c: &mut Criterion) {
    let mut group = c.benchmark_group("checksum");
    // Env override: CHECKSUM_SAMPLE_SIZE.
    group.sample_size(env_usize("CHECKSUM_SAMPLE_SIZE").unwrap_or(DEFAULT_SAMPLE_SIZE));

    let mut prng = StdRng::seed_from_u64(0x5EED);
    let mut data = vec![0u8; MESSAGE_SIZE_MAX_USIZE];
    prng.fill_bytes(&mut data);

    for size in SIZES {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("body", size), &data[..size], |b, input| {
            b.iter(|| checksum(black_box(input)))
        });
    }

    group.finish();
}

fn bench_header(c: &mut Criterion) {
    let mut group = c.benchmark_group("header");

    let mut header = Header::new(Command::Request, 1);
    header.client = 42;
    header.request = 7;
    header.set_checksum_body(&[]);
    header.set_checksum();
    let bytes = header.to_bytes();

    group.throughput(Throughput::Bytes(HEADER_SIZE_USIZE as u64));
    group.bench_function("set_checksum", |b| {
        b.iter(|| {
            let mut header = black_box(header);
            header.set_checksum();
            header.checksum
        })
    });
    group.bench_function("decode_and_verify", |b| {
        b.iter(|| {
            let header = Header::from_bytes(black_box(&bytes)).expect("valid header");
            header.is_valid_checksum()
        })
    });

    group.finish();
}

criterion_group!(benches, bench_checksum, bench_header);
criterion_main!(benches);
