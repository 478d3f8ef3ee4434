use ccpack::classify::{Category, ContentKind, SourceFile};
use ccpack::config::GIB;
use ccpack::plugin::{DescriptorOptions, PluginHeader};
use ccpack::plan;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::path::PathBuf;

fn units(n: usize) -> Vec<SourceFile> {
    (0..n)
        .map(|i| SourceFile {
            path:      PathBuf::from(format!("staging/Textures/cc{i:04}")),
            container: format!("ccBGSFO4{i:03} - Textures.ba2"),
            category:  Category::Textures,
            // 1 MiB .. ~2 GiB, deterministic spread
            size:      ((i as u64 * 7919) % 2048 + 1) * 1024 * 1024,
            kind:      ContentKind::Texture,
        })
        .collect()
}

fn bench_plan(c: &mut Criterion) {
    let small = units(50);
    let large = units(2000);

    c.bench_function("plan_50_units", |b| {
        b.iter(|| plan(Category::Textures, black_box(small.clone()), 7 * GIB, "CCMerged"))
    });
    c.bench_function("plan_2000_units", |b| {
        b.iter(|| plan(Category::Textures, black_box(large.clone()), 7 * GIB, "CCMerged"))
    });
}

fn bench_descriptor(c: &mut Criterion) {
    let opts = DescriptorOptions { localized: true, ..DescriptorOptions::default() };

    c.bench_function("encode_descriptor", |b| {
        b.iter(|| PluginHeader::light_master(black_box(&opts)).to_bytes().unwrap())
    });

    let bytes = PluginHeader::light_master(&opts).to_bytes().unwrap();
    c.bench_function("decode_descriptor", |b| {
        b.iter(|| PluginHeader::read(black_box(bytes.as_slice())).unwrap())
    });
}

criterion_group!(benches, bench_plan, bench_descriptor);
criterion_main!(benches);
