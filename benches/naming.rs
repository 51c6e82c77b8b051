//! Benchmark for volume name derivation
//!
//! Runs once per provision request, ahead of any appliance call.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use freenas_iscsi_provisioner::controlplane::naming::{format_volsize, VolumeNames};
use freenas_iscsi_provisioner::{AccessMode, ProvisioningConfig, ProvisioningRequest};

fn request(index: u64) -> ProvisioningRequest {
    ProvisioningRequest {
        name: format!("pvc-3f2a6c1e-{:04}", index),
        namespace: "analytics".to_string(),
        claim_name: format!("warehouse-{}", index),
        capacity_bytes: (index + 1) << 30,
        access_modes: vec![AccessMode::ReadWriteOnce],
    }
}

fn bench_derive_names(c: &mut Criterion) {
    let mut group = c.benchmark_group("naming");
    group.throughput(Throughput::Elements(1));

    let flat = ProvisioningConfig::default();
    let namespaced = ProvisioningConfig {
        enable_namespaces: true,
        deterministic_names: true,
        dataset_parent: "tank/k8s".to_string(),
        ..ProvisioningConfig::default()
    };
    let requests: Vec<_> = (0..1000).map(request).collect();

    group.bench_function("derive_flat", |b| {
        let mut i = 0usize;
        b.iter(|| {
            i = (i + 1) % requests.len();
            let _ = VolumeNames::derive(black_box(&requests[i]), black_box(&flat));
        });
    });

    group.bench_function("derive_namespaced_deterministic", |b| {
        let mut i = 0usize;
        b.iter(|| {
            i = (i + 1) % requests.len();
            let _ = VolumeNames::derive(black_box(&requests[i]), black_box(&namespaced));
        });
    });

    group.finish();
}

fn bench_format_volsize(c: &mut Criterion) {
    c.bench_function("format_volsize", |b| {
        b.iter(|| format_volsize(black_box(107_374_182_400)));
    });
}

criterion_group!(benches, bench_derive_names, bench_format_volsize);
criterion_main!(benches);
