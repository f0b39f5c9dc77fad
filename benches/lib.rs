use criterion::{criterion_group, criterion_main};

use flux::{bench_design_matrix, bench_flux_vjp};

mod render;
use render::bench_render;

criterion_group!(
    benches,
    bench_design_matrix,
    bench_flux_vjp,
    bench_render
);
criterion_main!(benches);
