use criterion::Criterion;
use light_curve_occultation::ndarray::Array1;
use light_curve_occultation::{DegreeConfig, Ops, Projection, SurfaceParams};
use std::hint::black_box;

pub fn bench_render(c: &mut Criterion) {
    let mut ops = Ops::new(DegreeConfig::unfiltered(5).unwrap()).unwrap();
    let y = Array1::from_shape_fn(ops.config().n_y(), |n| 1.0 / (n + 1) as f64);
    let params = SurfaceParams::new(1.0, 0.2, y);
    let theta = Array1::linspace(0.0, 6.0, 16);
    for projection in [Projection::Rectangular, Projection::Orthographic] {
        c.bench_function(
            format!("Render: {projection:?}, res = 64, 16 frames").as_str(),
            |b| {
                b.iter(|| {
                    ops.render(64, projection, black_box(theta.view()), &params)
                        .unwrap()
                })
            },
        );
    }
}
