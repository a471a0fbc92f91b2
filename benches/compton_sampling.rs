use criterion::{criterion_group, criterion_main, Criterion};
extern crate snmc as lib;

use lib::transport::gamma::{choose_f, sigma_compton_partial, thomson_angle};
use rand::Rng;
use rand::SeedableRng;
use rand_pcg::Pcg64;

fn criterion_benchmark(c: &mut Criterion) {
    let mut rng = Pcg64::seed_from_u64(12345);

    c.bench_function("sigma_compton_partial", |b| {
        b.iter(|| sigma_compton_partial(criterion::black_box(1.0), criterion::black_box(2.5)))
    });

    c.bench_function("choose_f x=1", |b| {
        b.iter(|| choose_f(criterion::black_box(1.0), rng.gen::<f64>()))
    });

    c.bench_function("choose_f x=0.05", |b| {
        b.iter(|| choose_f(criterion::black_box(0.05), rng.gen::<f64>()))
    });

    c.bench_function("thomson_angle", |b| b.iter(|| thomson_angle(&mut rng)));
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
