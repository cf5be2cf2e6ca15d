use criterion::{criterion_group, criterion_main, Criterion};
use resofit::ports::notch::notch_model;
use resofit::{BatchProcessor, FitConfig, PortKind, SweepPoint};

fn power_sweep() -> Vec<SweepPoint> {
    let (fr, qc) = (5.0e9, 2.0e4);
    (0..16)
        .map(|i| {
            let qi = 2.0e4 * (1.0 + i as f64);
            let ql = 1.0 / (1.0 / qi + 1.0 / qc);
            let frequencies: Vec<f64> = (0..1001)
                .map(|j| fr - 3.0e6 + 6.0e6 * j as f64 / 1000.0)
                .collect();
            let response = frequencies
                .iter()
                .map(|f| notch_model(*f, fr, ql, qc, 0.1, 0.8, 1.0, 4.0e-8))
                .collect();
            SweepPoint {
                parameter: i as f64,
                frequencies,
                response,
            }
        })
        .collect()
}

fn criterion_benchmark(c: &mut Criterion) {
    let sweep = power_sweep();
    let batch = BatchProcessor::new(PortKind::Notch, FitConfig::default());
    c.bench_function("Autofit", |b| {
        b.iter(|| batch.autofit(&sweep).expect("Could not fit sweep"))
    });
    c.bench_function("Parallel Autofit", |b| {
        b.iter(|| batch.par_autofit(&sweep).expect("Could not fit sweep"))
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
