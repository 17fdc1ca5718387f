/// Benchmarks of both peeler engines on synthetic banks.
///
/// Each case injects a fixed spike train into a noisy chunk and measures one
/// `peel` call, across bank sizes typical of a few tens of units on a small
/// probe.
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use ndarray::Array2;
use peeler::test_utils::{calibration_data, gabor_bank, inject_template, white_noise_traces};
use peeler::{GreedyPeeler, GreedySettingsBuilder, OmpPeeler, OmpSettingsBuilder, Peeler, PeelerContext};

fn spiky_chunk(bank: &peeler::TemplateBank, num_timesteps: usize) -> Array2<f32> {
    let mut traces = white_noise_traces(num_timesteps, bank.num_channels(), 0.01, 17);
    let mut at = 40;
    let mut cluster = 0;
    while at + bank.num_samples() + 40 < num_timesteps {
        inject_template(&mut traces, bank, cluster, at, 1.0);
        cluster = (cluster + 1) % bank.num_templates();
        at += 57;
    }
    traces
}

fn peeler_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("peel");
    let num_timesteps = 4_000;

    for &num_templates in &[4_usize, 16] {
        let bank = gabor_bank(num_templates, 40, 8);
        let traces = spiky_chunk(&bank, num_timesteps);
        let context = PeelerContext::new(ndarray::Array1::from_elem(8, 0.01));

        let omp_settings = OmpSettingsBuilder::default()
            .amplitudes(0.5, 2.0)
            .omp_min_sps(0.2)
            .rank(5)
            .build();
        let omp = OmpPeeler::setup(&bank, &context, &omp_settings).unwrap();

        let greedy_context =
            context.clone().with_calibration(calibration_data(&bank, 50, 100, 0.01, 3));
        let greedy_settings = GreedySettingsBuilder::default().build();
        let greedy = GreedyPeeler::setup(&bank, &greedy_context, &greedy_settings).unwrap();

        group.throughput(Throughput::Elements(num_timesteps as u64));
        group.bench_with_input(
            BenchmarkId::new("omp", num_templates),
            &num_templates,
            |b, _| b.iter(|| omp.peel(traces.view(), 0).unwrap()),
        );
        group.bench_with_input(
            BenchmarkId::new("greedy", num_templates),
            &num_templates,
            |b, _| b.iter(|| greedy.peel(traces.view(), 0).unwrap()),
        );
    }
    group.finish();
}

criterion_group!(benches, peeler_benchmark);
criterion_main!(benches);
