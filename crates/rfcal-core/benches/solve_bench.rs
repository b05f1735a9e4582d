//! Benchmarks for the calibration pipeline
//!
//! Run with: cargo bench -p rfcal-core --bench solve_bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rfcal_core::measurement_model::{model_measurement, random_error_terms, NoiseSource};
use rfcal_core::prelude::*;
use rfcal_core::qrsolve_q;

// ============================================================================
// QR Kernel Benchmarks
// ============================================================================

fn bench_qrsolve(c: &mut Criterion) {
    let mut group = c.benchmark_group("qrsolve");

    for n in [4, 8, 16, 32].iter() {
        let mut noise = NoiseSource::new(0xbe1c);
        let a = noise.matrix(*n, *n, 1.0);
        let b = noise.matrix(*n, 1, 1.0);

        group.bench_with_input(BenchmarkId::new("square", n), n, |bench, _| {
            bench.iter(|| qrsolve_q(black_box(&a), black_box(&b)))
        });
    }

    group.finish();
}

// ============================================================================
// Solve Benchmarks
// ============================================================================

fn solver_with_standards(cal_type: CalType, n: usize, frequencies: Vec<f64>) -> CalibrationSolver {
    let nf = frequencies.len();
    let (layout, truth) = random_error_terms(cal_type, n, n, nf, 0xca1).unwrap();
    let mut solver = CalibrationSolver::new(cal_type, n, n, frequencies).unwrap();
    let mut noise = NoiseSource::new(0xca2);

    let mut standards = vec![ParamMatrix::filled(n, n, solver.parameters().match_())];
    let count = rfcal_core::needed_standards(cal_type, n, n) + 1;
    for _ in 0..count {
        let ids = (0..n * n)
            .map(|_| {
                let v = noise.complex_uniform(0.6);
                solver.parameters_mut().scalar(v)
            })
            .collect();
        standards.push(ParamMatrix::from_ids(n, n, ids).unwrap());
    }

    for s in standards {
        let raw: Vec<ComplexMatrix> = solver
            .frequencies()
            .to_vec()
            .iter()
            .enumerate()
            .map(|(fi, &f)| {
                let s_eval = s.evaluate(solver.parameters(), f).unwrap();
                model_measurement(&layout, &truth[fi], &s_eval, fi).unwrap()
            })
            .collect();
        let map: PortMap = (0..n).map(Some).collect();
        solver.add_standard(s, map, Measurement::Scalar(raw)).unwrap();
    }
    solver
}

fn bench_solve(c: &mut Criterion) {
    let mut group = c.benchmark_group("solve");
    let frequencies: Vec<f64> = (0..101).map(|i| 1.0e9 + i as f64 * 1.0e7).collect();

    for &cal_type in &[CalType::E12, CalType::Ue14, CalType::T16] {
        group.bench_function(BenchmarkId::new("two_port", cal_type.name()), |bench| {
            bench.iter_with_setup(
                || solver_with_standards(cal_type, 2, frequencies.clone()),
                |solver| solver.solve().unwrap(),
            )
        });
    }

    group.finish();
}

// ============================================================================
// Apply Benchmarks
// ============================================================================

fn bench_apply(c: &mut Criterion) {
    let mut group = c.benchmark_group("apply");
    let frequencies: Vec<f64> = (0..101).map(|i| 1.0e9 + i as f64 * 1.0e7).collect();

    let solved = solver_with_standards(CalType::Ue10, 2, frequencies.clone())
        .solve()
        .unwrap();
    let mut noise = NoiseSource::new(0xd07);
    let raw: Vec<ComplexMatrix> = (0..frequencies.len())
        .map(|fi| {
            let dut = noise.matrix(2, 2, 0.5);
            solved.model(fi, &dut).unwrap()
        })
        .collect();

    group.bench_function("two_port_sweep", |bench| {
        bench.iter_with_setup(
            || CalibrationApplicator::new(solved.clone(), 2).unwrap(),
            |mut app| {
                app.add_sweep(
                    black_box(&frequencies),
                    &vec![Some(0), Some(1)],
                    Measurement::Scalar(raw.clone()),
                )
                .unwrap();
                app.finish()
            },
        )
    });

    group.finish();
}

criterion_group!(benches, bench_qrsolve, bench_solve, bench_apply);
criterion_main!(benches);
