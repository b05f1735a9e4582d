//! Simulated two-port UE10 calibration and DUT correction
//!
//! Run with: cargo run --example two_port_solt -p rfcal-core

use rfcal_core::measurement_model::{model_measurement, random_error_terms, NoiseSource};
use rfcal_core::observe::{init_logging, LogConfig};
use rfcal_core::prelude::*;

fn main() {
    init_logging(&LogConfig::development());

    let cal_type = CalType::Ue10;
    let n = 2;
    let frequencies: Vec<f64> = (0..11).map(|i| 1.0e9 + i as f64 * 1.0e8).collect();
    println!(
        "Simulating a {} calibration over {} frequency points...\n",
        cal_type.name(),
        frequencies.len()
    );

    // A "real" instrument: random but plausible error terms.
    let (layout, truth) =
        random_error_terms(cal_type, n, n, frequencies.len(), 0x5017).expect("layout");

    let mut solver =
        CalibrationSolver::new(cal_type, n, n, frequencies.clone()).expect("solver");
    let mut noise = NoiseSource::new(0xacdc);

    // Standards: both ports matched, both open, both shorted, and a thru.
    let matched = solver.parameters().match_();
    let thru_path = solver.parameters().one();
    let open = solver.parameters_mut().scalar(Complex::new(1.0, 0.0));
    let short = solver.parameters_mut().scalar(Complex::new(-1.0, 0.0));

    let mut thru = ParamMatrix::filled(n, n, matched);
    thru.set(0, 1, thru_path);
    thru.set(1, 0, thru_path);
    let reflect_pair = |id| {
        let mut s = ParamMatrix::filled(n, n, matched);
        for p in 0..n {
            s.set(p, p, id);
        }
        s
    };
    let standards = vec![
        ("match-match", ParamMatrix::filled(n, n, matched)),
        ("open-open", reflect_pair(open)),
        ("short-short", reflect_pair(short)),
        ("thru", thru),
    ];

    for (name, s) in standards {
        let raw: Vec<ComplexMatrix> = frequencies
            .iter()
            .enumerate()
            .map(|(fi, &f)| {
                let s_eval = s.evaluate(solver.parameters(), f).expect("evaluate");
                model_measurement(&layout, &truth[fi], &s_eval, fi).expect("model")
            })
            .collect();
        println!("Measured standard: {}", name);
        solver
            .add_standard(s, vec![Some(0), Some(1)], Measurement::Scalar(raw))
            .expect("add standard");
    }

    let solved = solver.solve().expect("solve");
    println!(
        "\nSolved {} error terms per frequency point.",
        solved.terms(0).len()
    );

    // Correct a simulated DUT sweep and compare against the truth.
    let dut: Vec<ComplexMatrix> = (0..frequencies.len())
        .map(|_| noise.matrix(n, n, 0.5))
        .collect();
    let raw: Vec<ComplexMatrix> = dut
        .iter()
        .enumerate()
        .map(|(fi, d)| model_measurement(&layout, &truth[fi], d, fi).expect("model"))
        .collect();

    let mut applicator = CalibrationApplicator::new(solved, n).expect("applicator");
    applicator
        .add_sweep(&frequencies, &vec![Some(0), Some(1)], Measurement::Scalar(raw))
        .expect("sweep");
    let corrected = applicator.finish();

    let mut worst = 0.0f64;
    for (fi, d) in dut.iter().enumerate() {
        for i in 0..n {
            for j in 0..n {
                worst = worst.max((corrected[fi].get(i, j) - d.get(i, j)).norm());
            }
        }
    }
    println!("Worst corrected-vs-true S-parameter error: {:.3e}", worst);
}
