use std::time::Instant;

use clap::Parser;
use lm_universal::core::Estimator;
use lm_universal::init_logger_with_level;
use lm_universal::optimizer::{LevenbergMarquardtConfig, SolverResult};
use lm_universal::problems::homography::{
    optimize_homography, optimize_homography_analytic, project,
};
use nalgebra::{Matrix3, Vector2, matrix};
use tracing::{Level, info, warn};

#[derive(Parser)]
#[command(name = "optimize_homography")]
#[command(about = "Refine a homography between synthetic point correspondences")]
struct Args {
    /// Number of correspondences on a regular grid
    #[arg(short, long, default_value = "100")]
    points: usize,

    /// Amplitude of the deterministic pixel noise added to the right points
    #[arg(short, long, default_value = "0.5")]
    noise: f64,

    /// Every n-th correspondence becomes a gross outlier (0 disables outliers)
    #[arg(long, default_value = "0")]
    outlier_every: usize,

    /// Robust estimator: "square", "linear", "huber", "tukey" or "cauchy"
    #[arg(short, long, default_value = "square")]
    estimator: Estimator,

    /// Maximum number of optimization iterations
    #[arg(short, long, default_value = "20")]
    max_iterations: usize,

    /// Use the closed-form Jacobian with 8 or 9 parameters instead of numeric differentiation
    #[arg(long)]
    analytic: Option<usize>,

    /// Print the per-iteration table
    #[arg(short, long)]
    verbose: bool,
}

fn ground_truth() -> Matrix3<f64> {
    matrix![
        0.98, 0.12, 25.0;
        -0.07, 1.04, -14.0;
        0.0004, 0.0002, 1.0
    ]
}

/// Deterministic jitter in `[-1, 1]`.
fn jitter(i: usize, salt: f64) -> f64 {
    (i as f64 * 12.9898 + salt * 78.233).sin()
}

fn correspondences(args: &Args, truth: &Matrix3<f64>) -> (Vec<Vector2<f64>>, Vec<Vector2<f64>>) {
    let side = (args.points as f64).sqrt().ceil().max(2.0) as usize;
    let step = 640.0 / side as f64;

    let mut left = Vec::with_capacity(args.points);
    let mut right = Vec::with_capacity(args.points);
    for i in 0..args.points {
        let point = Vector2::new((i % side) as f64 * step, (i / side) as f64 * step);
        let Some(mapped) = project(truth, &point) else {
            continue;
        };
        let mut noise = Vector2::new(jitter(i, 1.0), jitter(i, 2.0)) * args.noise;
        if args.outlier_every > 0 && i % args.outlier_every == 0 {
            noise *= 100.0;
        }
        left.push(point);
        right.push(mapped + noise);
    }
    (left, right)
}

fn max_deviation(a: &Matrix3<f64>, b: &Matrix3<f64>) -> f64 {
    (a - b).abs().max()
}

fn report(result: &SolverResult<Matrix3<f64>>, truth: &Matrix3<f64>, elapsed_ms: f64) {
    info!("{}", result.summary);
    info!("Status:            {}", result.status);
    info!("Initial error:     {:.6e}", result.initial_error);
    info!("Final error:       {:.6e}", result.final_error);
    info!("Accepted steps:    {}", result.summary.successful_steps);
    info!("Deviation (max):   {:.6e}", max_deviation(&result.parameters, truth));
    info!("Time:              {:.2}ms", elapsed_ms);
    info!("Optimized homography:{}", result.parameters);
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    init_logger_with_level(if args.verbose { Level::DEBUG } else { Level::INFO });

    info!("LM-UNIVERSAL HOMOGRAPHY OPTIMIZATION\n");

    let truth = ground_truth();
    let (left, right) = correspondences(&args, &truth);
    info!("Correspondences: {}", left.len());

    let mut initial = truth;
    initial[(0, 2)] += 8.0;
    initial[(1, 2)] -= 5.0;
    initial[(0, 1)] += 0.03;
    initial[(2, 0)] -= 0.0002;

    let config = LevenbergMarquardtConfig::new()
        .with_max_iterations(args.max_iterations)
        .with_estimator(args.estimator);

    let start = Instant::now();
    let result = match args.analytic {
        Some(parameters) => {
            info!("Closed-form Jacobian, {} parameters", parameters);
            optimize_homography_analytic(&initial, &left, &right, parameters, &config)
        }
        None => optimize_homography(&initial, &left, &right, &config),
    };
    let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;

    match result {
        Ok(result) => {
            report(&result, &truth, elapsed_ms);
            Ok(())
        }
        Err(e) => {
            warn!("Optimization failed: {}", e.chain());
            Err(e.into())
        }
    }
}
