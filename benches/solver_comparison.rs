//! Solver comparison benchmark for lm-universal
//!
//! Runs the same synthetic problems through the available linear solve paths:
//!
//! - **Dense**: one model with a dense Jacobian (`optimize_universal_model`)
//! - **SparseCholesky**: the block-sparse Jacobian solved as one sparse system
//! - **Schur**: the block-sparse Jacobian reduced to the shared/first parameters first
//! - **Analytic**: closed-form Jacobians through the advanced dense provider (homography only)
//!
//! ## Metrics
//!
//! - **Time**: Average wall-clock time in milliseconds (5 runs per configuration)
//! - **Iterations**: Number of attempts (linear solves) of the last run
//! - **Init/Final Error**: Robust error before and after the optimization
//!
//! ## Timing Methodology
//!
//! - Timing starts immediately before the optimization call
//! - Problem setup (synthetic data, ray casting) is excluded from timing
//!
//! ```bash
//! cargo bench --bench solver_comparison
//! ```

use std::hint::black_box;
use std::time::Instant;
use tracing::{info, warn};

use lm_universal::error::LmResult;
use lm_universal::init_logger;
use lm_universal::linalg::LinearSolverType;
use lm_universal::optimizer::{LevenbergMarquardtConfig, SolverResult};
use lm_universal::problems::homography::{
    optimize_homography, optimize_homography_analytic, project,
};
use lm_universal::problems::plane::Plane;
use lm_universal::problems::pose_plane::{
    PinholeCamera, PosesPlaneData, optimize_pose_plane, optimize_poses_plane,
};
use nalgebra::{Isometry3, Matrix3, Point3, Vector2, Vector3, matrix};

const RUNS: usize = 5;

#[derive(Clone)]
struct BenchmarkResult {
    problem: String,
    solver: String,
    elapsed_ms: String,
    iterations: String,
    initial_error: String,
    final_error: String,
    status: String,
}

impl BenchmarkResult {
    fn success<T>(problem: &str, solver: &str, elapsed_ms: f64, result: &SolverResult<T>) -> Self {
        Self {
            problem: problem.to_string(),
            solver: solver.to_string(),
            elapsed_ms: format!("{:.3}", elapsed_ms),
            iterations: result.iterations().to_string(),
            initial_error: format!("{:.6e}", result.initial_error),
            final_error: format!("{:.6e}", result.final_error),
            status: result.status.to_string(),
        }
    }

    fn failed(problem: &str, solver: &str, error: &str) -> Self {
        Self {
            problem: problem.to_string(),
            solver: solver.to_string(),
            elapsed_ms: "-".to_string(),
            iterations: "-".to_string(),
            initial_error: "-".to_string(),
            final_error: "-".to_string(),
            status: format!("error: {}", error),
        }
    }
}

/// Runs `optimize` [`RUNS`] times, averaging the elapsed time.
fn measure<T>(
    problem: &str,
    solver: &str,
    mut optimize: impl FnMut() -> LmResult<SolverResult<T>>,
) -> BenchmarkResult {
    let mut total_ms = 0.0;
    let mut last = None;

    for _ in 0..RUNS {
        let start = Instant::now();
        let result = black_box(optimize());
        total_ms += start.elapsed().as_secs_f64() * 1000.0;

        match result {
            Ok(result) => last = Some(result),
            Err(e) => {
                warn!("{} / {} failed: {}", problem, solver, e.chain_compact());
                return BenchmarkResult::failed(problem, solver, &e.to_string());
            }
        }
    }

    match last {
        Some(result) => BenchmarkResult::success(problem, solver, total_ms / RUNS as f64, &result),
        None => BenchmarkResult::failed(problem, solver, "no runs"),
    }
}

fn homography_benchmarks() -> Vec<BenchmarkResult> {
    let truth: Matrix3<f64> = matrix![
        1.1, 0.08, 12.0;
        -0.04, 0.95, -7.0;
        0.0008, -0.0005, 1.0
    ];
    let left: Vec<Vector2<f64>> = (0..400)
        .map(|i| Vector2::new((i % 20) as f64 * 32.0, (i / 20) as f64 * 24.0))
        .collect();
    let right: Vec<Vector2<f64>> = left
        .iter()
        .enumerate()
        .filter_map(|(i, p)| {
            let noise = Vector2::new(((i * 7) % 11) as f64 - 5.0, ((i * 3) % 7) as f64 - 3.0);
            project(&truth, p).map(|q| q + noise * 0.05)
        })
        .collect();

    let mut initial = truth;
    initial[(0, 2)] += 3.0;
    initial[(1, 2)] -= 2.0;
    initial[(2, 0)] += 0.0002;

    let config = LevenbergMarquardtConfig::new().with_max_iterations(30);
    let problem = "homography-400";

    vec![
        measure(problem, "Dense", || {
            optimize_homography(&initial, &left, &right, &config)
        }),
        measure(problem, "Analytic-8", || {
            optimize_homography_analytic(&initial, &left, &right, 8, &config)
        }),
        measure(problem, "Analytic-9", || {
            optimize_homography_analytic(&initial, &left, &right, 9, &config)
        }),
    ]
}

struct PosesPlaneScene {
    data: PosesPlaneData,
    initial_poses: Vec<Isometry3<f64>>,
    initial_plane: Plane,
}

fn poses_plane_scene(cameras: usize, points: usize) -> LmResult<PosesPlaneScene> {
    let camera = PinholeCamera::new(500.0, 500.0, 320.0, 240.0);
    let plane = Plane::from_angles(0.1, -0.15, 8.0);
    let side = (points as f64).sqrt().ceil() as usize;
    let world_points: Vec<Vector3<f64>> = (0..points)
        .map(|i| {
            let grid = Vector3::new((i % side) as f64, (i / side) as f64, 0.0) * 0.25;
            plane.project(&(grid - Vector3::new(1.5, 1.5, 0.0)))
        })
        .collect();

    let observe = |pose: &Isometry3<f64>| -> Vec<Vector2<f64>> {
        world_points
            .iter()
            .filter_map(|p| camera.project(&(pose * Point3::from(*p)).coords))
            .collect()
    };

    let first = Isometry3::identity();
    let poses: Vec<Isometry3<f64>> = (0..cameras)
        .map(|c| {
            let angle = 0.02 * c as f64;
            Isometry3::new(
                Vector3::new(-0.3 * (c + 1) as f64, 0.05 * angle.sin(), 0.02 * c as f64),
                Vector3::new(0.01, -angle, 0.005),
            )
        })
        .collect();
    let offset = Isometry3::new(Vector3::new(0.02, -0.01, 0.03), Vector3::new(0.0, 0.01, -0.005));
    let initial_poses = poses.iter().map(|pose| offset * pose).collect();

    let data = PosesPlaneData::new(
        camera,
        &first,
        &observe(&first),
        plane.distance(),
        poses.iter().map(observe).collect(),
    )?;

    Ok(PosesPlaneScene {
        data,
        initial_poses,
        initial_plane: Plane::from_angles(0.06, -0.1, 8.0),
    })
}

fn poses_plane_benchmarks(cameras: usize, points: usize) -> Vec<BenchmarkResult> {
    let problem = format!("poses-plane-{}x{}", cameras, points);
    let scene = match poses_plane_scene(cameras, points) {
        Ok(scene) => scene,
        Err(e) => return vec![BenchmarkResult::failed(&problem, "-", &e.to_string())],
    };

    let mut results = Vec::new();
    if cameras == 1 {
        let config = LevenbergMarquardtConfig::new().with_max_iterations(30);
        results.push(measure(&problem, "Dense", || {
            optimize_pose_plane(
                &mut scene.data.clone(),
                &scene.initial_poses[0],
                &scene.initial_plane,
                &config,
            )
        }));
    }

    for solver in [LinearSolverType::SparseCholesky, LinearSolverType::Schur] {
        let config = LevenbergMarquardtConfig::new()
            .with_max_iterations(30)
            .with_linear_solver_type(solver);
        results.push(measure(&problem, &solver.to_string(), || {
            optimize_poses_plane(
                &mut scene.data.clone(),
                &scene.initial_poses,
                &scene.initial_plane,
                &config,
            )
        }));
    }
    results
}

fn main() {
    init_logger();

    info!("Starting solver comparison benchmark...");
    info!("Running each configuration {} times and averaging results...", RUNS);

    let mut all_results = homography_benchmarks();
    for (cameras, points) in [(1, 100), (4, 100), (16, 200), (64, 200)] {
        info!("Poses and plane: {} cameras, {} points", cameras, points);
        all_results.extend(poses_plane_benchmarks(cameras, points));
    }

    info!("{}", "=".repeat(120));
    info!(
        "{:<24} {:<16} {:<14} {:<14} {:<8} {:<12} {:<20}",
        "Problem", "Solver", "Init Error", "Final Error", "Iters", "Time (ms)", "Status"
    );
    info!("{}", "-".repeat(120));
    for result in &all_results {
        info!(
            "{:<24} {:<16} {:<14} {:<14} {:<8} {:<12} {:<20}",
            result.problem,
            result.solver,
            result.initial_error,
            result.final_error,
            result.iterations,
            result.elapsed_ms,
            result.status
        );
    }
    info!("{}", "=".repeat(120));
}
